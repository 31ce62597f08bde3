#![no_std]
#![no_main]

use defmt::*;
use ds2502_emulator::charger::DellAdapter;
use ds2502_emulator::ds2502::Ds2502;
use ds2502_emulator::{BusLine, Direction, OneWireHub, Timing};
use embassy_executor::Spawner;
use embassy_rp::gpio::{Flex, Pull};
use embassy_time::{Duration, Instant};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

// Rough figures for the RP2040 at 125 MHz running from flash; recalibrate
// against a scope when changing the clock or the build profile.
const TIMING: Timing = Timing::from_calibration(125, 12);

const SERIAL: [u8; 6] = [0xa1, 0x5f, 0x32, 0x06, 0x00, 0x00];

struct FlexLine<'d>(Flex<'d>);

impl<'d> FlexLine<'d> {
    fn new(mut pin: Flex<'d>) -> Self {
        // External pull-up on the adapter side of the plug.
        pin.set_pull(Pull::None);
        pin.set_as_input();
        Self(pin)
    }
}

impl BusLine for FlexLine<'_> {
    fn is_high(&mut self) -> bool {
        self.0.is_high()
    }

    fn set_direction(&mut self, direction: Direction) {
        match direction {
            Direction::Input => self.0.set_as_input(),
            Direction::Output => self.0.set_as_output(),
        }
    }

    fn drive_low(&mut self) {
        self.0.set_low();
    }
}

static DEVICE: StaticCell<Ds2502> = StaticCell::new();

#[embassy_executor::main]
async fn main(_spawner: Spawner) -> ! {
    defmt::info!("hello.");

    let p = embassy_rp::init(Default::default());
    let line = FlexLine::new(Flex::new(p.PIN_15));

    let adapter = DellAdapter::W65;
    let device = DEVICE.init(adapter.device(SERIAL));
    info!("emulating {:?} ({=u16} W)", adapter, adapter.watts());

    let mut hub = OneWireHub::new(line, TIMING);
    if hub.attach(device).is_err() {
        defmt::panic!("hub slot taken");
    }

    // poll() must come round again within a reset time, so no awaiting here.
    let mut served: u32 = 0;
    let mut failed: u32 = 0;
    let mut heartbeat = Instant::now();
    loop {
        match hub.poll() {
            Ok(()) => served = served.wrapping_add(1),
            Err(e) => {
                failed = failed.wrapping_add(1);
                warn!("bus error {:?}", e);
            }
        }
        if heartbeat.elapsed() > Duration::from_secs(10) {
            info!("alive: {} polls, {} errors", served, failed);
            heartbeat = Instant::now();
        }
    }
}
