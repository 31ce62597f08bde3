//! Slave-side bus state machine.
//!
//! One [`OneWireHub::poll`] runs
//! WaitReset → Presence → WaitCommand → Dispatch and starts over, until the
//! bus goes idle or a cycle fails. A reset that starts while the slave waits
//! for a slot end is not missed: the slot wait gives up with
//! [`Error::ResetInProgress`] and the hub confirms the pulse it is already in
//! (ConfirmReset) instead of waiting for a fresh falling edge.

use crate::bus::OneWireBus;
use crate::devices::SlaveDevice;
use crate::line::{BusLine, Direction};
use crate::timing::Timing;
use crate::Error;

/// ROM commands.
const SKIP_ROM: u8 = 0xcc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    WaitReset,
    ConfirmReset,
    Presence,
    WaitCommand,
    Dispatch,
}

/// What the line did while waiting for a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetPulse {
    Valid,
    TooShort,
    /// Bus idle, or low for an unknown time.
    None,
}

impl<L: BusLine> OneWireBus<L> {
    pub(crate) fn wait_reset(&mut self) -> Result<ResetPulse, Error> {
        self.release();
        let timeout = self.timing.reset_timeout;

        // A pulse already under way has an unknown length; let it pass.
        if self.wait_while(false, timeout) == 0 {
            return Ok(ResetPulse::None);
        }
        let remaining = self.wait_while(true, timeout);
        if remaining == 0 {
            return Ok(ResetPulse::None);
        }
        // The sample that saw the line rise was high as well.
        let high = timeout - remaining + 1;
        let settled = high >= self.speed().settle;

        let remaining = self.wait_while(false, timeout);
        if remaining == 0 {
            return Err(Error::VeryLongReset);
        }
        if !settled {
            return Ok(ResetPulse::TooShort);
        }
        // The sample that caught the falling edge counts too.
        Ok(self.classify_reset(timeout - remaining + 1))
    }

    /// Finish a reset that was detected mid-slot. Returns false if the line
    /// rose early after all, i.e. it was only a long slot.
    pub(crate) fn confirm_reset(&mut self) -> Result<bool, Error> {
        let speed = self.speed();
        let rest = speed.reset_min - speed.slot_max - speed.read_max;
        if self.wait_while(false, rest) != 0 {
            return Ok(false);
        }
        // Low for a slot, its budget and `rest` on top: that is a reset.
        let remaining = self.wait_while(false, self.timing.reset_timeout);
        if remaining == 0 {
            return Err(Error::VeryLongReset);
        }
        // Lower bound, the slot that caught the falling edge is left out.
        let low = speed.slot_max + rest + (self.timing.reset_timeout - remaining);
        if self.overdrive && low >= self.timing.normal.reset_min {
            self.overdrive = false;
        }
        Ok(true)
    }

    fn classify_reset(&mut self, low: u32) -> ResetPulse {
        if low < self.speed().reset_min {
            return ResetPulse::TooShort;
        }
        if self.overdrive && low >= self.timing.normal.reset_min {
            self.overdrive = false;
        }
        ResetPulse::Valid
    }

    pub(crate) fn show_presence(&mut self) -> Result<(), Error> {
        let speed = self.speed();

        // The master samples some time after releasing the reset.
        self.wait_while(true, self.timing.presence_timeout);

        self.line.drive_low();
        self.line.set_direction(Direction::Output);
        self.spin(speed.presence_min);
        self.release();

        if self.wait_while(false, speed.presence_max - speed.presence_min) == 0 {
            return Err(Error::PresenceLowOnLine);
        }
        Ok(())
    }
}

/// The emulated bus presence: one line, at most one attached device.
pub struct OneWireHub<'a, L, D> {
    bus: OneWireBus<L>,
    slave: Option<&'a mut D>,
    error: Option<Error>,
}

impl<'a, L: BusLine, D: SlaveDevice<L>> OneWireHub<'a, L, D> {
    pub fn new(line: L, timing: Timing) -> Self {
        Self {
            bus: OneWireBus::new(line, timing),
            slave: None,
            error: None,
        }
    }

    /// Put `device` on the bus. Hands it back if the slot is taken.
    pub fn attach(&mut self, device: &'a mut D) -> Result<(), &'a mut D> {
        if self.slave.is_some() {
            return Err(device);
        }
        debug!("attach {:x}", device.rom_id());
        self.slave = Some(device);
        Ok(())
    }

    /// Take the device off the bus.
    pub fn detach(&mut self) -> Option<&'a mut D> {
        self.slave.take()
    }

    pub fn is_attached(&self) -> bool {
        self.slave.is_some()
    }

    pub fn bus(&self) -> &OneWireBus<L> {
        &self.bus
    }

    pub fn overdrive(&self) -> bool {
        self.bus.overdrive()
    }

    pub fn set_overdrive(&mut self, overdrive: bool) {
        self.bus.set_overdrive(overdrive);
    }

    /// Error that ended the last cycle, if any.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn clear_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Serve the bus until it goes idle or a cycle fails.
    ///
    /// Returns at once if no device is attached. Call it again right away:
    /// the next reset can follow a finished transaction within a few hundred
    /// microseconds.
    pub fn poll(&mut self) -> Result<(), Error> {
        self.error = None;
        let Some(slave) = self.slave.as_deref_mut() else {
            return Ok(());
        };
        let bus = &mut self.bus;

        let mut state = State::WaitReset;
        let result = loop {
            state = match state {
                State::WaitReset => match bus.wait_reset() {
                    Ok(ResetPulse::Valid) => State::Presence,
                    Ok(ResetPulse::TooShort) => State::WaitReset,
                    Ok(ResetPulse::None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                State::ConfirmReset => match bus.confirm_reset() {
                    Ok(true) => State::Presence,
                    Ok(false) => State::WaitReset,
                    Err(e) => break Err(e),
                },
                State::Presence => match bus.show_presence() {
                    Ok(()) => State::WaitCommand,
                    Err(e) => break Err(e),
                },
                State::WaitCommand => match bus.recv_byte() {
                    Ok(SKIP_ROM) => State::Dispatch,
                    Ok(cmd) => break Err(Error::IncorrectOnewireCmd(cmd)),
                    Err(Error::ResetInProgress) => State::ConfirmReset,
                    Err(e) => break Err(e),
                },
                State::Dispatch => match slave.duty(bus) {
                    Ok(()) => State::WaitReset,
                    Err(Error::ResetInProgress) => State::ConfirmReset,
                    Err(e) => break Err(e),
                },
            };
        };
        bus.release();

        if let Err(e) = result {
            warn!("1-Wire cycle aborted in {}: {}", state, e);
            self.error = Some(e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc8;
    use crate::ds2502::{Ds2502, MEMORY_SIZE};
    use crate::sim::{MasterScript, SimLine, RESET_LOW};
    use proptest::prelude::*;

    const SERIAL: [u8; 6] = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
    const READ_MEMORY: [u8; 3] = [0xf0, 0x00, 0x00];

    fn timing() -> Timing {
        Timing::from_calibration(1, 1)
    }

    fn contents() -> [u8; MEMORY_SIZE] {
        core::array::from_fn(|i| (i as u8).wrapping_mul(37) ^ 0x5a)
    }

    fn device() -> Ds2502 {
        Ds2502::with_memory(SERIAL, &contents())
    }

    fn hub(script: MasterScript, ds: &mut Ds2502) -> OneWireHub<'_, SimLine, Ds2502> {
        let mut hub = OneWireHub::new(SimLine::new(script), timing());
        assert!(hub.attach(ds).is_ok());
        hub
    }

    fn reset_then(commands: &[u8]) -> MasterScript {
        MasterScript::new()
            .idle(100)
            .reset()
            .write_bytes(&[SKIP_ROM])
            .write_bytes(commands)
    }

    #[test]
    fn full_memory_read() {
        let mut ds = device();
        let script = reset_then(&READ_MEMORY)
            .read_bytes(1 + MEMORY_SIZE + 1)
            .idle(100);
        let mut hub = hub(script, &mut ds);

        assert_eq!(Ok(()), hub.poll());
        assert!(!hub.has_error());

        let line = hub.bus().line();
        let received = line.master_received();
        assert_eq!(0x8d, received[0]);
        assert_eq!(crc8(&READ_MEMORY), received[0]);
        assert_eq!(&contents()[..], &received[1..1 + MEMORY_SIZE]);
        assert_eq!(crc8(&contents()), received[MEMORY_SIZE + 1]);
        assert_eq!(0, crc8(&received[1..]));
        assert!(!line.is_driven());
    }

    #[test]
    fn presence_pulse_lies_in_the_window() {
        let reset = MasterScript::new().idle(100).pulse(RESET_LOW);
        let released = reset.end();
        let mut ds = device();
        let mut hub = hub(reset.idle(100), &mut ds);
        assert_eq!(Err(Error::FirstBitOfByteTimeout), hub.poll());

        let t = *hub.bus().timing();
        let (start, end) = hub.bus().line().slave_pulls()[0];
        assert!(start >= released);
        assert!(start - released <= u64::from(t.presence_timeout) + 1);
        assert!(end - start >= u64::from(t.normal.presence_min));
        assert!(end - start <= u64::from(t.normal.presence_max));
        // Masters sample presence about 70us after releasing the reset.
        assert!((start..end).contains(&(released + 70)));
    }

    #[test]
    fn unsupported_rom_command_stays_silent() {
        let mut ds = device();
        let script = MasterScript::new()
            .idle(100)
            .reset()
            .write_bytes(&[0x33])
            .read_bytes(2)
            .idle(100);
        let mut hub = hub(script, &mut ds);

        assert_eq!(Err(Error::IncorrectOnewireCmd(0x33)), hub.poll());
        assert_eq!(Some(Error::IncorrectOnewireCmd(0x33)), hub.error());

        let line = hub.bus().line();
        assert_eq!(1, line.slave_pulls().len(), "presence only");
        assert_eq!(vec![0xff, 0xff], line.master_received());
    }

    #[test]
    fn next_poll_after_failed_cycle_waits_for_a_reset() {
        let mut ds = device();
        let script = MasterScript::new()
            .idle(100)
            .reset()
            .write_bytes(&[0x33])
            .idle(200)
            .reset()
            .write_bytes(&[SKIP_ROM])
            .write_bytes(&READ_MEMORY)
            .read_bytes(1 + MEMORY_SIZE + 1)
            .idle(100);
        let mut hub = hub(script, &mut ds);

        assert_eq!(Err(Error::IncorrectOnewireCmd(0x33)), hub.poll());
        assert_eq!(Ok(()), hub.poll());
        assert_eq!(None, hub.error());

        let received = hub.bus().line().master_received();
        assert_eq!(&contents()[..], &received[1..1 + MEMORY_SIZE]);
    }

    /// Read `before` bytes from address 0, reset, then read all of memory
    /// from `restart`.
    fn read_cut_short_by_reset(before: usize, restart: u8) -> MasterScript {
        reset_then(&READ_MEMORY)
            .read_bytes(before)
            .reset()
            .write_bytes(&[SKIP_ROM])
            .write_bytes(&[0xf0, restart, 0x00])
            .read_bytes(1 + MEMORY_SIZE - usize::from(restart) + 1)
            .idle(100)
    }

    fn assert_second_read(received: &[u8], restart: u8) {
        let data = &contents()[usize::from(restart)..];
        assert_eq!(crc8(&[0xf0, restart, 0x00]), received[0]);
        assert_eq!(data, &received[1..1 + data.len()]);
        assert_eq!(crc8(data), received[1 + data.len()]);
    }

    #[test]
    fn reset_on_a_zero_bit_ends_the_read() {
        let data = contents();
        assert_eq!(0, data[2] & 1);

        let mut ds = device();
        let mut hub = hub(read_cut_short_by_reset(3, 5), &mut ds);
        assert_eq!(Ok(()), hub.poll());

        let received = hub.bus().line().master_received();
        assert_eq!(&[0x8d, data[0], data[1]], &received[..3]);
        assert_second_read(&received[3..], 5);
    }

    #[test]
    fn reset_on_a_one_bit_ends_the_read() {
        let data = contents();
        assert_eq!(1, data[1] & 1);

        let mut ds = device();
        let mut hub = hub(read_cut_short_by_reset(2, 5), &mut ds);
        assert_eq!(Ok(()), hub.poll());
        assert_eq!(2, hub.bus().line().slave_pulls().iter().filter(|(s, e)| e - s == 160).count());

        let received = hub.bus().line().master_received();
        assert_eq!(&[0x8d, data[0]], &received[..2]);
        assert_second_read(&received[2..], 5);
    }

    #[test]
    fn reset_while_receiving_the_address() {
        let script = reset_then(&[0xf0])
            .reset()
            .write_bytes(&[SKIP_ROM])
            .write_bytes(&[0xf0, 40, 0x00])
            .read_bytes(1 + 4 + 1)
            .idle(100);
        let mut ds = device();
        let mut hub = hub(script, &mut ds);
        assert_eq!(Ok(()), hub.poll());
        assert_second_read(&hub.bus().line().master_received(), 40);
    }

    #[test]
    fn reset_while_receiving_the_rom_command() {
        let script = MasterScript::new()
            .idle(100)
            .reset()
            .write_bits(&[false, true, true])
            .reset()
            .write_bytes(&[SKIP_ROM])
            .write_bytes(&[0xf0, 40, 0x00])
            .read_bytes(1 + 4 + 1)
            .idle(100);
        let mut ds = device();
        let mut hub = hub(script, &mut ds);
        assert_eq!(Ok(()), hub.poll());
        assert_eq!(None, hub.error());
        assert_second_read(&hub.bus().line().master_received(), 40);
    }

    #[test]
    fn redirected_page_is_served_on_the_bus() {
        let mut ds = device();
        assert!(ds.set_page_redirection(0, 1));
        let expected: Vec<u8> = (0..MEMORY_SIZE as u8)
            .map(|a| {
                let a = usize::from(ds.translate_redirection(a));
                contents().get(a).copied().unwrap_or(0xff)
            })
            .collect();
        assert_eq!(contents()[32], expected[0]);
        assert_eq!(0xff, expected[12]);

        let script = reset_then(&READ_MEMORY)
            .read_bytes(1 + MEMORY_SIZE + 1)
            .idle(100);
        let mut hub = hub(script, &mut ds);
        assert_eq!(Ok(()), hub.poll());

        let received = hub.bus().line().master_received();
        assert_eq!(&expected[..], &received[1..1 + MEMORY_SIZE]);
        assert_eq!(crc8(&expected), received[MEMORY_SIZE + 1]);
    }

    #[test]
    fn read_from_the_middle_of_memory() {
        let mut ds = device();
        let script = reset_then(&[0xf0, 40, 0x00]).read_bytes(1 + 4 + 1).idle(100);
        let mut hub = hub(script, &mut ds);
        assert_eq!(Ok(()), hub.poll());

        let received = hub.bus().line().master_received();
        assert_eq!(crc8(&[0xf0, 40, 0x00]), received[0]);
        assert_eq!(&contents()[40..], &received[1..5]);
        assert_eq!(crc8(&contents()[40..]), received[5]);
    }

    #[test]
    fn two_byte_address_is_refused() {
        let mut ds = device();
        let script = reset_then(&[0xf0, 0x00, 0x01]).read_bytes(2).idle(100);
        let mut hub = hub(script, &mut ds);

        assert_eq!(Err(Error::IncorrectSlaveUsage), hub.poll());
        assert_eq!(vec![0xff, 0xff], hub.bus().line().master_received());
    }

    #[test]
    fn unknown_device_command_stays_silent() {
        let mut ds = device();
        let script = reset_then(&[0xaa, 0x00, 0x00]).read_bytes(2).idle(100);
        let mut hub = hub(script, &mut ds);

        assert_eq!(Ok(()), hub.poll());
        let line = hub.bus().line();
        assert_eq!(1, line.slave_pulls().len());
        assert_eq!(vec![0xff, 0xff], line.master_received());
    }

    #[test]
    fn master_abandoning_after_command_is_a_byte_boundary_timeout() {
        let mut ds = device();
        let mut hub = hub(reset_then(&READ_MEMORY), &mut ds);
        assert_eq!(Err(Error::FirstBitOfByteTimeout), hub.poll());
        assert_eq!(Some(Error::FirstBitOfByteTimeout), hub.clear_error());
        assert!(!hub.has_error());
    }

    #[test]
    fn line_stuck_low_after_presence() {
        let mut ds = device();
        let script = MasterScript::new().idle(100).pulse(RESET_LOW).idle(100).pulse(700);
        let mut hub = hub(script, &mut ds);
        assert_eq!(Err(Error::PresenceLowOnLine), hub.poll());
        assert!(!hub.bus().line().is_driven());
    }

    #[test]
    fn endless_reset_is_reported() {
        let mut ds = device();
        let script = MasterScript::new().idle(100).pulse(6000);
        let mut hub = hub(script, &mut ds);
        assert_eq!(Err(Error::VeryLongReset), hub.poll());
        assert!(hub.bus().line().slave_pulls().is_empty());
    }

    #[test]
    fn reset_boundary() {
        let t = timing();
        let min = u64::from(t.normal.reset_min);

        let mut ds = device();
        let mut short = hub(MasterScript::new().idle(100).pulse(min - 1).idle(500), &mut ds);
        assert_eq!(Ok(()), short.poll());
        assert!(short.bus().line().slave_pulls().is_empty());

        let mut ds = device();
        let mut exact = hub(MasterScript::new().idle(100).pulse(min).idle(500), &mut ds);
        // Presence, then no command arrives.
        assert_eq!(Err(Error::FirstBitOfByteTimeout), exact.poll());
        assert_eq!(1, exact.bus().line().slave_pulls().len());
    }

    #[test]
    fn reset_needs_a_settled_line() {
        let script = MasterScript::new()
            .idle(100)
            .pulse(300)
            .idle(2)
            .pulse(RESET_LOW)
            .idle(600);
        let mut bus = OneWireBus::new(SimLine::new(script.clone()), timing());
        assert_eq!(Ok(ResetPulse::TooShort), bus.wait_reset());
        assert_eq!(Ok(ResetPulse::TooShort), bus.wait_reset());

        let mut ds = device();
        let mut hub = hub(script, &mut ds);
        assert_eq!(Ok(()), hub.poll());
        assert!(hub.bus().line().slave_pulls().is_empty());
    }

    #[test]
    fn reset_after_the_settle_time_is_answered() {
        let settle = u64::from(timing().normal.settle);
        let script = MasterScript::new()
            .idle(100)
            .pulse(300)
            .idle(2 * settle)
            .pulse(RESET_LOW)
            .idle(600);
        let mut ds = device();
        let mut hub = hub(script, &mut ds);
        assert_eq!(Err(Error::FirstBitOfByteTimeout), hub.poll());
        assert_eq!(1, hub.bus().line().slave_pulls().len());
    }

    #[test]
    fn short_pulses_are_ignored_until_a_real_reset() {
        let mut ds = device();
        let script = MasterScript::new()
            .idle(100)
            .read_bytes(1)
            .pulse(200)
            .idle(300)
            .reset()
            .write_bytes(&[SKIP_ROM])
            .write_bytes(&READ_MEMORY)
            .read_bytes(1 + MEMORY_SIZE + 1)
            .idle(100);
        let mut hub = hub(script, &mut ds);
        assert_eq!(Ok(()), hub.poll());

        let received = hub.bus().line().master_received();
        assert_eq!(0xff, received[0], "nothing answered before the reset");
        assert_eq!(0x8d, received[1]);
        assert_eq!(&contents()[..], &received[2..2 + MEMORY_SIZE]);
    }

    #[test]
    fn overdrive_reset_keeps_overdrive() {
        let t = timing();
        let mut ds = device();
        let mut hub = hub(MasterScript::new().idle(100).pulse(60).idle(200), &mut ds);
        hub.set_overdrive(true);

        assert_eq!(Err(Error::FirstBitOfByteTimeout), hub.poll());
        assert!(hub.overdrive());
        let (start, end) = hub.bus().line().slave_pulls()[0];
        assert_eq!(u64::from(t.overdrive.presence_min), end - start);
    }

    #[test]
    fn normal_reset_drops_out_of_overdrive() {
        let mut ds = device();
        let script = reset_then(&READ_MEMORY)
            .read_bytes(1 + MEMORY_SIZE + 1)
            .idle(100);
        let mut hub = hub(script, &mut ds);
        hub.set_overdrive(true);

        assert_eq!(Ok(()), hub.poll());
        assert!(!hub.overdrive());
        assert_eq!(&contents()[..], &hub.bus().line().master_received()[1..1 + MEMORY_SIZE]);
    }

    #[test]
    fn normal_speed_ignores_overdrive_reset() {
        let mut ds = device();
        let mut hub = hub(MasterScript::new().idle(100).pulse(60).idle(200), &mut ds);
        assert_eq!(Ok(()), hub.poll());
        assert!(hub.bus().line().slave_pulls().is_empty());
    }

    #[test]
    fn nothing_attached_leaves_the_bus_alone() {
        let mut hub: OneWireHub<'_, SimLine, Ds2502> =
            OneWireHub::new(SimLine::new(MasterScript::new().reset()), timing());
        assert_eq!(Ok(()), hub.poll());
        assert_eq!(0, hub.bus().line().now());
    }

    #[test]
    fn single_attach_slot() {
        let mut first = device();
        let mut second = Ds2502::new([0; 6]);
        let mut hub = OneWireHub::new(SimLine::new(MasterScript::new()), timing());

        assert!(hub.attach(&mut first).is_ok());
        let second = hub.attach(&mut second).unwrap_err();
        assert!(hub.is_attached());

        let detached = hub.detach().map(|d| *SlaveDevice::<SimLine>::rom_id(&*d));
        assert_eq!(Some(crate::devices::rom_id(0x09, SERIAL)), detached);
        assert!(!hub.is_attached());
        assert!(hub.attach(second).is_ok());
    }

    fn confirm_reset(low: u64, overdrive: bool) -> (Result<bool, Error>, bool) {
        let script = MasterScript::new().pulse(low).idle(50);
        let mut bus = OneWireBus::new(SimLine::new(script), timing());
        bus.set_overdrive(overdrive);
        (bus.confirm_reset(), bus.overdrive())
    }

    #[test]
    fn interrupted_reset_is_confirmed_once_the_rest_passes() {
        let t = timing();
        let rest = u64::from(t.normal.reset_min - t.normal.slot_max - t.normal.read_max);
        assert_eq!((Ok(false), false), confirm_reset(rest - 1, false));
        assert_eq!((Ok(true), false), confirm_reset(rest, false));
        assert_eq!((Ok(true), false), confirm_reset(RESET_LOW, false));
        assert_eq!((Err(Error::VeryLongReset), false), confirm_reset(6000, false));
    }

    #[test]
    fn interrupted_normal_reset_leaves_overdrive() {
        assert_eq!((Ok(true), false), confirm_reset(RESET_LOW, true));
        // Overdrive-length reset.
        assert_eq!((Ok(true), true), confirm_reset(60, true));
        // A long overdrive slot.
        assert_eq!((Ok(false), true), confirm_reset(5, true));
    }

    fn wait_reset(low: u64) -> Result<ResetPulse, Error> {
        let script = MasterScript::new().idle(100).pulse(low).idle(50);
        OneWireBus::new(SimLine::new(script), timing()).wait_reset()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn pulses_within_the_reset_window_are_resets(low in 430u64..=960) {
            prop_assert_eq!(Ok(ResetPulse::Valid), wait_reset(low));
        }

        #[test]
        fn long_pulses_released_before_the_timeout_are_resets(low in 961u64..=5000) {
            prop_assert_eq!(Ok(ResetPulse::Valid), wait_reset(low));
        }

        #[test]
        fn short_pulses_are_not_resets(low in 1u64..430) {
            prop_assert_eq!(Ok(ResetPulse::TooShort), wait_reset(low));
        }
    }

    #[test]
    fn reset_timeout_edge() {
        assert_eq!(Ok(ResetPulse::Valid), wait_reset(5000));
        assert_eq!(Err(Error::VeryLongReset), wait_reset(5001));
    }
}
