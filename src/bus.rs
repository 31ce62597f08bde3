//! Bit and byte transport on the slave side.
//!
//! The master owns the clock: it opens every time slot with a falling edge.
//! The slave waits for the line to come back up (end of the previous slot),
//! waits for the next falling edge, and then either samples the line or
//! holds it low for a while. All waits are polling loops bounded by the
//! [`Timing`] profile.
//!
//! Bytes travel least significant bit first. Multi-bit transfers run in a
//! critical section and abort at the first failing bit; bytes already on
//! the wire are not rolled back, the master's own CRC check discards the
//! transaction.

use crate::line::{BusLine, Direction};
use crate::timing::{SpeedTiming, Timing};
use crate::{crc16_bit, Error};

/// The slave end of the bus: the line, its timing and the current speed.
pub struct OneWireBus<L> {
    pub(crate) line: L,
    pub(crate) timing: Timing,
    pub(crate) overdrive: bool,
}

impl<L: BusLine> OneWireBus<L> {
    /// Take over `line` and start listening at normal speed.
    ///
    /// Panics if `timing` breaks the window invariants (see
    /// [`Timing::validate`]).
    pub fn new(mut line: L, timing: Timing) -> Self {
        timing.validate();
        line.drive_low();
        line.set_direction(Direction::Input);
        Self {
            line,
            timing,
            overdrive: false,
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// True while the fast timing profile is in use.
    pub fn overdrive(&self) -> bool {
        self.overdrive
    }

    /// Switch the timing profile. Devices call this after accepting an
    /// overdrive command; the hub falls back on its own when it sees a
    /// normal-speed reset.
    pub fn set_overdrive(&mut self, overdrive: bool) {
        self.overdrive = overdrive;
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    pub fn into_inner(self) -> L {
        self.line
    }

    /// Windows for the current speed.
    pub(crate) fn speed(&self) -> SpeedTiming {
        *self.timing.speed(self.overdrive)
    }

    /// Stop driving and listen.
    pub(crate) fn release(&mut self) {
        self.line.set_direction(Direction::Input);
    }

    /// Spin while the line reads `level`, for at most `retries` samples.
    /// Returns the samples left when the level changed, 0 if it never did.
    pub(crate) fn wait_while(&mut self, level: bool, mut retries: u32) -> u32 {
        if retries == 0 {
            return 0;
        }
        while self.line.is_high() == level {
            retries -= 1;
            if retries == 0 {
                break;
            }
        }
        retries
    }

    /// Burn exactly `loops` samples, whatever the line does.
    pub(crate) fn spin(&mut self, loops: u32) {
        for _ in 0..loops {
            self.line.is_high();
        }
    }

    /// Wait for the current slot to end and the next one to begin.
    fn await_slot(&mut self, slot_max: u32) -> Result<(), Error> {
        if self.wait_while(false, slot_max) == 0 {
            return Err(Error::ResetInProgress);
        }
        if self.wait_while(true, self.timing.msg_high_timeout) == 0 {
            return Err(Error::AwaitTimeslotTimeoutHigh);
        }
        Ok(())
    }

    /// Answer one master read slot. A 0 holds the line low for the
    /// write-zero time; a 1 leaves it to the pull-up but still spends the
    /// slot so the next edge is not mistaken for this one.
    ///
    /// Interrupts must be masked by the caller.
    pub fn send_bit(&mut self, value: bool) -> Result<(), Error> {
        let speed = self.speed();
        self.await_slot(speed.slot_max)?;

        let budget = if value {
            speed.read_max
        } else {
            self.line.set_direction(Direction::Output);
            speed.write_zero
        };
        // A 1 that runs out of budget is a reset under way; the next slot
        // wait reports it.
        self.wait_while(false, budget);
        self.line.set_direction(Direction::Input);
        Ok(())
    }

    /// Receive one master write slot: 1 unless the master still holds the
    /// line low at the sample point.
    ///
    /// Interrupts must be masked by the caller.
    pub fn recv_bit(&mut self) -> Result<bool, Error> {
        let speed = self.speed();
        self.await_slot(speed.slot_max)?;
        Ok(self.wait_while(false, speed.read_min) > 0)
    }

    fn send_inner(&mut self, data: &[u8], mut crc16: Option<&mut u16>) -> Result<(), Error> {
        critical_section::with(|_| {
            self.line.drive_low();
            self.line.set_direction(Direction::Input);
            for byte in data {
                for i in 0..8 {
                    let bit = byte & (1 << i) != 0;
                    if let Err(e) = self.send_bit(bit) {
                        self.release();
                        return Err(if i == 0 { e.at_byte_boundary() } else { e });
                    }
                    if let Some(crc16) = crc16.as_deref_mut() {
                        *crc16 = crc16_bit(*crc16, bit);
                    }
                }
            }
            Ok(())
        })
    }

    fn recv_inner(&mut self, buf: &mut [u8], mut crc16: Option<&mut u16>) -> Result<(), Error> {
        critical_section::with(|_| {
            self.line.drive_low();
            self.line.set_direction(Direction::Input);
            for byte in buf.iter_mut() {
                let mut value = 0;
                for i in 0..8 {
                    let bit = match self.recv_bit() {
                        Ok(bit) => bit,
                        Err(e) => return Err(if i == 0 { e.at_byte_boundary() } else { e }),
                    };
                    if bit {
                        value |= 1 << i;
                    }
                    if let Some(crc16) = crc16.as_deref_mut() {
                        *crc16 = crc16_bit(*crc16, bit);
                    }
                }
                *byte = value;
            }
            Ok(())
        })
    }

    /// Send `data` to the master, byte by byte as it opens read slots.
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.send_inner(data, None)
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.send_inner(&[byte], None)
    }

    /// As [`Self::send`], folding every bit that made it onto the wire into
    /// `crc16`.
    pub fn send_with_crc16(&mut self, data: &[u8], crc16: &mut u16) -> Result<(), Error> {
        self.send_inner(data, Some(crc16))
    }

    /// Fill `buf` from master write slots.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.recv_inner(buf, None)
    }

    pub fn recv_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [0];
        self.recv_inner(&mut byte, None)?;
        Ok(byte[0])
    }

    /// As [`Self::recv`], folding every received bit into `crc16`.
    pub fn recv_with_crc16(&mut self, buf: &mut [u8], crc16: &mut u16) -> Result<(), Error> {
        self.recv_inner(buf, Some(crc16))
    }
}
