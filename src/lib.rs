#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Software 1-Wire slave that impersonates a DS2502 add-only EEPROM
//! (family 0x09) on a plain GPIO, so an unmodified bus master sees a real
//! device.
//!
//! There is no UART trick and no timer peripheral involved: the slave polls
//! the line in tight loops and counts iterations against a profile calibrated
//! for the CPU (see [`timing`]). That makes the whole transaction timing
//! critical:
//!
//! 1. [`OneWireHub::poll`] waits for a reset pulse, answers with a presence
//!    pulse and receives the ROM command. Only SKIP ROM (0xCC) is understood;
//!    with a single device on the hub it hands the bus to that device.
//!
//! 2. The device ([`ds2502::Ds2502`]) then drives the rest of the transaction
//!    itself through [`OneWireBus`]: command, target address, CRC-8 trailers
//!    and the memory stream.
//!
//! 3. Every multi-bit transfer runs inside a critical section. A timer
//!    interrupt in the middle of a slot would put the sample point off the
//!    master's slot.
//!
//! Errors end the current cycle and never the firmware: the master sees a
//! silent device or a CRC mismatch and retries after the next reset.
//!
//! 1-Wire is a trademark of Maxim Integrated.

// This mod MUST go first, so that the others see its macros.
#[macro_use]
mod fmt;

pub mod bus;
pub mod charger;
pub mod devices;
pub mod ds2502;
pub mod hub;
pub mod line;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod timing;

pub use bus::OneWireBus;
pub use devices::SlaveDevice;
pub use hub::OneWireHub;
pub use line::{BusLine, Direction, OpenDrainLine};
pub use timing::Timing;

/// All 1Wire devices carry an 8-byte ROM ID: family code, 48-bit serial,
/// CRC-8 over the first seven bytes.
pub type RomId = [u8; 8];

/// Reasons a bus cycle ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The line stayed low past the end of a time slot; a new reset is
    /// probably under way. Handled inside the hub, never returned by `poll`.
    ResetInProgress,
    /// The master held the line low longer than the bus-idle timeout.
    VeryLongReset,
    /// The line did not rise after the presence pulse was released.
    PresenceLowOnLine,
    /// The master never opened the next time slot.
    AwaitTimeslotTimeoutHigh,
    /// As `AwaitTimeslotTimeoutHigh`, but exactly at a byte boundary: the
    /// master abandoned the transaction.
    FirstBitOfByteTimeout,
    /// Unsupported ROM command.
    IncorrectOnewireCmd(u8),
    /// The device rejected what the master asked of it.
    IncorrectSlaveUsage,
}

impl Error {
    /// Refine a slot timeout that hit the first bit of a byte.
    pub(crate) fn at_byte_boundary(self) -> Self {
        match self {
            Error::AwaitTimeslotTimeoutHigh => Error::FirstBitOfByteTimeout,
            other => other,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::ResetInProgress => f.write_str("reset in progress"),
            Error::VeryLongReset => f.write_str("very long reset"),
            Error::PresenceLowOnLine => f.write_str("line stuck low after presence pulse"),
            Error::AwaitTimeslotTimeoutHigh => f.write_str("timed out waiting for time slot"),
            Error::FirstBitOfByteTimeout => f.write_str("master stopped at byte boundary"),
            Error::IncorrectOnewireCmd(cmd) => write!(f, "unsupported ROM command {:#04x}", cmd),
            Error::IncorrectSlaveUsage => f.write_str("incorrect slave usage"),
        }
    }
}

/// Incrementally calculate CRC8 from starting value and one new byte.
pub fn crc8_update(crc8: u8, data: u8) -> u8 {
    // See Maxim Application Note 27
    let mut crc8 = crc8 ^ data;
    for _ in 0..8 {
        if crc8 & 1 != 0 {
            crc8 = (crc8 >> 1) ^ 0x8c_u8;
        } else {
            crc8 >>= 1;
        }
    }
    crc8
}

/// Calculate 1Wire CRC8 of a sequence of bytes.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, b| crc8_update(crc, *b))
}

/// Fold one bit, as it crosses the bus, into a CRC16 (polynomial 0xA001,
/// reflected).
pub(crate) fn crc16_bit(crc16: u16, bit: bool) -> u16 {
    let mix = (crc16 & 1 != 0) ^ bit;
    let crc16 = crc16 >> 1;
    if mix {
        crc16 ^ 0xa001
    } else {
        crc16
    }
}

/// Continue the 1Wire CRC16 from `crc16` over `data`.
pub const fn crc16_update(mut crc16: u16, data: &[u8]) -> u16 {
    let mut i = 0;
    while i < data.len() {
        let mut byte = data[i];
        let mut bit = 0;
        while bit < 8 {
            let mix = (crc16 ^ byte as u16) & 1;
            crc16 >>= 1;
            if mix != 0 {
                crc16 ^= 0xa001;
            }
            byte >>= 1;
            bit += 1;
        }
        i += 1;
    }
    crc16
}

/// Calculate 1Wire CRC16 of a sequence of bytes.
pub const fn crc16(data: &[u8]) -> u16 {
    crc16_update(0, data)
}
