//! Devices the hub can impersonate.
//!
//! | Device  | Code | Emulated | Notes                                      |
//! | ------- | ---- | -------- | ------------------------------------------ |
//! | DS2502  |  09  | yes      | READ MEMORY only, no programming pulse     |
//! | DS1982  |  09  | yes      | iButton packaging of the DS2502            |
//!
//! A device gets the bus after the hub has handled reset, presence and the
//! ROM command, and runs the rest of the transaction itself.

use crate::bus::OneWireBus;
use crate::line::BusLine;
use crate::{crc8, Error, RomId};

/// Emulated devices and their family code
pub struct FamilyCodes {}
impl FamilyCodes {
    pub const DS2502: u8 = b'\x09';
    pub const DS1982: u8 = b'\x09';
}

/// Build a ROM ID from family code and serial number, appending the CRC8.
pub fn rom_id(family: u8, serial: [u8; 6]) -> RomId {
    let mut rom = [0; 8];
    rom[0] = family;
    rom[1..7].copy_from_slice(&serial);
    rom[7] = crc8(&rom[..7]);
    rom
}

/// A slave the hub can dispatch to.
pub trait SlaveDevice<L: BusLine> {
    fn rom_id(&self) -> &RomId;

    /// Serve the transaction that follows the ROM command, talking to the
    /// master through `bus`. Return as soon as a transfer fails; the hub
    /// decides what the error means for the bus. Return
    /// [`Error::IncorrectSlaveUsage`] to flag a request the device refuses.
    fn duty(&mut self, bus: &mut OneWireBus<L>) -> Result<(), Error>;
}
