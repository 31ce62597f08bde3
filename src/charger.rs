//! Dell power adapter identification.
//!
//! Dell laptops read a DS2502 in the adapter plug over the centre pin and
//! refuse to charge, or throttle, when it is missing or unknown. The memory
//! holds a 40 character ASCII record followed by its CRC-16, low byte first:
//!
//! ```text
//! DELL 00AC 065 195 033 CN05U0927161552F31B8A03
//!      |    |   |   |   PPID
//!      |    |   |   output current, 1/10 A
//!      |    |   output voltage, 1/10 V
//!      |    rated power, W
//!      adapter type
//! ```

use crate::crc16;
use crate::ds2502::{Ds2502, MEMORY_SIZE};

pub const ID_SIZE: usize = 40;
/// Record plus CRC-16 trailer.
pub const PAYLOAD_SIZE: usize = ID_SIZE + 2;

const _: () = assert!(PAYLOAD_SIZE <= MEMORY_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DellAdapter {
    W45,
    W65,
    W90,
    W130,
}

impl DellAdapter {
    pub const ALL: [DellAdapter; 4] = [Self::W45, Self::W65, Self::W90, Self::W130];

    pub const fn id(self) -> &'static [u8; ID_SIZE] {
        match self {
            Self::W45 => b"DELL00AC045195023CN0CDF577243865Q27F2A05",
            Self::W65 => b"DELL00AC065195033CN05U0927161552F31B8A03",
            Self::W90 => b"DELL00AC090195046CN0C80234866161R23H8A03",
            Self::W130 => b"DELL00AC130195067CN0CDF577243865Q27F2233",
        }
    }

    /// Rated power as written in the record.
    pub const fn watts(self) -> u16 {
        let id = self.id();
        let mut watts = 0;
        let mut i = 8;
        while i < 11 {
            watts = watts * 10 + (id[i] - b'0') as u16;
            i += 1;
        }
        watts
    }

    /// Memory image: the record, then its CRC-16 little endian.
    pub const fn payload(self) -> [u8; PAYLOAD_SIZE] {
        let id = self.id();
        let mut payload = [0; PAYLOAD_SIZE];
        let mut i = 0;
        while i < ID_SIZE {
            payload[i] = id[i];
            i += 1;
        }
        let crc = crc16(id).to_le_bytes();
        payload[ID_SIZE] = crc[0];
        payload[ID_SIZE + 1] = crc[1];
        payload
    }

    /// A DS2502 programmed the way the adapter leaves the factory.
    pub fn device(self, serial: [u8; 6]) -> Ds2502 {
        Ds2502::with_memory(serial, &self.payload())
    }
}
