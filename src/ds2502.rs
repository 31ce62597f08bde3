//! DS2502 1Kbit add-only memory.
//!
//! The chip is organised in 32-byte pages plus an 8-byte status block:
//!
//! | Status byte | Content                                                   |
//! | ----------- | --------------------------------------------------------- |
//! | 0           | bit `p`: write protect page `p`, bit `p + 4`: page `p` used |
//! | 1..=4       | redirection byte per page, 0xFF = not redirected          |
//! | 5, 6        | reserved                                                  |
//! | 7           | factory programmed, always 0x00                           |
//!
//! A redirection byte holds the one's complement of the replacement page,
//! so erased EPROM (0xFF) reads as "no redirection". The flip side is that no
//! page can be redirected to page 0.
//!
//! Only the first [`MEMORY_SIZE`] bytes are backed by storage, enough for a
//! power adapter ID; anything beyond reads as 0xFF like unprogrammed EPROM.
//! Programming over the bus needs the 12 V pulse and is not emulated.

use crate::bus::OneWireBus;
use crate::devices::{rom_id, FamilyCodes, SlaveDevice};
use crate::line::BusLine;
use crate::{crc8, crc8_update, Error, RomId};

pub const FAMILY_CODE: u8 = FamilyCodes::DS2502;

const PAGE_SHIFT: u8 = 5;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
const PAGE_MASK: u8 = (PAGE_SIZE - 1) as u8;

/// Bytes backed by storage.
pub const MEMORY_SIZE: usize = 44;
/// Pages that have at least one backed byte.
pub const PAGE_COUNT: u8 = MEMORY_SIZE.div_ceil(PAGE_SIZE) as u8;

const STATUS_SIZE: usize = 8;
const STATUS_WP_PAGES: usize = 0x00;
const STATUS_PG_REDIR: usize = 0x01;
const STATUS_FACTORYP: usize = 0x07;

const _: () = assert!(MEMORY_SIZE < 256, "single-byte addressing");
const _: () = assert!(PAGE_COUNT <= 4, "status block covers four pages");

/// Function commands.
const READ_MEMORY: u8 = 0xf0;

pub struct Ds2502 {
    rom: RomId,
    memory: [u8; MEMORY_SIZE],
    status: [u8; STATUS_SIZE],
}

impl Ds2502 {
    /// Blank device: memory unprogrammed, no page used or redirected.
    pub fn new(serial: [u8; 6]) -> Self {
        let mut ds = Self {
            rom: rom_id(FAMILY_CODE, serial),
            memory: [0xff; MEMORY_SIZE],
            status: [0; STATUS_SIZE],
        };
        ds.clear_status();
        ds
    }

    /// Device preloaded with `contents` from address 0.
    pub fn with_memory(serial: [u8; 6], contents: &[u8]) -> Self {
        let mut ds = Self::new(serial);
        ds.write_memory(contents, 0);
        ds
    }

    pub fn clear_memory(&mut self) {
        self.memory.fill(0xff);
    }

    pub fn clear_status(&mut self) {
        self.status.fill(0xff);
        self.status[STATUS_FACTORYP] = 0x00;
    }

    /// Copy `source` into memory at `position`, clipped to the backed
    /// memory. Returns false when nothing fit.
    pub fn write_memory(&mut self, source: &[u8], position: u8) -> bool {
        let position = usize::from(position);
        if position >= MEMORY_SIZE {
            return false;
        }
        let len = source.len().min(MEMORY_SIZE - position);
        self.memory[position..position + len].copy_from_slice(&source[..len]);
        len == source.len()
    }

    /// Fill `destination` from memory at `position`; false if the range
    /// leaves the backed memory.
    pub fn read_memory(&self, destination: &mut [u8], position: u8) -> bool {
        let position = usize::from(position);
        match self.memory.get(position..position + destination.len()) {
            Some(bytes) => {
                destination.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    pub fn read_status(&self, address: u8) -> u8 {
        self.status
            .get(usize::from(address))
            .copied()
            .unwrap_or(0xff)
    }

    /// Program a status byte. Like the EPROM cells, bits only go from 1
    /// to 0. Returns the resulting byte.
    pub fn write_status(&mut self, address: u8, value: u8) -> u8 {
        match self.status.get_mut(usize::from(address)) {
            Some(byte) => {
                *byte &= value;
                *byte
            }
            None => 0xff,
        }
    }

    pub fn set_page_protection(&mut self, page: u8) {
        if page < PAGE_COUNT {
            self.status[STATUS_WP_PAGES] &= !(1 << page);
        }
    }

    pub fn page_protection(&self, page: u8) -> bool {
        page < PAGE_COUNT && self.status[STATUS_WP_PAGES] & (1 << page) == 0
    }

    /// Mark `page` used. Out-of-range pages are ignored.
    pub fn set_page_used(&mut self, page: u8) {
        if page < PAGE_COUNT {
            self.status[STATUS_WP_PAGES] &= !(1 << (page + 4));
        }
    }

    pub fn page_used(&self, page: u8) -> bool {
        page < PAGE_COUNT && self.status[STATUS_WP_PAGES] & (1 << (page + 4)) == 0
    }

    /// Serve reads of `source` from `destination`. Redirecting a page to
    /// itself removes the redirection. Returns false, changing nothing, if
    /// either page is out of range.
    pub fn set_page_redirection(&mut self, source: u8, destination: u8) -> bool {
        if source >= PAGE_COUNT || destination >= PAGE_COUNT {
            return false;
        }
        self.status[STATUS_PG_REDIR + usize::from(source)] = if source == destination {
            0xff
        } else {
            !destination
        };
        true
    }

    /// Page that serves reads of `page`; 0 for pages out of range.
    pub fn page_redirection(&self, page: u8) -> u8 {
        if page >= PAGE_COUNT {
            return 0;
        }
        match self.redirection_byte(page) {
            0xff => page,
            redirect => !redirect,
        }
    }

    fn redirection_byte(&self, page: u8) -> u8 {
        self.status
            .get(STATUS_PG_REDIR + usize::from(page))
            .filter(|_| page < PAGE_COUNT)
            .copied()
            .unwrap_or(0xff)
    }

    /// Map a memory address through the page redirection table.
    pub fn translate_redirection(&self, address: u8) -> u8 {
        match self.redirection_byte(address >> PAGE_SHIFT) {
            0xff => address,
            redirect => (address & PAGE_MASK) | (!redirect << PAGE_SHIFT),
        }
    }

    fn byte_at(&self, address: u8) -> u8 {
        self.memory
            .get(usize::from(address))
            .copied()
            .unwrap_or(0xff)
    }

    /// READ MEMORY: CRC8 of command and address, then memory from `start`
    /// to the end of the backed memory, then the CRC8 of that data.
    ///
    /// Each byte goes out on its own so the master can end the read with a
    /// reset at any point. Past the final CRC the device stays quiet and the
    /// pull-up delivers the 1s the datasheet asks for.
    fn read_memory_cmd<L: BusLine>(
        &self,
        bus: &mut OneWireBus<L>,
        start: u8,
        header_crc: u8,
    ) -> Result<(), Error> {
        bus.send_byte(header_crc)?;

        let mut crc = 0;
        for address in usize::from(start)..MEMORY_SIZE {
            let byte = self.byte_at(self.translate_redirection(address as u8));
            bus.send_byte(byte)?;
            crc = crc8_update(crc, byte);
        }
        bus.send_byte(crc)
    }
}

impl<L: BusLine> SlaveDevice<L> for Ds2502 {
    fn rom_id(&self) -> &RomId {
        &self.rom
    }

    fn duty(&mut self, bus: &mut OneWireBus<L>) -> Result<(), Error> {
        let mut header = [0; 3];
        bus.recv(&mut header)?;
        let [cmd, address_low, address_high] = header;

        if address_high != 0 {
            debug!("ds2502: address {:x}{:x} out of range", address_high, address_low);
            return Err(Error::IncorrectSlaveUsage);
        }

        match cmd {
            READ_MEMORY => {
                self.read_memory_cmd(bus, address_low, crc8(&header))?;
                trace!("ds2502: memory read from {:x}", address_low);
                Ok(())
            }
            _ => {
                trace!("ds2502: ignoring command {:x}", cmd);
                Ok(())
            }
        }
    }
}
