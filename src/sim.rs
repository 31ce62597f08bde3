//! Simulated bus for exercising the slave without hardware.
//!
//! Time is virtual: one tick per [`BusLine::is_high`] call, which is exactly
//! the unit the timing profile counts in. A [`MasterScript`] lays out, up
//! front, every interval in which the master pulls the line low; the slave
//! runs against it and [`SimLine`] records every interval the slave pulled
//! the line low. Master read slots are decoded afterwards from that record.
//!
//! Slot shapes follow the usual master timings with one tick per
//! microsecond (`Timing::from_calibration(1, 1)`).

use std::vec::Vec;

use crate::line::{BusLine, Direction};

/// Length of one master time slot, recovery included.
pub const SLOT: u64 = 70;
/// Low time that opens a write-1 or read slot.
pub const SHORT_LOW: u64 = 6;
/// Low time of a write-0 slot.
pub const WRITE_ZERO_LOW: u64 = 60;
/// Where the master samples a read slot, from its falling edge.
pub const SAMPLE_AT: u64 = 15;
/// Standard reset low time and the presence window after it.
pub const RESET_LOW: u64 = 480;
pub const PRESENCE_WINDOW: u64 = 480;

/// Timeline of what the master does to the line.
#[derive(Debug, Clone, Default)]
pub struct MasterScript {
    now: u64,
    lows: Vec<(u64, u64)>,
    samples: Vec<u64>,
}

impl MasterScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave the line to the pull-up for `ticks`.
    pub fn idle(mut self, ticks: u64) -> Self {
        self.now += ticks;
        self
    }

    /// Pull the line low for `ticks`.
    pub fn pulse(mut self, ticks: u64) -> Self {
        self.lows.push((self.now, self.now + ticks));
        self.now += ticks;
        self
    }

    /// Standard reset pulse followed by the presence window.
    pub fn reset(self) -> Self {
        self.pulse(RESET_LOW).idle(PRESENCE_WINDOW)
    }

    pub fn write_bits(mut self, bits: &[bool]) -> Self {
        for bit in bits {
            let low = if *bit { SHORT_LOW } else { WRITE_ZERO_LOW };
            self.lows.push((self.now, self.now + low));
            self.now += SLOT;
        }
        self
    }

    /// Write bytes, least significant bit first.
    pub fn write_bytes(self, bytes: &[u8]) -> Self {
        let bits: Vec<bool> = bytes
            .iter()
            .flat_map(|b| (0..8).map(move |i| b & (1 << i) != 0))
            .collect();
        self.write_bits(&bits)
    }

    pub fn read_bits(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.lows.push((self.now, self.now + SHORT_LOW));
            self.samples.push(self.now + SAMPLE_AT);
            self.now += SLOT;
        }
        self
    }

    pub fn read_bytes(self, count: usize) -> Self {
        self.read_bits(count * 8)
    }

    /// Tick at which the script so far ends.
    pub fn end(&self) -> u64 {
        self.now
    }
}

/// Bus line driven by a [`MasterScript`] and the slave under test.
#[derive(Debug)]
pub struct SimLine {
    script: MasterScript,
    now: u64,
    direction: Direction,
    latch_low: bool,
    pull_started: Option<u64>,
    pulls: Vec<(u64, u64)>,
}

impl SimLine {
    pub fn new(script: MasterScript) -> Self {
        Self {
            script,
            now: 0,
            direction: Direction::Input,
            latch_low: false,
            pull_started: None,
            pulls: Vec::new(),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// True while the slave pulls the line low.
    pub fn is_driven(&self) -> bool {
        self.direction == Direction::Output
    }

    /// Completed intervals `[start, end)` in which the slave pulled low.
    pub fn slave_pulls(&self) -> &[(u64, u64)] {
        &self.pulls
    }

    fn master_low(&self, t: u64) -> bool {
        self.script.lows.iter().any(|&(s, e)| s <= t && t < e)
    }

    fn slave_low(&self, t: u64) -> bool {
        self.pulls.iter().any(|&(s, e)| s <= t && t < e)
            || self.pull_started.map_or(false, |s| s <= t)
    }

    /// Bits the master read in its read slots, in order.
    pub fn master_bits(&self) -> Vec<bool> {
        self.script
            .samples
            .iter()
            .map(|&t| !(self.master_low(t) || self.slave_low(t)))
            .collect()
    }

    /// Complete bytes the master read, least significant bit first.
    pub fn master_received(&self) -> Vec<u8> {
        self.master_bits()
            .chunks_exact(8)
            .map(|bits| {
                bits.iter()
                    .enumerate()
                    .fold(0, |byte, (i, bit)| byte | ((*bit as u8) << i))
            })
            .collect()
    }

    fn update_pull(&mut self) {
        let pulling = self.direction == Direction::Output;
        assert!(
            !pulling || self.latch_low,
            "slave drove the line high at tick {}",
            self.now
        );
        match (pulling, self.pull_started) {
            (true, None) => self.pull_started = Some(self.now),
            (false, Some(start)) => {
                self.pulls.push((start, self.now));
                self.pull_started = None;
            }
            _ => (),
        }
    }
}

impl BusLine for SimLine {
    fn is_high(&mut self) -> bool {
        let t = self.now;
        self.now += 1;
        !(self.master_low(t) || self.slave_low(t))
    }

    fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
        self.update_pull();
    }

    fn drive_low(&mut self) {
        self.latch_low = true;
        self.update_pull();
    }
}
