//! Bus timing expressed in polling-loop iterations.
//!
//! There is no hardware timer behind the slave: every wait is a loop that
//! samples the line once per iteration, so durations are loop counts. The
//! counts are derived once, at build time, from the reference microsecond
//! table and the measured number of CPU cycles one polling iteration takes
//! on the target (its "instructions per loop").

/// Windows for one bus speed, in loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpeedTiming {
    /// Shortest low pulse accepted as a reset.
    pub reset_min: u32,
    /// Longest regular reset pulse.
    pub reset_max: u32,
    /// How long the presence pulse is held low.
    pub presence_min: u32,
    /// Latest moment the line must be high again after the presence pulse.
    pub presence_max: u32,
    /// Longest a time slot may keep the line low.
    pub slot_max: u32,
    /// Sample point after the falling edge of a write slot.
    pub read_min: u32,
    /// Budget for a master read slot in which the slave sends a 1.
    pub read_max: u32,
    /// How long the slave holds the line low to send a 0.
    pub write_zero: u32,
    /// Minimum high time before a falling edge may start a reset.
    pub settle: u32,
}

/// Complete timing profile: both speeds plus the speed-independent timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    pub normal: SpeedTiming,
    pub overdrive: SpeedTiming,
    /// Bus-idle timeout while waiting for a reset, also the longest low
    /// pulse still accepted as one.
    pub reset_timeout: u32,
    /// Delay between the end of a reset and the presence pulse.
    pub presence_timeout: u32,
    /// How long to wait for the master to open the next time slot.
    pub msg_high_timeout: u32,
}

/// Reference windows in microseconds, as `[normal, overdrive]`.
mod us {
    pub const RESET_MIN: [u32; 2] = [430, 48];
    pub const RESET_MAX: [u32; 2] = [960, 80];
    pub const PRESENCE_MIN: [u32; 2] = [160, 8];
    pub const PRESENCE_MAX: [u32; 2] = [480, 32];
    pub const SLOT_MAX: [u32; 2] = [135, 30];
    pub const READ_MIN: [u32; 2] = [20, 4];
    pub const READ_MAX: [u32; 2] = [60, 10];
    pub const WRITE_ZERO: [u32; 2] = [30, 8];
    pub const SETTLE: [u32; 2] = [10, 2];

    pub const RESET_TIMEOUT: u32 = 5000;
    pub const PRESENCE_TIMEOUT: u32 = 20;
    pub const MSG_HIGH_TIMEOUT: u32 = 15000;
}

/// Convert microseconds to polling loops.
pub const fn us_to_loops(us: u32, cycles_per_us: u32, instructions_per_loop: u32) -> u32 {
    ((us as u64 * cycles_per_us as u64) / instructions_per_loop as u64) as u32
}

impl SpeedTiming {
    const fn from_us(index: usize, cycles_per_us: u32, instructions_per_loop: u32) -> Self {
        let (c, i) = (cycles_per_us, instructions_per_loop);
        Self {
            reset_min: us_to_loops(us::RESET_MIN[index], c, i),
            reset_max: us_to_loops(us::RESET_MAX[index], c, i),
            presence_min: us_to_loops(us::PRESENCE_MIN[index], c, i),
            presence_max: us_to_loops(us::PRESENCE_MAX[index], c, i),
            slot_max: us_to_loops(us::SLOT_MAX[index], c, i),
            read_min: us_to_loops(us::READ_MIN[index], c, i),
            read_max: us_to_loops(us::READ_MAX[index], c, i),
            write_zero: us_to_loops(us::WRITE_ZERO[index], c, i),
            settle: us_to_loops(us::SETTLE[index], c, i),
        }
    }

    const fn validate(&self) {
        // Resuming an interrupted reset waits `reset_min - slot_max - read_max`.
        assert!(
            self.reset_min > self.slot_max + self.read_max,
            "reset is indistinguishable from a time slot"
        );
        assert!(
            self.read_max > self.write_zero,
            "read budget must exceed the write-zero hold"
        );
        assert!(self.reset_max > self.reset_min, "empty reset window");
        assert!(self.presence_max > self.presence_min, "empty presence window");
        assert!(self.settle > 0, "settle time below one loop");
    }
}

impl Timing {
    /// Build the profile for a CPU running `cycles_per_us` cycles per
    /// microsecond whose polling loop takes `instructions_per_loop` cycles.
    ///
    /// Panics if the resulting windows overlap; used to initialise a `const`
    /// this turns into a build error.
    pub const fn from_calibration(cycles_per_us: u32, instructions_per_loop: u32) -> Self {
        assert!(instructions_per_loop > 0, "architecture not calibrated");
        let (c, i) = (cycles_per_us, instructions_per_loop);
        let timing = Self {
            normal: SpeedTiming::from_us(0, c, i),
            overdrive: SpeedTiming::from_us(1, c, i),
            reset_timeout: us_to_loops(us::RESET_TIMEOUT, c, i),
            presence_timeout: us_to_loops(us::PRESENCE_TIMEOUT, c, i),
            msg_high_timeout: us_to_loops(us::MSG_HIGH_TIMEOUT, c, i),
        };
        timing.validate();
        timing
    }

    /// Check the invariants between windows. `from_calibration` already does
    /// this and so does `OneWireBus::new`, for hand-tuned profiles.
    pub const fn validate(&self) {
        self.normal.validate();
        self.overdrive.validate();
        assert!(
            self.normal.reset_max > self.overdrive.reset_min,
            "normal reset window must cover the overdrive one"
        );
        assert!(
            self.reset_timeout > self.normal.reset_max,
            "idle timeout shorter than a reset"
        );
        assert!(
            self.overdrive.read_min > 2,
            "architecture is too slow for these windows"
        );
    }

    /// Windows for the requested speed.
    pub const fn speed(&self, overdrive: bool) -> &SpeedTiming {
        if overdrive {
            &self.overdrive
        } else {
            &self.normal
        }
    }
}
