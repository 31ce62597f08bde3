//! The single open-drain data line shared with the bus master.
//!
//! A slave only ever pulls the line low; the pull-up resistor supplies the
//! high level. The hub therefore needs three effects from the pin: sample
//! the level, switch between listening and driving, and preset the output
//! latch to low so that "driving" always means "pulling low".

use core::convert::Infallible;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};

/// Pin direction as seen by the slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Tri-stated, the master or the pull-up decides the level.
    Input,
    /// Driving the output latch onto the line.
    Output,
}

/// Raw access to the bus line.
///
/// Every call to [`BusLine::is_high`] is one iteration of the polling loops
/// the timing profile is calibrated against, so implementations must not
/// block or sleep.
pub trait BusLine {
    /// Sample the current line level.
    fn is_high(&mut self) -> bool;

    /// Switch between listening and driving.
    fn set_direction(&mut self, direction: Direction);

    /// Preset the output latch to low. Takes effect on the line only while
    /// the direction is [`Direction::Output`].
    fn drive_low(&mut self);
}

impl<T: BusLine + ?Sized> BusLine for &mut T {
    fn is_high(&mut self) -> bool {
        T::is_high(self)
    }

    fn set_direction(&mut self, direction: Direction) {
        T::set_direction(self, direction)
    }

    fn drive_low(&mut self) {
        T::drive_low(self)
    }
}

/// [`BusLine`] over an open-drain `embedded-hal` pin, where setting the pin
/// high releases the line and setting it low pulls it down.
///
/// Pin errors are not recoverable inside a time slot, so only infallible pins
/// are accepted (which is what MCU GPIO drivers provide).
pub struct OpenDrainLine<P> {
    pin: P,
    latch_low: bool,
    direction: Direction,
}

impl<P> OpenDrainLine<P>
where
    P: InputPin + OutputPin + ErrorType<Error = Infallible>,
{
    /// Wrap `pin` and release the line.
    pub fn new(pin: P) -> Self {
        let mut line = Self {
            pin,
            latch_low: false,
            direction: Direction::Input,
        };
        line.apply();
        line
    }

    pub fn into_inner(self) -> P {
        self.pin
    }

    fn apply(&mut self) {
        let result = if self.direction == Direction::Output && self.latch_low {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        };
        match result {
            Ok(()) => (),
            Err(e) => match e {},
        }
    }
}

impl<P> BusLine for OpenDrainLine<P>
where
    P: InputPin + OutputPin + ErrorType<Error = Infallible>,
{
    fn is_high(&mut self) -> bool {
        match self.pin.is_high() {
            Ok(level) => level,
            Err(e) => match e {},
        }
    }

    fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
        self.apply();
    }

    fn drive_low(&mut self) {
        self.latch_low = true;
        self.apply();
    }
}
