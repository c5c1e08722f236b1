use thiserror::Error;

use crate::types::StatusPayload;

pub const MAX_SPEED: u8 = 3;
pub const MAX_TIMER_MINUTES: u16 = 720;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{field} value {value} outside 0..={max}")]
pub struct StateError {
    pub field: &'static str,
    pub value: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Speed(u8),
    Oscillate(bool),
    Timer(u16),
}

pub trait Actuator {
    fn apply(&mut self, change: StateChange, state: &DeviceState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputLevels {
    pub speed_lines: [bool; MAX_SPEED as usize],
    pub oscillate: bool,
}

impl OutputLevels {
    pub fn is_deenergized(&self) -> bool {
        !self.oscillate && self.speed_lines.iter().all(|line| !line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
    speed: u8,
    oscillate: bool,
    timer_minutes: u16,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn oscillate(&self) -> bool {
        self.oscillate
    }

    pub fn timer_minutes(&self) -> u16 {
        self.timer_minutes
    }

    pub fn apply_speed(
        &mut self,
        value: i64,
        actuator: &mut dyn Actuator,
    ) -> Result<(), StateError> {
        let speed = checked_range("speed", value, MAX_SPEED.into())? as u8;
        self.speed = speed;
        actuator.apply(StateChange::Speed(speed), self);
        Ok(())
    }

    pub fn apply_oscillate(&mut self, enabled: bool, actuator: &mut dyn Actuator) {
        self.oscillate = enabled;
        actuator.apply(StateChange::Oscillate(enabled), self);
    }

    pub fn apply_timer(
        &mut self,
        minutes: i64,
        actuator: &mut dyn Actuator,
    ) -> Result<(), StateError> {
        let minutes = checked_range("timer", minutes, MAX_TIMER_MINUTES.into())? as u16;
        self.timer_minutes = minutes;
        actuator.apply(StateChange::Timer(minutes), self);
        Ok(())
    }

    // Output levels for the relay lines. Speed 0 never energizes anything.
    pub fn outputs(&self) -> OutputLevels {
        let mut levels = OutputLevels::default();
        if self.speed == 0 {
            return levels;
        }

        levels.speed_lines[usize::from(self.speed - 1)] = true;
        levels.oscillate = self.oscillate;
        levels
    }

    pub fn status_payload(&self) -> StatusPayload {
        StatusPayload {
            speed: self.speed,
            oscillate: self.oscillate,
            timer_minutes: self.timer_minutes,
        }
    }
}

fn checked_range(field: &'static str, value: i64, max: i64) -> Result<i64, StateError> {
    if (0..=max).contains(&value) {
        Ok(value)
    } else {
        Err(StateError { field, value, max })
    }
}
