use super::{field, padded};
use crate::error::CommandError;
use crate::mqtt::message_manager::CommandFields;

pub const MAX_FAN_SPEED: u32 = 10;

/// Fan speed 1-10 as `fnsp`; speed 0 switches the fan off instead
pub fn fan_speed(speed: u32) -> Result<CommandFields, CommandError> {
    match speed {
        0 => Ok(field("fpwr", "OFF")),
        1..=MAX_FAN_SPEED => Ok(field("fnsp", padded(speed))),
        _ => Err(CommandError::FanSpeedOutOfRange(speed)),
    }
}
