//! Builders for the appliance's `STATE-SET` fields
//!
//! Each builder validates its input and returns the fields to hand to
//! [`crate::session::DeviceSession::publish_command`]. Values follow the
//! appliance's conventions: `ON`/`OFF` for switches, zero-padded four digit
//! strings for numbers.

pub mod fan_speed;
pub mod oscillation;
pub mod sleep_timer;

use crate::error::CommandError;
use crate::mqtt::message_manager::CommandFields;

pub use fan_speed::fan_speed;
pub use oscillation::{
    parse_width, snap_width, stop_oscillation, OscillationInfo, OscillationPlan,
};
pub use sleep_timer::{parse_sleep_time, sleep_timer};

pub(crate) fn field(key: &str, value: impl Into<String>) -> CommandFields {
    let mut fields = CommandFields::new();
    fields.insert(key.to_string(), value.into());
    fields
}

pub(crate) fn padded(value: u32) -> String {
    format!("{:04}", value)
}

fn switch(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Accepts true/false, t/f, 1/0, on/off, yes/no and y/n in any case
pub fn parse_boolean(value: &str) -> Result<bool, CommandError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "t" | "1" | "on" | "yes" | "y" => Ok(true),
        "false" | "f" | "0" | "off" | "no" | "n" => Ok(false),
        _ => Err(CommandError::InvalidBoolean(value.to_string())),
    }
}

pub fn power(on: bool) -> CommandFields {
    field("fpwr", switch(on))
}

pub fn auto_mode(on: bool) -> CommandFields {
    field("auto", switch(on))
}

pub fn night_mode(on: bool) -> CommandFields {
    field("nmod", switch(on))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boolean_accepts_all_spellings() {
        for value in ["true", "T", "1", "on", "YES", " y "] {
            assert_eq!(parse_boolean(value), Ok(true), "{}", value);
        }
        for value in ["false", "F", "0", "Off", "no", "n"] {
            assert_eq!(parse_boolean(value), Ok(false), "{}", value);
        }
    }

    #[test]
    fn test_parse_boolean_rejects_garbage() {
        assert_eq!(
            parse_boolean("maybe"),
            Err(CommandError::InvalidBoolean("maybe".to_string()))
        );
        assert!(parse_boolean("").is_err());
        assert!(parse_boolean("2").is_err());
    }

    #[test]
    fn test_switch_builders() {
        assert_eq!(power(true), field("fpwr", "ON"));
        assert_eq!(power(false), field("fpwr", "OFF"));
        assert_eq!(auto_mode(true), field("auto", "ON"));
        assert_eq!(night_mode(false), field("nmod", "OFF"));
    }
}
