use super::{field, padded};
use crate::error::CommandError;
use crate::mqtt::message_manager::CommandFields;

pub const MAX_SLEEP_MINUTES: u32 = 540;

/// Parses a sleep timer duration into minutes
///
/// Accepts `off`, raw minutes (`90`), `H:MM` (`1:30`) and `2h15m` / `1h` /
/// `45m`. The result must lie within 0-540 minutes.
pub fn parse_sleep_time(value: &str) -> Result<u32, CommandError> {
    let input = value.trim().to_lowercase();
    let invalid = || CommandError::InvalidTime(value.to_string());

    let minutes = if input == "off" {
        return Ok(0);
    } else if let Some((hours, minutes)) = input.split_once(':') {
        let hours = digits(hours).ok_or_else(invalid)?;
        let minutes = digits(minutes).ok_or_else(invalid)?;
        if minutes >= 60 {
            return Err(invalid());
        }
        hours
            .checked_mul(60)
            .and_then(|h| h.checked_add(minutes))
            .ok_or_else(invalid)?
    } else if input.ends_with('h') || input.ends_with('m') {
        hours_and_minutes(&input).ok_or_else(invalid)?
    } else {
        digits(&input).ok_or_else(invalid)?
    };

    if minutes > MAX_SLEEP_MINUTES {
        return Err(CommandError::SleepTimerOutOfRange(minutes));
    }
    Ok(minutes)
}

fn digits(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

// `<n>h`, `<n>m` or `<n>h<n>m`, in that order; all zero is rejected.
fn hours_and_minutes(input: &str) -> Option<u32> {
    let (hours, rest) = match input.split_once('h') {
        Some((hours, rest)) => (digits(hours)?, rest),
        None => (0, input),
    };
    let minutes = if rest.is_empty() {
        0
    } else {
        digits(rest.strip_suffix('m')?)?
    };

    if hours == 0 && minutes == 0 {
        return None;
    }
    hours.checked_mul(60)?.checked_add(minutes)
}

/// Sleep timer in minutes as `sltm`; 0 clears the timer
pub fn sleep_timer(minutes: u32) -> Result<CommandFields, CommandError> {
    match minutes {
        0 => Ok(field("sltm", "OFF")),
        1..=MAX_SLEEP_MINUTES => Ok(field("sltm", padded(minutes))),
        _ => Err(CommandError::SleepTimerOutOfRange(minutes)),
    }
}
