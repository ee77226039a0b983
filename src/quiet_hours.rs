//! Time-of-day window for automatic location updates.
//!
//! Bounds are `"HH:MM"` strings, inclusive on both ends. A window whose
//! start is later than its end wraps past midnight.

use serde::{Deserialize, Serialize};

pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Configured `{from, to}` window as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid time of day '{0}', expected HH:MM")]
pub struct TimeParseError(pub String);

impl QuietHours {
    /// Build a window, rejecting malformed bounds
    pub fn new(from: &str, to: &str) -> Result<Self, TimeParseError> {
        parse_minutes(from)?;
        parse_minutes(to)?;
        Ok(Self {
            from: from.trim().to_string(),
            to: to.trim().to_string(),
        })
    }

    /// Whether `minute_of_day` (0..1440) falls inside the window
    pub fn contains(&self, minute_of_day: u32) -> Result<bool, TimeParseError> {
        let from = parse_minutes(&self.from)?;
        let to = parse_minutes(&self.to)?;
        Ok(window_contains(from, to, minute_of_day))
    }
}

/// Parse `"HH:MM"` into minutes since midnight
pub fn parse_minutes(value: &str) -> Result<u32, TimeParseError> {
    let err = || TimeParseError(value.to_string());
    let (hours, minutes) = value.trim().split_once(':').ok_or_else(err)?;
    let hours: u32 = hours.parse().map_err(|_| err())?;
    let minutes: u32 = minutes.parse().map_err(|_| err())?;
    if hours > 23 || minutes > 59 {
        return Err(err());
    }
    Ok(hours * 60 + minutes)
}

/// Inclusive membership with midnight wraparound when `from > to`
pub fn window_contains(from: u32, to: u32, minute: u32) -> bool {
    if from <= to {
        minute >= from && minute <= to
    } else {
        minute >= from || minute <= to
    }
}
