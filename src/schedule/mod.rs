//! Wall-clock relay schedules.
//!
//! A schedule is an on/off window over the day plus a weekday bitmask.
//! `on_time > off_time` means the window crosses midnight. The relay is ON
//! only when the current weekday's bit is set *and* the current time falls
//! inside the window.

pub mod runner;

pub use runner::Scheduler;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Fixed weekday bit values shared with the front-end.
pub const SUNDAY: u8 = 2;
pub const MONDAY: u8 = 4;
pub const TUESDAY: u8 = 8;
pub const WEDNESDAY: u8 = 16;
pub const THURSDAY: u8 = 32;
pub const FRIDAY: u8 = 64;
pub const SATURDAY: u8 = 128;

/// The bit for a chrono weekday.
pub fn weekday_bit(day: Weekday) -> u8 {
    match day {
        Weekday::Sun => SUNDAY,
        Weekday::Mon => MONDAY,
        Weekday::Tue => TUESDAY,
        Weekday::Wed => WEDNESDAY,
        Weekday::Thu => THURSDAY,
        Weekday::Fri => FRIDAY,
        Weekday::Sat => SATURDAY,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,
    /// "HH:MM", local wall time.
    pub on_time: String,
    /// "HH:MM", local wall time.
    pub off_time: String,
    #[serde(default)]
    pub days_mask: u8,
}

impl Schedule {
    /// Parse an "HH:MM" field. Seconds are not accepted.
    pub fn parse_time(text: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(text, "%H:%M").ok()
    }

    /// Whether the relay governed by this schedule should be ON at the
    /// given local time and weekday. A disabled or unparseable schedule is
    /// never ON.
    pub fn should_be_on(&self, time: NaiveTime, day: Weekday) -> bool {
        if !self.enabled {
            return false;
        }
        if self.days_mask & weekday_bit(day) == 0 {
            return false;
        }
        let (Some(on), Some(off)) = (
            Self::parse_time(&self.on_time),
            Self::parse_time(&self.off_time),
        ) else {
            return false;
        };
        if on <= off {
            on <= time && time < off
        } else {
            // Window crosses midnight.
            time >= on || time < off
        }
    }
}
