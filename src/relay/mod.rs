//! Relay domain types and the single-writer authority.
//!
//! Everything above this module speaks *logical* state only. The mapping to
//! electrical levels, which depends on whether the relay contact is wired
//! normally open or normally closed, lives here and nowhere else.

pub mod authority;

pub use authority::RelayAuthority;

use crate::hardware::Level;
use serde::{Deserialize, Serialize};

/// User-visible relay state, independent of wiring polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Off,
    On,
}

impl RelayState {
    /// Wire representation used by the API: ON=1, OFF=0.
    pub fn as_u8(self) -> u8 {
        match self {
            RelayState::Off => 0,
            RelayState::On => 1,
        }
    }

    pub fn toggled(self) -> RelayState {
        match self {
            RelayState::Off => RelayState::On,
            RelayState::On => RelayState::Off,
        }
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayState::Off => write!(f, "OFF"),
            RelayState::On => write!(f, "ON"),
        }
    }
}

/// Physical contact type of the relay; decides the level↔logical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    NormallyOpen,
    NormallyClosed,
}

impl Polarity {
    /// Translate a logical state into the level that produces it.
    pub fn level_for(self, state: RelayState) -> Level {
        match (self, state) {
            (Polarity::NormallyOpen, RelayState::On) => Level::High,
            (Polarity::NormallyOpen, RelayState::Off) => Level::Low,
            (Polarity::NormallyClosed, RelayState::On) => Level::Low,
            (Polarity::NormallyClosed, RelayState::Off) => Level::High,
        }
    }

    /// Translate an observed level into the logical state it means.
    pub fn state_for(self, level: Level) -> RelayState {
        match (self, level) {
            (Polarity::NormallyOpen, Level::High) => RelayState::On,
            (Polarity::NormallyOpen, Level::Low) => RelayState::Off,
            (Polarity::NormallyClosed, Level::Low) => RelayState::On,
            (Polarity::NormallyClosed, Level::High) => RelayState::Off,
        }
    }
}

/// Outcome of a confirmed relay mutation. `confirmed` is false when the
/// read-back after the write disagreed with the commanded state.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchOutcome {
    pub id: String,
    pub state: RelayState,
    pub confirmed: bool,
}

/// Outcome of a pulse submission. The restore happens later, off this call
/// path; `duration` echoes the applied pulse length in seconds.
#[derive(Debug, Clone, Serialize)]
pub struct PulseOutcome {
    pub id: String,
    pub initial_state: RelayState,
    pub duration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polarity_round_trip() {
        for polarity in [Polarity::NormallyOpen, Polarity::NormallyClosed] {
            for state in [RelayState::On, RelayState::Off] {
                assert_eq!(polarity.state_for(polarity.level_for(state)), state);
            }
        }
    }

    #[test]
    fn test_normally_closed_inverts() {
        assert_eq!(
            Polarity::NormallyClosed.level_for(RelayState::On),
            Level::Low
        );
        assert_eq!(
            Polarity::NormallyClosed.state_for(Level::High),
            RelayState::Off
        );
    }
}
