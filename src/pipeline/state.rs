//! Driver lifecycle states.

use std::fmt;

/// Lifecycle of the pipeline driver.
///
/// `Starting -> Running <-> Recovering`, ending in `Stopped` after a
/// requested shutdown or in `Failed` after an unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    #[default]
    Starting,
    Running,
    Recovering,
    Stopped,
    Failed,
}

impl DriverState {
    /// Numeric code exported on the `flurry_driver_state` gauge.
    pub fn code(&self) -> u8 {
        match self {
            DriverState::Starting => 0,
            DriverState::Running => 1,
            DriverState::Recovering => 2,
            DriverState::Stopped => 3,
            DriverState::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverState::Stopped | DriverState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverState::Starting => "starting",
            DriverState::Running => "running",
            DriverState::Recovering => "recovering",
            DriverState::Stopped => "stopped",
            DriverState::Failed => "failed",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
