//! Supervised reboot via the kernel watchdog device.
//!
//! Writing to the watchdog file and then *not* performing the magic close
//! leaves the timer armed; the supervisor reboots the board when it expires.
//! Arming is therefore one-shot and irreversible from this process; the
//! upper layers debounce before calling [`Watchdog::arm`].

use crate::error::{AppResult, ControlError};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct Watchdog {
    path: PathBuf,
}

impl Watchdog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Arm the watchdog. The file handle is deliberately dropped without the
    /// magic-close byte so the timer keeps running.
    pub fn arm(&self) -> AppResult<()> {
        warn!(path = %self.path.display(), "arming watchdog for supervised reboot");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                ControlError::Hardware(crate::hardware::HardwareError::Unavailable(format!(
                    "watchdog {}: {e}",
                    self.path.display()
                )))
            })?;
        file.write_all(b"1")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog");
        std::fs::write(&path, b"").unwrap();
        let wd = Watchdog::new(&path);
        wd.arm().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"1");
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let wd = Watchdog::new("/nonexistent/watchdog");
        assert!(wd.arm().is_err());
    }
}
