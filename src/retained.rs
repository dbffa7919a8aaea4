//! State that survives deep sleep.
//!
//! On the device this lives in RTC-retained memory; on a host it is a small
//! JSON file. A cold boot (power-on or reset rather than a timer wake)
//! invalidates it, which also drops any pending clock write.

use crate::scheduler::ScheduleState;
use crate::time_authority::PendingTimeUpdate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetainedState {
    /// Weather fetch bookkeeping
    pub weather_schedule: ScheduleState,
    /// Display refresh bookkeeping
    pub display_schedule: ScheduleState,
    /// Clock write deferred from the previous cycle
    pub pending_time: Option<PendingTimeUpdate>,
    /// Next image to show
    pub image_index: u32,
    /// Timer wakes since the last cold boot
    pub wake_count: u32,
    /// Sleep the previous cycle asked for, in seconds
    pub slept_secs: u64,
}

impl RetainedState {
    /// Load retained state; missing or unreadable state starts fresh.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(data) => match serde_json::from_slice::<RetainedState>(&data) {
                Ok(state) => {
                    debug!("Restored retained state from {}", path.display());
                    state
                }
                Err(e) => {
                    warn!("Retained state corrupted ({}), starting fresh", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No retained state, starting fresh");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Discard retained state after a cold boot.
    pub fn invalidate(path: &Path) -> Result<(), io::Error> {
        match fs::remove_file(path) {
            Ok(()) => {
                info!("Retained state invalidated");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_and_invalidate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/retained.json");

        let state = RetainedState {
            weather_schedule: ScheduleState {
                consecutive_failures: 2,
                last_attempt: 1_700_000_000,
            },
            pending_time: Some(PendingTimeUpdate::new(
                NaiveDate::from_ymd_opt(2024, 3, 1)
                    .unwrap()
                    .and_hms_opt(7, 30, 0)
                    .unwrap(),
            )),
            image_index: 4,
            ..RetainedState::default()
        };
        state.save(&path).unwrap();
        assert_eq!(RetainedState::load(&path), state);

        RetainedState::invalidate(&path).unwrap();
        assert_eq!(RetainedState::load(&path), RetainedState::default());
        // Invalidating twice is fine
        RetainedState::invalidate(&path).unwrap();
    }

    #[test]
    fn test_corrupted_state_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retained.json");
        fs::write(&path, b"{not json").unwrap();
        assert_eq!(RetainedState::load(&path), RetainedState::default());
    }
}
