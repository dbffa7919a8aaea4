//! # Wake Cycle
//!
//! One pass from wake to sleep:
//!
//! 1. Bail out early (sleeping the maximum interval) on a critically low cell
//! 2. Restore retained state, or discard it after a cold boot. A carried-over
//!    clock write is advanced by the time slept
//! 3. Storage takes the bus; credentials are read from the card
//! 4. Resolve the time. The clock write is deferred while storage holds the bus
//! 5. Validate the next image and copy it to the staging volume
//! 6. Display takes the bus and shows the staged image or an error screen
//! 7. Release the bus and commit any deferred clock write
//! 8. Refresh weather if due, drop the link and compute the next sleep
//!
//! Only the retained state crosses the sleep boundary; every component here is
//! rebuilt by the caller on each wake.

use crate::battery::BatteryInfo;
use crate::bus::{BusArbiter, BusOwner};
use crate::config::Config;
use crate::error::{ErrorDescriptor, FrameError};
use crate::network::NetworkLink;
use crate::renderer::{Renderer, StatusLine};
use crate::retained::RetainedState;
use crate::scheduler;
use crate::stager::{FileStager, StagedFile};
use crate::storage::PrimaryStorage;
use crate::time_authority::TimeAuthority;
use crate::weather::{WeatherClient, WeatherManager};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-wake inputs that do not come from configuration.
#[derive(Debug, Clone, Copy)]
pub struct CycleOptions {
    pub battery: BatteryInfo,
    /// Power-on or reset rather than a timer wake
    pub cold_boot: bool,
    /// Ignore the clock peripheral and take the network time
    pub force_time_sync: bool,
}

/// Outcome of one wake cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub timestamp: Option<NaiveDateTime>,
    pub staged: Option<StagedFile>,
    /// The error shown instead of an image, if any
    pub error: Option<FrameError>,
    pub sleep_for: Duration,
    /// True when the battery was too low to run the cycle at all
    pub skipped: bool,
}

pub struct WakeCycle {
    config: Config,
    arbiter: BusArbiter,
    network: NetworkLink,
    time: TimeAuthority,
    stager: FileStager,
    storage: PrimaryStorage,
    renderer: Box<dyn Renderer>,
    weather_client: Box<dyn WeatherClient>,
}

impl WakeCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        arbiter: BusArbiter,
        network: NetworkLink,
        time: TimeAuthority,
        stager: FileStager,
        storage: PrimaryStorage,
        renderer: Box<dyn Renderer>,
        weather_client: Box<dyn WeatherClient>,
    ) -> Self {
        Self {
            config,
            arbiter,
            network,
            time,
            stager,
            storage,
            renderer,
            weather_client,
        }
    }

    pub fn arbiter(&self) -> &BusArbiter {
        &self.arbiter
    }

    pub fn time_authority(&self) -> &TimeAuthority {
        &self.time
    }

    pub fn run(&mut self, options: CycleOptions) -> CycleReport {
        let battery = options.battery;
        let retained_path = PathBuf::from(&self.config.state.retained_path);

        if options.cold_boot {
            info!("Cold boot, discarding retained state");
            if let Err(e) = RetainedState::invalidate(&retained_path) {
                warn!("Failed to invalidate retained state: {}", e);
            }
        }
        let mut retained = RetainedState::load(&retained_path);
        retained.wake_count = retained.wake_count.saturating_add(1);
        info!("Wake #{} (battery {})", retained.wake_count, battery);
        // A write carried over from the last wake is behind by the sleep since
        let slept = ChronoDuration::seconds(retained.slept_secs as i64);
        retained.pending_time = retained.pending_time.map(|p| p.aged(slept));

        if battery.is_critical(self.config.schedule.critical_voltage_mv) {
            let sleep_for = Duration::from_secs(scheduler::max_interval(battery.percent) as u64);
            error!(
                "Battery critical ({} mV < {} mV), skipping cycle",
                battery.millivolts, self.config.schedule.critical_voltage_mv
            );
            retained.slept_secs = sleep_for.as_secs();
            self.save(&retained, &retained_path);
            return CycleReport {
                timestamp: None,
                staged: None,
                error: None,
                sleep_for,
                skipped: true,
            };
        }

        self.time.restore_pending(retained.pending_time.take());

        // Storage holds the bus for credentials, time and staging
        if let Err(e) = self.arbiter.acquire(BusOwner::Storage) {
            warn!("Storage bus select failed: {}", e);
        }
        self.load_credentials();

        let mut failure: Option<FrameError> = None;
        let timestamp = match self
            .time
            .resolve(&mut self.network, self.arbiter.owner(), options.force_time_sync)
        {
            Ok(time) => Some(time),
            Err(e) => {
                error!("No valid time this cycle: {}", e);
                failure = Some(e);
                None
            }
        };

        let staged = match self.stage_next(&mut retained) {
            Ok(staged) => Some(staged),
            Err(e) => {
                if e.is_soft() {
                    warn!("Staging unavailable: {}", e);
                } else {
                    error!("Image rejected: {}", e);
                }
                failure.get_or_insert(e);
                None
            }
        };

        // Weather shown is whatever was cached before this wake
        let mut weather = WeatherManager::new(
            self.config.weather.clone(),
            &self.config.weather.cache_file,
            retained.weather_schedule,
        );
        let now = timestamp.map(|t| t.and_utc().timestamp());
        let status = StatusLine {
            timestamp,
            battery,
            weather: now
                .and_then(|now| weather.displayable(battery.percent, now))
                .cloned(),
        };

        if let Err(e) = self.arbiter.acquire(BusOwner::Display) {
            warn!("Display bus select failed: {}", e);
        }
        let rendered = match (&staged, failure.clone()) {
            (Some(file), None) => self.renderer.render_image(file, &status),
            (_, kind) => {
                let kind = kind
                    .unwrap_or_else(|| FrameError::FileNotFound("nothing staged".to_string()));
                self.renderer
                    .render_error(&ErrorDescriptor::from_error(kind), &status)
            }
        };
        if let Err(e) = rendered {
            error!("Render failed: {}", e);
            failure.get_or_insert(e);
        }
        self.arbiter.release();

        match self.time.commit_pending(self.arbiter.owner()) {
            Ok(true) => debug!("Deferred clock write committed"),
            Ok(false) => {}
            Err(e) => warn!("{}", e),
        }
        retained.pending_time = self.time.pending();

        if let Some(now) = now {
            self.refresh_weather(&mut weather, battery, now);
        }
        retained.weather_schedule = weather.schedule();
        self.network.disconnect();

        let now = now.unwrap_or_default();
        if failure.is_some() {
            retained.display_schedule.record_failure(now);
        } else {
            retained.display_schedule.record_success(now);
        }
        let sleep_for = self.next_sleep(&retained, battery);
        info!("Cycle done, sleeping {} s", sleep_for.as_secs());
        retained.slept_secs = sleep_for.as_secs();

        self.save(&retained, &retained_path);
        CycleReport {
            timestamp,
            staged,
            error: failure,
            sleep_for,
            skipped: false,
        }
    }

    fn load_credentials(&mut self) {
        if self.network.credentials().is_some() {
            return;
        }
        let result = self
            .storage
            .open_credentials(&self.config.network.credentials_file)
            .and_then(|reader| self.network.load_credentials(reader));
        if let Err(e) = result {
            warn!("Network unavailable this cycle: {}", e);
        }
    }

    fn stage_next(&mut self, retained: &mut RetainedState) -> Result<StagedFile, FrameError> {
        let storage = &self.config.storage;
        let entry = self
            .storage
            .find_next_image(retained.image_index, &storage.image_extension)?;
        // Move on next wake even if this file turns out to be bad
        retained.image_index = entry.index + 1;

        let mut file = self.storage.open(&entry)?;
        self.stager.copy_to_staging(
            &mut self.arbiter,
            &mut file,
            &entry.name,
            &self.config.staging.staged_name,
            storage.image_width,
            storage.image_height,
        )
    }

    fn refresh_weather(&mut self, weather: &mut WeatherManager, battery: BatteryInfo, now: i64) {
        if !weather.needs_update(battery.percent, now) {
            debug!("Weather refresh not due");
            return;
        }
        if !self.network.is_connected() {
            if let Err(e) = self.network.connect() {
                warn!("Skipping weather refresh: {}", e);
                return;
            }
        }
        // Failure is already counted by the manager
        weather.refresh(self.weather_client.as_ref(), now).ok();
    }

    fn next_sleep(&self, retained: &RetainedState, battery: BatteryInfo) -> Duration {
        let schedule = &self.config.schedule;
        let secs = if scheduler::should_refresh(battery.percent, schedule.low_battery_threshold) {
            retained
                .display_schedule
                .interval(self.config.refresh_interval_secs(), battery.percent)
        } else {
            info!("Battery at {}%, sleeping as long as allowed", battery.percent);
            scheduler::max_interval(battery.percent)
        };
        Duration::from_secs(secs as u64)
    }

    fn save(&self, retained: &RetainedState, path: &Path) {
        if let Err(e) = retained.save(path) {
            error!("Failed to save retained state to {}: {}", path.display(), e);
        }
    }
}
