//! # Weather Overlay Data
//!
//! Current conditions for the frame's status bar, fetched from Open-Meteo and
//! cached as JSON between wake cycles.
//!
//! ## Refresh Policy
//! - Weather is only fetched (and shown) when enabled, located, and the battery
//!   is strictly above the configured threshold
//! - Fetches are spaced by the adaptive interval, which grows with consecutive
//!   failures and falling battery (see [`crate::scheduler`])
//! - The cached record is displayed until it is older than `max_age_hours`
//!
//! ## Cache Schema
//! Fields added after the first release (`temp_min`, `temp_max`,
//! `sunrise_time`, `sunset_time`, `has_daily_data`, `temperature_unit`) default
//! when missing so older cache files still load.

use crate::config::WeatherConfig;
use crate::error::FrameError;
use crate::scheduler::{self, ScheduleState};
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const OPEN_METEO_BASE: &str = "https://api.open-meteo.com/v1/forecast";

/// Code reported when no observation is available.
pub const INVALID_WEATHER_CODE: u8 = 255;

/// Wind speed above which the windy icon variants are used (km/h).
const WINDY_THRESHOLD: f32 = 25.0;

/// Current conditions as cached between cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherRecord {
    pub temperature: f32,
    /// WMO code, 0-99, or 255 when invalid
    pub weather_code: u8,
    pub humidity: u8,
    pub is_day: bool,
    pub wind_speed: f32,
    /// Unix seconds of the successful fetch
    pub last_update: i64,
    pub description: String,
    pub valid: bool,
    pub temperature_unit: String,
    pub temp_min: f32,
    pub temp_max: f32,
    pub sunrise_time: i64,
    pub sunset_time: i64,
    pub has_daily_data: bool,
}

impl Default for WeatherRecord {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            weather_code: INVALID_WEATHER_CODE,
            humidity: 0,
            is_day: true,
            wind_speed: 0.0,
            last_update: 0,
            description: String::new(),
            valid: false,
            temperature_unit: "°C".to_string(),
            temp_min: 0.0,
            temp_max: 0.0,
            sunrise_time: 0,
            sunset_time: 0,
            has_daily_data: false,
        }
    }
}

impl WeatherRecord {
    pub fn is_stale(&self, now: i64, max_age_secs: u32) -> bool {
        self.valid && now.saturating_sub(self.last_update) > max_age_secs as i64
    }

    pub fn is_displayable(&self, now: i64, max_age_secs: u32) -> bool {
        self.valid && !self.is_stale(now, max_age_secs)
    }

    pub fn icon(&self) -> WeatherIcon {
        wmo_code_to_icon(self.weather_code, self.is_day, self.wind_speed)
    }

    /// Rounded temperature with unit, e.g. `"21°C"`.
    pub fn temperature_label(&self) -> String {
        if !self.valid {
            return String::new();
        }
        format!("{:.0}{}", self.temperature, self.temperature_unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherIcon {
    ClearSkyDay,
    ClearSkyNight,
    CloudyDay,
    CloudyNight,
    Overcast,
    Fog,
    OvercastWindRain,
    CloudyDayRain,
    CloudyNightRain,
    Rain,
    WindRain,
    SnowRain,
    Snow,
    Thunderstorm,
    Wind,
    Unknown,
}

struct IconRule {
    day: WeatherIcon,
    night: WeatherIcon,
    /// Replaces both variants when windy
    windy: Option<WeatherIcon>,
}

impl IconRule {
    const fn same(icon: WeatherIcon) -> Self {
        Self {
            day: icon,
            night: icon,
            windy: None,
        }
    }

    fn pick(&self, is_day: bool, is_windy: bool) -> WeatherIcon {
        match (self.windy, is_windy) {
            (Some(icon), true) => icon,
            _ if is_day => self.day,
            _ => self.night,
        }
    }
}

use WeatherIcon::*;

/// Icons for the codes Open-Meteo documents.
const ICON_CODES: &[(&[u8], IconRule)] = &[
    (&[0], IconRule { day: ClearSkyDay, night: ClearSkyNight, windy: None }),
    (&[1, 2, 3], IconRule { day: CloudyDay, night: CloudyNight, windy: None }),
    (&[45, 48], IconRule { day: Fog, night: Fog, windy: Some(OvercastWindRain) }),
    (
        &[51, 53, 56, 57, 61],
        IconRule { day: CloudyDayRain, night: CloudyNightRain, windy: Some(WindRain) },
    ),
    (
        &[55, 63, 65, 66, 67, 80, 81, 82],
        IconRule { day: Rain, night: Rain, windy: Some(WindRain) },
    ),
    (&[68, 69, 83, 84, 85, 86], IconRule::same(SnowRain)),
    (&[71, 73, 75, 77], IconRule::same(Snow)),
    (&[95, 96, 99], IconRule::same(Thunderstorm)),
];

/// Fallback for undocumented codes inside a known family.
const ICON_RANGES: &[(u8, u8, IconRule)] = &[
    (45, 48, IconRule { day: Overcast, night: Overcast, windy: Some(OvercastWindRain) }),
    (51, 67, IconRule { day: CloudyDayRain, night: CloudyNightRain, windy: Some(WindRain) }),
    (68, 86, IconRule::same(SnowRain)),
    (95, 99, IconRule::same(Thunderstorm)),
];

const DESCRIPTIONS: &[(u8, &str)] = &[
    (0, "Clear"),
    (1, "Mostly Clear"),
    (2, "Partly Cloudy"),
    (3, "Overcast"),
    (45, "Fog"),
    (48, "Rime Fog"),
    (51, "Light Drizzle"),
    (53, "Drizzle"),
    (55, "Heavy Drizzle"),
    (56, "Freezing Drizzle"),
    (57, "Heavy Freezing Drizzle"),
    (61, "Light Rain"),
    (63, "Rain"),
    (65, "Heavy Rain"),
    (66, "Freezing Rain"),
    (67, "Heavy Freezing Rain"),
    (71, "Light Snow"),
    (73, "Snow"),
    (75, "Heavy Snow"),
    (77, "Snow Grains"),
    (80, "Light Showers"),
    (81, "Showers"),
    (82, "Heavy Showers"),
    (85, "Light Snow Showers"),
    (86, "Snow Showers"),
    (95, "Thunderstorm"),
    (96, "Thunderstorm with Hail"),
    (99, "Heavy Thunderstorm"),
];

/// Map a WMO code to an icon; total over all `u8` values.
pub fn wmo_code_to_icon(code: u8, is_day: bool, wind_speed: f32) -> WeatherIcon {
    let is_windy = wind_speed > WINDY_THRESHOLD;

    if let Some((_, rule)) = ICON_CODES.iter().find(|(codes, _)| codes.contains(&code)) {
        return rule.pick(is_day, is_windy);
    }
    if let Some((_, _, rule)) = ICON_RANGES
        .iter()
        .find(|(lo, hi, _)| (*lo..=*hi).contains(&code))
    {
        return rule.pick(is_day, is_windy);
    }
    if is_windy {
        Wind
    } else {
        Unknown
    }
}

pub fn wmo_code_to_description(code: u8) -> &'static str {
    DESCRIPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
        .unwrap_or("Unknown")
}

/// Load a cached record; invalid records are treated as absent.
pub fn load_cache(path: &Path) -> Result<WeatherRecord, io::Error> {
    let data = fs::read(path)?;
    let record: WeatherRecord = serde_json::from_slice(&data)?;
    if !record.valid {
        return Err(io::Error::other("cached weather marked invalid"));
    }
    Ok(record)
}

pub fn save_cache(path: &Path, record: &WeatherRecord) -> Result<(), io::Error> {
    let data = serde_json::to_vec(record)?;
    fs::write(path, data)?;
    Ok(())
}

/// Source of current conditions.
pub trait WeatherClient {
    fn fetch(&self, config: &WeatherConfig) -> Result<WeatherRecord, FrameError>;
}

/// Open-Meteo forecast API client.
pub struct OpenMeteoClient {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    base_url: String,
}

impl OpenMeteoClient {
    pub fn new() -> Result<Self, FrameError> {
        Self::with_base_url(OPEN_METEO_BASE)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, FrameError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FrameError::WeatherFetchFailed(e.to_string()))?;
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| FrameError::WeatherFetchFailed(e.to_string()))?;
        Ok(Self {
            client,
            runtime,
            base_url: base_url.to_string(),
        })
    }

    fn query(config: &WeatherConfig) -> Vec<(&'static str, String)> {
        vec![
            ("latitude", format!("{:.4}", config.latitude)),
            ("longitude", format!("{:.4}", config.longitude)),
            (
                "daily",
                "sunrise,sunset,apparent_temperature_max,apparent_temperature_min".to_string(),
            ),
            (
                "current",
                "is_day,precipitation,rain,showers,snowfall,weather_code,cloud_cover,\
                 wind_speed_10m,apparent_temperature,relative_humidity_2m"
                    .to_string(),
            ),
            ("timezone", config.timezone.clone()),
            ("forecast_days", "1".to_string()),
            ("temperature_unit", config.temperature_unit.clone()),
            ("wind_speed_unit", config.wind_speed_unit.clone()),
            ("precipitation_unit", config.precipitation_unit.clone()),
        ]
    }

    /// Fetch and parse current conditions.
    pub async fn fetch_current(&self, config: &WeatherConfig) -> Result<WeatherRecord, FrameError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&Self::query(config))
            .send()
            .await
            .map_err(|e| FrameError::WeatherFetchFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FrameError::WeatherFetchFailed(format!("HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FrameError::WeatherFetchFailed(e.to_string()))?;
        parse_response(&body)
    }
}

impl WeatherClient for OpenMeteoClient {
    fn fetch(&self, config: &WeatherConfig) -> Result<WeatherRecord, FrameError> {
        self.runtime.block_on(self.fetch_current(config))
    }
}

/// Extract a record from an Open-Meteo forecast response.
pub fn parse_response(doc: &Value) -> Result<WeatherRecord, FrameError> {
    let missing = |what: &str| FrameError::WeatherFetchFailed(format!("response missing {what}"));

    let current = doc.get("current").ok_or_else(|| missing("current"))?;
    let mut record = WeatherRecord {
        temperature: current
            .get("apparent_temperature")
            .and_then(Value::as_f64)
            .ok_or_else(|| missing("apparent_temperature"))? as f32,
        is_day: current
            .get("is_day")
            .and_then(Value::as_u64)
            .map(|v| v == 1)
            .unwrap_or(true),
        wind_speed: current
            .get("wind_speed_10m")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32,
        humidity: current
            .get("relative_humidity_2m")
            .and_then(Value::as_f64)
            .map(|h| h.clamp(0.0, 100.0) as u8)
            .unwrap_or(0),
        ..WeatherRecord::default()
    };

    let code = current
        .get("weather_code")
        .and_then(Value::as_u64)
        .ok_or_else(|| missing("weather_code"))?;
    record.weather_code = u8::try_from(code).unwrap_or(INVALID_WEATHER_CODE);
    record.description = wmo_code_to_description(record.weather_code).to_string();

    if let Some(unit) = doc
        .pointer("/current_units/apparent_temperature")
        .and_then(Value::as_str)
    {
        record.temperature_unit = unit.to_string();
    }

    if let Some(daily) = doc.get("daily") {
        let first_f32 = |key: &str| {
            daily
                .get(key)
                .and_then(|v| v.get(0))
                .and_then(Value::as_f64)
                .map(|v| v as f32)
        };
        if let (Some(min), Some(max)) = (
            first_f32("apparent_temperature_min"),
            first_f32("apparent_temperature_max"),
        ) {
            record.temp_min = min;
            record.temp_max = max;
        }

        let first_time = |key: &str| {
            daily
                .get(key)
                .and_then(|v| v.get(0))
                .and_then(Value::as_str)
                .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").ok())
                .map(|t| t.and_utc().timestamp())
        };
        if let (Some(rise), Some(set)) = (first_time("sunrise"), first_time("sunset")) {
            record.sunrise_time = rise;
            record.sunset_time = set;
        }
        record.has_daily_data = true;
    }

    Ok(record)
}

/// Owns the weather record, its cache file and its refresh bookkeeping.
pub struct WeatherManager {
    config: WeatherConfig,
    cache_path: PathBuf,
    current: WeatherRecord,
    schedule: ScheduleState,
}

impl WeatherManager {
    pub fn new(
        config: WeatherConfig,
        cache_path: impl Into<PathBuf>,
        schedule: ScheduleState,
    ) -> Self {
        let cache_path = cache_path.into();
        let current = match load_cache(&cache_path) {
            Ok(record) => {
                info!(
                    "Loaded cached weather: {} {}",
                    record.temperature_label(),
                    record.description
                );
                record
            }
            Err(e) => {
                debug!("No usable weather cache at {}: {}", cache_path.display(), e);
                WeatherRecord::default()
            }
        };
        Self {
            config: config.sanitized(),
            cache_path,
            current,
            schedule,
        }
    }

    pub fn record(&self) -> &WeatherRecord {
        &self.current
    }

    pub fn schedule(&self) -> ScheduleState {
        self.schedule
    }

    pub fn should_display_weather(&self, battery_percent: u8) -> bool {
        self.config.is_valid()
            && scheduler::should_refresh(battery_percent, self.config.battery_threshold)
    }

    /// Whether a fetch should be attempted at `now`.
    pub fn needs_update(&self, battery_percent: u8, now: i64) -> bool {
        if !self.config.is_valid() {
            return false;
        }
        self.schedule.is_due(
            now,
            self.config.update_interval_minutes.saturating_mul(60),
            battery_percent,
            self.config.battery_threshold,
        )
    }

    /// Fetch through `client`, updating the record, cache and failure count.
    pub fn refresh(&mut self, client: &dyn WeatherClient, now: i64) -> Result<(), FrameError> {
        info!("Fetching weather data...");
        match client.fetch(&self.config) {
            Ok(mut record) => {
                record.last_update = now;
                record.valid = true;
                self.current = record;
                self.schedule.record_success(now);
                if let Err(e) = save_cache(&self.cache_path, &self.current) {
                    warn!("Failed to cache weather data: {}", e);
                }
                info!(
                    "Weather updated: {} {}",
                    self.current.temperature_label(),
                    self.current.description
                );
                Ok(())
            }
            Err(e) => {
                self.schedule.record_failure(now);
                warn!(
                    "Weather fetch failed ({} consecutive): {}",
                    self.schedule.consecutive_failures, e
                );
                Err(e)
            }
        }
    }

    /// The record to show, if any.
    pub fn displayable(&self, battery_percent: u8, now: i64) -> Option<&WeatherRecord> {
        let max_age = self.config.max_age_hours.saturating_mul(3600);
        (self.should_display_weather(battery_percent) && self.current.is_displayable(now, max_age))
            .then_some(&self.current)
    }
}
