//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the photo-frame.toml file.
//! Board variants (clock model, shared or split bus, pin assignments) are resolved
//! here once at startup and injected into the bus arbiter and time authority, so the
//! arbitration logic is identical on every board.
//!
//! Every section carries `#[serde(default)]`, so a file only needs the keys that
//! differ from the defaults.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Application configuration loaded from photo-frame.toml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Board variant and wiring
    pub board: BoardConfig,
    /// Wireless link and time service
    pub network: NetworkConfig,
    /// Display refresh scheduling and battery policy
    pub schedule: ScheduleConfig,
    /// Weather overlay data
    pub weather: WeatherConfig,
    /// Primary (removable) storage
    pub storage: StorageConfig,
    /// Staging filesystem
    pub staging: StagingConfig,
    /// State that must survive deep sleep
    pub state: StateConfig,
    /// Rendered frame output
    pub display: DisplayConfig,
}

/// Which battery-backed clock the board carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockModel {
    /// Host system clock stands in for the battery-backed clock
    System,
    /// No clock peripheral fitted; every cycle asks the network
    Absent,
    /// DS3231 on I2C (requires the `hardware` feature)
    Ds3231,
}

/// SPI pin set used when one peripheral owns the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BusPins {
    pub sck: u8,
    pub miso: u8,
    pub mosi: u8,
    pub cs: u8,
}

/// Board wiring, resolved once at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BoardConfig {
    pub clock: ClockModel,
    /// Storage and display share one SPI host
    pub shared_bus: bool,
    /// Clock peripheral shares wiring with storage, so writes must wait for a free bus
    pub clock_shares_bus: bool,
    pub storage_pins: BusPins,
    pub display_pins: BusPins,
    /// GPIO character device for chip-select lines
    pub gpio_chip: String,
    /// SPI device node
    pub spi_device: String,
    /// I2C device node for the clock peripheral
    pub i2c_device: String,
}

/// Retry strategy for connecting the link.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Upper bound of the random jitter as a fraction of the delay
    pub jitter_ratio: f32,
}

/// Wireless link and network time configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Two-line credentials file (identifier, secret), relative to the storage root
    pub credentials_file: String,
    /// Fixed UTC offset applied to network time, e.g. "+01:00"
    pub utc_offset: String,
    pub ntp_servers: Vec<String>,
    /// Per-attempt connection timeout
    pub connect_timeout_ms: u64,
    pub ntp_timeout_secs: u64,
    pub retry: RetryConfig,
}

/// Display refresh scheduling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Base interval between display refreshes
    pub refresh_interval_minutes: u32,
    /// Network refreshes are suppressed at or below this percentage
    pub low_battery_threshold: u8,
    /// Below this voltage the cycle is skipped entirely
    pub critical_voltage_mv: u32,
}

/// Weather overlay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub enabled: bool,
    pub latitude: f32,
    pub longitude: f32,
    pub update_interval_minutes: u32,
    /// Weather is not fetched at or below this battery percentage
    pub battery_threshold: u8,
    /// Cached data older than this is not displayed
    pub max_age_hours: u32,
    pub timezone: String,
    pub temperature_unit: String,
    pub wind_speed_unit: String,
    pub precipitation_unit: String,
    pub cache_file: String,
}

/// Primary storage device holding the image library.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Mount point of the primary storage device
    pub root: String,
    /// Extension of images to cycle through (".bin" or ".bmp")
    pub image_extension: String,
    pub image_width: u32,
    pub image_height: u32,
}

/// Staging filesystem holding the validated copy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StagingConfig {
    pub root: String,
    /// Name the validated image is staged under
    pub staged_name: String,
    /// Suffix of staged files removed before each staging operation
    pub cleanup_suffix: String,
}

/// Cross-sleep state location.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    pub retained_path: String,
}

/// Rendered frame output.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// PBM file receiving each rendered frame
    pub output: String,
    pub width: u32,
    pub height: u32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            clock: ClockModel::System,
            shared_bus: true,
            clock_shares_bus: true,
            storage_pins: BusPins {
                sck: 18,
                miso: 22,
                mosi: 23,
                cs: 17,
            },
            display_pins: BusPins {
                sck: 18,
                miso: 19,
                mosi: 23,
                cs: 5,
            },
            gpio_chip: "/dev/gpiochip0".to_string(),
            spi_device: "/dev/spidev0.0".to_string(),
            i2c_device: "/dev/i2c-1".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 2000,
            jitter_ratio: 0.25,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            credentials_file: "wifi.txt".to_string(),
            utc_offset: "+00:00".to_string(),
            ntp_servers: vec!["pool.ntp.org".to_string(), "time.google.com".to_string()],
            connect_timeout_ms: 30_000,
            ntp_timeout_secs: 20,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            refresh_interval_minutes: 60,
            low_battery_threshold: 15,
            critical_voltage_mv: 3300,
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        WeatherConfig {
            enabled: false,
            latitude: 40.7128,
            longitude: -74.0060,
            update_interval_minutes: 120,
            battery_threshold: 15,
            max_age_hours: 3,
            timezone: "auto".to_string(),
            temperature_unit: "celsius".to_string(),
            wind_speed_unit: "kmh".to_string(),
            precipitation_unit: "mm".to_string(),
            cache_file: "weather_cache.json".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: "/media/sdcard".to_string(),
            image_extension: ".bin".to_string(),
            image_width: 800,
            image_height: 480,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        StagingConfig {
            root: "/var/lib/photo-frame/staging".to_string(),
            staged_name: "current.tmp".to_string(),
            cleanup_suffix: ".tmp".to_string(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            retained_path: "/var/lib/photo-frame/retained.json".to_string(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            output: "/tmp/photo-frame.pbm".to_string(),
            width: 800,
            height: 480,
        }
    }
}

impl WeatherConfig {
    /// Enabled and located somewhere on the globe.
    pub fn is_valid(&self) -> bool {
        self.enabled
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Clamp tunables to their supported ranges.
    pub fn sanitized(mut self) -> Self {
        self.update_interval_minutes = self.update_interval_minutes.max(15);
        self.battery_threshold = self.battery_threshold.clamp(5, 50);
        self.max_age_hours = self.max_age_hours.clamp(1, 24);
        self
    }
}

impl Config {
    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(mut config) => {
                    config.weather = config.weather.sanitized();
                    info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Invalid config file format: {}", e);
                    warn!("Using default configuration");
                    Self::default()
                }
            },
            Err(_) => {
                info!(
                    "No config file at {}, using default configuration",
                    path.display()
                );
                Self::default()
            }
        }
    }

    /// Save current configuration to the given path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }

    /// Base display refresh interval in seconds.
    pub fn refresh_interval_secs(&self) -> u32 {
        self.schedule.refresh_interval_minutes.saturating_mul(60)
    }
}
