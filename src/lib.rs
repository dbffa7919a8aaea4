//! # Photo Frame Core Library
//!
//! Wake-cycle core for a battery-powered e-paper photo frame. The device wakes,
//! works out the current time, stages the next image from removable storage,
//! renders it and goes back to deep sleep for an interval chosen from battery
//! level and recent failures.
//!
//! ## Components
//! - [`bus::BusArbiter`]: one shared SPI bus, two peripherals (storage card and
//!   display), never both selected
//! - [`time_authority::TimeAuthority`]: battery-backed clock first, network
//!   time as fallback, with clock writes deferred while the bus is busy
//! - [`network::NetworkLink`]: credentials, connect with jittered backoff,
//!   network time query
//! - [`stager::FileStager`]: image validation and chunked copy to the staging
//!   volume
//! - [`scheduler`]: battery- and failure-aware refresh intervals
//!
//! [`cycle::WakeCycle`] strings these together for one wake. Everything is
//! single-threaded and blocking; the only async code is the weather HTTP client,
//! which runs on its own runtime.
//!
//! ## Hardware Seams
//! Peripherals are reached through small traits (`BusLines`, `Radio`,
//! `TimeService`, `RtcDevice`, `StagingFs`, `Clock`, `Watchdog`, `Renderer`)
//! so that the host build and the tests can swap in simulated parts. Linux
//! bindings for real hardware live in `linux_hw` behind the `hardware` feature.

pub mod battery;
pub mod bus;
pub mod config;
pub mod cycle;
pub mod error;
pub mod framebuffer;
#[cfg(feature = "hardware")]
pub mod linux_hw;
pub mod network;
pub mod renderer;
pub mod retained;
pub mod scheduler;
pub mod stager;
pub mod staging;
pub mod storage;
pub mod time_authority;
pub mod timing;
pub mod weather;

#[cfg(test)]
mod tests;

pub use battery::BatteryInfo;
pub use bus::{BusArbiter, BusOwner};
pub use config::Config;
pub use cycle::{CycleOptions, CycleReport, WakeCycle};
pub use error::{ErrorDescriptor, FrameError};
pub use network::NetworkLink;
pub use scheduler::ScheduleState;
pub use stager::{FileStager, StagedFile};
pub use time_authority::{PendingTimeUpdate, TimeAuthority};
