//! # Shared Bus Arbitration
//!
//! The primary storage card and the e-paper display sit on one SPI host. Only
//! one of them may drive it at a time, and the outgoing peripheral must be
//! deselected (and the host released) before the incoming one is selected.
//!
//! [`BusArbiter`] records the current [`BusOwner`] and performs the electrical
//! switch through a [`BusLines`] implementation:
//! - [`GpioBusLines`]: chip-select pins (active low) plus an SPI host that is
//!   re-begun with the owner's pin set when the bus is shared
//! - [`SimulatedBusLines`]: hosts without an electrical layer
//!
//! The arbiter also owns the staging filesystem, since staging is what lets the
//! storage device be powered down before the display takes the bus.

use crate::config::{BoardConfig, BusPins};
use crate::error::{FrameError, HwError};
use crate::staging::StagingFs;
use crate::timing::Watchdog;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

/// Who currently drives the shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BusOwner {
    #[default]
    None,
    Storage,
    Display,
}

/// Trait for an output pin (chip select)
pub trait GpioPin {
    fn set_high(&mut self) -> Result<(), HwError>;
    fn set_low(&mut self) -> Result<(), HwError>;
}

/// Trait for the SPI host peripheral
pub trait SpiHost {
    /// Claim the host with the given pin routing.
    fn begin(&mut self, pins: BusPins) -> Result<(), HwError>;
    /// Release the host and float its pins.
    fn end(&mut self);
}

/// Electrical side of the bus switch.
pub trait BusLines {
    /// Deselect and power down `owner`'s side of the bus.
    fn deselect(&mut self, owner: BusOwner) -> Result<(), HwError>;
    /// Configure the bus for `owner` and select it.
    fn select(&mut self, owner: BusOwner) -> Result<(), HwError>;
    /// Deselect every chip-select line and release the host.
    fn deselect_all(&mut self);
}

/// Chip-select lines plus an SPI host, following the board's wiring.
pub struct GpioBusLines<SPI, CS> {
    spi: SPI,
    storage_cs: CS,
    display_cs: CS,
    storage_pins: BusPins,
    display_pins: BusPins,
    shared_bus: bool,
}

impl<SPI, CS> GpioBusLines<SPI, CS>
where
    SPI: SpiHost,
    CS: GpioPin,
{
    pub fn new(spi: SPI, storage_cs: CS, display_cs: CS, board: &BoardConfig) -> Self {
        Self {
            spi,
            storage_cs,
            display_cs,
            storage_pins: board.storage_pins,
            display_pins: board.display_pins,
            shared_bus: board.shared_bus,
        }
    }

    fn cs_for(&mut self, owner: BusOwner) -> Option<&mut CS> {
        match owner {
            BusOwner::Storage => Some(&mut self.storage_cs),
            BusOwner::Display => Some(&mut self.display_cs),
            BusOwner::None => None,
        }
    }
}

impl<SPI, CS> BusLines for GpioBusLines<SPI, CS>
where
    SPI: SpiHost,
    CS: GpioPin,
{
    fn deselect(&mut self, owner: BusOwner) -> Result<(), HwError> {
        if let Some(cs) = self.cs_for(owner) {
            cs.set_high()?;
        }
        if self.shared_bus {
            self.spi.end();
        }
        Ok(())
    }

    fn select(&mut self, owner: BusOwner) -> Result<(), HwError> {
        let pins = match owner {
            BusOwner::Storage => self.storage_pins,
            BusOwner::Display => self.display_pins,
            BusOwner::None => return Ok(()),
        };
        if self.shared_bus {
            self.spi.begin(pins)?;
        }
        match self.cs_for(owner) {
            Some(cs) => cs.set_low(),
            None => Ok(()),
        }
    }

    fn deselect_all(&mut self) {
        if let Err(e) = self.storage_cs.set_high() {
            warn!("Storage chip select stuck: {}", e);
        }
        if let Err(e) = self.display_cs.set_high() {
            warn!("Display chip select stuck: {}", e);
        }
        self.spi.end();
    }
}

/// Bus lines for hosts where the OS owns the electrical layer.
#[derive(Default)]
pub struct SimulatedBusLines;

impl BusLines for SimulatedBusLines {
    fn deselect(&mut self, owner: BusOwner) -> Result<(), HwError> {
        debug!("bus: deselect {:?}", owner);
        Ok(())
    }

    fn select(&mut self, owner: BusOwner) -> Result<(), HwError> {
        debug!("bus: select {:?}", owner);
        Ok(())
    }

    fn deselect_all(&mut self) {
        debug!("bus: deselect all");
    }
}

/// Single-owner gatekeeper for the shared bus and the staging volume.
pub struct BusArbiter {
    lines: Box<dyn BusLines>,
    staging: Box<dyn StagingFs>,
    watchdog: Box<dyn Watchdog>,
    owner: BusOwner,
    staging_mounted: bool,
}

impl BusArbiter {
    pub fn new(
        lines: Box<dyn BusLines>,
        staging: Box<dyn StagingFs>,
        watchdog: Box<dyn Watchdog>,
    ) -> Self {
        Self {
            lines,
            staging,
            watchdog,
            owner: BusOwner::None,
            staging_mounted: false,
        }
    }

    pub fn owner(&self) -> BusOwner {
        self.owner
    }

    /// Hand the bus to `owner`, deselecting the previous owner first.
    ///
    /// A no-op when `owner` already holds the bus. If the electrical layer
    /// fails the error is returned, but `owner` is still recorded so that a
    /// later [`release`](Self::release) cleans up correctly.
    pub fn acquire(&mut self, owner: BusOwner) -> Result<(), HwError> {
        if owner == self.owner {
            return Ok(());
        }
        if owner == BusOwner::None {
            self.release();
            return Ok(());
        }

        if self.owner != BusOwner::None {
            debug!("bus: handing over from {:?} to {:?}", self.owner, owner);
            if let Err(e) = self.lines.deselect(self.owner) {
                warn!("Failed to deselect {:?}: {}", self.owner, e);
            }
        }

        let result = self.lines.select(owner);
        if let Err(e) = &result {
            error!("Bus acquire for {:?} failed: {}", owner, e);
        }
        self.owner = owner;
        result
    }

    /// Free the bus and deselect every chip select.
    pub fn release(&mut self) {
        self.lines.deselect_all();
        if self.owner != BusOwner::None {
            debug!("bus: released by {:?}", self.owner);
        }
        self.owner = BusOwner::None;
    }

    /// Mount the staging volume, formatting it if it cannot be mounted.
    ///
    /// Idempotent: once mounted, later calls return immediately.
    pub fn init_staging_filesystem(&mut self) -> Result<(), FrameError> {
        if self.staging_mounted {
            return Ok(());
        }

        match self.staging.mount() {
            Ok(()) => info!("Staging filesystem mounted"),
            Err(e) => {
                warn!("Staging mount failed ({}), formatting...", e);
                self.staging.format().map_err(|e| {
                    error!("Staging format failed: {}", e);
                    FrameError::StagingMountFailed(e.to_string())
                })?;
                info!("Staging filesystem formatted and mounted");
            }
        }

        self.staging_mounted = true;
        Ok(())
    }

    /// Remove every staged entry whose name ends with `suffix`.
    ///
    /// The directory is re-enumerated after each deletion and the watchdog is
    /// fed once per removal. Returns the number of entries removed.
    pub fn cleanup_staged_files(&mut self, suffix: &str) -> usize {
        if !self.staging_mounted {
            return 0;
        }

        let mut deleted = 0;
        let mut skipped: Vec<String> = Vec::new();
        loop {
            let names = match self.staging.list() {
                Ok(names) => names,
                Err(e) => {
                    error!("Failed to enumerate staging root: {}", e);
                    break;
                }
            };
            let Some(name) = names
                .into_iter()
                .find(|n| n.ends_with(suffix) && !skipped.contains(n))
            else {
                break;
            };

            let removed = self.staging.remove(&name);
            self.watchdog.feed();
            match removed {
                Ok(()) => {
                    debug!("Deleted staged file: {}", name);
                    deleted += 1;
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", name, e);
                    skipped.push(name);
                }
            }
        }

        if deleted > 0 {
            info!("Cleaned up {} staged file(s)", deleted);
        }
        deleted
    }

    pub fn staging(&mut self) -> &mut dyn StagingFs {
        self.staging.as_mut()
    }
}
