//! # Time Authority
//!
//! Resolves a trusted calendar timestamp from the battery-backed clock, falling
//! back to the network time service when the clock is absent or has lost power.
//!
//! ## States
//! - `ClockTrusted`: the clock is running and its value is returned directly
//! - `ClockUnavailable`: no clock peripheral answered
//! - `AwaitingNetwork`: the clock cannot be trusted and the network is being asked
//! - `DeferredCommitPending`: a network timestamp is waiting to be written to
//!   the clock once the bus is free
//!
//! On boards where the clock shares wiring with primary storage, a network
//! timestamp obtained while the bus is owned is not written immediately. It is
//! kept as a [`PendingTimeUpdate`] and written by
//! [`commit_pending`](TimeAuthority::commit_pending) after the bus is released.
//! The pending record is a plain value owned by the authority; the wake cycle
//! persists it across sleeps through the retained state. A record restored
//! after a sleep is discarded if the clock turns out to be running.

use crate::bus::BusOwner;
use crate::config::BoardConfig;
use crate::error::{FrameError, HwError};
use crate::network::{NetworkLink, EPOCH_SANITY_FLOOR};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

/// Battery-backed real-time clock peripheral.
pub trait RtcDevice {
    /// Check the peripheral answers; fails when it is not fitted or not answering.
    fn begin(&mut self) -> Result<(), HwError>;
    /// True when the oscillator stopped since the last adjust.
    fn lost_power(&mut self) -> Result<bool, HwError>;
    fn now(&mut self) -> Result<NaiveDateTime, HwError>;
    fn adjust(&mut self, time: NaiveDateTime) -> Result<(), HwError>;
}

/// Host clock standing in for the battery-backed clock.
///
/// Adjustments are kept as an in-memory offset; the OS clock itself is never set.
pub struct SystemRtc {
    offset: ChronoDuration,
}

impl Default for SystemRtc {
    fn default() -> Self {
        Self {
            offset: ChronoDuration::zero(),
        }
    }
}

impl RtcDevice for SystemRtc {
    fn begin(&mut self) -> Result<(), HwError> {
        Ok(())
    }

    fn lost_power(&mut self) -> Result<bool, HwError> {
        Ok(false)
    }

    fn now(&mut self) -> Result<NaiveDateTime, HwError> {
        Ok(Local::now().naive_local() + self.offset)
    }

    fn adjust(&mut self, time: NaiveDateTime) -> Result<(), HwError> {
        self.offset = time - Local::now().naive_local();
        debug!("System clock offset now {} s", self.offset.num_seconds());
        Ok(())
    }
}

/// Board without a clock peripheral.
#[derive(Default)]
pub struct AbsentRtc;

impl RtcDevice for AbsentRtc {
    fn begin(&mut self) -> Result<(), HwError> {
        Err(HwError("no clock peripheral fitted".to_string()))
    }

    fn lost_power(&mut self) -> Result<bool, HwError> {
        Ok(true)
    }

    fn now(&mut self) -> Result<NaiveDateTime, HwError> {
        Err(HwError("no clock peripheral fitted".to_string()))
    }

    fn adjust(&mut self, _time: NaiveDateTime) -> Result<(), HwError> {
        Err(HwError("no clock peripheral fitted".to_string()))
    }
}

/// A network timestamp waiting to be written to the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTimeUpdate {
    pub timestamp: NaiveDateTime,
    pub committed: bool,
}

impl PendingTimeUpdate {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            committed: false,
        }
    }

    /// The same write moved forward by time spent asleep since it was taken.
    pub fn aged(self, elapsed: ChronoDuration) -> Self {
        Self {
            timestamp: self.timestamp + elapsed,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeState {
    ClockTrusted,
    ClockUnavailable,
    AwaitingNetwork,
    DeferredCommitPending,
}

/// True when `time` is on or after the epoch sanity floor.
pub fn is_valid_timestamp(time: &NaiveDateTime) -> bool {
    time.and_utc().timestamp() >= EPOCH_SANITY_FLOOR
}

pub struct TimeAuthority {
    rtc: Box<dyn RtcDevice>,
    clock_shares_bus: bool,
    state: TimeState,
    clock_present: bool,
    pending: Option<PendingTimeUpdate>,
    last_trusted: Option<NaiveDateTime>,
}

impl TimeAuthority {
    pub fn new(rtc: Box<dyn RtcDevice>, board: &BoardConfig) -> Self {
        Self {
            rtc,
            clock_shares_bus: board.clock_shares_bus,
            state: TimeState::ClockUnavailable,
            clock_present: false,
            pending: None,
            last_trusted: None,
        }
    }

    /// Restore a pending write carried over from before the last sleep.
    pub fn restore_pending(&mut self, pending: Option<PendingTimeUpdate>) {
        self.pending = pending.filter(|p| !p.committed);
        if self.pending.is_some() {
            self.state = TimeState::DeferredCommitPending;
        }
    }

    pub fn state(&self) -> TimeState {
        self.state
    }

    /// The uncommitted pending write, if any.
    pub fn pending(&self) -> Option<PendingTimeUpdate> {
        self.pending.filter(|p| !p.committed)
    }

    pub fn has_pending(&self) -> bool {
        self.pending().is_some()
    }

    /// Most recent timestamp that passed validation.
    pub fn last_trusted(&self) -> Option<NaiveDateTime> {
        self.last_trusted
    }

    /// Resolve the current time.
    ///
    /// Reads the clock when it is present and running, otherwise asks the
    /// network (connecting first if needed). A network timestamp is returned
    /// immediately even when the clock write has to be deferred because
    /// `bus_owner` holds the clock's wiring. Fails only when neither source
    /// produced a valid timestamp.
    pub fn resolve(
        &mut self,
        network: &mut NetworkLink,
        bus_owner: BusOwner,
        force_reset: bool,
    ) -> Result<NaiveDateTime, FrameError> {
        info!("Initializing clock...");
        match self.rtc.begin() {
            Ok(()) => self.clock_present = true,
            Err(e) => {
                warn!("Clock not found: {}", e);
                self.clock_present = false;
                self.state = TimeState::ClockUnavailable;
            }
        }

        if self.clock_present && !force_reset {
            if let Some(time) = self.read_trusted_clock() {
                if let Some(stale) = self.pending.take().filter(|p| !p.committed) {
                    info!(
                        "Clock is running, dropping carried-over write {}",
                        stale.timestamp.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                return Ok(time);
            }
        } else if force_reset {
            info!("Clock reset requested");
        }

        self.state = TimeState::AwaitingNetwork;
        let fetched = Self::fetch_network_time(network);
        let time = match fetched {
            Ok(time) if is_valid_timestamp(&time) => time,
            Ok(time) => {
                error!("Network returned implausible time {}", time);
                self.state = self.fallback_state();
                return Err(FrameError::ClockInitializationFailed(format!(
                    "implausible network time {time}"
                )));
            }
            Err(e) => {
                error!("No time source available: {}", e);
                self.state = self.fallback_state();
                return Err(FrameError::ClockInitializationFailed(e.to_string()));
            }
        };

        self.last_trusted = Some(time);

        if !self.clock_present {
            self.state = TimeState::ClockUnavailable;
            return Ok(time);
        }

        if self.clock_shares_bus && bus_owner != BusOwner::None {
            info!("Bus owned by {:?}, deferring clock write", bus_owner);
            self.defer(time);
            return Ok(time);
        }

        match self.rtc.adjust(time) {
            Ok(()) => {
                info!("Clock set to {}", time.format("%Y-%m-%d %H:%M:%S"));
                self.pending = None;
                self.state = TimeState::ClockTrusted;
            }
            Err(e) => {
                warn!("Clock write failed ({}), will retry later", e);
                self.defer(time);
            }
        }
        Ok(time)
    }

    /// Write the pending timestamp to the clock.
    ///
    /// Returns `Ok(true)` when a write happened and `Ok(false)` when there was
    /// nothing to do or the bus is still owned. A clock that does not answer
    /// leaves the record in place for the next attempt.
    pub fn commit_pending(&mut self, bus_owner: BusOwner) -> Result<bool, FrameError> {
        let Some(mut pending) = self.pending() else {
            return Ok(false);
        };

        if self.clock_shares_bus && bus_owner != BusOwner::None {
            debug!("Bus still owned by {:?}, clock write stays pending", bus_owner);
            return Ok(false);
        }

        match self.rtc.adjust(pending.timestamp) {
            Ok(()) => {
                info!(
                    "Committed deferred clock write {}",
                    pending.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
                pending.committed = true;
                self.pending = Some(pending);
                self.state = TimeState::ClockTrusted;
                Ok(true)
            }
            Err(e) => {
                warn!("Deferred clock write failed: {}", e);
                Err(FrameError::ClockWriteFailed(e.to_string()))
            }
        }
    }

    fn read_trusted_clock(&mut self) -> Option<NaiveDateTime> {
        match self.rtc.lost_power() {
            Ok(false) => {}
            Ok(true) => {
                warn!("Clock lost power, time must be set");
                return None;
            }
            Err(e) => {
                warn!("Clock status unreadable: {}", e);
                return None;
            }
        }

        match self.rtc.now() {
            Ok(time) if is_valid_timestamp(&time) => {
                info!("Clock is running: {}", time.format("%Y-%m-%d %H:%M:%S"));
                self.state = TimeState::ClockTrusted;
                self.last_trusted = Some(time);
                Some(time)
            }
            Ok(time) => {
                warn!("Clock reports implausible time {}", time);
                None
            }
            Err(e) => {
                warn!("Clock read failed: {}", e);
                None
            }
        }
    }

    fn fetch_network_time(network: &mut NetworkLink) -> Result<NaiveDateTime, FrameError> {
        if !network.is_connected() {
            network.connect()?;
        }
        network.fetch_timestamp()
    }

    fn defer(&mut self, time: NaiveDateTime) {
        if let Some(old) = self.pending() {
            debug!("Replacing pending clock write {}", old.timestamp);
        }
        self.pending = Some(PendingTimeUpdate::new(time));
        self.state = TimeState::DeferredCommitPending;
    }

    fn fallback_state(&self) -> TimeState {
        if self.has_pending() {
            TimeState::DeferredCommitPending
        } else {
            TimeState::ClockUnavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::tests::support::{FakeClock, ScriptedRadio, ScriptedRtc, ScriptedTimeService};
    use chrono::NaiveDate;
    use std::io::Cursor;

    const NET_EPOCH: i64 = 1_700_000_000;

    fn net_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 14)
            .unwrap()
            .and_hms_opt(22, 13, 20)
            .unwrap()
    }

    fn online() -> NetworkLink {
        let mut net = NetworkLink::new(
            Box::new(ScriptedRadio::after_polls(0)),
            Box::new(ScriptedTimeService::after_polls(0, NET_EPOCH)),
            Box::new(FakeClock::new()),
            &NetworkConfig::default(),
        );
        net.load_credentials(Cursor::new("net\npass\n")).unwrap();
        net
    }

    fn offline() -> NetworkLink {
        NetworkLink::new(
            Box::new(ScriptedRadio::never()),
            Box::new(ScriptedTimeService::never()),
            Box::new(FakeClock::new()),
            &NetworkConfig::default(),
        )
    }

    fn authority(rtc: ScriptedRtc) -> TimeAuthority {
        TimeAuthority::new(Box::new(rtc), &BoardConfig::default())
    }

    #[test]
    fn test_running_clock_is_trusted() {
        let clock_time = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let rtc = ScriptedRtc::running(clock_time);
        let mut ta = authority(rtc);
        let mut net = offline();

        let t = ta.resolve(&mut net, BusOwner::Storage, false).unwrap();
        assert_eq!(t, clock_time);
        assert_eq!(ta.state(), TimeState::ClockTrusted);
        assert!(!net.is_connected());
    }

    #[test]
    fn test_lost_power_with_busy_bus_defers_write() {
        let rtc = ScriptedRtc::lost_power();
        let writes = rtc.writes();
        let mut ta = authority(rtc);
        let mut net = online();

        let t = ta.resolve(&mut net, BusOwner::Storage, false).unwrap();
        assert_eq!(t, net_time());
        assert_eq!(ta.state(), TimeState::DeferredCommitPending);
        assert_eq!(ta.pending().unwrap().timestamp, net_time());
        assert!(writes.borrow().is_empty());

        // Still busy: nothing happens
        assert_eq!(ta.commit_pending(BusOwner::Display), Ok(false));
        assert!(ta.has_pending());

        assert_eq!(ta.commit_pending(BusOwner::None), Ok(true));
        assert!(!ta.has_pending());
        assert_eq!(ta.state(), TimeState::ClockTrusted);
        assert_eq!(*writes.borrow(), vec![net_time()]);

        // Further commits are no-ops
        assert_eq!(ta.commit_pending(BusOwner::None), Ok(false));
        assert_eq!(writes.borrow().len(), 1);
    }

    #[test]
    fn test_free_bus_writes_immediately() {
        let rtc = ScriptedRtc::lost_power();
        let writes = rtc.writes();
        let mut ta = authority(rtc);
        let mut net = online();

        ta.resolve(&mut net, BusOwner::None, false).unwrap();
        assert_eq!(ta.state(), TimeState::ClockTrusted);
        assert!(!ta.has_pending());
        assert_eq!(writes.borrow().len(), 1);
    }

    #[test]
    fn test_failed_commit_keeps_record() {
        let mut rtc = ScriptedRtc::lost_power();
        rtc.fail_writes = true;
        let mut ta = authority(rtc);
        let mut net = online();

        ta.resolve(&mut net, BusOwner::Storage, false).unwrap();
        let err = ta.commit_pending(BusOwner::None).unwrap_err();
        assert!(matches!(err, FrameError::ClockWriteFailed(_)));
        assert!(ta.has_pending());
        assert_eq!(ta.state(), TimeState::DeferredCommitPending);
    }

    #[test]
    fn test_absent_clock_uses_network_without_pending() {
        let mut ta = TimeAuthority::new(Box::new(AbsentRtc), &BoardConfig::default());
        let mut net = online();

        let t = ta.resolve(&mut net, BusOwner::Storage, false).unwrap();
        assert_eq!(t, net_time());
        assert_eq!(ta.state(), TimeState::ClockUnavailable);
        assert!(!ta.has_pending());
    }

    #[test]
    fn test_both_sources_failing_is_fatal() {
        let mut ta = TimeAuthority::new(Box::new(AbsentRtc), &BoardConfig::default());
        let mut net = offline();
        let err = ta.resolve(&mut net, BusOwner::None, false).unwrap_err();
        assert!(matches!(err, FrameError::ClockInitializationFailed(_)));
        assert!(ta.last_trusted().is_none());
    }

    #[test]
    fn test_forced_reset_skips_running_clock() {
        let clock_time = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let mut ta = authority(ScriptedRtc::running(clock_time));
        let mut net = online();
        let t = ta.resolve(&mut net, BusOwner::None, true).unwrap();
        assert_eq!(t, net_time());
    }

    #[test]
    fn test_implausible_clock_value_falls_back_and_keeps_trusted() {
        let boot = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(!is_valid_timestamp(&boot));

        let mut ta = authority(ScriptedRtc::running(boot));
        let mut net = offline();
        assert!(ta.resolve(&mut net, BusOwner::None, false).is_err());
        assert!(ta.last_trusted().is_none());
    }

    #[test]
    fn test_newer_timestamp_overwrites_pending() {
        let older = NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut ta = authority(ScriptedRtc::lost_power());
        ta.restore_pending(Some(PendingTimeUpdate::new(older)));
        assert_eq!(ta.state(), TimeState::DeferredCommitPending);

        let mut net = online();
        ta.resolve(&mut net, BusOwner::Storage, false).unwrap();
        assert_eq!(ta.pending().unwrap().timestamp, net_time());
    }

    #[test]
    fn test_running_clock_drops_restored_write() {
        let clock_time = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let rtc = ScriptedRtc::running(clock_time);
        let writes = rtc.writes();
        let stale = PendingTimeUpdate::new(clock_time - ChronoDuration::minutes(90));
        let mut ta = authority(rtc);
        ta.restore_pending(Some(stale));
        let mut net = offline();

        assert_eq!(ta.resolve(&mut net, BusOwner::Storage, false), Ok(clock_time));
        assert_eq!(ta.state(), TimeState::ClockTrusted);
        assert!(!ta.has_pending());
        assert_eq!(ta.commit_pending(BusOwner::None), Ok(false));
        assert!(writes.borrow().is_empty());
    }

    #[test]
    fn test_aged_record_moves_forward() {
        let record = PendingTimeUpdate::new(net_time()).aged(ChronoDuration::seconds(3600));
        assert_eq!(record.timestamp, net_time() + ChronoDuration::hours(1));
        assert!(!record.committed);
    }

    #[test]
    fn test_committed_records_are_not_restored() {
        let mut record = PendingTimeUpdate::new(net_time());
        record.committed = true;
        let mut ta = authority(ScriptedRtc::lost_power());
        ta.restore_pending(Some(record));
        assert!(!ta.has_pending());
    }
}
