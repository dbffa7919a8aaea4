//! Injected fakes for the hardware and time seams.
//!
//! Each fake records what happened through shared handles (`Rc<Cell<_>>`,
//! `Rc<RefCell<_>>`) so a test can keep a handle after boxing the fake into
//! the component under test.

use crate::bus::{BusLines, BusOwner, GpioPin, SpiHost};
use crate::config::{BusPins, WeatherConfig};
use crate::error::{ErrorDescriptor, FrameError, HwError};
use crate::network::{Credentials, Radio, TimeService};
use crate::renderer::{Renderer, StatusLine};
use crate::stager::StagedFile;
use crate::staging::StagingFs;
use crate::time_authority::RtcDevice;
use crate::timing::{Clock, Watchdog};
use crate::weather::{WeatherClient, WeatherRecord};
use chrono::NaiveDateTime;
use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

/// Ordered log of electrical events shared between fakes.
#[derive(Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.borrow_mut().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

/// Bus lines that only record select/deselect calls.
pub struct RecordingLines {
    log: EventLog,
    pub fail_select: bool,
}

impl RecordingLines {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_select: false,
        }
    }
}

impl BusLines for RecordingLines {
    fn deselect(&mut self, owner: BusOwner) -> Result<(), HwError> {
        self.log.push(format!("deselect {:?}", owner));
        Ok(())
    }

    fn select(&mut self, owner: BusOwner) -> Result<(), HwError> {
        if self.fail_select {
            return Err(HwError("bus unresponsive".to_string()));
        }
        self.log.push(format!("select {:?}", owner));
        Ok(())
    }

    fn deselect_all(&mut self) {
        self.log.push("deselect all");
    }
}

pub struct RecordingPin {
    name: &'static str,
    log: EventLog,
}

impl RecordingPin {
    pub fn new(name: &'static str, log: EventLog) -> Self {
        Self { name, log }
    }
}

impl GpioPin for RecordingPin {
    fn set_high(&mut self) -> Result<(), HwError> {
        self.log.push(format!("{} high", self.name));
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), HwError> {
        self.log.push(format!("{} low", self.name));
        Ok(())
    }
}

pub struct RecordingSpi {
    log: EventLog,
}

impl RecordingSpi {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl SpiHost for RecordingSpi {
    fn begin(&mut self, pins: BusPins) -> Result<(), HwError> {
        self.log.push(format!("spi begin cs={}", pins.cs));
        Ok(())
    }

    fn end(&mut self) {
        self.log.push("spi end");
    }
}

/// Staging volume that can neither mount nor format.
pub struct FailingStaging;

impl StagingFs for FailingStaging {
    fn mount(&mut self) -> io::Result<()> {
        Err(io::Error::other("no flash partition"))
    }

    fn format(&mut self) -> io::Result<()> {
        Err(io::Error::other("no flash partition"))
    }

    fn list(&self) -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn remove(&mut self, _name: &str) -> io::Result<()> {
        Err(io::Error::other("not mounted"))
    }

    fn create(&mut self, _name: &str) -> io::Result<Box<dyn Write>> {
        Err(io::Error::other("not mounted"))
    }

    fn size_of(&self, _name: &str) -> io::Result<u64> {
        Err(io::Error::other("not mounted"))
    }

    fn path_of(&self, name: &str) -> PathBuf {
        PathBuf::from(name)
    }
}

/// Clock that advances only when slept on.
#[derive(Clone, Default)]
pub struct FakeClock(Rc<Cell<u64>>);

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }

    fn sleep(&self, duration: Duration) {
        self.0.set(self.0.get() + duration.as_millis() as u64);
    }
}

/// Watchdog that counts feeds.
#[derive(Clone, Default)]
pub struct CountingWatchdog(Rc<Cell<u32>>);

impl CountingWatchdog {
    pub fn count(&self) -> u32 {
        self.0.get()
    }
}

impl Watchdog for CountingWatchdog {
    fn feed(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

/// Radio that reports a link after a fixed number of status polls per attempt.
pub struct ScriptedRadio {
    polls_needed: Option<u32>,
    polls: u32,
    begins: Rc<Cell<u32>>,
}

impl ScriptedRadio {
    pub fn after_polls(polls: u32) -> Self {
        Self {
            polls_needed: Some(polls),
            polls: 0,
            begins: Rc::default(),
        }
    }

    pub fn never() -> Self {
        Self {
            polls_needed: None,
            polls: 0,
            begins: Rc::default(),
        }
    }

    pub fn begin_count(&self) -> Rc<Cell<u32>> {
        self.begins.clone()
    }
}

impl Radio for ScriptedRadio {
    fn begin(&mut self, _credentials: &Credentials) -> Result<(), HwError> {
        self.begins.set(self.begins.get() + 1);
        self.polls = 0;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        match self.polls_needed {
            Some(needed) if self.polls >= needed => true,
            Some(_) => {
                self.polls += 1;
                false
            }
            None => false,
        }
    }

    fn local_address(&self) -> Option<IpAddr> {
        self.polls_needed
            .map(|_| IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42)))
    }

    fn disconnect(&mut self) {
        self.polls = 0;
    }
}

/// Time service that returns zero until polled enough times.
pub struct ScriptedTimeService {
    polls_needed: Option<u32>,
    polls: u32,
    epoch: i64,
}

impl ScriptedTimeService {
    pub fn after_polls(polls: u32, epoch: i64) -> Self {
        Self {
            polls_needed: Some(polls),
            polls: 0,
            epoch,
        }
    }

    pub fn never() -> Self {
        Self {
            polls_needed: None,
            polls: 0,
            epoch: 0,
        }
    }
}

impl TimeService for ScriptedTimeService {
    fn configure(&mut self, _servers: &[String]) {}

    fn epoch_seconds(&mut self) -> i64 {
        match self.polls_needed {
            Some(needed) if self.polls >= needed => self.epoch,
            Some(_) => {
                self.polls += 1;
                0
            }
            None => 0,
        }
    }
}

/// Clock peripheral with a fixed value and a record of writes.
pub struct ScriptedRtc {
    time: NaiveDateTime,
    lost_power: bool,
    writes: Rc<RefCell<Vec<NaiveDateTime>>>,
    pub fail_writes: bool,
}

impl ScriptedRtc {
    pub fn running(time: NaiveDateTime) -> Self {
        Self {
            time,
            lost_power: false,
            writes: Rc::default(),
            fail_writes: false,
        }
    }

    pub fn lost_power() -> Self {
        Self {
            time: NaiveDateTime::default(),
            lost_power: true,
            writes: Rc::default(),
            fail_writes: false,
        }
    }

    pub fn writes(&self) -> Rc<RefCell<Vec<NaiveDateTime>>> {
        self.writes.clone()
    }
}

impl RtcDevice for ScriptedRtc {
    fn begin(&mut self) -> Result<(), HwError> {
        Ok(())
    }

    fn lost_power(&mut self) -> Result<bool, HwError> {
        Ok(self.lost_power)
    }

    fn now(&mut self) -> Result<NaiveDateTime, HwError> {
        Ok(self.time)
    }

    fn adjust(&mut self, time: NaiveDateTime) -> Result<(), HwError> {
        if self.fail_writes {
            return Err(HwError("clock not answering".to_string()));
        }
        self.writes.borrow_mut().push(time);
        self.time = time;
        self.lost_power = false;
        Ok(())
    }
}

/// What a [`RecordingRenderer`] was asked to draw.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedFrame {
    Image(StagedFile, StatusLine),
    Error(ErrorDescriptor, StatusLine),
}

/// Renderer that keeps every request instead of drawing.
#[derive(Clone, Default)]
pub struct RecordingRenderer(Rc<RefCell<Vec<RenderedFrame>>>);

impl RecordingRenderer {
    pub fn frames(&self) -> Vec<RenderedFrame> {
        self.0.borrow().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn render_image(&mut self, staged: &StagedFile, status: &StatusLine) -> Result<(), FrameError> {
        self.0
            .borrow_mut()
            .push(RenderedFrame::Image(staged.clone(), status.clone()));
        Ok(())
    }

    fn render_error(
        &mut self,
        error: &ErrorDescriptor,
        status: &StatusLine,
    ) -> Result<(), FrameError> {
        self.0
            .borrow_mut()
            .push(RenderedFrame::Error(error.clone(), status.clone()));
        Ok(())
    }
}

/// Weather source with a canned answer.
pub struct StaticWeather {
    answer: Result<WeatherRecord, FrameError>,
    calls: Rc<Cell<u32>>,
}

impl StaticWeather {
    pub fn returning(record: WeatherRecord) -> Self {
        Self {
            answer: Ok(record),
            calls: Rc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: Err(FrameError::WeatherFetchFailed("offline".to_string())),
            calls: Rc::default(),
        }
    }

    pub fn calls(&self) -> Rc<Cell<u32>> {
        self.calls.clone()
    }
}

impl WeatherClient for StaticWeather {
    fn fetch(&self, _config: &WeatherConfig) -> Result<WeatherRecord, FrameError> {
        self.calls.set(self.calls.get() + 1);
        self.answer.clone()
    }
}
