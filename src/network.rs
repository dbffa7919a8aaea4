//! # Network Link
//!
//! Owns the wireless connection lifecycle and the network time query.
//!
//! ## Connection Policy
//! - Credentials come from a two-line source: identifier, then secret
//! - `connect()` makes up to [`RetryPolicy::max_attempts`] attempts, each
//!   polling the radio until a per-attempt timeout
//! - Between attempts it backs off exponentially (`base * 2^attempt`) plus up
//!   to 25% random jitter
//!
//! ## Time Query
//! `fetch_timestamp()` polls a [`TimeService`] until it reports an epoch value
//! past [`EPOCH_SANITY_FLOOR`]. Values below the floor are what an
//! unsynchronised service reports right after boot.
//!
//! All waiting goes through the injected [`Clock`], and the radio and time
//! service are traits, so the whole policy runs in tests without delays.

use crate::config::{NetworkConfig, RetryConfig};
use crate::error::{FrameError, HwError};
use crate::timing::Clock;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::BufRead;
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

/// Unix seconds below which a time service is considered unsynchronised (2001-09-09).
pub const EPOCH_SANITY_FLOOR: i64 = 1_000_000_000;

/// Interval between radio status polls within one attempt.
const CONNECT_POLL: Duration = Duration::from_millis(500);

/// Interval between time service polls.
const NTP_POLL: Duration = Duration::from_millis(200);

/// Network identifier and secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identifier: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Bounded retry with exponential backoff and random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Jitter upper bound as a fraction of the backoff delay
    pub jitter_ratio: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Backoff after failed attempt `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    /// Backoff plus a uniform jitter in `0..=backoff * jitter_ratio`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let backoff = self.backoff(attempt);
        let max_jitter = (backoff.as_millis() as f64 * self.jitter_ratio as f64) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rng.random_range(0..=max_jitter)
        };
        backoff + Duration::from_millis(jitter)
    }
}

/// Wireless radio driver.
pub trait Radio {
    /// Start associating with the network; returns once the request is issued.
    fn begin(&mut self, credentials: &Credentials) -> Result<(), HwError>;
    fn is_connected(&mut self) -> bool;
    fn local_address(&self) -> Option<IpAddr>;
    /// Tear down the association and power the radio off.
    fn disconnect(&mut self);
}

/// Network time service.
pub trait TimeService {
    fn configure(&mut self, servers: &[String]);
    /// Current Unix seconds as known to the service; below the sanity floor until synced.
    fn epoch_seconds(&mut self) -> i64;
}

/// Wireless link with credentials, retry policy and time query.
pub struct NetworkLink {
    radio: Box<dyn Radio>,
    time_service: Box<dyn TimeService>,
    clock: Box<dyn Clock>,
    rng: StdRng,
    policy: RetryPolicy,
    connect_timeout: Duration,
    ntp_timeout: Duration,
    ntp_servers: Vec<String>,
    utc_offset: FixedOffset,
    credentials: Option<Credentials>,
    state: ConnectionState,
    address: Option<IpAddr>,
}

impl NetworkLink {
    pub fn new(
        radio: Box<dyn Radio>,
        time_service: Box<dyn TimeService>,
        clock: Box<dyn Clock>,
        config: &NetworkConfig,
    ) -> Self {
        let utc_offset = config.utc_offset.parse::<FixedOffset>().unwrap_or_else(|e| {
            warn!("Invalid UTC offset '{}' ({}), using UTC", config.utc_offset, e);
            Utc.fix()
        });
        Self {
            radio,
            time_service,
            clock,
            rng: StdRng::from_os_rng(),
            policy: RetryPolicy::from_config(&config.retry),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            ntp_timeout: Duration::from_secs(config.ntp_timeout_secs),
            ntp_servers: config.ntp_servers.clone(),
            utc_offset,
            credentials: None,
            state: ConnectionState::Disconnected,
            address: None,
        }
    }

    /// Replace the jitter source, e.g. with a seeded generator.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Parse identifier and secret from the first two lines of `source`.
    ///
    /// Idempotent once credentials are loaded.
    pub fn load_credentials<R: BufRead>(&mut self, source: R) -> Result<(), FrameError> {
        if self.credentials.is_some() {
            return Ok(());
        }

        let mut lines = source.lines();
        let identifier = match lines.next() {
            Some(Ok(line)) => line.trim().to_string(),
            _ => String::new(),
        };
        let secret = match lines.next() {
            Some(Ok(line)) => line.trim().to_string(),
            _ => String::new(),
        };

        if identifier.is_empty() {
            warn!("Network identifier missing from credentials source");
            return Err(FrameError::CredentialsNotFound);
        }

        info!("Loaded network credentials for '{}'", identifier);
        self.credentials = Some(Credentials { identifier, secret });
        Ok(())
    }

    /// Forget credentials and drop the link.
    pub fn reset(&mut self) {
        self.disconnect();
        self.credentials = None;
    }

    /// Connect with bounded retries; a no-op when already connected.
    pub fn connect(&mut self) -> Result<(), FrameError> {
        let credentials = self
            .credentials
            .clone()
            .ok_or(FrameError::CredentialsNotFound)?;

        if self.state == ConnectionState::Connected && self.radio.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        info!("Connecting to '{}'", credentials.identifier);
        let attempts = self.policy.max_attempts;
        for attempt in 0..attempts {
            self.state = ConnectionState::Connecting;
            info!("Connection attempt {}/{}", attempt + 1, attempts);

            if self.try_attempt(&credentials) {
                self.state = ConnectionState::Connected;
                self.address = self.radio.local_address();
                match self.address {
                    Some(addr) => info!("Connected, address {}", addr),
                    None => info!("Connected"),
                }
                return Ok(());
            }

            warn!("Connection attempt {} failed", attempt + 1);
            self.radio.disconnect();

            if attempt + 1 < attempts {
                let delay = self.policy.delay_for(attempt, &mut self.rng);
                info!("Retrying in {} ms", delay.as_millis());
                self.clock.sleep(delay);
            }
        }

        self.state = ConnectionState::Disconnected;
        self.address = None;
        warn!("Failed to connect after {} attempt(s)", attempts);
        Err(FrameError::ConnectionFailed { attempts })
    }

    fn try_attempt(&mut self, credentials: &Credentials) -> bool {
        if let Err(e) = self.radio.begin(credentials) {
            warn!("Radio refused to start: {}", e);
            return false;
        }

        let start = self.clock.now_ms();
        let timeout = self.connect_timeout.as_millis() as u64;
        loop {
            if self.radio.is_connected() {
                return true;
            }
            if self.clock.now_ms().saturating_sub(start) >= timeout {
                return false;
            }
            self.clock.sleep(CONNECT_POLL);
        }
    }

    /// Query the time service and return local calendar time.
    pub fn fetch_timestamp(&mut self) -> Result<NaiveDateTime, FrameError> {
        if !self.is_connected() {
            return Err(FrameError::NotConnected);
        }

        self.time_service.configure(&self.ntp_servers);
        info!("Waiting for network time...");

        let start = self.clock.now_ms();
        let timeout = self.ntp_timeout.as_millis() as u64;
        let epoch = loop {
            let epoch = self.time_service.epoch_seconds();
            if epoch > EPOCH_SANITY_FLOOR {
                break epoch;
            }
            let waited_ms = self.clock.now_ms().saturating_sub(start);
            if waited_ms >= timeout {
                warn!("Network time sync timed out after {} ms", waited_ms);
                return Err(FrameError::TimeSyncTimeout { waited_ms });
            }
            self.clock.sleep(NTP_POLL);
        };

        let utc = DateTime::from_timestamp(epoch, 0)
            .ok_or(FrameError::TimeSyncTimeout { waited_ms: 0 })?;
        let local = utc.with_timezone(&self.utc_offset).naive_local();
        info!("Network time: {}", local.format("%Y-%m-%d %H:%M:%S"));
        Ok(local)
    }

    /// Tear down the radio; safe when already disconnected.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            info!("Disconnecting");
            self.radio.disconnect();
        }
        self.state = ConnectionState::Disconnected;
        self.address = None;
    }
}

/// Radio for hosts where the operating system manages association.
///
/// The link counts as up when the OS has a routable local address.
#[derive(Default)]
pub struct SystemRadio {
    address: Option<IpAddr>,
}

impl SystemRadio {
    fn route_address() -> Option<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        // UDP connect only selects a route; nothing is sent
        socket.connect("192.0.2.1:9").ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
    }
}

impl Radio for SystemRadio {
    fn begin(&mut self, credentials: &Credentials) -> Result<(), HwError> {
        debug!(
            "Association with '{}' is managed by the host OS",
            credentials.identifier
        );
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.address = Self::route_address();
        self.address.is_some()
    }

    fn local_address(&self) -> Option<IpAddr> {
        self.address
    }

    fn disconnect(&mut self) {
        self.address = None;
    }
}

/// Seconds between the NTP era origin (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// Minimal SNTP client over UDP.
pub struct SntpService {
    servers: Vec<String>,
    timeout: Duration,
}

impl SntpService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            servers: Vec::new(),
            timeout,
        }
    }

    fn query(&self, server: &str) -> std::io::Result<i64> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.connect((server, 123))?;

        let mut packet = [0u8; 48];
        packet[0] = 0x1B; // LI=0, VN=3, Mode=client
        socket.send(&packet)?;

        let mut reply = [0u8; 48];
        let n = socket.recv(&mut reply)?;
        if n < 48 {
            return Err(std::io::Error::other("short SNTP reply"));
        }
        let secs = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]);
        Ok(secs as i64 - NTP_UNIX_OFFSET)
    }
}

impl TimeService for SntpService {
    fn configure(&mut self, servers: &[String]) {
        self.servers = servers.to_vec();
    }

    fn epoch_seconds(&mut self) -> i64 {
        for server in &self.servers {
            match self.query(server) {
                Ok(epoch) => return epoch,
                Err(e) => debug!("SNTP query to {} failed: {}", server, e),
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{FakeClock, ScriptedRadio, ScriptedTimeService};
    use chrono::NaiveDate;
    use std::io::Cursor;

    fn link(radio: ScriptedRadio, time: ScriptedTimeService, clock: FakeClock) -> NetworkLink {
        NetworkLink::new(
            Box::new(radio),
            Box::new(time),
            Box::new(clock),
            &NetworkConfig::default(),
        )
        .with_rng(StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_credentials_are_trimmed() {
        let mut net = link(
            ScriptedRadio::never(),
            ScriptedTimeService::never(),
            FakeClock::new(),
        );
        net.load_credentials(Cursor::new("  home-net \r\nhunter2  \n"))
            .unwrap();
        let creds = net.credentials().unwrap();
        assert_eq!(creds.identifier, "home-net");
        assert_eq!(creds.secret, "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_empty_identifier_is_credentials_not_found() {
        let mut net = link(
            ScriptedRadio::never(),
            ScriptedTimeService::never(),
            FakeClock::new(),
        );
        assert_eq!(
            net.load_credentials(Cursor::new("\nsecret\n")),
            Err(FrameError::CredentialsNotFound)
        );
    }

    #[test]
    fn test_connect_without_credentials_fails() {
        let mut net = link(
            ScriptedRadio::after_polls(0),
            ScriptedTimeService::never(),
            FakeClock::new(),
        );
        assert_eq!(net.connect(), Err(FrameError::CredentialsNotFound));
    }

    #[test]
    fn test_connect_succeeds_on_first_attempt() {
        let clock = FakeClock::new();
        let mut net = link(
            ScriptedRadio::after_polls(3),
            ScriptedTimeService::never(),
            clock.clone(),
        );
        net.load_credentials(Cursor::new("net\npass\n")).unwrap();

        net.connect().unwrap();
        assert_eq!(net.state(), ConnectionState::Connected);
        assert!(net.address().is_some());
        // Three 500 ms polls before the radio reported the link
        assert_eq!(clock.now_ms(), 1500);

        // Idempotent
        net.connect().unwrap();
        assert_eq!(clock.now_ms(), 1500);
    }

    #[test]
    fn test_connect_exhausts_retries_with_backoff() {
        let clock = FakeClock::new();
        let radio = ScriptedRadio::never();
        let begins = radio.begin_count();
        let mut net = link(radio, ScriptedTimeService::never(), clock.clone());
        net.load_credentials(Cursor::new("net\npass\n")).unwrap();

        assert_eq!(
            net.connect(),
            Err(FrameError::ConnectionFailed { attempts: 2 })
        );
        assert_eq!(net.state(), ConnectionState::Disconnected);
        assert_eq!(begins.get(), 2);

        // Two 30 s attempts plus one 2000..=2500 ms backoff
        let elapsed = clock.now_ms();
        assert!((62_000..=62_500).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn test_backoff_doubles_and_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(2000));
        assert_eq!(policy.backoff(1), Duration::from_millis(4000));

        let mut rng = StdRng::seed_from_u64(1);
        for attempt in 0..4 {
            let base = policy.backoff(attempt);
            let delay = policy.delay_for(attempt, &mut rng);
            assert!(delay >= base);
            assert!(delay <= base + base / 4);
        }
    }

    #[test]
    fn test_fetch_timestamp_requires_connection() {
        let mut net = link(
            ScriptedRadio::after_polls(0),
            ScriptedTimeService::after_polls(0, 1_700_000_000),
            FakeClock::new(),
        );
        assert_eq!(net.fetch_timestamp(), Err(FrameError::NotConnected));
    }

    #[test]
    fn test_fetch_timestamp_waits_past_floor() {
        let clock = FakeClock::new();
        let mut net = link(
            ScriptedRadio::after_polls(0),
            ScriptedTimeService::after_polls(4, 1_700_000_000),
            clock.clone(),
        );
        net.load_credentials(Cursor::new("net\n")).unwrap();
        net.connect().unwrap();

        let ts = net.fetch_timestamp().unwrap();
        let expected = NaiveDate::from_ymd_opt(2023, 11, 14)
            .unwrap()
            .and_hms_opt(22, 13, 20)
            .unwrap();
        assert_eq!(ts, expected);
        assert_eq!(clock.now_ms(), 800);
    }

    #[test]
    fn test_fetch_timestamp_times_out() {
        let mut net = link(
            ScriptedRadio::after_polls(0),
            ScriptedTimeService::never(),
            FakeClock::new(),
        );
        net.load_credentials(Cursor::new("net\n")).unwrap();
        net.connect().unwrap();

        match net.fetch_timestamp() {
            Err(FrameError::TimeSyncTimeout { waited_ms }) => assert!(waited_ms >= 20_000),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_is_safe_twice() {
        let mut net = link(
            ScriptedRadio::after_polls(0),
            ScriptedTimeService::never(),
            FakeClock::new(),
        );
        net.load_credentials(Cursor::new("net\n")).unwrap();
        net.connect().unwrap();
        net.disconnect();
        net.disconnect();
        assert_eq!(net.state(), ConnectionState::Disconnected);
        assert!(net.address().is_none());

        net.reset();
        assert!(net.credentials().is_none());
    }
}
