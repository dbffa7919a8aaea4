//! # Frame Errors
//!
//! Every failure the wake cycle can observe is a [`FrameError`]. The enum is
//! `Clone` and `PartialEq` so that it can be carried inside an
//! [`ErrorDescriptor`] all the way to the renderer, and compared directly in
//! tests. Underlying I/O errors are flattened to their message for the same
//! reason.
//!
//! ## Propagation
//! - Network and clock failures during time resolution are recovered locally
//!   by switching to the other time source; only both failing is surfaced.
//! - File validation failures are always surfaced to the caller.
//! - Staging mount/write failures are soft: the cycle can still show a
//!   previously staged file or an error screen.

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors raised by the frame's peripherals and wake-cycle components.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The credentials source is missing or its identifier line is empty
    #[error("network credentials not found")]
    CredentialsNotFound,

    /// All connection attempts were exhausted
    #[error("network connection failed after {attempts} attempt(s)")]
    ConnectionFailed { attempts: u32 },

    /// An operation that needs a link was called while disconnected
    #[error("network is not connected")]
    NotConnected,

    /// Neither the clock peripheral nor the network produced a timestamp
    #[error("clock initialization failed: {0}")]
    ClockInitializationFailed(String),

    /// The clock peripheral did not accept a write
    #[error("clock write failed: {0}")]
    ClockWriteFailed(String),

    /// The time service never reported a value past the sanity floor
    #[error("time sync timed out after {waited_ms} ms")]
    TimeSyncTimeout { waited_ms: u64 },

    /// Raster length differs from `width * height`
    #[error("image file truncated: expected {expected} bytes, found {actual}")]
    FileTruncated { expected: u64, actual: u64 },

    /// A raster file was validated without expected dimensions
    #[error("image dimensions not provided")]
    DimensionsNotProvided,

    /// Bitmap header dimensions differ from the expected ones
    #[error("image dimensions mismatch: expected {expected_width}x{expected_height}, found {actual_width}x{actual_height}")]
    DimensionsMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    /// Structural inconsistency inside an otherwise recognised file
    #[error("image file corrupted: {0}")]
    FileCorrupted(String),

    /// Unsupported extension or unreadable header
    #[error("image file header invalid: {0}")]
    HeaderInvalid(String),

    /// Bitmap file without the `BM` signature
    #[error("bitmap signature invalid")]
    BitmapSignatureInvalid,

    /// Zero-length file
    #[error("image file is empty")]
    FileEmpty,

    /// File size outside the accepted range
    #[error("image file size {size} outside {min}..={max} bytes")]
    FileSizeOutOfBounds { size: u64, min: u64, max: u64 },

    /// No matching file on the primary storage device
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A file exists but could not be opened or read
    #[error("file open failed: {0}")]
    FileOpenFailed(String),

    /// The staging filesystem could not be mounted or formatted
    #[error("staging filesystem mount failed: {0}")]
    StagingMountFailed(String),

    /// Writing the staged copy failed
    #[error("staging write failed: {0}")]
    StagingWriteFailed(String),

    /// Weather provider request or response failure
    #[error("weather fetch failed: {0}")]
    WeatherFetchFailed(String),

    /// The frame could not be drawn or handed to the panel
    #[error("render failed: {0}")]
    RenderFailed(String),
}

impl FrameError {
    /// Wrap an I/O failure while opening or reading a source file.
    pub fn open_failed(path: impl fmt::Display, err: io::Error) -> Self {
        FrameError::FileOpenFailed(format!("{path}: {err}"))
    }

    /// True for errors that never stop the cycle from showing something.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            FrameError::StagingMountFailed(_)
                | FrameError::StagingWriteFailed(_)
                | FrameError::ClockWriteFailed(_)
                | FrameError::WeatherFetchFailed(_)
        )
    }
}

/// What the renderer receives instead of image data when a cycle cannot proceed.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDescriptor {
    /// Short human-readable message for the screen
    pub message: String,
    /// The error that stopped the cycle
    pub kind: FrameError,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>, kind: FrameError) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    /// Descriptor with a screen message chosen from the error itself.
    pub fn from_error(kind: FrameError) -> Self {
        let message = match &kind {
            FrameError::ClockInitializationFailed(_) | FrameError::TimeSyncTimeout { .. } => {
                "Time unavailable"
            }
            FrameError::CredentialsNotFound
            | FrameError::ConnectionFailed { .. }
            | FrameError::NotConnected => "Network unavailable",
            FrameError::FileNotFound(_) => "No images found",
            FrameError::FileOpenFailed(_) => "Storage read failed",
            FrameError::StagingMountFailed(_) | FrameError::StagingWriteFailed(_) => {
                "Staging failed"
            }
            FrameError::RenderFailed(_) => "Display failed",
            _ => "Image invalid",
        };
        Self::new(message, kind)
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// Failure reported by an electrical layer (pins, SPI host, I2C device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwError(pub String);

impl fmt::Display for HwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hardware error: {}", self.0)
    }
}

impl std::error::Error for HwError {}
