//! # File Stager
//!
//! Validates an image on primary storage and copies it to the staging volume,
//! so primary storage can be powered down before the display takes the bus.
//!
//! ## Validation Rules
//! - Size must be within [`MIN_FILE_SIZE`]..=[`MAX_FILE_SIZE`]; an empty file
//!   is reported separately
//! - `.bin`: raw 8-bit raster, exactly `width * height` bytes; dimensions are
//!   mandatory for this format
//! - `.bmp`: `BM` signature, pixel-data offset at byte 10, width at 18 and
//!   height at 22 (little-endian); a negative height marks a top-down bitmap
//!   and its magnitude is compared
//! - Anything else is rejected without reading the header
//!
//! The read position is rewound to the start after validation, whatever the
//! outcome.

use crate::bus::{BusArbiter, BusOwner};
use crate::error::FrameError;
use crate::timing::Watchdog;
use log::{debug, error, info, warn};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

pub const MIN_FILE_SIZE: u64 = 100;
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

const CHUNK_SIZE: usize = 1024;
/// Chunks copied between watchdog feeds (4 KiB).
const CHUNKS_PER_FEED: usize = 4;

const BMP_HEADER_LEN: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    BinaryRaster,
    Bitmap,
}

impl ImageKind {
    /// Dispatch on the file name's extension, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".bin") {
            Some(ImageKind::BinaryRaster)
        } else if lower.ends_with(".bmp") {
            Some(ImageKind::Bitmap)
        } else {
            None
        }
    }
}

/// Outcome of inspecting one file.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub ok: bool,
    pub kind: Option<ImageKind>,
    pub declared_width: u32,
    pub declared_height: u32,
    /// File length in bytes, when it could be determined
    pub size: u64,
    pub error: Option<FrameError>,
}

impl ValidationResult {
    fn accepted(kind: ImageKind, width: u32, height: u32, size: u64) -> Self {
        Self {
            ok: true,
            kind: Some(kind),
            declared_width: width,
            declared_height: height,
            size,
            error: None,
        }
    }

    fn rejected(error: FrameError, size: u64) -> Self {
        Self {
            ok: false,
            kind: None,
            declared_width: 0,
            declared_height: 0,
            size,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Self, FrameError> {
        match self.error.clone() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// A validated image copied to the staging volume.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    /// Entry name on the staging volume
    pub name: String,
    /// Where the renderer reads it from
    pub path: PathBuf,
    pub kind: ImageKind,
    pub size: u64,
}

pub struct FileStager {
    watchdog: Box<dyn Watchdog>,
    cleanup_suffix: Option<String>,
}

impl FileStager {
    pub fn new(watchdog: Box<dyn Watchdog>) -> Self {
        Self {
            watchdog,
            cleanup_suffix: None,
        }
    }

    /// Remove staged entries ending in `suffix` before each copy.
    pub fn with_cleanup(mut self, suffix: impl Into<String>) -> Self {
        self.cleanup_suffix = Some(suffix.into());
        self
    }

    /// Inspect `file` (named `name`) against the expected dimensions.
    ///
    /// Pass zero for either dimension to skip the comparison; raster files
    /// then fail with `DimensionsNotProvided`.
    pub fn validate<R: Read + Seek>(
        file: &mut R,
        name: &str,
        expected_width: u32,
        expected_height: u32,
    ) -> ValidationResult {
        let result = match file.seek(SeekFrom::End(0)) {
            Ok(size) => match inspect(file, name, size, expected_width, expected_height) {
                Ok((kind, width, height)) => ValidationResult::accepted(kind, width, height, size),
                Err(e) => ValidationResult::rejected(e, size),
            },
            Err(e) => ValidationResult::rejected(FrameError::open_failed(name, e), 0),
        };

        if let Err(e) = file.seek(SeekFrom::Start(0)) {
            warn!("Failed to rewind {}: {}", name, e);
        }

        match &result.error {
            None => debug!(
                "Validated {} ({:?}, {}x{}, {} bytes)",
                name, result.kind, result.declared_width, result.declared_height, result.size
            ),
            Some(e) => warn!("Rejected {}: {}", name, e),
        }
        result
    }

    /// Validate `file` and stream it to `destination` on the staging volume.
    ///
    /// A file that fails validation is never staged and leaves the volume
    /// untouched. Otherwise old entries matching the cleanup suffix go first.
    /// A copy whose final size differs from the source is removed.
    pub fn copy_to_staging<R: Read + Seek>(
        &mut self,
        arbiter: &mut BusArbiter,
        file: &mut R,
        source_name: &str,
        destination: &str,
        expected_width: u32,
        expected_height: u32,
    ) -> Result<StagedFile, FrameError> {
        let validation = Self::validate(file, source_name, expected_width, expected_height)
            .into_result()?;
        let kind = validation.kind.unwrap_or(ImageKind::BinaryRaster);

        if arbiter.owner() != BusOwner::Storage {
            warn!("Staging {} while bus owner is {:?}", source_name, arbiter.owner());
        }
        arbiter.init_staging_filesystem()?;
        if let Some(suffix) = &self.cleanup_suffix {
            arbiter.cleanup_staged_files(suffix);
        }

        info!("Staging {} -> {}", source_name, destination);
        let copied = self.stream(arbiter, file, source_name, destination)?;

        let staging = arbiter.staging();
        let staged_size = staging
            .size_of(destination)
            .map_err(|e| FrameError::StagingWriteFailed(e.to_string()))?;
        if staged_size != validation.size || copied != validation.size {
            error!(
                "Staged size mismatch for {}: source {} bytes, staged {} bytes",
                destination, validation.size, staged_size
            );
            remove_partial(arbiter, destination);
            return Err(FrameError::StagingWriteFailed(format!(
                "size mismatch: expected {} bytes, wrote {}",
                validation.size, staged_size
            )));
        }

        if let Err(e) = file.seek(SeekFrom::Start(0)) {
            warn!("Failed to rewind {}: {}", source_name, e);
        }

        info!("Staged {} bytes to {}", copied, destination);
        Ok(StagedFile {
            name: destination.to_string(),
            path: arbiter.staging().path_of(destination),
            kind,
            size: copied,
        })
    }

    fn stream<R: Read>(
        &mut self,
        arbiter: &mut BusArbiter,
        file: &mut R,
        source_name: &str,
        destination: &str,
    ) -> Result<u64, FrameError> {
        let mut out = arbiter
            .staging()
            .create(destination)
            .map_err(|e| FrameError::StagingWriteFailed(format!("create {destination}: {e}")))?;

        let mut buffer = [0u8; CHUNK_SIZE];
        let mut copied: u64 = 0;
        let mut chunks: usize = 0;
        let outcome = loop {
            let n = match file.read(&mut buffer) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(FrameError::open_failed(source_name, e)),
            };
            if let Err(e) = out.write_all(&buffer[..n]) {
                break Err(FrameError::StagingWriteFailed(e.to_string()));
            }
            copied += n as u64;
            chunks += 1;
            if chunks % CHUNKS_PER_FEED == 0 {
                self.watchdog.feed();
            }
        };

        let outcome = outcome.and_then(|()| {
            out.flush()
                .map_err(|e| FrameError::StagingWriteFailed(e.to_string()))
        });
        drop(out);

        match outcome {
            Ok(()) => Ok(copied),
            Err(e) => {
                error!("Copy of {} failed after {} bytes: {}", source_name, copied, e);
                remove_partial(arbiter, destination);
                Err(e)
            }
        }
    }
}

fn remove_partial(arbiter: &mut BusArbiter, destination: &str) {
    if let Err(e) = arbiter.staging().remove(destination) {
        warn!("Failed to remove partial copy {}: {}", destination, e);
    }
}

fn inspect<R: Read + Seek>(
    file: &mut R,
    name: &str,
    size: u64,
    expected_width: u32,
    expected_height: u32,
) -> Result<(ImageKind, u32, u32), FrameError> {
    if size == 0 {
        return Err(FrameError::FileEmpty);
    }
    if !(MIN_FILE_SIZE..=MAX_FILE_SIZE).contains(&size) {
        return Err(FrameError::FileSizeOutOfBounds {
            size,
            min: MIN_FILE_SIZE,
            max: MAX_FILE_SIZE,
        });
    }

    match ImageKind::from_name(name) {
        Some(ImageKind::BinaryRaster) => {
            if expected_width == 0 || expected_height == 0 {
                return Err(FrameError::DimensionsNotProvided);
            }
            let expected = expected_width as u64 * expected_height as u64;
            if size != expected {
                return Err(FrameError::FileTruncated {
                    expected,
                    actual: size,
                });
            }
            Ok((ImageKind::BinaryRaster, expected_width, expected_height))
        }
        Some(ImageKind::Bitmap) => {
            file.seek(SeekFrom::Start(0))
                .map_err(|e| FrameError::open_failed(name, e))?;
            let mut header = [0u8; BMP_HEADER_LEN];
            file.read_exact(&mut header)
                .map_err(|e| FrameError::HeaderInvalid(format!("unreadable bitmap header: {e}")))?;

            if &header[0..2] != b"BM" {
                return Err(FrameError::BitmapSignatureInvalid);
            }

            let data_offset = read_u32_le(&header, 10);
            let width = read_i32_le(&header, 18).unsigned_abs();
            let height = read_i32_le(&header, 22).unsigned_abs();

            if expected_width != 0
                && expected_height != 0
                && (width != expected_width || height != expected_height)
            {
                return Err(FrameError::DimensionsMismatch {
                    expected_width,
                    expected_height,
                    actual_width: width,
                    actual_height: height,
                });
            }

            if data_offset as u64 >= size {
                return Err(FrameError::FileCorrupted(format!(
                    "pixel data offset {data_offset} beyond file size {size}"
                )));
            }

            Ok((ImageKind::Bitmap, width, height))
        }
        None => Err(FrameError::HeaderInvalid(format!(
            "unsupported image type: {name}"
        ))),
    }
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_i32_le(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
