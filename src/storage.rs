//! Primary (removable) storage holding the image library and the network
//! credentials file.
//!
//! Images are cycled by index over the root directory in name order. Hidden
//! entries and files with other extensions are not counted; an index past the
//! last image wraps to the first.

use crate::error::FrameError;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::PathBuf;

/// An image selected from primary storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String,
    pub path: PathBuf,
    /// Position among the matching files
    pub index: u32,
    /// Number of matching files found in the scan
    pub total: u32,
}

pub struct PrimaryStorage {
    root: PathBuf,
}

impl PrimaryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Select the image at `index`, wrapping to the first image when `index`
    /// is past the end.
    pub fn find_next_image(&self, index: u32, extension: &str) -> Result<ImageEntry, FrameError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| FrameError::open_failed(self.root.display(), e))?;

        let extension = extension.to_ascii_lowercase();
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| {
                !name.starts_with('.') && name.to_ascii_lowercase().ends_with(&extension)
            })
            .collect();
        names.sort();

        if names.is_empty() {
            warn!("No {} images in {}", extension, self.root.display());
            return Err(FrameError::FileNotFound(format!(
                "no {} files in {}",
                extension,
                self.root.display()
            )));
        }

        let total = names.len() as u32;
        let index = if index >= total {
            debug!("Image index {} past end ({}), wrapping", index, total);
            0
        } else {
            index
        };
        let name = names.swap_remove(index as usize);
        info!("Selected image {}/{}: {}", index + 1, total, name);

        Ok(ImageEntry {
            path: self.root.join(&name),
            name,
            index,
            total,
        })
    }

    pub fn open(&self, entry: &ImageEntry) -> Result<File, FrameError> {
        File::open(&entry.path).map_err(|e| FrameError::open_failed(entry.path.display(), e))
    }

    /// Open the two-line credentials file; absence is `CredentialsNotFound`.
    pub fn open_credentials(&self, name: &str) -> Result<BufReader<File>, FrameError> {
        let path = self.root.join(name);
        File::open(&path).map(BufReader::new).map_err(|e| {
            warn!("Credentials file {} unavailable: {}", path.display(), e);
            FrameError::CredentialsNotFound
        })
    }
}
