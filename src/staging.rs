//! Staging filesystem.
//!
//! A small secondary volume that holds the validated image while the primary
//! storage device is powered down and the display owns the bus. On the device
//! this is on-board flash; on a host it is a directory.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

/// Operations the bus arbiter and file stager need from the staging volume.
pub trait StagingFs {
    /// Mount an existing volume; fails if it is absent or unreadable.
    fn mount(&mut self) -> io::Result<()>;
    /// Wipe and recreate the volume, leaving it mounted.
    fn format(&mut self) -> io::Result<()>;
    /// Entry names in the volume root, in enumeration order.
    fn list(&self) -> io::Result<Vec<String>>;
    fn remove(&mut self, name: &str) -> io::Result<()>;
    /// Create (or truncate) an entry for writing.
    fn create(&mut self, name: &str) -> io::Result<Box<dyn Write>>;
    /// Size of an entry in bytes.
    fn size_of(&self, name: &str) -> io::Result<u64>;
    /// Location the renderer reads a staged entry from.
    fn path_of(&self, name: &str) -> PathBuf;
}

/// Directory-backed staging volume.
pub struct DirStagingFs {
    root: PathBuf,
}

impl DirStagingFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StagingFs for DirStagingFs {
    fn mount(&mut self) -> io::Result<()> {
        let meta = fs::metadata(&self.root)?;
        if !meta.is_dir() {
            return Err(io::Error::other("staging root is not a directory"));
        }
        // A volume we cannot enumerate counts as unmounted
        fs::read_dir(&self.root)?;
        Ok(())
    }

    fn format(&mut self) -> io::Result<()> {
        if self.root.exists() {
            if self.root.is_dir() {
                fs::remove_dir_all(&self.root)?;
            } else {
                fs::remove_file(&self.root)?;
            }
        }
        fs::create_dir_all(&self.root)
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn remove(&mut self, name: &str) -> io::Result<()> {
        fs::remove_file(self.root.join(name))
    }

    fn create(&mut self, name: &str) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(File::create(self.root.join(name))?))
    }

    fn size_of(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.root.join(name))?.len())
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}
