// This is free and unencumbered software released into the public domain.

use crate::shared::{CaptureId, StorageError};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Persists captured stills. Only invoked from post-processing threads.
pub trait Storage: Send + Sync {
    fn persist(&self, id: CaptureId, jpeg: &[u8], file_name: Option<&str>) -> Result<PathBuf, StorageError>;
}

/// Writes stills into one directory, generating `IMG_0001.jpg`-style names
/// when the caller does not supply one.
#[derive(Clone, Debug)]
pub struct DirectoryStorage {
    dir: PathBuf,
    prefix: String,
    extension: String,
}

impl DirectoryStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: "IMG_".into(),
            extension: "jpg".into(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves the path a capture will be written to.
    ///
    /// Absolute names are used as given, relative ones land in the storage
    /// directory, and a missing extension gets the default one.
    pub fn resolve_path(&self, file_name: Option<&str>) -> PathBuf {
        match file_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => {
                let mut path = PathBuf::from(name);
                if path.is_relative() {
                    path = self.dir.join(path);
                }
                if path.extension().is_none() {
                    path.set_extension(&self.extension);
                }
                path
            },
            None => self.next_free_path(),
        }
    }

    fn next_free_path(&self) -> PathBuf {
        let mut n: u32 = 1;
        loop {
            let candidate = self
                .dir
                .join(format!("{}{:04}.{}", self.prefix, n, self.extension));
            if !candidate.exists() || n == u32::MAX {
                return candidate;
            }
            n += 1;
        }
    }
}

impl Storage for DirectoryStorage {
    fn persist(&self, id: CaptureId, jpeg: &[u8], file_name: Option<&str>) -> Result<PathBuf, StorageError> {
        let path = self.resolve_path(file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StorageError::Unavailable)?;
        }

        let mut file = fs::File::create(&path).map_err(StorageError::Unavailable)?;
        file.write_all(jpeg).map_err(StorageError::from_write)?;
        file.sync_all().map_err(StorageError::from_write)?;

        debug!(target: "asimov_camera_session", %id, path = %path.display(), bytes = jpeg.len(), "saved still");
        Ok(path)
    }
}
