//! Append-only JSON array logs.
//!
//! `orders.json` and `states.json` are single JSON arrays that grow by one
//! element per record. Each append rewrites the file through a temporary
//! file in the same directory followed by a rename, so a reader (or a crash)
//! never observes a half-written array.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::StorageError;

/// File name of the per-episode order log.
pub const ORDERS_FILE: &str = "orders.json";

/// File name of the per-episode telemetry log.
pub const STATES_FILE: &str = "states.json";

/// An append-only JSON array stored at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonArrayLog {
    path: PathBuf,
}

impl JsonArrayLog {
    /// Creates a log handle; the file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the order log inside `dir`.
    pub fn orders_in(dir: &Path) -> Self {
        Self::new(dir.join(ORDERS_FILE))
    }

    /// Returns the telemetry log inside `dir`.
    pub fn states_in(dir: &Path) -> Self {
        Self::new(dir.join(STATES_FILE))
    }

    /// Returns the log's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record to the array.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the existing file is not a JSON array or the
    /// updated array cannot be written.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<usize, StorageError> {
        let mut entries = self.read_values()?;
        entries.push(serde_json::to_value(record)?);
        self.write_values(&entries)?;
        Ok(entries.len())
    }

    /// Reads every record in the log. A missing file is an empty log.
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, StorageError> {
        self.read_values()?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StorageError::from))
            .collect()
    }

    /// Returns the number of records currently in the log.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.read_values()?.len())
    }

    /// Returns true when the log has no records.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    fn read_values(&self) -> Result<Vec<Value>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&contents)? {
            Value::Array(entries) => Ok(entries),
            _ => Err(StorageError::NotAnArray {
                path: self.path.display().to_string(),
            }),
        }
    }

    fn write_values(&self, entries: &[Value]) -> Result<(), StorageError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, entries)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StorageError::PersistFailed {
                path: self.path.display().to_string(),
                reason: e.error.to_string(),
            })?;
        Ok(())
    }
}
