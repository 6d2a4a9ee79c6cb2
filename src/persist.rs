//! Small persisted values: reconnect counters and watch-list text.
//!
//! The engine only needs a handful of keyed numbers and strings to survive a
//! restart. [`KvStore`] is the seam; [`JsonFileStore`] keeps them in one JSON
//! file replaced atomically on every write, [`MemoryStore`] keeps them in
//! memory for tests and for running without a state file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from a persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Keyed storage for small counters and strings.
pub trait KvStore {
    fn get_u32(&self, key: &str) -> Option<u32>;
    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError>;
    fn get_str(&self, key: &str) -> Option<String>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Number(u32),
    Text(String),
}

/// In-memory store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get_u32(&self, key: &str) -> Option<u32> {
        match self.values.get(key)? {
            StoredValue::Number(n) => Some(*n),
            StoredValue::Text(_) => None,
        }
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), StoredValue::Number(value));
        Ok(())
    }

    fn get_str(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            StoredValue::Text(s) => Some(s.clone()),
            StoredValue::Number(_) => None,
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .insert(key.to_string(), StoredValue::Text(value.to_string()));
        Ok(())
    }
}

/// JSON file store. Every write replaces the file via a temp file + rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    /// Open a store, starting empty if the file does not exist.
    ///
    /// A file that exists but cannot be decoded is logged and ignored; the
    /// next write replaces it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable state file");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!(path = %path.display(), entries = values.len(), "State store opened");
        Ok(Self {
            path,
            inner: MemoryStore { values },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(&self.inner.values)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl KvStore for JsonFileStore {
    fn get_u32(&self, key: &str) -> Option<u32> {
        self.inner.get_u32(key)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.inner.set_u32(key, value)?;
        self.flush()
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.inner.get_str(key)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_str(key, value)?;
        self.flush()
    }
}
