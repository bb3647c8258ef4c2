//! Opaque key/value preferences storage.
//!
//! The approval engine keeps its rule list and enabled flag under a single
//! key. The store only moves JSON values in and out.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::relock;

#[derive(Error, Debug)]
pub enum PreferencesError {
    #[error("preferences I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed preferences: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Get/set of JSON values by key.
pub trait PreferencesStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Value>, PreferencesError>;
    fn set(&self, key: &str, value: Value) -> Result<(), PreferencesError>;
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferencesStore for MemoryPreferences {
    fn get(&self, key: &str) -> Result<Option<Value>, PreferencesError> {
        Ok(relock(self.values.lock()).get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), PreferencesError> {
        relock(self.values.lock()).insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON object file with keys at the top level.
///
/// Writes go to a sibling temp file that is then renamed over the original,
/// so a crash never leaves a half-written file.
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> PreferencesError {
        PreferencesError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_all(&self) -> Result<Map<String, Value>, PreferencesError> {
        match fs::read_to_string(&self.path) {
            Ok(txt) if txt.trim().is_empty() => Ok(Map::new()),
            Ok(txt) => Ok(serde_json::from_str(&txt)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn write_all(&self, values: &Map<String, Value>) -> Result<(), PreferencesError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let body = serde_json::to_vec_pretty(values)?;
        let mut file = fs::File::create(&tmp).map_err(|e| self.io_err(e))?;
        file.write_all(&body).map_err(|e| self.io_err(e))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }
}

impl PreferencesStore for JsonFilePreferences {
    fn get(&self, key: &str) -> Result<Option<Value>, PreferencesError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), PreferencesError> {
        let _guard = relock(self.write_lock.lock());
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value);
        self.write_all(&values)
    }
}
