//! Persisted user choices: endpoint override, active endpoint and custom
//! addresses. The core reads and writes them only through [`PreferenceStore`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("preference file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("preference file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub endpoint_override: Option<String>,
    pub active_endpoint: Option<String>,
    pub custom_addresses: Vec<String>,
}

pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> Result<Preferences, PreferenceError>;
    fn save(&self, prefs: &Preferences) -> Result<(), PreferenceError>;
}

/// JSON file, replaced atomically on every save.
pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn load(&self) -> Result<Preferences, PreferenceError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Preferences::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, prefs: &Preferences) -> Result<(), PreferenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(prefs)?;

        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(&json)?;
        f.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPreferenceStore {
    inner: Mutex<Preferences>,
}

impl MemoryPreferenceStore {
    pub fn new(initial: Preferences) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<Preferences, PreferenceError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, prefs: &Preferences) -> Result<(), PreferenceError> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = prefs.clone();
        Ok(())
    }
}
