//! # Local Storage
//!
//! Durable state the engine reads at startup and writes after a sync.
//!
//! ```text
//! ┌────────────────────────────┐        ┌────────────────────────────────┐
//! │        ConfigStore         │        │          MediaStore            │
//! │                            │        │                                │
//! │  load() -> Option<Config>  │        │  list()   -> [LocalFile]       │
//! │  save(&Config)             │        │  write()  -> PathBuf           │
//! │                            │        │  remove()                      │
//! │  JsonFileStore             │        │  DirMediaStore                 │
//! │  MemoryConfigStore (tests) │        │  MemoryMediaStore (tests)      │
//! └────────────────────────────┘        └────────────────────────────────┘
//! ```
//!
//! Engine settings changed at runtime (the server URL) go through a
//! [`SettingsStore`] so they survive a restart.
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! power cut never leaves a half-written configuration or image behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use bee_core::media::check_filename;
use bee_core::{DeviceConfiguration, LocalFile, CONFIGURATION_FILE_NAME};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Traits
// =============================================================================

/// Persists the authoritative configuration.
pub trait ConfigStore: Send + Sync {
    /// Returns `None` when nothing has been saved yet.
    fn load(&self) -> SyncResult<Option<DeviceConfiguration>>;

    fn save(&self, config: &DeviceConfiguration) -> SyncResult<()>;
}

/// Persists engine settings edited at runtime.
pub trait SettingsStore: Send + Sync {
    fn save(&self, settings: &SyncConfig) -> SyncResult<()>;
}

/// Flat directory of media files.
pub trait MediaStore: Send + Sync {
    fn list(&self) -> SyncResult<Vec<LocalFile>>;

    /// Stores `bytes` under `filename` and returns the final path.
    fn write(&self, filename: &str, bytes: &[u8]) -> SyncResult<PathBuf>;

    /// Removes a file. Removing a missing file is not an error.
    fn remove(&self, filename: &str) -> SyncResult<()>;

    /// Where `filename` lives or would live.
    fn path_for(&self, filename: &str) -> PathBuf;
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> SyncError {
    SyncError::StorageFailed(format!("{}: {}", path.display(), err))
}

/// Writes `bytes` to a temporary sibling of `path`, then renames it over
/// `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(".tmp");
    let temp = path.with_file_name(temp_name);

    let result = (|| {
        let mut file = fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

// =============================================================================
// JSON File Store
// =============================================================================

/// Keeps the configuration as pretty-printed JSON on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store for `<dir>/configuration.json`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        JsonFileStore {
            path: dir.as_ref().join(CONFIGURATION_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> SyncResult<Option<DeviceConfiguration>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved configuration");
                return Ok(None);
            }
            Err(e) => return Err(storage_error(&self.path, e)),
        };

        DeviceConfiguration::from_json_str(&text)
            .map(Some)
            .map_err(|e| storage_error(&self.path, e))
    }

    fn save(&self, config: &DeviceConfiguration) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
        }
        let text = config.to_json_pretty()?;
        write_atomic(&self.path, text.as_bytes()).map_err(|e| storage_error(&self.path, e))?;
        debug!(path = %self.path.display(), version = %config.version, "Configuration saved");
        Ok(())
    }
}

// =============================================================================
// TOML Settings Store
// =============================================================================

/// Writes settings back to the TOML file they were loaded from. Without a
/// path the platform config directory is used.
#[derive(Debug, Clone, Default)]
pub struct TomlSettingsStore {
    path: Option<PathBuf>,
}

impl TomlSettingsStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        TomlSettingsStore { path }
    }
}

impl SettingsStore for TomlSettingsStore {
    fn save(&self, settings: &SyncConfig) -> SyncResult<()> {
        settings.save(self.path.clone())
    }
}

// =============================================================================
// Directory Media Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct DirMediaStore {
    dir: PathBuf,
}

impl DirMediaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirMediaStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MediaStore for DirMediaStore {
    fn list(&self) -> SyncResult<Vec<LocalFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error(&self.dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| storage_error(&self.dir, e))?;
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Leftovers from interrupted writes.
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            files.push(LocalFile::new(name, metadata.len()));
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn write(&self, filename: &str, bytes: &[u8]) -> SyncResult<PathBuf> {
        check_filename(filename)?;
        fs::create_dir_all(&self.dir).map_err(|e| storage_error(&self.dir, e))?;
        let path = self.dir.join(filename);
        write_atomic(&path, bytes).map_err(|e| storage_error(&path, e))?;
        Ok(path)
    }

    fn remove(&self, filename: &str) -> SyncResult<()> {
        check_filename(filename)?;
        let path = self.dir.join(filename);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&path, e)),
        }
    }

    fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }
}

// =============================================================================
// In-Memory Stores
// =============================================================================

/// Configuration store that lives in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    saved: Mutex<Option<DeviceConfiguration>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DeviceConfiguration) -> Self {
        MemoryConfigStore {
            saved: Mutex::new(Some(config)),
        }
    }

    /// Last saved configuration.
    pub fn saved(&self) -> Option<DeviceConfiguration> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> SyncResult<Option<DeviceConfiguration>> {
        Ok(self.saved())
    }

    fn save(&self, config: &DeviceConfiguration) -> SyncResult<()> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }
}

/// Settings store that keeps the last saved copy in memory.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    saved: Mutex<Option<SyncConfig>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Option<SyncConfig> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn save(&self, settings: &SyncConfig) -> SyncResult<()> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        Ok(())
    }
}

/// Media store that lives in memory under a virtual root.
#[derive(Debug)]
pub struct MemoryMediaStore {
    root: PathBuf,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Default for MemoryMediaStore {
    fn default() -> Self {
        MemoryMediaStore {
            root: PathBuf::from("/memory/media"),
            files: Mutex::new(BTreeMap::new()),
        }
    }
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a file of `size` bytes.
    pub fn insert(&self, filename: &str, size: usize) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filename.to_string(), vec![0u8; size]);
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(filename)
    }

    pub fn names(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl MediaStore for MemoryMediaStore {
    fn list(&self) -> SyncResult<Vec<LocalFile>> {
        Ok(self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, bytes)| LocalFile::new(name.clone(), bytes.len() as u64))
            .collect())
    }

    fn write(&self, filename: &str, bytes: &[u8]) -> SyncResult<PathBuf> {
        check_filename(filename)?;
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filename.to_string(), bytes.to_vec());
        Ok(self.path_for(filename))
    }

    fn remove(&self, filename: &str) -> SyncResult<()> {
        check_filename(filename)?;
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(filename);
        Ok(())
    }

    fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }
}
