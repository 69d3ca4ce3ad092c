//! # Media Assets
//!
//! The media model and the diff that keeps it in line with the server.
//!
//! ## Reconciliation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Server list vs local listing                        │
//! │                                                                         │
//! │   server: [a.gif, b.png, c.jpg]     local: [b.png, c.jpg, d.txt]        │
//! │                                                                         │
//! │   download = server − local   ──►  [a.gif]                              │
//! │   keep     = server ∩ local   ──►  [b.png, c.jpg]                       │
//! │   delete   = local − server   ──►  [] (d.txt fails the validity gate)   │
//! │                                                                         │
//! │   VALIDITY GATE                                                         │
//! │   ─────────────                                                         │
//! │   extension ∈ {gif, png, jpg, jpeg}  AND  size ≥ min_size (50 bytes)    │
//! │   Files failing the gate are never deleted and never modelled.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Files smaller than this are treated as truncated or placeholder files.
pub const MIN_MEDIA_FILE_SIZE: u64 = 50;

/// Extensions the device can display.
pub const MEDIA_EXTENSIONS: [&str; 4] = ["gif", "png", "jpg", "jpeg"];

// =============================================================================
// Validity Rules
// =============================================================================

/// Lower-cased extension of a filename, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Mime type for a media filename, `None` for unsupported extensions.
pub fn mime_for(filename: &str) -> Option<&'static str> {
    match extension_of(filename)?.as_str() {
        "gif" => Some("image/gif"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        _ => None,
    }
}

/// The validity gate: supported extension and at least `min_size` bytes.
pub fn is_valid_media(filename: &str, size: u64, min_size: u64) -> bool {
    mime_for(filename).is_some() && size >= min_size
}

/// Checks that a server-supplied name stays inside the media directory.
pub fn check_filename(filename: &str) -> CoreResult<()> {
    let unsafe_name = filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
        || filename.contains('\0');

    if unsafe_name {
        Err(CoreError::UnsafeFilename(filename.to_string()))
    } else {
        Ok(())
    }
}

// =============================================================================
// Media Asset
// =============================================================================

/// One media file known to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    /// Identifier; the filename doubles as id.
    pub id: String,
    pub filename: String,
    /// Absolute path on disk.
    pub path: PathBuf,
    /// `"unknown"` for unsupported extensions.
    pub mime_type: String,
    pub size: u64,
    pub is_valid: bool,
}

impl MediaAsset {
    /// Builds an asset for a file stored at `path`.
    pub fn new(filename: impl Into<String>, path: impl Into<PathBuf>, size: u64, min_size: u64) -> Self {
        let filename = filename.into();
        MediaAsset {
            id: filename.clone(),
            mime_type: mime_for(&filename).unwrap_or("unknown").to_string(),
            is_valid: is_valid_media(&filename, size, min_size),
            path: path.into(),
            size,
            filename,
        }
    }
}

// =============================================================================
// Media Model
// =============================================================================

/// Ordered collection of assets, unique by filename.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaModel {
    assets: Vec<MediaAsset>,
}

impl MediaModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the asset with the same filename. Returns true
    /// when the filename was not modelled before.
    pub fn upsert(&mut self, asset: MediaAsset) -> bool {
        match self.index_of(&asset.filename) {
            Some(index) => {
                self.assets[index] = asset;
                false
            }
            None => {
                self.assets.push(asset);
                true
            }
        }
    }

    pub fn remove(&mut self, filename: &str) -> Option<MediaAsset> {
        let index = self.index_of(filename)?;
        Some(self.assets.remove(index))
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.index_of(filename).is_some()
    }

    pub fn get(&self, filename: &str) -> Option<&MediaAsset> {
        self.assets.iter().find(|asset| asset.filename == filename)
    }

    pub fn path_of(&self, filename: &str) -> Option<&Path> {
        self.get(filename).map(|asset| asset.path.as_path())
    }

    pub fn index_of(&self, filename: &str) -> Option<usize> {
        self.assets.iter().position(|asset| asset.filename == filename)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaAsset> {
        self.assets.iter()
    }

    pub fn filenames(&self) -> Vec<String> {
        self.assets.iter().map(|asset| asset.filename.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.assets.clear();
    }

    /// Snapshot of the current assets.
    pub fn to_vec(&self) -> Vec<MediaAsset> {
        self.assets.clone()
    }
}

// =============================================================================
// Reconciliation Plan
// =============================================================================

/// A file present in the local media directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub size: u64,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        LocalFile {
            name: name.into(),
            size,
        }
    }
}

/// The outcome of diffing a server list against the local listing.
///
/// All three lists keep the order of their source list and hold no
/// duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// On the server, not on disk.
    pub download: Vec<String>,
    /// On disk, not on the server, and passing the validity gate.
    pub delete: Vec<String>,
    /// On the server and already on disk.
    pub keep: Vec<String>,
}

impl ReconciliationPlan {
    pub fn compute(server: &[String], local: &[LocalFile], min_size: u64) -> Self {
        let local_names: HashSet<&str> = local.iter().map(|file| file.name.as_str()).collect();
        let server_names: HashSet<&str> = server.iter().map(String::as_str).collect();

        let mut plan = ReconciliationPlan::default();
        let mut seen = HashSet::new();

        for name in server {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if local_names.contains(name.as_str()) {
                plan.keep.push(name.clone());
            } else {
                plan.download.push(name.clone());
            }
        }

        for file in local {
            if !server_names.contains(file.name.as_str())
                && is_valid_media(&file.name, file.size, min_size)
                && !plan.delete.contains(&file.name)
            {
                plan.delete.push(file.name.clone());
            }
        }

        plan
    }

    pub fn is_noop(&self) -> bool {
        self.download.is_empty() && self.delete.is_empty()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for("a.gif"), Some("image/gif"));
        assert_eq!(mime_for("a.PNG"), Some("image/png"));
        assert_eq!(mime_for("a.jpg"), Some("image/jpeg"));
        assert_eq!(mime_for("a.jpeg"), Some("image/jpeg"));
        assert_eq!(mime_for("a.txt"), None);
        assert_eq!(mime_for("noext"), None);
    }

    #[test]
    fn test_validity_gate() {
        assert!(is_valid_media("a.gif", 50, MIN_MEDIA_FILE_SIZE));
        assert!(!is_valid_media("a.gif", 49, MIN_MEDIA_FILE_SIZE));
        assert!(!is_valid_media("a.txt", 5000, MIN_MEDIA_FILE_SIZE));
    }

    #[test]
    fn test_check_filename() {
        assert!(check_filename("logo.png").is_ok());
        assert!(check_filename("my..file.png").is_err());
        assert!(check_filename("../etc/passwd").is_err());
        assert!(check_filename("sub/dir.png").is_err());
        assert!(check_filename("sub\\dir.png").is_err());
        assert!(check_filename("").is_err());
    }

    #[test]
    fn test_media_asset_new() {
        let asset = MediaAsset::new("a.jpeg", "/media/a.jpeg", 2000, MIN_MEDIA_FILE_SIZE);
        assert_eq!(asset.id, "a.jpeg");
        assert_eq!(asset.mime_type, "image/jpeg");
        assert!(asset.is_valid);

        let tiny = MediaAsset::new("b.bin", "/media/b.bin", 10, MIN_MEDIA_FILE_SIZE);
        assert_eq!(tiny.mime_type, "unknown");
        assert!(!tiny.is_valid);
    }

    #[test]
    fn test_model_upsert_and_remove() {
        let mut model = MediaModel::new();
        assert!(model.upsert(MediaAsset::new("a.gif", "/m/a.gif", 100, 50)));
        assert!(model.upsert(MediaAsset::new("b.gif", "/m/b.gif", 100, 50)));
        assert!(!model.upsert(MediaAsset::new("a.gif", "/m/a.gif", 300, 50)));

        assert_eq!(model.len(), 2);
        assert_eq!(model.get("a.gif").map(|a| a.size), Some(300));
        assert_eq!(model.index_of("b.gif"), Some(1));
        assert_eq!(model.path_of("b.gif"), Some(Path::new("/m/b.gif")));

        assert!(model.remove("a.gif").is_some());
        assert!(model.remove("a.gif").is_none());
        assert_eq!(model.filenames(), names(&["b.gif"]));

        model.clear();
        assert!(model.is_empty());
    }

    #[test]
    fn test_reconciliation_example() {
        let server = names(&["a.gif", "b.png", "c.jpg"]);
        let local = vec![
            LocalFile::new("b.png", 2000),
            LocalFile::new("c.jpg", 2000),
            LocalFile::new("d.txt", 10),
        ];

        let plan = ReconciliationPlan::compute(&server, &local, MIN_MEDIA_FILE_SIZE);

        assert_eq!(plan.download, names(&["a.gif"]));
        assert!(plan.delete.is_empty());
        assert_eq!(plan.keep, names(&["b.png", "c.jpg"]));
    }

    #[test]
    fn test_reconciliation_deletes_only_valid_media() {
        let server = names(&["a.gif"]);
        let local = vec![
            LocalFile::new("a.gif", 2000),
            LocalFile::new("old.png", 2000),
            LocalFile::new("tiny.png", 10),
            LocalFile::new("notes.txt", 2000),
        ];

        let plan = ReconciliationPlan::compute(&server, &local, MIN_MEDIA_FILE_SIZE);

        assert!(plan.download.is_empty());
        assert_eq!(plan.delete, names(&["old.png"]));
        assert_eq!(plan.keep, names(&["a.gif"]));
    }

    #[test]
    fn test_reconciliation_dedupes_server_list() {
        let server = names(&["a.gif", "a.gif", "b.gif"]);
        let plan = ReconciliationPlan::compute(&server, &[], MIN_MEDIA_FILE_SIZE);
        assert_eq!(plan.download, names(&["a.gif", "b.gif"]));
    }

    #[test]
    fn test_empty_server_list_deletes_everything_valid() {
        let local = vec![LocalFile::new("a.gif", 100), LocalFile::new("b.gif", 100)];
        let plan = ReconciliationPlan::compute(&[], &local, MIN_MEDIA_FILE_SIZE);
        assert_eq!(plan.delete, names(&["a.gif", "b.gif"]));
        assert!(!plan.is_noop());
    }
}
