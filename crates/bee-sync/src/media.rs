//! # Media Sync
//!
//! Reconciles the server's asset list against the local media directory.
//!
//! ## Reconciliation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  server list ──┐                                                        │
//! │                ├──► ReconciliationPlan                                  │
//! │  local files ──┘        │                                               │
//! │                         ├── delete  ──► remove file + model entry (now) │
//! │                         ├── keep    ──► adopt into model (no network)   │
//! │                         └── download ─► one task per file               │
//! │                                            │                            │
//! │                    Download { batch, filename, result } ◄──┘            │
//! │                                 │                                       │
//! │            stale batch? ── yes ──► ignore                               │
//! │                                 │ no                                    │
//! │               success ──► model.upsert   failure ──► failures += name   │
//! │                                 │                                       │
//! │                     pending empty? ── yes ──► finalize                  │
//! │                                                                         │
//! │  finalize: no failures ──► MediaSyncCompleted                           │
//! │            failures    ──► MediaSyncFailed("Some downloads failed: …")  │
//! │            either way  ──► startup check completes if still running     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Downloads are independent: one failing never cancels or retries its
//! siblings. Only files passing the validity gate (known image extension,
//! at least `min_file_size` bytes) are ever deleted or modelled.

use bee_core::media::{check_filename, is_valid_media};
use bee_core::{LocalFile, MediaAsset, MediaModel, ReconciliationPlan};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bulk::BulkTransport;
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::dispatcher::ResponseRoute;
use crate::engine::LoopEvent;
use crate::error::{SyncError, SyncResult};
use crate::startup::{StartupCoordinator, StartupState, SyncDomain};
use crate::status::{MediaStatus, SyncEvent};
use crate::storage::MediaStore;
use crate::timer::TimerId;

/// Outcome of one download: where the file landed and its size.
pub type DownloadResult = SyncResult<(PathBuf, u64)>;

pub struct MediaSync {
    store: Arc<dyn MediaStore>,
    transport: Arc<dyn BulkTransport>,
    min_size: u64,
    default_media: String,
    remote: bool,
    startup: StartupCoordinator,
    model: MediaModel,
    syncing: bool,
    last_error: Option<String>,
    batch: u64,
    pending: HashSet<String>,
    failures: Vec<String>,
    downloads: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl MediaSync {
    pub fn new(
        store: Arc<dyn MediaStore>,
        transport: Arc<dyn BulkTransport>,
        startup_timeout: Duration,
        events: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        MediaSync {
            store,
            transport,
            min_size: bee_core::media::MIN_MEDIA_FILE_SIZE,
            default_media: String::new(),
            remote: true,
            startup: StartupCoordinator::new(SyncDomain::Media, startup_timeout),
            model: MediaModel::new(),
            syncing: false,
            last_error: None,
            batch: 0,
            pending: HashSet::new(),
            failures: Vec::new(),
            downloads: Vec::new(),
            events,
        }
    }

    pub fn from_config(
        config: &SyncConfig,
        store: Arc<dyn MediaStore>,
        transport: Arc<dyn BulkTransport>,
        events: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        Self::new(store, transport, config.media_timeout(), events)
            .with_min_size(config.media.min_file_size)
            .with_default_media(config.media.default_media.clone())
            .with_remote(config.server.enabled)
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_default_media(mut self, default_media: impl Into<String>) -> Self {
        self.default_media = default_media.into();
        self
    }

    /// With remote sync off the files already on disk are the media set.
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Seeds the model from disk and begins the startup check.
    pub fn start(&mut self, ctx: &mut SyncContext) {
        if self.startup.state() != StartupState::NotStarted {
            return;
        }
        self.seed_from_disk();

        if !self.remote {
            self.startup.complete_locally(ctx);
            return;
        }
        self.startup.begin(ctx, json!({}));
        self.syncing = true;
    }

    /// Startup fetches through the coordinator; later connects re-fetch.
    pub fn on_connected(&mut self, ctx: &mut SyncContext) {
        if !self.remote {
            return;
        }
        if self.startup.on_connected(ctx, json!({})) {
            return;
        }
        if self.startup.is_complete() {
            debug!("Reconnected, fetching media list");
            ctx.call(
                SyncDomain::Media.fetch_method(),
                json!({}),
                ResponseRoute::Fetch(SyncDomain::Media),
            );
        }
    }

    pub fn on_fetch_result(&mut self, ctx: &mut SyncContext, outcome: SyncResult<Value>) {
        match outcome {
            Ok(payload) => self.on_list(ctx, &payload),
            Err(e) => self.complete_with_error(ctx, format!("Failed to fetch media list: {e}")),
        }
    }

    /// A media list from a fetch or a `media` publish.
    pub fn on_list(&mut self, ctx: &mut SyncContext, payload: &Value) {
        let Some(object) = payload.as_object().filter(|o| !o.is_empty()) else {
            warn!("Received empty media data");
            return;
        };

        info!("Received media list from backend");
        self.syncing = true;

        let mut server = Vec::new();
        for entry in object.get("files").and_then(Value::as_array).into_iter().flatten() {
            let Some(name) = entry.as_str() else {
                warn!(?entry, "Ignoring non-string media entry");
                continue;
            };
            match check_filename(name) {
                Ok(()) => server.push(name.to_string()),
                Err(e) => warn!(error = %e, "Ignoring unsafe media filename"),
            }
        }

        self.reconcile(ctx, &server);
    }

    pub fn on_startup_timeout(&mut self, ctx: &mut SyncContext, id: TimerId) {
        if self.startup.on_timeout(ctx, id) && self.pending.is_empty() {
            self.syncing = false;
        }
    }

    /// One finished download. Results from a superseded batch are dropped.
    pub fn on_download(&mut self, ctx: &mut SyncContext, batch: u64, filename: String, result: DownloadResult) {
        if batch != self.batch || !self.pending.remove(&filename) {
            debug!(%filename, batch, "Ignoring stale download result");
            return;
        }

        match result {
            Ok((path, size)) => {
                debug!(%filename, size, "Downloaded");
                self.model
                    .upsert(MediaAsset::new(filename, path, size, self.min_size));
            }
            Err(e) => {
                warn!(%filename, error = %e, "Download failed");
                self.failures.push(filename);
            }
        }

        if self.pending.is_empty() {
            self.downloads.clear();
            if self.failures.is_empty() {
                self.complete_with_success(ctx);
            } else {
                let failed = std::mem::take(&mut self.failures);
                let error = SyncError::DownloadsIncomplete { failed };
                self.complete_with_error(ctx, error.to_string());
            }
        }
    }

    /// Aborts outstanding downloads.
    pub fn shutdown(&mut self) {
        for task in self.downloads.drain(..) {
            task.abort();
        }
        self.pending.clear();
        self.failures.clear();
        self.batch += 1;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Absolute path of a valid local file, else the default media URI.
    pub fn media_path(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        if check_filename(name).is_ok() {
            if let Some(asset) = self.model.get(name).filter(|a| a.is_valid) {
                return asset.path.to_string_lossy().into_owned();
            }
            let on_disk = self
                .store
                .list()
                .ok()
                .and_then(|files| files.into_iter().find(|f| f.name == name));
            if let Some(file) = on_disk.filter(|f| is_valid_media(&f.name, f.size, self.min_size)) {
                return self.store.path_for(&file.name).to_string_lossy().into_owned();
            }
        }
        warn!(name, default = %self.default_media, "Requested media not found or invalid, using default");
        self.default_media.clone()
    }

    pub fn model(&self) -> &MediaModel {
        &self.model
    }

    pub fn assets(&self) -> Vec<MediaAsset> {
        self.model.to_vec()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn startup_check_in_progress(&self) -> bool {
        self.startup.is_in_progress()
    }

    pub fn pending_downloads(&self) -> usize {
        self.pending.len()
    }

    pub fn status(&self) -> MediaStatus {
        MediaStatus {
            syncing: self.syncing,
            last_error: self.last_error.clone(),
            startup_check_in_progress: self.startup.is_in_progress(),
            asset_count: self.model.len(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn local_files(&self) -> Vec<LocalFile> {
        match self.store.list() {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "Failed to list media directory");
                Vec::new()
            }
        }
    }

    fn seed_from_disk(&mut self) {
        for file in self.local_files() {
            if is_valid_media(&file.name, file.size, self.min_size) {
                let path = self.store.path_for(&file.name);
                self.model
                    .upsert(MediaAsset::new(file.name, path, file.size, self.min_size));
            }
        }
        if !self.model.is_empty() {
            info!(count = self.model.len(), "Loaded local media");
        }
    }

    fn reconcile(&mut self, ctx: &mut SyncContext, server: &[String]) {
        let local = self.local_files();
        let plan = ReconciliationPlan::compute(server, &local, self.min_size);
        info!(
            download = plan.download.len(),
            delete = plan.delete.len(),
            keep = plan.keep.len(),
            "Media reconciliation"
        );

        for name in &plan.delete {
            if let Err(e) = self.store.remove(name) {
                warn!(%name, error = %e, "Failed to delete media file");
            }
            self.model.remove(name);
        }

        for name in &plan.keep {
            if self.model.contains(name) {
                continue;
            }
            let size = local.iter().find(|f| &f.name == name).map_or(0, |f| f.size);
            let path = self.store.path_for(name);
            self.model
                .upsert(MediaAsset::new(name.clone(), path, size, self.min_size));
        }

        // A new list supersedes whatever the previous batch was doing.
        for task in self.downloads.drain(..) {
            task.abort();
        }
        self.batch += 1;
        self.pending.clear();
        self.failures.clear();

        if plan.download.is_empty() {
            self.complete_with_success(ctx);
            return;
        }

        for name in plan.download {
            self.pending.insert(name.clone());
            self.downloads.push(self.spawn_download(name));
        }
    }

    fn spawn_download(&self, filename: String) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let batch = self.batch;

        tokio::spawn(async move {
            let result = fetch_and_store(transport, store, &filename).await;
            let _ = events.send(LoopEvent::Download {
                batch,
                filename,
                result,
            });
        })
    }

    fn complete_with_success(&mut self, ctx: &mut SyncContext) {
        self.syncing = false;
        self.last_error = None;
        info!(assets = self.model.len(), "Media sync completed");
        ctx.emit(SyncEvent::MediaSyncCompleted);
        self.startup.finish(ctx);
    }

    fn complete_with_error(&mut self, ctx: &mut SyncContext, message: String) {
        self.syncing = false;
        warn!(error = %message, "Media sync failed");
        self.last_error = Some(message.clone());
        ctx.emit(SyncEvent::MediaSyncFailed(message));
        self.startup.finish(ctx);
    }
}

/// Downloads `media/<filename>` and writes it through the store.
async fn fetch_and_store(
    transport: Arc<dyn BulkTransport>,
    store: Arc<dyn MediaStore>,
    filename: &str,
) -> DownloadResult {
    let bytes = transport.download(&format!("media/{filename}")).await?;
    let size = bytes.len() as u64;

    let name = filename.to_string();
    let path = tokio::task::spawn_blocking(move || store.write(&name, &bytes))
        .await
        .map_err(|e| SyncError::Internal(format!("media write task failed: {e}")))??;
    Ok((path, size))
}
