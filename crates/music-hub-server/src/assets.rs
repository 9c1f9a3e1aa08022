//! Permanent asset directory and file reclamation.
//!
//! All deletions of asset files go through [`AssetFiles`], which serialises
//! work per source id and refuses to touch a file that a session still holds a
//! [`Lease`] on. The acquisition pipeline takes the same per-source lock while
//! it checks for an existing track, so an eviction and a dedup hit on the same
//! source can never interleave.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::asset_store::{AssetStore, Track};
use crate::error::EngineError;

/// Directory name the engine keeps its database under.
pub const STATE_DIR_NAME: &str = ".music-hub";

/// Reference counts of tracks held by session queues.
#[derive(Clone, Default)]
pub struct ActiveAssets {
    counts: Arc<Mutex<HashMap<i64, usize>>>,
}

impl ActiveAssets {
    /// Take a reference on `track_id`.
    pub fn lease(&self, track_id: i64) -> Lease {
        let mut counts = self.counts.lock().unwrap_or_else(|err| err.into_inner());
        *counts.entry(track_id).or_insert(0) += 1;
        Lease {
            assets: self.clone(),
            track_id,
            released: false,
        }
    }

    pub fn is_in_use(&self, track_id: i64) -> bool {
        let counts = self.counts.lock().unwrap_or_else(|err| err.into_inner());
        counts.get(&track_id).copied().unwrap_or(0) > 0
    }

    #[cfg(test)]
    pub fn in_use_count(&self) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|err| err.into_inner());
        counts.len()
    }

    /// Drop one reference; returns true when nothing references the track anymore.
    fn release_one(&self, track_id: i64) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(|err| err.into_inner());
        match counts.get_mut(&track_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(&track_id);
                true
            }
            None => true,
        }
    }
}

/// A queue entry's claim on a track's file.
pub struct Lease {
    assets: ActiveAssets,
    track_id: i64,
    released: bool,
}

impl Lease {
    /// Give the claim back; returns true if this was the last one.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.assets.release_one(self.track_id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.assets.release_one(self.track_id);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("track_id", &self.track_id).finish()
    }
}

/// Per-source async locks.
#[derive(Clone, Default)]
pub struct SourceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SourceLocks {
    pub async fn lock(&self, source_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|err| err.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(source_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// What happened to a file on reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaimed {
    Deleted { bytes: u64 },
    AlreadyGone,
    InUse,
}

/// The permanent asset directory.
pub struct AssetFiles {
    root: PathBuf,
    store: AssetStore,
    active: ActiveAssets,
    locks: SourceLocks,
}

impl AssetFiles {
    pub fn new(root: PathBuf, store: AssetStore) -> io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            store,
            active: ActiveAssets::default(),
            locks: SourceLocks::default(),
        })
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn active(&self) -> &ActiveAssets {
        &self.active
    }

    pub fn locks(&self) -> &SourceLocks {
        &self.locks
    }

    /// Final location for a source id's file.
    pub fn target_path(&self, source_id: &str, extension: Option<&str>) -> PathBuf {
        self.root
            .join(crate::source_id::asset_file_name(source_id, extension))
    }

    /// Move a resolver temp file into the asset directory; returns its size.
    pub async fn move_into_place(&self, from: &Path, to: &Path) -> Result<u64, EngineError> {
        if !self.is_under_root(to) {
            return Err(EngineError::StorageFailed(format!(
                "target {:?} is outside the asset directory",
                to
            )));
        }
        if tokio::fs::rename(from, to).await.is_err() {
            // Cross-device moves need a copy.
            tokio::fs::copy(from, to).await.map_err(|e| {
                EngineError::StorageFailed(format!("copy {:?} -> {:?}: {e}", from, to))
            })?;
            if let Err(err) = tokio::fs::remove_file(from).await {
                tracing::warn!(path = %from.display(), error = %err, "failed to remove temp file after copy");
            }
        }
        let meta = tokio::fs::metadata(to)
            .await
            .map_err(|e| EngineError::StorageFailed(format!("stat {:?}: {e}", to)))?;
        Ok(meta.len())
    }

    /// Best-effort removal of a resolver temp file.
    pub async fn discard_temp(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "discarded temp file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to discard temp file");
            }
        }
    }

    /// Delete a track's file unless a session still holds it. The row stays live.
    pub async fn reclaim(&self, track: &Track) -> Result<Reclaimed, EngineError> {
        let _guard = self.locks.lock(&track.source_id).await;
        if self.active.is_in_use(track.id) {
            return Ok(Reclaimed::InUse);
        }
        self.remove_file(&track.file_path).await
    }

    /// Delete a track's file and soft-delete its row, unless it is in use or
    /// has already been evicted.
    pub async fn evict(&self, track: &Track) -> Result<Reclaimed, EngineError> {
        let _guard = self.locks.lock(&track.source_id).await;
        if self.active.is_in_use(track.id) {
            return Ok(Reclaimed::InUse);
        }
        let current = self.store.find_by_id(track.id)?;
        let Some(current) = current.filter(|t| !t.is_deleted) else {
            return Ok(Reclaimed::AlreadyGone);
        };
        let outcome = self.remove_file(&current.file_path).await?;
        self.store.mark_deleted(current.id)?;
        Ok(outcome)
    }

    async fn remove_file(&self, path: &Path) -> Result<Reclaimed, EngineError> {
        if !self.is_under_root(path) {
            return Err(EngineError::StorageFailed(format!(
                "refusing to delete {:?} outside the asset directory",
                path
            )));
        }
        let bytes = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Reclaimed::AlreadyGone),
            Err(err) => {
                return Err(EngineError::StorageFailed(format!("stat {:?}: {err}", path)));
            }
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(Reclaimed::Deleted { bytes }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Reclaimed::AlreadyGone),
            Err(err) => Err(EngineError::StorageFailed(format!("remove {:?}: {err}", path))),
        }
    }

    fn is_under_root(&self, path: &Path) -> bool {
        path.is_absolute()
            && path.starts_with(&self.root)
            && !path.components().any(|c| matches!(c, Component::ParentDir))
    }

    /// Soft-delete live, unpinned rows whose file is gone. Tracks held by a
    /// session are skipped. Returns how many rows were marked deleted.
    pub async fn reconcile(&self) -> Result<usize, EngineError> {
        let mut marked = 0;
        for track in self.store.list_unpinned_live()? {
            let _guard = self.locks.lock(&track.source_id).await;
            if self.active.is_in_use(track.id) {
                continue;
            }
            let Some(current) = self.store.find_by_id(track.id)?.filter(|t| !t.is_deleted) else {
                continue;
            };
            let present = tokio::fs::try_exists(&current.file_path)
                .await
                .map_err(|e| EngineError::StorageFailed(format!("stat {:?}: {e}", current.file_path)))?;
            if present {
                continue;
            }
            self.store.mark_deleted(current.id)?;
            tracing::info!(track_id = current.id, source_id = %current.source_id, "marked missing track deleted");
            marked += 1;
        }
        Ok(marked)
    }

    /// Resolve a stream request path to the file of a live track.
    pub fn resolve_stream_path(&self, raw: &str) -> Result<Option<PathBuf>, EngineError> {
        let path = Path::new(raw);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let Ok(canonical) = path.canonicalize() else {
            return Ok(None);
        };
        if !canonical.starts_with(&self.root) || !canonical.is_file() {
            return Ok(None);
        }
        let track = self.store.find_live_by_file_path(&canonical)?;
        Ok(track.map(|_| canonical))
    }

    /// Total bytes of regular files under the asset directory, excluding the
    /// engine's own state directory.
    pub async fn disk_usage(&self) -> Result<u64, EngineError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || dir_size(&root))
            .await
            .map_err(|e| EngineError::StorageFailed(format!("disk usage task: {e}")))?
            .map_err(|e| EngineError::StorageFailed(format!("disk usage: {e}")))
    }
}

fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if entry.file_name() == STATE_DIR_NAME {
                continue;
            }
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
