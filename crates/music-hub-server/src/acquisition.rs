//! Acquisition pipeline: query -> resolved, stored, registered track.
//!
//! Resolver invocations are bounded by a semaphore shared by every session.
//! Dedup, move and registration for one source id run under that source's
//! lock, so concurrent requests for the same source converge on one track and
//! one file.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::asset_store::{NewTrack, StoreError, Track};
use crate::assets::{AssetFiles, Lease};
use crate::error::EngineError;
use crate::resolver::{Resolution, Resolver};
use crate::source_id::{extract_source_id, unique_source_id};

/// A registered track plus the caller's claim on its file.
#[derive(Debug)]
pub struct AcquiredTrack {
    pub track: Track,
    pub lease: Lease,
}

pub struct AcquisitionPipeline {
    resolver: Arc<dyn Resolver>,
    files: Arc<AssetFiles>,
    permits: Arc<Semaphore>,
}

impl AcquisitionPipeline {
    pub fn new(resolver: Arc<dyn Resolver>, files: Arc<AssetFiles>, max_concurrent: usize) -> Self {
        Self {
            resolver,
            files,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn files(&self) -> &Arc<AssetFiles> {
        &self.files
    }

    /// Resolve `query`, store its file and return the (possibly existing) track.
    pub async fn acquire(&self, query: &str, requested_by: &str) -> Result<AcquiredTrack, EngineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(EngineError::ResolutionFailed("empty query".to_string()));
        }

        let resolution = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| EngineError::ResolutionFailed("acquisition pool closed".to_string()))?;
            self.resolver.resolve(query).await?
        };
        let temp = resolution.local_file_path.clone();

        // Resolvers may share one temp path per source; a racing acquire that
        // already moved it leaves nothing behind, so the temp file is only
        // required once dedup has missed.
        let (source_id, dedup) = match extract_source_id(&resolution.source_url) {
            Some(id) => (id, true),
            None => (unique_source_id(), false),
        };
        let _guard = self.files.locks().lock(&source_id).await;

        if dedup {
            let existing = match self.files.store().find_by_source_id(&source_id) {
                Ok(existing) => existing,
                Err(err) => {
                    self.files.discard_temp(&temp).await;
                    return Err(err.into());
                }
            };
            if let Some(existing) = existing {
                return self.reuse(existing, &temp).await;
            }
        }

        require_temp(&temp).await?;
        let target = self.files.target_path(&source_id, extension_of(&temp));
        let size = match self.files.move_into_place(&temp, &target).await {
            Ok(size) => size,
            Err(err) => {
                self.files.discard_temp(&temp).await;
                return Err(err);
            }
        };

        let new_track = new_track(&resolution, source_id.clone(), &target, size, requested_by);
        match self.files.store().create(&new_track) {
            Ok(track) => {
                tracing::info!(
                    track_id = track.id,
                    source_id = %track.source_id,
                    title = %track.title,
                    size_bytes = size,
                    "track acquired"
                );
                let lease = self.files.active().lease(track.id);
                Ok(AcquiredTrack { track, lease })
            }
            Err(StoreError::DuplicateSourceId(_)) => {
                // Registered by another process between lookup and insert.
                let existing = self.files.store().find_by_source_id(&source_id)?;
                let Some(existing) = existing else {
                    self.files.discard_temp(&target).await;
                    return Err(EngineError::DuplicateSourceId(source_id));
                };
                if existing.file_path != target {
                    self.files.discard_temp(&target).await;
                }
                let lease = self.files.active().lease(existing.id);
                Ok(AcquiredTrack { track: existing, lease })
            }
            Err(err) => {
                tracing::warn!(source_id = %source_id, error = %err, "track registration failed; removing file");
                self.files.discard_temp(&target).await;
                Err(err.into())
            }
        }
    }

    /// Dedup hit: drop the fresh download, or use it to restore a reclaimed file.
    async fn reuse(&self, existing: Track, temp: &Path) -> Result<AcquiredTrack, EngineError> {
        if tokio::fs::try_exists(&existing.file_path).await.unwrap_or(false) {
            self.files.discard_temp(temp).await;
            tracing::info!(
                track_id = existing.id,
                source_id = %existing.source_id,
                "reusing existing track"
            );
            let lease = self.files.active().lease(existing.id);
            return Ok(AcquiredTrack { track: existing, lease });
        }

        require_temp(temp).await?;
        let target = self.files.target_path(&existing.source_id, extension_of(temp));
        let size = match self.files.move_into_place(temp, &target).await {
            Ok(size) => size,
            Err(err) => {
                self.files.discard_temp(temp).await;
                return Err(err);
            }
        };
        let track = match self.files.store().restore_file(existing.id, &target, size) {
            Ok(track) => track,
            Err(err) => {
                self.files.discard_temp(&target).await;
                return Err(err.into());
            }
        };
        tracing::info!(
            track_id = track.id,
            source_id = %track.source_id,
            "restored file for existing track"
        );
        let lease = self.files.active().lease(track.id);
        Ok(AcquiredTrack { track, lease })
    }
}

async fn require_temp(temp: &Path) -> Result<(), EngineError> {
    if tokio::fs::try_exists(temp).await.unwrap_or(false) {
        return Ok(());
    }
    Err(EngineError::ResolutionFailed(format!(
        "resolver reported {:?} but the file does not exist",
        temp
    )))
}

fn extension_of(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn new_track(
    resolution: &Resolution,
    source_id: String,
    file_path: &Path,
    size: u64,
    requested_by: &str,
) -> NewTrack {
    let requested_by = requested_by.trim();
    NewTrack {
        source_id,
        title: resolution.title.clone(),
        author: resolution.author.clone(),
        duration_seconds: resolution.duration_seconds,
        thumbnail_url: resolution.thumbnail_url.clone(),
        source_url: resolution.source_url.clone(),
        file_path: file_path.to_path_buf(),
        file_size_bytes: size,
        added_by: (!requested_by.is_empty()).then(|| requested_by.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::asset_store::AssetStore;

    /// Resolver that "downloads" by writing a small temp file.
    pub(crate) struct FakeResolver {
        downloads: PathBuf,
        urls: HashMap<String, String>,
        counter: AtomicUsize,
        in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        delay: Duration,
        shared_files: bool,
        pub(crate) queries: Mutex<Vec<String>>,
    }

    impl FakeResolver {
        pub(crate) fn new(downloads: PathBuf) -> Self {
            std::fs::create_dir_all(&downloads).expect("downloads dir");
            Self {
                downloads,
                urls: HashMap::new(),
                counter: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::ZERO,
                shared_files: false,
                queries: Mutex::new(Vec::new()),
            }
        }

        /// Map a query to the source URL it resolves to.
        pub(crate) fn with_url(mut self, query: &str, url: &str) -> Self {
            self.urls.insert(query.to_string(), url.to_string());
            self
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Download every query to `<query>.mp3`, like a resolver that names
        /// temp files by video id.
        pub(crate) fn with_shared_files(mut self) -> Self {
            self.shared_files = true;
            self
        }
    }

    #[async_trait]
    impl Resolver for FakeResolver {
        async fn resolve(&self, query: &str) -> Result<Resolution, EngineError> {
            self.queries
                .lock()
                .expect("queries")
                .push(query.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if query.starts_with("missing") {
                return Err(EngineError::ResolutionFailed("No results found".to_string()));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let file = if self.shared_files {
                self.downloads.join(format!("{query}.mp3"))
            } else {
                self.downloads.join(format!("dl-{n}.mp3"))
            };
            std::fs::write(&file, query.as_bytes()).expect("write download");
            let source_url = self
                .urls
                .get(query)
                .cloned()
                .or_else(|| query.starts_with("http").then(|| query.to_string()))
                .unwrap_or_else(|| format!("https://example.com/{n}"));
            Ok(Resolution {
                title: format!("{query} (title)"),
                author: "Band".to_string(),
                duration_seconds: 200,
                thumbnail_url: None,
                source_url,
                local_file_path: file,
            })
        }
    }

    pub(crate) fn asset_files(root: &Path) -> Arc<AssetFiles> {
        let store = AssetStore::open(&root.join("db").join("assets.sqlite")).expect("store");
        Arc::new(AssetFiles::new(root.join("assets"), store).expect("files"))
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = std::fs::read_dir(dir)
            .expect("read dir")
            .map(|e| e.expect("entry").path())
            .filter(|p| p.is_file())
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn same_source_from_different_queries_dedups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = FakeResolver::new(dir.path().join("downloads"))
            .with_url("rick astley", "https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .with_url("never gonna", "https://youtu.be/dQw4w9WgXcQ");
        let files = asset_files(dir.path());
        let pipeline = AcquisitionPipeline::new(Arc::new(resolver), files.clone(), 2);

        let first = pipeline.acquire("rick astley", "alice").await.expect("first");
        let second = pipeline.acquire("never gonna", "bob").await.expect("second");

        assert_eq!(first.track.id, second.track.id);
        assert_eq!(first.track.source_id, "youtube:dQw4w9WgXcQ");
        assert_eq!(files_in(files.root()).len(), 1);
        assert!(files_in(&dir.path().join("downloads")).is_empty());
        assert_eq!(first.track.added_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn resolver_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = asset_files(dir.path());
        let resolver = FakeResolver::new(dir.path().join("downloads"));
        let pipeline = AcquisitionPipeline::new(Arc::new(resolver), files.clone(), 2);

        let err = pipeline.acquire("missing song", "alice").await.expect_err("fail");
        assert_eq!(err, EngineError::ResolutionFailed("No results found".to_string()));
        let counts = files.store().track_counts().expect("counts");
        assert_eq!(counts.active, 0);
        assert!(files_in(files.root()).is_empty());
    }

    #[tokio::test]
    async fn unrecognised_sources_are_unique_per_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = asset_files(dir.path());
        let resolver = FakeResolver::new(dir.path().join("downloads"))
            .with_url("radio", "https://example.com/stream.mp3");
        let pipeline = AcquisitionPipeline::new(Arc::new(resolver), files.clone(), 2);

        let a = pipeline.acquire("radio", "alice").await.expect("a");
        let b = pipeline.acquire("radio", "alice").await.expect("b");
        assert_ne!(a.track.id, b.track.id);
        assert!(a.track.source_id.starts_with("local:"));
        assert_eq!(files_in(files.root()).len(), 2);
    }

    #[tokio::test]
    async fn reclaimed_file_is_restored_on_reacquire() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = asset_files(dir.path());
        let resolver = FakeResolver::new(dir.path().join("downloads"))
            .with_url("song", "https://youtu.be/abc123");
        let pipeline = AcquisitionPipeline::new(Arc::new(resolver), files.clone(), 2);

        let first = pipeline.acquire("song", "alice").await.expect("first");
        let track = first.track.clone();
        assert!(first.lease.release());
        files.reclaim(&track).await.expect("reclaim");
        assert!(!track.file_path.exists());

        let again = pipeline.acquire("song", "alice").await.expect("again");
        assert_eq!(again.track.id, track.id);
        assert!(again.track.file_path.exists());
        assert_eq!(files_in(files.root()).len(), 1);
    }

    #[tokio::test]
    async fn concurrent_acquisitions_are_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = asset_files(dir.path());
        let resolver = Arc::new(
            FakeResolver::new(dir.path().join("downloads")).with_delay(Duration::from_millis(30)),
        );
        let pipeline = AcquisitionPipeline::new(resolver.clone(), files, 2);

        let queries: Vec<String> = (0..6).map(|i| format!("song {i}")).collect();
        let results =
            futures_util::future::join_all(queries.iter().map(|q| pipeline.acquire(q, "alice"))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(resolver.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn concurrent_same_source_converges_on_one_track() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = asset_files(dir.path());
        let resolver = FakeResolver::new(dir.path().join("downloads"))
            .with_url("a", "https://youtu.be/same")
            .with_url("b", "https://www.youtube.com/watch?v=same");
        let pipeline = AcquisitionPipeline::new(Arc::new(resolver), files.clone(), 4);

        let (a, b) = tokio::join!(pipeline.acquire("a", "x"), pipeline.acquire("b", "y"));
        let (a, b) = (a.expect("a"), b.expect("b"));
        assert_eq!(a.track.id, b.track.id);
        assert_eq!(files.store().track_counts().expect("counts").active, 1);
        assert_eq!(files_in(files.root()).len(), 1);
    }

    #[tokio::test]
    async fn shared_temp_path_does_not_fail_the_dedup_loser() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = asset_files(dir.path());
        let resolver = FakeResolver::new(dir.path().join("downloads"))
            .with_url("same", "https://youtu.be/same")
            .with_shared_files()
            .with_delay(Duration::from_millis(10));
        let pipeline = AcquisitionPipeline::new(Arc::new(resolver), files.clone(), 4);

        let (a, b) = tokio::join!(pipeline.acquire("same", "x"), pipeline.acquire("same", "y"));
        let (a, b) = (a.expect("a"), b.expect("b"));
        assert_eq!(a.track.id, b.track.id);
        assert_eq!(files.store().track_counts().expect("counts").active, 1);
        assert_eq!(files_in(files.root()).len(), 1);
        assert!(files_in(&dir.path().join("downloads")).is_empty());
    }

    #[tokio::test]
    async fn dedup_hit_accepts_a_temp_file_already_gone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = asset_files(dir.path());
        let resolver = FakeResolver::new(dir.path().join("downloads"))
            .with_url("song", "https://youtu.be/abc123");
        let pipeline = AcquisitionPipeline::new(Arc::new(resolver), files.clone(), 2);
        let first = pipeline.acquire("song", "alice").await.expect("first");
        let track = first.track.clone();

        let gone = dir.path().join("downloads").join("never-written.mp3");
        let reused = pipeline
            .reuse(track.clone(), &gone)
            .await
            .expect("reuse with missing temp");
        assert_eq!(reused.track.id, track.id);

        assert!(!first.lease.release());
        assert!(reused.lease.release());
        files.reclaim(&track).await.expect("reclaim");
        let err = pipeline
            .reuse(track.clone(), &gone)
            .await
            .expect_err("restore needs a temp file");
        assert!(matches!(err, EngineError::ResolutionFailed(_)));
    }
}
