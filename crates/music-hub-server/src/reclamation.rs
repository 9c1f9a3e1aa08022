//! Storage reclamation.
//!
//! Two jobs keep the asset directory bounded: a retention sweep that evicts
//! every cold, unreferenced track, and a quota sweep that evicts the oldest
//! candidates one at a time until usage drops under the warning threshold.
//! Both go through [`AssetFiles::evict`], which re-checks under the source lock
//! that no session holds the track right before deleting.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use music_hub_types::{QuotaSweepReport, StorageReport, SweepFailure, SweepReport};

use crate::asset_store::{now_ms, Track};
use crate::assets::{AssetFiles, Reclaimed};
use crate::config::StorageSettings;
use crate::error::EngineError;

pub struct Reclaimer {
    files: Arc<AssetFiles>,
    settings: StorageSettings,
    /// Serializes sweeps so scheduled and on-demand runs never overlap.
    running: tokio::sync::Mutex<()>,
}

impl Reclaimer {
    pub fn new(files: Arc<AssetFiles>, settings: StorageSettings) -> Self {
        Self {
            files,
            settings,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Evict every candidate older than the retention window.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        self.sweep_at(now_ms()).await
    }

    pub(crate) async fn sweep_at(&self, now_ms: i64) -> Result<SweepReport, EngineError> {
        let _running = self.running.lock().await;
        let candidates = self
            .files
            .store()
            .list_eviction_candidates_at(self.settings.retention_days, now_ms)?;
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };
        for track in &candidates {
            self.evict_into(track, &mut report).await;
        }
        tracing::info!(
            candidates = report.candidates,
            deleted = report.deleted,
            freed_bytes = report.freed_bytes,
            skipped_in_use = report.skipped_in_use,
            failures = report.failures.len(),
            "retention sweep finished"
        );
        Ok(report)
    }

    async fn evict_into(&self, track: &Track, report: &mut SweepReport) -> u64 {
        match self.files.evict(track).await {
            Ok(Reclaimed::Deleted { bytes }) => {
                report.deleted += 1;
                report.freed_bytes += bytes;
                bytes
            }
            Ok(Reclaimed::AlreadyGone) => {
                report.deleted += 1;
                0
            }
            Ok(Reclaimed::InUse) => {
                report.skipped_in_use += 1;
                0
            }
            Err(err) => {
                tracing::warn!(track_id = track.id, error = %err, "failed to evict track");
                report.failures.push(SweepFailure {
                    track_id: track.id,
                    error: err.to_string(),
                });
                0
            }
        }
    }

    /// Evict oldest candidates while usage is above the warning threshold.
    pub async fn quota_sweep(&self) -> Result<QuotaSweepReport, EngineError> {
        self.quota_sweep_at(now_ms()).await
    }

    pub(crate) async fn quota_sweep_at(&self, now_ms: i64) -> Result<QuotaSweepReport, EngineError> {
        let _running = self.running.lock().await;
        let threshold = self.settings.threshold_bytes();
        let usage_before = self.files.disk_usage().await?;
        let mut report = QuotaSweepReport {
            usage_before_bytes: usage_before,
            usage_after_bytes: usage_before,
            threshold_bytes: threshold,
            ..QuotaSweepReport::default()
        };
        if usage_before <= threshold {
            return Ok(report);
        }
        report.triggered = true;
        tracing::warn!(
            usage_bytes = usage_before,
            threshold_bytes = threshold,
            quota_bytes = self.settings.quota_bytes,
            "storage above threshold; starting quota sweep"
        );

        let candidates = self
            .files
            .store()
            .list_eviction_candidates_at(self.settings.quota_retention_days, now_ms)?;
        let mut usage = usage_before;
        let mut scratch = SweepReport::default();
        for track in candidates {
            if usage <= threshold {
                break;
            }
            let freed = self.evict_into(&track, &mut scratch).await;
            if freed > 0 {
                usage = self.files.disk_usage().await?;
            }
        }
        report.deleted = scratch.deleted;
        report.freed_bytes = scratch.freed_bytes;
        report.usage_after_bytes = usage;
        report.exhausted = usage > threshold;
        if report.exhausted {
            tracing::warn!(
                usage_bytes = usage,
                threshold_bytes = threshold,
                "quota sweep ran out of candidates"
            );
        } else {
            tracing::info!(
                usage_bytes = usage,
                deleted = report.deleted,
                freed_bytes = report.freed_bytes,
                "quota sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn storage_report(&self) -> Result<StorageReport, EngineError> {
        let usage = self.files.disk_usage().await?;
        let counts = self.files.store().track_counts()?;
        let threshold = self.settings.threshold_bytes();
        Ok(StorageReport {
            usage_bytes: usage,
            quota_bytes: self.settings.quota_bytes,
            threshold_bytes: threshold,
            needs_cleanup: usage > threshold,
            active_tracks: counts.active,
            deleted_tracks: counts.deleted,
        })
    }
}

/// Start the periodic retention and quota jobs.
pub fn spawn_schedules(reclaimer: Arc<Reclaimer>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let sweep_interval = reclaimer.settings().sweep_interval;
    let quota_interval = reclaimer.settings().quota_check_interval;

    if reclaimer.settings().sweep_enabled {
        let sweeper = reclaimer.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = sweeper.sweep().await {
                    tracing::warn!(error = %err, "scheduled retention sweep failed");
                }
            }
        }));
    } else {
        tracing::info!("scheduled retention sweep disabled");
    }

    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(quota_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = reclaimer.quota_sweep().await {
                tracing::warn!(error = %err, "quota check failed");
            }
        }
    }));
    handles
}
