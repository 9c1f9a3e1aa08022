use serde::{Deserialize, Serialize};

/// Version of the control surface published by the hub.
///
/// Controllers may pin a version in [`ControlRequest::version`]; the hub rejects
/// requests carrying any other value.
pub const CONTROL_BRIDGE_VERSION: u32 = 1;

/// Commands a controller may issue against a tenant's session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ControlVerb {
    /// Connect the session to a playback target (creates the session).
    Join,
    /// Stop, release the connection, and destroy the session.
    Leave,
    /// Acquire a track from a free-text query or URL and enqueue it.
    Play,
    /// Pause the current track.
    Pause,
    /// Resume a paused track.
    Resume,
    /// Advance past the current track.
    Skip,
    /// Clear the queue and stop playback, keeping the connection.
    Stop,
    /// Toggle repeat of the current track.
    LoopToggle,
    /// Shuffle everything after the current track.
    Shuffle,
    /// Return the full queue snapshot.
    QueueQuery,
    /// Return the current track, if any.
    NowPlaying,
}

impl ControlVerb {
    /// Every verb the hub publishes, in table order.
    pub const ALL: [ControlVerb; 11] = [
        ControlVerb::Join,
        ControlVerb::Leave,
        ControlVerb::Play,
        ControlVerb::Pause,
        ControlVerb::Resume,
        ControlVerb::Skip,
        ControlVerb::Stop,
        ControlVerb::LoopToggle,
        ControlVerb::Shuffle,
        ControlVerb::QueueQuery,
        ControlVerb::NowPlaying,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ControlVerb::Join => "join",
            ControlVerb::Leave => "leave",
            ControlVerb::Play => "play",
            ControlVerb::Pause => "pause",
            ControlVerb::Resume => "resume",
            ControlVerb::Skip => "skip",
            ControlVerb::Stop => "stop",
            ControlVerb::LoopToggle => "loop_toggle",
            ControlVerb::Shuffle => "shuffle",
            ControlVerb::QueueQuery => "queue_query",
            ControlVerb::NowPlaying => "now_playing",
        }
    }
}

impl std::fmt::Display for ControlVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verb arguments. Each handler validates the fields it needs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ControlArgs {
    /// Free-text query or URL (`play`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Playback target, e.g. a receiver address (`join`, optional for `play`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Who asked for the track (`play`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

/// A single control command addressed to one tenant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ControlRequest {
    /// Tenant (guild) the command applies to.
    pub tenant_id: String,
    /// Command to run.
    pub verb: ControlVerb,
    /// Verb arguments.
    #[serde(default)]
    pub args: ControlArgs,
    /// Control surface version the caller was built against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl ControlRequest {
    pub fn new(tenant_id: impl Into<String>, verb: ControlVerb) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            verb,
            args: ControlArgs::default(),
            version: Some(CONTROL_BRIDGE_VERSION),
        }
    }

    pub fn with_args(mut self, args: ControlArgs) -> Self {
        self.args = args;
        self
    }
}

/// Correlated reply to a [`ControlRequest`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ControlResponse {
    pub ok: bool,
    /// Verb-specific payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub data: Option<serde_json::Value>,
    /// `"<code>: <detail>"` on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ControlResponse {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self {
            ok: true,
            data,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            reason: Some(reason.into()),
        }
    }

    /// Error code prefix of `reason` (`not_ready`, `invalid_state`, ...).
    pub fn reason_code(&self) -> Option<&str> {
        self.reason
            .as_deref()
            .map(|reason| reason.split_once(':').map(|(code, _)| code).unwrap_or(reason))
    }
}

/// Published control surface description.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ControlInfo {
    pub version: u32,
    pub verbs: Vec<ControlVerb>,
}

/// Lifecycle state of a playback session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Playing,
    Paused,
    Draining,
}

/// Track fields exposed to controllers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TrackSummary {
    pub id: i64,
    pub source_id: String,
    pub title: String,
    pub author: String,
    pub duration_seconds: u32,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
}

/// One queued entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct QueueEntrySummary {
    pub track: TrackSummary,
    pub requested_by: String,
}

/// Point-in-time view of a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct QueueSnapshot {
    pub tenant_id: String,
    pub session_id: String,
    pub state: SessionState,
    pub connected: bool,
    pub loop_enabled: bool,
    /// Head entry while playing or paused.
    pub now_playing: Option<QueueEntrySummary>,
    /// Full queue, head first.
    pub entries: Vec<QueueEntrySummary>,
    /// Acquisitions started for this session that have not been enqueued yet.
    pub pending_acquisitions: usize,
}

/// Result of a successful `play`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EnqueueOutcome {
    pub track: TrackSummary,
    /// Zero-based queue position (0 = now playing).
    pub position: usize,
    /// `true` when this enqueue started playback.
    pub started: bool,
}

/// Loop flag after `loop_toggle`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LoopState {
    pub loop_enabled: bool,
}

/// Outcome of a retention sweep.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SweepReport {
    pub candidates: usize,
    pub deleted: usize,
    pub freed_bytes: u64,
    /// Candidates left alone because a session still references them.
    pub skipped_in_use: usize,
    pub failures: Vec<SweepFailure>,
}

/// Per-track failure recorded by a sweep.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SweepFailure {
    pub track_id: i64,
    pub error: String,
}

/// Outcome of a quota check.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct QuotaSweepReport {
    pub usage_before_bytes: u64,
    pub usage_after_bytes: u64,
    pub threshold_bytes: u64,
    /// `false` when usage was already under the threshold.
    pub triggered: bool,
    pub deleted: usize,
    pub freed_bytes: u64,
    /// `true` when usage stayed above threshold after all candidates were tried.
    pub exhausted: bool,
}

/// Outcome of reconciling live rows against files on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReconcileReport {
    /// Live rows soft-deleted because their file was missing.
    pub marked_deleted: usize,
}

/// Disk usage and track counts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct StorageReport {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
    pub threshold_bytes: u64,
    pub needs_cleanup: bool,
    pub active_tracks: i64,
    pub deleted_tracks: i64,
}

/// Reason why playback ended on the receiver side.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Decoder, transport, or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Playback status reported by a networked receiver.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReceiverStatus {
    /// Current file/path being played, if available.
    pub now_playing: Option<String>,
    /// `true` when playback is paused or idle.
    pub paused: bool,
    /// Elapsed playback time in milliseconds.
    pub elapsed_ms: Option<u64>,
    /// Total media duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Active output device name, if known.
    pub device: Option<String>,
    /// End reason when playback transitions to idle.
    pub end_reason: Option<PlaybackEndReason>,
}
