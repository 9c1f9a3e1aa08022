//! Per-tenant playback session.
//!
//! Each session is a task that owns its queue, connection and state; every
//! mutation arrives as a [`SessionCommand`] or a transport event and is applied
//! by that one task, so transitions never interleave. Acquisition runs outside
//! the task: callers reserve an [`AcquireTicket`], acquire, then enqueue with
//! the ticket. Stopping or leaving bumps the session generation, which makes
//! outstanding tickets stale and their tracks get discarded on arrival.
//!
//! Lifecycle: Idle -> Connecting -> Idle (connected) -> Playing <-> Paused,
//! back to Idle when the queue drains, Draining while tearing down.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use music_hub_types::{EnqueueOutcome, QueueEntrySummary, QueueSnapshot, SessionState};

use crate::acquisition::{AcquiredTrack, AcquisitionPipeline};
use crate::asset_store::Track;
use crate::assets::{AssetFiles, Lease, Reclaimed};
use crate::config::SessionSettings;
use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};
use crate::session_registry::RegistryInner;
use crate::transport::{Connection, Transport, TransportEvent, TransportEvents};

const COMMAND_BUFFER: usize = 64;

/// Collaborators shared by every session.
pub struct SessionContext {
    pub pipeline: Arc<AcquisitionPipeline>,
    pub files: Arc<AssetFiles>,
    pub transport: Arc<dyn Transport>,
    pub events: EventBus,
    pub settings: SessionSettings,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Permission to enqueue one acquired track.
#[derive(Debug)]
pub struct AcquireTicket {
    generation: u64,
}

pub(crate) enum SessionCommand {
    Join {
        target: String,
        reply: Reply<()>,
    },
    Reserve {
        reply: Reply<AcquireTicket>,
    },
    Enqueue {
        ticket: AcquireTicket,
        acquired: AcquiredTrack,
        requested_by: String,
        reply: Reply<EnqueueOutcome>,
    },
    Abandon {
        ticket: AcquireTicket,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Skip {
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<usize>,
    },
    Leave {
        reply: Reply<()>,
    },
    ToggleLoop {
        reply: Reply<bool>,
    },
    Shuffle {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<QueueSnapshot>,
    },
    Reacquired {
        token: u64,
        result: Result<AcquiredTrack, EngineError>,
    },
}

/// Cheap, cloneable reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tenant_id: String,
    session_id: String,
    tx: mpsc::Sender<SessionCommand>,
    files: Arc<AssetFiles>,
}

impl SessionHandle {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once the session task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn gone(&self) -> EngineError {
        EngineError::no_session(&self.tenant_id)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Connect to `target`; resolves once the connection is ready.
    pub async fn join(&self, target: &str) -> Result<(), EngineError> {
        let target = target.to_string();
        self.request(|reply| SessionCommand::Join { target, reply }).await
    }

    /// Register an acquisition that will later be enqueued or abandoned.
    pub async fn reserve(&self) -> Result<AcquireTicket, EngineError> {
        self.request(|reply| SessionCommand::Reserve { reply }).await
    }

    pub async fn enqueue(
        &self,
        ticket: AcquireTicket,
        acquired: AcquiredTrack,
        requested_by: &str,
    ) -> Result<EnqueueOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        let cmd = SessionCommand::Enqueue {
            ticket,
            acquired,
            requested_by: requested_by.to_string(),
            reply,
        };
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(cmd).await {
            if let SessionCommand::Enqueue { acquired, .. } = cmd {
                discard_acquired(&self.files, acquired).await;
            }
            return Err(self.gone());
        }
        rx.await.map_err(|_| self.gone())?
    }

    /// Give back a ticket whose acquisition failed.
    pub async fn abandon(&self, ticket: AcquireTicket) {
        let _ = self.tx.send(SessionCommand::Abandon { ticket }).await;
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request(|reply| SessionCommand::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request(|reply| SessionCommand::Resume { reply }).await
    }

    pub async fn skip(&self) -> Result<(), EngineError> {
        self.request(|reply| SessionCommand::Skip { reply }).await
    }

    /// Clear the queue and stop playback; returns how many entries were dropped.
    pub async fn stop(&self) -> Result<usize, EngineError> {
        self.request(|reply| SessionCommand::Stop { reply }).await
    }

    pub async fn leave(&self) -> Result<(), EngineError> {
        self.request(|reply| SessionCommand::Leave { reply }).await
    }

    /// Flip loop mode; returns the new value.
    pub async fn toggle_loop(&self) -> Result<bool, EngineError> {
        self.request(|reply| SessionCommand::ToggleLoop { reply }).await
    }

    pub async fn shuffle(&self) -> Result<(), EngineError> {
        self.request(|reply| SessionCommand::Shuffle { reply }).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, EngineError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    pub async fn now_playing(&self) -> Result<QueueEntrySummary, EngineError> {
        self.snapshot()
            .await?
            .now_playing
            .ok_or_else(|| EngineError::InvalidState("nothing is playing".to_string()))
    }
}

/// Release a track nobody will play and delete its file if it is unused.
pub(crate) async fn discard_acquired(files: &AssetFiles, acquired: AcquiredTrack) {
    let AcquiredTrack { track, lease } = acquired;
    lease.release();
    reclaim_track(files, &track).await;
}

async fn reclaim_track(files: &AssetFiles, track: &Track) {
    match files.reclaim(track).await {
        Ok(Reclaimed::Deleted { bytes }) => {
            tracing::debug!(track_id = track.id, bytes, "reclaimed track file");
        }
        Ok(Reclaimed::InUse) => {
            tracing::debug!(track_id = track.id, "track file still queued elsewhere");
        }
        Ok(Reclaimed::AlreadyGone) => {}
        Err(err) => {
            tracing::warn!(track_id = track.id, error = %err, "failed to reclaim track file");
        }
    }
}

pub(crate) fn spawn(
    tenant_id: &str,
    ctx: Arc<SessionContext>,
    registry: Weak<RegistryInner>,
    runtime: &tokio::runtime::Handle,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let session_id = format!("sess:{}", uuid::Uuid::new_v4());
    let handle = SessionHandle {
        tenant_id: tenant_id.to_string(),
        session_id: session_id.clone(),
        tx: tx.clone(),
        files: ctx.files.clone(),
    };
    let actor = SessionActor {
        tenant_id: tenant_id.to_string(),
        session_id,
        ctx,
        registry,
        self_tx: tx.downgrade(),
        state: SessionState::Idle,
        queue: VecDeque::new(),
        loop_enabled: false,
        connection: None,
        events_rx: None,
        pending_join: None,
        reconnect_deadline: None,
        current_play: None,
        next_play_id: 1,
        generation: 0,
        pending_acquisitions: 0,
        reacquire: None,
        next_token: 1,
    };
    tracing::info!(tenant_id = %tenant_id, session_id = %handle.session_id, "session created");
    runtime.spawn(actor.run(rx));
    handle
}

struct QueueEntry {
    track: Track,
    requested_by: String,
    /// `None` only while a looped track is being fetched again.
    lease: Option<Lease>,
}

impl QueueEntry {
    fn summary(&self) -> QueueEntrySummary {
        QueueEntrySummary {
            track: self.track.summary(),
            requested_by: self.requested_by.clone(),
        }
    }
}

async fn reclaim_entry(files: &AssetFiles, entry: QueueEntry) {
    if let Some(lease) = entry.lease {
        lease.release();
    }
    reclaim_track(files, &entry.track).await;
}

struct PendingJoin {
    target: String,
    deadline: Instant,
    reply: Reply<()>,
}

enum Step {
    Command(Option<SessionCommand>),
    Event(Option<TransportEvent>),
    JoinTimeout,
    ReconnectTimeout,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct SessionActor {
    tenant_id: String,
    session_id: String,
    ctx: Arc<SessionContext>,
    registry: Weak<RegistryInner>,
    self_tx: mpsc::WeakSender<SessionCommand>,
    state: SessionState,
    queue: VecDeque<QueueEntry>,
    loop_enabled: bool,
    connection: Option<Box<dyn Connection>>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pending_join: Option<PendingJoin>,
    reconnect_deadline: Option<Instant>,
    /// Play id of the track the transport is currently playing.
    current_play: Option<u64>,
    next_play_id: u64,
    generation: u64,
    pending_acquisitions: usize,
    /// Token of the in-flight loop re-acquisition.
    reacquire: Option<u64>,
    next_token: u64,
}

async fn next_event(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            let join_deadline = self.pending_join.as_ref().map(|join| join.deadline);
            let reconnect_deadline = self.reconnect_deadline;
            let step = tokio::select! {
                biased;
                event = next_event(&mut self.events_rx) => Step::Event(event),
                _ = sleep_until_opt(join_deadline) => Step::JoinTimeout,
                _ = sleep_until_opt(reconnect_deadline) => Step::ReconnectTimeout,
                cmd = commands.recv() => Step::Command(cmd),
            };
            let flow = match step {
                Step::Event(Some(event)) => self.on_transport_event(event).await,
                Step::Event(None) => {
                    self.events_rx = None;
                    self.on_transport_event(TransportEvent::Disconnected).await
                }
                Step::JoinTimeout => {
                    self.fail_join("timed out waiting for the connection to become ready")
                        .await
                }
                Step::ReconnectTimeout => {
                    let reason = EngineError::ConnectionLost("reconnect timed out".to_string());
                    self.teardown(&reason.to_string()).await;
                    Flow::Exit
                }
                Step::Command(Some(cmd)) => self.on_command(cmd).await,
                Step::Command(None) => {
                    self.teardown("session released").await;
                    Flow::Exit
                }
            };
            if flow == Flow::Exit {
                break;
            }
        }

        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            self.reject(cmd).await;
        }
        tracing::info!(tenant_id = %self.tenant_id, session_id = %self.session_id, "session closed");
    }

    fn gone(&self) -> EngineError {
        EngineError::no_session(&self.tenant_id)
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some() && self.pending_join.is_none()
    }

    fn publish(&self, event: SessionEvent) {
        self.ctx.events.publish(event);
    }

    async fn on_command(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::Join { target, reply } => return self.join(target, reply).await,
            SessionCommand::Reserve { reply } => {
                self.pending_acquisitions += 1;
                let _ = reply.send(Ok(AcquireTicket {
                    generation: self.generation,
                }));
            }
            SessionCommand::Enqueue {
                ticket,
                acquired,
                requested_by,
                reply,
            } => return self.enqueue(ticket, acquired, requested_by, reply).await,
            SessionCommand::Abandon { .. } => {
                self.pending_acquisitions = self.pending_acquisitions.saturating_sub(1);
                return self.maybe_reap();
            }
            SessionCommand::Pause { reply } => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            SessionCommand::Resume { reply } => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            SessionCommand::Skip { reply } => {
                let result = self.skip().await;
                let _ = reply.send(result);
            }
            SessionCommand::Stop { reply } => {
                let cleared = self.stop().await;
                let flow = self.maybe_reap();
                let _ = reply.send(Ok(cleared));
                return flow;
            }
            SessionCommand::Leave { reply } => {
                self.teardown("leave").await;
                let _ = reply.send(Ok(()));
                return Flow::Exit;
            }
            SessionCommand::ToggleLoop { reply } => {
                self.loop_enabled = !self.loop_enabled;
                tracing::info!(tenant_id = %self.tenant_id, loop_enabled = self.loop_enabled, "loop toggled");
                let _ = reply.send(Ok(self.loop_enabled));
            }
            SessionCommand::Shuffle { reply } => {
                let _ = reply.send(self.shuffle());
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            SessionCommand::Reacquired { token, result } => {
                self.on_reacquired(token, result).await;
            }
        }
        Flow::Continue
    }

    /// Answer commands that arrive after the session stopped.
    async fn reject(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Enqueue {
                acquired, reply, ..
            } => {
                discard_acquired(&self.ctx.files, acquired).await;
                let _ = reply.send(Err(EngineError::Cancelled(
                    "session closed before the track was ready".to_string(),
                )));
            }
            SessionCommand::Reacquired {
                result: Ok(acquired),
                ..
            } => discard_acquired(&self.ctx.files, acquired).await,
            SessionCommand::Join { reply, .. }
            | SessionCommand::Pause { reply }
            | SessionCommand::Resume { reply }
            | SessionCommand::Skip { reply }
            | SessionCommand::Leave { reply }
            | SessionCommand::Shuffle { reply } => {
                let _ = reply.send(Err(self.gone()));
            }
            SessionCommand::Stop { reply } => {
                let _ = reply.send(Err(self.gone()));
            }
            SessionCommand::ToggleLoop { reply } => {
                let _ = reply.send(Err(self.gone()));
            }
            SessionCommand::Reserve { reply } => {
                let _ = reply.send(Err(self.gone()));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(Err(self.gone()));
            }
            SessionCommand::Abandon { .. } | SessionCommand::Reacquired { .. } => {}
        }
    }

    async fn join(&mut self, target: String, reply: Reply<()>) -> Flow {
        if self.pending_join.is_some() {
            let _ = reply.send(Err(EngineError::InvalidState(
                "join already in progress".to_string(),
            )));
            return Flow::Continue;
        }
        if let Some(conn) = self.connection.as_ref() {
            tracing::debug!(tenant_id = %self.tenant_id, target = %conn.target(), "already connected");
            let _ = reply.send(Ok(()));
            return Flow::Continue;
        }

        self.state = SessionState::Connecting;
        tracing::info!(tenant_id = %self.tenant_id, target = %target, "connecting");
        let (events, rx) = TransportEvents::channel();
        match self.ctx.transport.connect(&self.tenant_id, &target, events).await {
            Ok(conn) => {
                self.connection = Some(conn);
                self.events_rx = Some(rx);
                self.pending_join = Some(PendingJoin {
                    target,
                    deadline: Instant::now() + self.ctx.settings.join_timeout,
                    reply,
                });
                Flow::Continue
            }
            Err(err) => {
                let err = EngineError::from(err);
                tracing::warn!(tenant_id = %self.tenant_id, target = %target, error = %err, "connect failed");
                self.teardown(&err.to_string()).await;
                let _ = reply.send(Err(err));
                Flow::Exit
            }
        }
    }

    async fn fail_join(&mut self, reason: &str) -> Flow {
        let join = self.pending_join.take();
        tracing::warn!(tenant_id = %self.tenant_id, reason = %reason, "join failed");
        self.teardown(reason).await;
        if let Some(join) = join {
            let _ = join
                .reply
                .send(Err(EngineError::ConnectionFailed(reason.to_string())));
        }
        Flow::Exit
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Ready => {
                if let Some(join) = self.pending_join.take() {
                    self.state = SessionState::Idle;
                    self.publish(SessionEvent::Joined {
                        tenant_id: self.tenant_id.clone(),
                        target: join.target.clone(),
                    });
                    let _ = join.reply.send(Ok(()));
                    if self.current_play.is_none() && self.reacquire.is_none() {
                        self.play_head().await;
                    }
                } else if self.reconnect_deadline.take().is_some() {
                    tracing::info!(tenant_id = %self.tenant_id, "connection recovered");
                }
                Flow::Continue
            }
            TransportEvent::Disconnected => {
                if self.pending_join.is_some() {
                    return self
                        .fail_join("connection dropped before it became ready")
                        .await;
                }
                if self.connection.is_some() && self.reconnect_deadline.is_none() {
                    tracing::warn!(
                        tenant_id = %self.tenant_id,
                        timeout_ms = self.ctx.settings.reconnect_timeout.as_millis() as u64,
                        "connection dropped; waiting for it to recover"
                    );
                    self.reconnect_deadline =
                        Some(Instant::now() + self.ctx.settings.reconnect_timeout);
                }
                Flow::Continue
            }
            TransportEvent::PlaybackComplete { play_id } => {
                if self.take_current_play(play_id) {
                    self.finish_head(None).await;
                }
                Flow::Continue
            }
            TransportEvent::PlaybackError { play_id, error } => {
                if self.take_current_play(play_id) {
                    self.finish_head(Some(error)).await;
                }
                Flow::Continue
            }
        }
    }

    fn take_current_play(&mut self, play_id: u64) -> bool {
        if self.current_play == Some(play_id) {
            self.current_play = None;
            true
        } else {
            tracing::debug!(tenant_id = %self.tenant_id, play_id, "ignoring stale playback event");
            false
        }
    }

    /// Completion transition for the head entry.
    async fn finish_head(&mut self, error: Option<String>) {
        let Some(head) = self.queue.front() else {
            self.state = SessionState::Idle;
            return;
        };
        let track_id = head.track.id;
        let title = head.track.title.clone();
        match error {
            Some(error) => {
                self.publish(SessionEvent::PlaybackError {
                    tenant_id: self.tenant_id.clone(),
                    track_id,
                    title,
                    error,
                });
                self.drop_head().await;
                self.play_head().await;
            }
            None if self.loop_enabled => {
                self.publish(SessionEvent::TrackFinished {
                    tenant_id: self.tenant_id.clone(),
                    track_id,
                });
                self.start_reacquire().await;
            }
            None => {
                self.publish(SessionEvent::TrackFinished {
                    tenant_id: self.tenant_id.clone(),
                    track_id,
                });
                self.drop_head().await;
                self.play_head().await;
            }
        }
    }

    /// Remove the head entry and reclaim its file.
    async fn drop_head(&mut self) {
        if let Some(entry) = self.queue.pop_front() {
            reclaim_entry(&self.ctx.files, entry).await;
        }
    }

    /// Start the head entry, dropping entries whose files are gone or that the
    /// transport refuses.
    async fn play_head(&mut self) {
        loop {
            let Some(head) = self.queue.front() else {
                self.current_play = None;
                if matches!(self.state, SessionState::Playing | SessionState::Paused) {
                    self.publish(SessionEvent::QueueDrained {
                        tenant_id: self.tenant_id.clone(),
                    });
                }
                if self.state != SessionState::Connecting {
                    self.state = SessionState::Idle;
                }
                return;
            };
            if !self.is_connected() {
                return;
            }
            let track_id = head.track.id;
            let title = head.track.title.clone();
            let path = head.track.file_path.clone();

            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                let reason = EngineError::FileMissing(path.display().to_string());
                tracing::warn!(tenant_id = %self.tenant_id, track_id, error = %reason, "skipping queued track");
                self.publish(SessionEvent::TrackSkipped {
                    tenant_id: self.tenant_id.clone(),
                    track_id,
                    title,
                    reason: reason.to_string(),
                });
                self.drop_head().await;
                continue;
            }

            let play_id = self.next_play_id;
            self.next_play_id += 1;
            let Some(conn) = self.connection.as_mut() else {
                return;
            };
            match conn.play(play_id, &path, &title).await {
                Ok(()) => {
                    self.current_play = Some(play_id);
                    self.state = SessionState::Playing;
                    if let Err(err) = self.ctx.files.store().increment_play_count(track_id) {
                        tracing::warn!(track_id, error = %err, "failed to record play");
                    }
                    self.publish(SessionEvent::NowPlaying {
                        tenant_id: self.tenant_id.clone(),
                        track_id,
                        title,
                    });
                    return;
                }
                Err(err) => {
                    self.publish(SessionEvent::PlaybackError {
                        tenant_id: self.tenant_id.clone(),
                        track_id,
                        title,
                        error: err.to_string(),
                    });
                    self.drop_head().await;
                }
            }
        }
    }

    /// Loop mode: reclaim the finished file and fetch the same source again.
    async fn start_reacquire(&mut self) {
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        let track = head.track.clone();
        let requested_by = head.requested_by.clone();
        if let Some(lease) = head.lease.take() {
            lease.release();
        }
        reclaim_track(&self.ctx.files, &track).await;

        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let token = self.next_token;
        self.next_token += 1;
        self.reacquire = Some(token);
        let pipeline = self.ctx.pipeline.clone();
        let files = self.ctx.files.clone();
        tracing::info!(tenant_id = %self.tenant_id, track_id = track.id, "looping; re-acquiring track");
        tokio::spawn(async move {
            let result = pipeline.acquire(&track.source_url, &requested_by).await;
            if let Err(mpsc::error::SendError(SessionCommand::Reacquired {
                result: Ok(acquired),
                ..
            })) = tx.send(SessionCommand::Reacquired { token, result }).await
            {
                discard_acquired(&files, acquired).await;
            }
        });
    }

    async fn on_reacquired(&mut self, token: u64, result: Result<AcquiredTrack, EngineError>) {
        if self.reacquire != Some(token) {
            if let Ok(acquired) = result {
                discard_acquired(&self.ctx.files, acquired).await;
            }
            return;
        }
        self.reacquire = None;
        match result {
            Ok(acquired) => {
                let AcquiredTrack { track, lease } = acquired;
                match self.queue.front_mut() {
                    Some(head) => {
                        head.track = track;
                        head.lease = Some(lease);
                    }
                    None => {
                        discard_acquired(&self.ctx.files, AcquiredTrack { track, lease }).await;
                    }
                }
                self.play_head().await;
            }
            Err(err) => {
                if let Some(head) = self.queue.front() {
                    self.publish(SessionEvent::PlaybackError {
                        tenant_id: self.tenant_id.clone(),
                        track_id: head.track.id,
                        title: head.track.title.clone(),
                        error: err.to_string(),
                    });
                }
                self.drop_head().await;
                self.play_head().await;
            }
        }
    }

    async fn enqueue(
        &mut self,
        ticket: AcquireTicket,
        acquired: AcquiredTrack,
        requested_by: String,
        reply: Reply<EnqueueOutcome>,
    ) -> Flow {
        self.pending_acquisitions = self.pending_acquisitions.saturating_sub(1);
        if ticket.generation != self.generation {
            tracing::info!(
                tenant_id = %self.tenant_id,
                track_id = acquired.track.id,
                "discarding track acquired before stop"
            );
            discard_acquired(&self.ctx.files, acquired).await;
            let flow = self.maybe_reap();
            let _ = reply.send(Err(EngineError::Cancelled(
                "session was stopped before the track was ready".to_string(),
            )));
            return flow;
        }

        let was_empty = self.queue.is_empty();
        let summary = acquired.track.summary();
        let track_id = acquired.track.id;
        self.queue.push_back(QueueEntry {
            track: acquired.track,
            requested_by,
            lease: Some(acquired.lease),
        });
        let position = self.queue.len() - 1;
        tracing::info!(tenant_id = %self.tenant_id, track_id, position, "track enqueued");

        if self.state == SessionState::Idle && was_empty && self.is_connected() {
            self.play_head().await;
        }
        let started = position == 0
            && self.state == SessionState::Playing
            && self.queue.front().is_some_and(|head| head.track.id == track_id);
        let _ = reply.send(Ok(EnqueueOutcome {
            track: summary,
            position,
            started,
        }));
        Flow::Continue
    }

    async fn pause(&mut self) -> Result<(), EngineError> {
        if self.state != SessionState::Playing {
            return Err(EngineError::InvalidState(format!(
                "cannot pause while {:?}",
                self.state
            )));
        }
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("no connection".to_string()))?;
        conn.pause().await?;
        self.state = SessionState::Paused;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), EngineError> {
        if self.state != SessionState::Paused {
            return Err(EngineError::InvalidState(format!(
                "cannot resume while {:?}",
                self.state
            )));
        }
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("no connection".to_string()))?;
        conn.resume().await?;
        self.state = SessionState::Playing;
        Ok(())
    }

    async fn skip(&mut self) -> Result<(), EngineError> {
        if !matches!(self.state, SessionState::Playing | SessionState::Paused) {
            return Err(EngineError::InvalidState("nothing is playing".to_string()));
        }
        if self.current_play.take().is_some() {
            if let Some(conn) = self.connection.as_mut() {
                if let Err(err) = conn.stop().await {
                    tracing::warn!(tenant_id = %self.tenant_id, error = %err, "stop for skip failed");
                }
            }
        }
        self.reacquire = None;
        // Same transition as a natural end, so loop mode replays the head.
        self.finish_head(None).await;
        Ok(())
    }

    async fn stop(&mut self) -> usize {
        self.generation += 1;
        self.reacquire = None;
        self.current_play = None;
        if let Some(conn) = self.connection.as_mut() {
            if let Err(err) = conn.stop().await {
                tracing::warn!(tenant_id = %self.tenant_id, error = %err, "transport stop failed");
            }
        }
        let cleared = self.queue.len();
        self.clear_queue().await;
        if self.state != SessionState::Connecting {
            self.state = SessionState::Idle;
        }
        tracing::info!(tenant_id = %self.tenant_id, cleared, "session stopped");
        cleared
    }

    async fn clear_queue(&mut self) {
        while let Some(entry) = self.queue.pop_front() {
            reclaim_entry(&self.ctx.files, entry).await;
        }
    }

    fn shuffle(&mut self) -> Result<(), EngineError> {
        if self.queue.len() <= 2 {
            return Err(EngineError::InvalidState(
                "need more than two queued tracks to shuffle".to_string(),
            ));
        }
        let mut rest: Vec<QueueEntry> = self.queue.drain(1..).collect();
        rest.shuffle(&mut rand::rng());
        self.queue.extend(rest);
        Ok(())
    }

    fn snapshot(&self) -> QueueSnapshot {
        let entries: Vec<QueueEntrySummary> = self.queue.iter().map(QueueEntry::summary).collect();
        let now_playing = match self.state {
            SessionState::Playing | SessionState::Paused => entries.first().cloned(),
            _ => None,
        };
        QueueSnapshot {
            tenant_id: self.tenant_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            connected: self.is_connected(),
            loop_enabled: self.loop_enabled,
            now_playing,
            entries,
            pending_acquisitions: self.pending_acquisitions,
        }
    }

    fn should_reap(&self) -> bool {
        self.queue.is_empty()
            && self.connection.is_none()
            && self.pending_join.is_none()
            && self.pending_acquisitions == 0
            && self.reacquire.is_none()
    }

    /// Destroy an idle session that holds nothing.
    fn maybe_reap(&mut self) -> Flow {
        if !self.should_reap() {
            return Flow::Continue;
        }
        self.state = SessionState::Draining;
        self.detach();
        self.publish(SessionEvent::TornDown {
            tenant_id: self.tenant_id.clone(),
            reason: "idle".to_string(),
        });
        Flow::Exit
    }

    /// Stop, release the connection, reclaim the queue and unregister.
    async fn teardown(&mut self, reason: &str) {
        self.state = SessionState::Draining;
        self.generation += 1;
        self.reacquire = None;
        self.current_play = None;
        self.reconnect_deadline = None;
        if let Some(join) = self.pending_join.take() {
            let _ = join
                .reply
                .send(Err(EngineError::ConnectionFailed(reason.to_string())));
        }
        if let Some(mut conn) = self.connection.take() {
            if let Err(err) = conn.stop().await {
                tracing::debug!(tenant_id = %self.tenant_id, error = %err, "stop during teardown failed");
            }
            conn.release().await;
        }
        self.events_rx = None;
        self.clear_queue().await;
        self.detach();
        self.publish(SessionEvent::TornDown {
            tenant_id: self.tenant_id.clone(),
            reason: reason.to_string(),
        });
    }

    fn detach(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_session(&self.tenant_id, &self.session_id);
        }
    }
}
