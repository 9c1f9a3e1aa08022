//! Playback transport abstraction.
//!
//! A [`Transport`] opens per-session [`Connection`]s to a playback target. The
//! connection reports lifecycle and playback outcomes asynchronously through
//! [`TransportEvents`]; every playback event carries the `play_id` the session
//! passed to [`Connection::play`], so stale events can be told apart.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection is usable (first time, or again after a drop).
    Ready,
    /// Connection dropped; it may come back with another `Ready`.
    Disconnected,
    /// The track started by `play_id` ended.
    PlaybackComplete { play_id: u64 },
    /// The track started by `play_id` failed.
    PlaybackError { play_id: u64, error: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("connection closed")]
    Closed,
}

/// Sender half handed to a connection for reporting events.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the session stopped listening.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `target` on behalf of `tenant_id`.
    ///
    /// The connection is not usable until it emits [`TransportEvent::Ready`].
    async fn connect(
        &self,
        tenant_id: &str,
        target: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn target(&self) -> &str;

    async fn play(&mut self, play_id: u64, path: &Path, title: &str) -> Result<(), TransportError>;

    async fn pause(&mut self) -> Result<(), TransportError>;

    async fn resume(&mut self) -> Result<(), TransportError>;

    /// Stop the current track. No completion event is required afterwards.
    async fn stop(&mut self) -> Result<(), TransportError>;

    /// Tear the connection down; no events are sent after this returns.
    async fn release(&mut self);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct MockState {
        events: Option<TransportEvents>,
        plays: Vec<(u64, PathBuf)>,
        calls: Vec<String>,
        fail_connect: bool,
        silent: bool,
        fail_play: bool,
    }

    /// In-memory transport; tests drive playback outcomes by hand.
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Every connect attempt fails.
        pub(crate) fn refusing() -> Self {
            let transport = Self::default();
            transport.lock().fail_connect = true;
            transport
        }

        /// Connects but never reports `Ready`.
        pub(crate) fn silent() -> Self {
            let transport = Self::default();
            transport.lock().silent = true;
            transport
        }

        pub(crate) fn fail_plays(&self, fail: bool) {
            self.lock().fail_play = fail;
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(|err| err.into_inner())
        }

        pub(crate) fn plays(&self) -> Vec<(u64, PathBuf)> {
            self.lock().plays.clone()
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.lock().calls.clone()
        }

        pub(crate) fn last_play_id(&self) -> Option<u64> {
            self.lock().plays.last().map(|(id, _)| *id)
        }

        pub(crate) fn emit(&self, event: TransportEvent) {
            if let Some(events) = self.lock().events.as_ref() {
                events.send(event);
            }
        }

        /// Report natural end of the most recent `play`.
        pub(crate) fn finish_current(&self) {
            if let Some(play_id) = self.last_play_id() {
                self.emit(TransportEvent::PlaybackComplete { play_id });
            }
        }

        pub(crate) fn fail_current(&self, error: &str) {
            if let Some(play_id) = self.last_play_id() {
                self.emit(TransportEvent::PlaybackError {
                    play_id,
                    error: error.to_string(),
                });
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(
            &self,
            _tenant_id: &str,
            target: &str,
            events: TransportEvents,
        ) -> Result<Box<dyn Connection>, TransportError> {
            let mut state = self.lock();
            state.calls.push(format!("connect {target}"));
            if state.fail_connect {
                return Err(TransportError::Unreachable(target.to_string()));
            }
            if !state.silent {
                events.send(TransportEvent::Ready);
            }
            state.events = Some(events);
            Ok(Box::new(MockConnection {
                target: target.to_string(),
                state: self.state.clone(),
            }))
        }
    }

    struct MockConnection {
        target: String,
        state: Arc<Mutex<MockState>>,
    }

    impl MockConnection {
        fn record(&self, call: &str) {
            let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
            state.calls.push(call.to_string());
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn target(&self) -> &str {
            &self.target
        }

        async fn play(&mut self, play_id: u64, path: &Path, _title: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
            state.calls.push(format!("play {play_id}"));
            if state.fail_play {
                return Err(TransportError::Command("decoder rejected file".to_string()));
            }
            state.plays.push((play_id, path.to_path_buf()));
            Ok(())
        }

        async fn pause(&mut self) -> Result<(), TransportError> {
            self.record("pause");
            Ok(())
        }

        async fn resume(&mut self) -> Result<(), TransportError> {
            self.record("resume");
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), TransportError> {
            self.record("stop");
            Ok(())
        }

        async fn release(&mut self) {
            let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
            state.calls.push("release".to_string());
            state.events = None;
        }
    }
}
