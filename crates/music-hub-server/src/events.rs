//! In-process session status channel.
//!
//! Sessions publish what happened to them here; the host logs it. Controllers
//! do not subscribe, they query.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Joined {
        tenant_id: String,
        target: String,
    },
    NowPlaying {
        tenant_id: String,
        track_id: i64,
        title: String,
    },
    TrackFinished {
        tenant_id: String,
        track_id: i64,
    },
    /// Queue entry dropped because its file is gone.
    TrackSkipped {
        tenant_id: String,
        track_id: i64,
        title: String,
        reason: String,
    },
    PlaybackError {
        tenant_id: String,
        track_id: i64,
        title: String,
        error: String,
    },
    QueueDrained {
        tenant_id: String,
    },
    TornDown {
        tenant_id: String,
        reason: String,
    },
}

impl SessionEvent {
    #[cfg(test)]
    pub fn tenant_id(&self) -> &str {
        match self {
            SessionEvent::Joined { tenant_id, .. }
            | SessionEvent::NowPlaying { tenant_id, .. }
            | SessionEvent::TrackFinished { tenant_id, .. }
            | SessionEvent::TrackSkipped { tenant_id, .. }
            | SessionEvent::PlaybackError { tenant_id, .. }
            | SessionEvent::QueueDrained { tenant_id }
            | SessionEvent::TornDown { tenant_id, .. } => tenant_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

/// Log every session event until the bus closes.
pub fn spawn_status_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "session status logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Joined { tenant_id, target } => {
            tracing::info!(tenant_id = %tenant_id, target = %target, "session joined");
        }
        SessionEvent::NowPlaying {
            tenant_id,
            track_id,
            title,
        } => {
            tracing::info!(tenant_id = %tenant_id, track_id, title = %title, "now playing");
        }
        SessionEvent::TrackFinished { tenant_id, track_id } => {
            tracing::debug!(tenant_id = %tenant_id, track_id, "track finished");
        }
        SessionEvent::TrackSkipped {
            tenant_id,
            track_id,
            title,
            reason,
        } => {
            tracing::warn!(tenant_id = %tenant_id, track_id, title = %title, reason = %reason, "track skipped");
        }
        SessionEvent::PlaybackError {
            tenant_id,
            track_id,
            title,
            error,
        } => {
            tracing::warn!(tenant_id = %tenant_id, track_id, title = %title, error = %error, "playback error");
        }
        SessionEvent::QueueDrained { tenant_id } => {
            tracing::info!(tenant_id = %tenant_id, "queue drained");
        }
        SessionEvent::TornDown { tenant_id, reason } => {
            tracing::info!(tenant_id = %tenant_id, reason = %reason, "session torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::QueueDrained {
            tenant_id: "g1".to_string(),
        });
        let event = rx.recv().await.expect("event");
        assert_eq!(event.tenant_id(), "g1");
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        EventBus::new().publish(SessionEvent::TornDown {
            tenant_id: "g1".to_string(),
            reason: "leave".to_string(),
        });
    }
}
