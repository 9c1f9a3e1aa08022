//! Networked receiver ("bridge") transport.
//!
//! A target is `host:port[/device]`. Connecting selects the output device on
//! the receiver, then a watcher task polls `/status`: reachability changes
//! become `Ready`/`Disconnected`, and the receiver's `end_reason` becomes the
//! completion or error event for the active play. Receivers fetch audio from
//! this server's `/stream` endpoint.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use music_hub_types::{PlaybackEndReason, ReceiverStatus};

use crate::config::TransportSettings;
use crate::transport::{Connection, Transport, TransportError, TransportEvent, TransportEvents};

/// Idle polls after `play` before an unseen track counts as finished.
const IDLE_POLLS_BEFORE_END: u32 = 4;

/// HTTP response payload for the receiver device list.
#[derive(Debug, serde::Deserialize)]
struct HttpDevicesResponse {
    devices: Vec<HttpDeviceInfo>,
}

/// Device info returned by the receiver HTTP API.
#[derive(Debug, serde::Deserialize, Clone)]
struct HttpDeviceInfo {
    id: String,
    name: String,
}

/// JSON payload for starting playback on the receiver.
#[derive(Debug, serde::Serialize)]
struct HttpPlayRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ext_hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BridgeTarget {
    http_addr: String,
    device: Option<String>,
}

fn parse_target(raw: &str) -> Result<BridgeTarget, TransportError> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("http://").unwrap_or(raw);
    let (addr, device) = match raw.split_once('/') {
        Some((addr, device)) => (addr, Some(device.trim_matches('/'))),
        None => (raw, None),
    };
    let valid_port = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !valid_port {
        return Err(TransportError::InvalidTarget(format!(
            "expected host:port[/device], got {raw:?}"
        )));
    }
    let device = device
        .filter(|d| !d.is_empty())
        .map(|d| urlencoding::decode(d).map(|d| d.into_owned()).unwrap_or_else(|_| d.to_string()));
    Ok(BridgeTarget {
        http_addr: addr.to_string(),
        device,
    })
}

#[derive(Debug, Default)]
struct ActivePlay {
    play_id: u64,
    started: bool,
    idle_polls: u32,
}

/// Tracks the play the session is waiting on.
#[derive(Debug, Default)]
struct PlayWatch {
    active: Option<ActivePlay>,
}

impl PlayWatch {
    fn begin(&mut self, play_id: u64) {
        self.active = Some(ActivePlay {
            play_id,
            ..ActivePlay::default()
        });
    }

    fn clear(&mut self) {
        self.active = None;
    }

    fn observe(&mut self, status: &ReceiverStatus) -> Option<TransportEvent> {
        let active = self.active.as_mut()?;
        if status.now_playing.is_some() {
            active.started = true;
            active.idle_polls = 0;
            return None;
        }
        active.idle_polls += 1;
        if !active.started && active.idle_polls < IDLE_POLLS_BEFORE_END {
            return None;
        }
        let play_id = active.play_id;
        self.active = None;
        Some(match status.end_reason {
            Some(PlaybackEndReason::Error) => TransportEvent::PlaybackError {
                play_id,
                error: "receiver reported a playback error".to_string(),
            },
            _ => TransportEvent::PlaybackComplete { play_id },
        })
    }
}

/// Transport that drives receivers over their HTTP API.
pub struct BridgeTransport {
    client: reqwest::Client,
    public_base_url: String,
    poll_interval: Duration,
}

impl BridgeTransport {
    pub fn new(public_base_url: String, settings: &TransportSettings) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| TransportError::Command(format!("http client: {e}")))?;
        Ok(Self {
            client,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            poll_interval: settings.poll_interval,
        })
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(
        &self,
        tenant_id: &str,
        target: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let parsed = parse_target(target)?;
        let url = format!("http://{}/devices", parsed.http_addr);
        let devices: HttpDevicesResponse = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| TransportError::Unreachable(format!("devices request failed: {e}")))?
            .json()
            .await
            .map_err(|e| TransportError::Unreachable(format!("devices decode failed: {e}")))?;

        let device = match parsed.device.as_deref() {
            Some(wanted) => devices
                .devices
                .iter()
                .find(|d| d.id == wanted || d.name == wanted)
                .cloned()
                .ok_or_else(|| {
                    TransportError::InvalidTarget(format!(
                        "device {wanted:?} not found on {}",
                        parsed.http_addr
                    ))
                })?,
            None => devices.devices.first().cloned().ok_or_else(|| {
                TransportError::Unreachable(format!("{} reported no output devices", parsed.http_addr))
            })?,
        };

        let url = format!("http://{}/devices/select", parsed.http_addr);
        self.client
            .post(&url)
            .json(&serde_json::json!({ "name": device.name }))
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| TransportError::Unreachable(format!("set device failed: {e}")))?;

        tracing::info!(
            tenant_id = %tenant_id,
            http_addr = %parsed.http_addr,
            device = %device.name,
            "receiver connected"
        );

        let watch = Arc::new(Mutex::new(PlayWatch::default()));
        let watcher = tokio::spawn(watch_status(
            self.client.clone(),
            parsed.http_addr.clone(),
            self.poll_interval,
            events,
            watch.clone(),
        ));
        Ok(Box::new(BridgeConnection {
            target: target.to_string(),
            http_addr: parsed.http_addr,
            client: self.client.clone(),
            public_base_url: self.public_base_url.clone(),
            watch,
            watcher: Some(watcher),
        }))
    }
}

async fn fetch_status(client: &reqwest::Client, http_addr: &str) -> Result<ReceiverStatus, reqwest::Error> {
    client
        .get(format!("http://{http_addr}/status"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

async fn watch_status(
    client: reqwest::Client,
    http_addr: String,
    poll_interval: Duration,
    events: TransportEvents,
    watch: Arc<Mutex<PlayWatch>>,
) {
    let mut online: Option<bool> = None;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if events.is_closed() {
            break;
        }
        match fetch_status(&client, &http_addr).await {
            Ok(status) => {
                if online != Some(true) {
                    online = Some(true);
                    if !events.send(TransportEvent::Ready) {
                        break;
                    }
                }
                let event = watch
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .observe(&status);
                if let Some(event) = event {
                    if !events.send(event) {
                        break;
                    }
                }
            }
            Err(err) => {
                if online != Some(false) {
                    tracing::warn!(http_addr = %http_addr, error = %err, "receiver status poll failed");
                    online = Some(false);
                    if !events.send(TransportEvent::Disconnected) {
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(http_addr = %http_addr, "receiver watcher stopped");
}

struct BridgeConnection {
    target: String,
    http_addr: String,
    client: reqwest::Client,
    public_base_url: String,
    watch: Arc<Mutex<PlayWatch>>,
    watcher: Option<JoinHandle<()>>,
}

impl BridgeConnection {
    fn watch(&self) -> std::sync::MutexGuard<'_, PlayWatch> {
        self.watch.lock().unwrap_or_else(|err| err.into_inner())
    }

    async fn post(&self, path: &str, body: Option<serde_json::Value>) -> Result<(), TransportError> {
        let url = format!("http://{}{}", self.http_addr, path);
        let mut req = self.client.post(&url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        req.send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| TransportError::Command(format!("{path} failed: {e}")))?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, TransportError> {
        fetch_status(&self.client, &self.http_addr)
            .await
            .map(|status| status.paused)
            .map_err(|e| TransportError::Command(format!("status failed: {e}")))
    }
}

#[async_trait]
impl Connection for BridgeConnection {
    fn target(&self) -> &str {
        &self.target
    }

    async fn play(&mut self, play_id: u64, path: &Path, title: &str) -> Result<(), TransportError> {
        let stream_url = format!(
            "{}/stream?path={}",
            self.public_base_url,
            urlencoding::encode(&path.to_string_lossy())
        );
        let ext_hint = path.extension().and_then(|ext| ext.to_str());
        let payload = HttpPlayRequest {
            url: &stream_url,
            ext_hint,
            title: Some(title),
        };
        let body = serde_json::to_value(&payload)
            .map_err(|e| TransportError::Command(format!("encode play request: {e}")))?;
        self.watch().begin(play_id);
        if let Err(err) = self.post("/play", Some(body)).await {
            self.watch().clear();
            return Err(err);
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), TransportError> {
        if !self.is_paused().await? {
            self.post("/pause", None).await?;
        }
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), TransportError> {
        if self.is_paused().await? {
            self.post("/pause", None).await?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        self.watch().clear();
        self.post("/stop", None).await
    }

    async fn release(&mut self) {
        self.watch().clear();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Err(err) = self.post("/stop", None).await {
            tracing::debug!(http_addr = %self.http_addr, error = %err, "stop on release failed");
        }
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing() -> ReceiverStatus {
        ReceiverStatus {
            now_playing: Some("http://hub/stream?path=a.mp3".to_string()),
            ..ReceiverStatus::default()
        }
    }

    fn ended(reason: Option<PlaybackEndReason>) -> ReceiverStatus {
        ReceiverStatus {
            paused: true,
            end_reason: reason,
            ..ReceiverStatus::default()
        }
    }

    #[test]
    fn parse_target_accepts_device_suffix() {
        assert_eq!(
            parse_target("192.168.1.20:5556/Living%20Room").expect("target"),
            BridgeTarget {
                http_addr: "192.168.1.20:5556".to_string(),
                device: Some("Living Room".to_string()),
            }
        );
        assert_eq!(
            parse_target("http://receiver.local:5556").expect("target"),
            BridgeTarget {
                http_addr: "receiver.local:5556".to_string(),
                device: None,
            }
        );
    }

    #[test]
    fn parse_target_rejects_missing_port() {
        assert!(matches!(
            parse_target("receiver.local"),
            Err(TransportError::InvalidTarget(_))
        ));
        assert!(matches!(parse_target(":5556"), Err(TransportError::InvalidTarget(_))));
    }

    #[test]
    fn watch_reports_completion_after_track_was_seen() {
        let mut watch = PlayWatch::default();
        watch.begin(3);
        assert_eq!(watch.observe(&playing()), None);
        assert_eq!(
            watch.observe(&ended(Some(PlaybackEndReason::Eof))),
            Some(TransportEvent::PlaybackComplete { play_id: 3 })
        );
        assert_eq!(watch.observe(&ended(Some(PlaybackEndReason::Eof))), None);
    }

    #[test]
    fn watch_maps_receiver_errors() {
        let mut watch = PlayWatch::default();
        watch.begin(9);
        watch.observe(&playing());
        assert!(matches!(
            watch.observe(&ended(Some(PlaybackEndReason::Error))),
            Some(TransportEvent::PlaybackError { play_id: 9, .. })
        ));
    }

    #[test]
    fn watch_waits_before_declaring_an_unseen_track_done() {
        let mut watch = PlayWatch::default();
        watch.begin(1);
        for _ in 1..IDLE_POLLS_BEFORE_END {
            assert_eq!(watch.observe(&ended(None)), None);
        }
        assert_eq!(
            watch.observe(&ended(None)),
            Some(TransportEvent::PlaybackComplete { play_id: 1 })
        );
    }

    #[test]
    fn cleared_watch_ignores_status() {
        let mut watch = PlayWatch::default();
        watch.begin(1);
        watch.observe(&playing());
        watch.clear();
        assert_eq!(watch.observe(&ended(Some(PlaybackEndReason::Stopped))), None);
    }
}
