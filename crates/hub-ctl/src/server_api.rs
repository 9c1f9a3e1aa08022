use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use music_hub_types::{ControlInfo, ControlRequest, ControlResponse};

/// `play` waits on the resolver download, so allow it plenty of time.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(180);

pub(crate) fn control_info(server: &str) -> Result<ControlInfo> {
    let url = endpoint(server, "control");
    read_json(ureq::get(&url).call().context("request /control")?, "control")
}

pub(crate) fn dispatch(server: &str, request: &ControlRequest) -> Result<ControlResponse> {
    let url = endpoint(server, "control");
    let resp = ureq::post(&url)
        .config()
        .timeout_global(Some(CONTROL_TIMEOUT))
        .build()
        .send_json(request)
        .with_context(|| format!("request /control ({})", request.verb))?;
    read_json(resp, "control")
}

pub(crate) fn sessions(server: &str) -> Result<serde_json::Value> {
    let url = endpoint(server, "sessions");
    let body: serde_json::Value =
        read_json(ureq::get(&url).call().context("request /sessions")?, "sessions")?;
    Ok(body
        .get("sessions")
        .cloned()
        .unwrap_or(serde_json::Value::Array(Vec::new())))
}

fn endpoint(server: &str, path: &str) -> String {
    format!("{}/{path}", server.trim_end_matches('/'))
}

fn read_json<T: DeserializeOwned>(
    mut resp: ureq::http::Response<ureq::Body>,
    label: &str,
) -> Result<T> {
    let body = resp
        .body_mut()
        .read_to_string()
        .with_context(|| format!("read /{label} response body"))?;
    serde_json::from_str(&body).with_context(|| format!("decode /{label} response"))
}
