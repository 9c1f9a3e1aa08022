//! Control bridge.
//!
//! A versioned table of verb handlers published once at startup. Controllers
//! reach it over HTTP (`POST /control`) or in-process through [`ControlBridge::dispatch`];
//! either way every call gets exactly one [`ControlResponse`]. Handlers only
//! translate arguments and forward to the tenant's session, which stays the
//! single owner of playback state.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use music_hub_types::{
    ControlArgs, ControlInfo, ControlRequest, ControlResponse, ControlVerb, LoopState,
    CONTROL_BRIDGE_VERSION,
};

use crate::acquisition::AcquisitionPipeline;
use crate::error::EngineError;
use crate::session::{AcquireTicket, SessionHandle};
use crate::session_registry::SessionRegistry;

pub type HandlerResult = Result<Option<Value>, EngineError>;

/// `(tenant_id, args) -> result`.
pub type ControlHandler =
    Arc<dyn Fn(String, ControlArgs) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

const DEFAULT_REQUESTER: &str = "controller";

pub struct ControlBridge {
    version: u32,
    handlers: HashMap<ControlVerb, ControlHandler>,
}

impl ControlBridge {
    /// Build the handler table over the given registry and pipeline.
    pub fn publish(registry: SessionRegistry, pipeline: Arc<AcquisitionPipeline>) -> Self {
        let mut handlers: HashMap<ControlVerb, ControlHandler> = HashMap::new();
        for verb in ControlVerb::ALL {
            let registry = registry.clone();
            let pipeline = pipeline.clone();
            let handler: ControlHandler = Arc::new(move |tenant_id, args| {
                handle(verb, registry.clone(), pipeline.clone(), tenant_id, args).boxed()
            });
            handlers.insert(verb, handler);
        }
        Self {
            version: CONTROL_BRIDGE_VERSION,
            handlers,
        }
    }

    pub fn info(&self) -> ControlInfo {
        let mut verbs: Vec<ControlVerb> = self.handlers.keys().copied().collect();
        verbs.sort_by_key(|verb| verb.as_str());
        ControlInfo {
            version: self.version,
            verbs,
        }
    }

    /// Run one request to completion and report the outcome.
    pub async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        let ControlRequest {
            tenant_id,
            verb,
            args,
            version,
        } = request;
        if let Some(version) = version.filter(|v| *v != self.version) {
            return ControlResponse::fail(format!(
                "unsupported_version: controller speaks v{version}, bridge is v{}",
                self.version
            ));
        }
        let tenant_id = tenant_id.trim().to_string();
        if tenant_id.is_empty() {
            return ControlResponse::fail(
                EngineError::BadRequest("tenant_id is required".to_string()).to_string(),
            );
        }
        let Some(handler) = self.handlers.get(&verb) else {
            return ControlResponse::fail(format!("unknown_verb: {verb}"));
        };

        let started = std::time::Instant::now();
        match handler(tenant_id.clone(), args).await {
            Ok(data) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    verb = %verb,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "control request ok"
                );
                ControlResponse::ok(data)
            }
            Err(err) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    verb = %verb,
                    code = err.code(),
                    error = %err,
                    "control request failed"
                );
                ControlResponse::fail(err.to_string())
            }
        }
    }
}

fn existing(registry: &SessionRegistry, tenant_id: &str) -> Result<SessionHandle, EngineError> {
    registry
        .get(tenant_id)
        .ok_or_else(|| EngineError::no_session(tenant_id))
}

fn to_data<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|err| EngineError::Persistence(format!("encode response: {err}")))
}

fn required(value: Option<String>, name: &str) -> Result<String, EngineError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::BadRequest(format!("{name} is required")))
}

async fn handle(
    verb: ControlVerb,
    registry: SessionRegistry,
    pipeline: Arc<AcquisitionPipeline>,
    tenant_id: String,
    args: ControlArgs,
) -> HandlerResult {
    match verb {
        ControlVerb::Join => {
            let target = required(args.target, "target")?;
            let session = registry.get_or_create(&tenant_id);
            session.join(&target).await?;
            to_data(&session.snapshot().await?)
        }
        ControlVerb::Leave => {
            existing(&registry, &tenant_id)?.leave().await?;
            Ok(None)
        }
        ControlVerb::Play => play(&registry, &pipeline, &tenant_id, args).await,
        ControlVerb::Pause => {
            existing(&registry, &tenant_id)?.pause().await?;
            Ok(None)
        }
        ControlVerb::Resume => {
            existing(&registry, &tenant_id)?.resume().await?;
            Ok(None)
        }
        ControlVerb::Skip => {
            existing(&registry, &tenant_id)?.skip().await?;
            Ok(None)
        }
        ControlVerb::Stop => {
            let cleared = existing(&registry, &tenant_id)?.stop().await?;
            to_data(&serde_json::json!({ "cleared": cleared }))
        }
        ControlVerb::LoopToggle => {
            let loop_enabled = existing(&registry, &tenant_id)?.toggle_loop().await?;
            to_data(&LoopState { loop_enabled })
        }
        ControlVerb::Shuffle => {
            let session = existing(&registry, &tenant_id)?;
            session.shuffle().await?;
            to_data(&session.snapshot().await?)
        }
        ControlVerb::QueueQuery => to_data(&existing(&registry, &tenant_id)?.snapshot().await?),
        ControlVerb::NowPlaying => {
            to_data(&existing(&registry, &tenant_id)?.now_playing().await?)
        }
    }
}

/// Acquire outside the session, then hand the track over with the ticket.
async fn play(
    registry: &SessionRegistry,
    pipeline: &AcquisitionPipeline,
    tenant_id: &str,
    args: ControlArgs,
) -> HandlerResult {
    let query = required(args.query, "query")?;
    let requested_by = args
        .requested_by
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_REQUESTER.to_string());
    let target = args
        .target
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let first = registry.get_or_create(tenant_id);
    let (session, ticket) = reserve_slot(registry, first, tenant_id, target.as_deref()).await?;
    match pipeline.acquire(&query, &requested_by).await {
        Ok(acquired) => {
            let outcome = session.enqueue(ticket, acquired, &requested_by).await?;
            to_data(&outcome)
        }
        Err(err) => {
            session.abandon(ticket).await;
            Err(err)
        }
    }
}

/// Join if asked and reserve an acquisition slot. A session reaped between
/// lookup and reservation is replaced once.
async fn reserve_slot(
    registry: &SessionRegistry,
    session: SessionHandle,
    tenant_id: &str,
    target: Option<&str>,
) -> Result<(SessionHandle, AcquireTicket), EngineError> {
    match join_and_reserve(&session, target).await {
        Err(EngineError::NotReady(_)) => {
            tracing::debug!(tenant_id, session_id = %session.session_id(), "session reaped before reserve; retrying");
            let session = registry.get_or_create(tenant_id);
            let ticket = join_and_reserve(&session, target).await?;
            Ok((session, ticket))
        }
        Err(err) => Err(err),
        Ok(ticket) => Ok((session, ticket)),
    }
}

async fn join_and_reserve(
    session: &SessionHandle,
    target: Option<&str>,
) -> Result<AcquireTicket, EngineError> {
    if let Some(target) = target {
        let connected = session.snapshot().await?.connected;
        if !connected {
            session.join(target).await?;
        }
    }
    session.reserve().await
}
