//! Shared application state.
//!
//! Everything the HTTP handlers need; the engine pieces own their own locking.

use std::sync::Arc;

use crate::assets::AssetFiles;
use crate::control_bridge::ControlBridge;
use crate::reclamation::Reclaimer;
use crate::session_registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<ControlBridge>,
    pub registry: SessionRegistry,
    pub reclaimer: Arc<Reclaimer>,
    pub files: Arc<AssetFiles>,
}

impl AppState {
    pub fn new(
        bridge: Arc<ControlBridge>,
        registry: SessionRegistry,
        reclaimer: Arc<Reclaimer>,
        files: Arc<AssetFiles>,
    ) -> Self {
        Self {
            bridge,
            registry,
            reclaimer,
            files,
        }
    }
}
