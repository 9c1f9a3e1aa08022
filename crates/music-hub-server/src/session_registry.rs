//! Tenant to session mapping.
//!
//! At most one live session per tenant. Sessions unregister themselves when
//! they tear down; a removal only takes effect if the mapping still points at
//! the session asking for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::{self, SessionContext, SessionHandle};

pub(crate) struct RegistryInner {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    ctx: Arc<SessionContext>,
    runtime: tokio::runtime::Handle,
}

impl RegistryInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn remove_session(&self, tenant_id: &str, session_id: &str) {
        let mut sessions = self.lock();
        if sessions
            .get(tenant_id)
            .is_some_and(|handle| handle.session_id() == session_id)
        {
            sessions.remove(tenant_id);
            tracing::debug!(tenant_id = %tenant_id, session_id = %session_id, "session unregistered");
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Must be called from inside a tokio runtime; sessions run on it.
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                ctx,
                runtime: tokio::runtime::Handle::current(),
            }),
        }
    }

    #[cfg(test)]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.inner.ctx
    }

    /// Return the tenant's session, creating an idle one if needed.
    pub fn get_or_create(&self, tenant_id: &str) -> SessionHandle {
        let mut sessions = self.inner.lock();
        if let Some(handle) = sessions.get(tenant_id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        let handle = session::spawn(
            tenant_id,
            self.inner.ctx.clone(),
            Arc::downgrade(&self.inner),
            &self.inner.runtime,
        );
        sessions.insert(tenant_id.to_string(), handle.clone());
        handle
    }

    pub fn get(&self, tenant_id: &str) -> Option<SessionHandle> {
        self.inner
            .lock()
            .get(tenant_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Unmap the tenant's session. The session tears itself down once the
    /// last outstanding handle is dropped.
    pub fn remove(&self, tenant_id: &str) -> Option<SessionHandle> {
        self.inner.lock().remove(tenant_id)
    }

    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.inner.lock().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<SessionHandle> = self
            .inner
            .lock()
            .values()
            .filter(|handle| !handle.is_closed())
            .cloned()
            .collect();
        handles.sort_by(|a, b| a.tenant_id().cmp(b.tenant_id()));
        handles
    }

    /// Leave every session; used on shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.inner.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(err) = handle.leave().await {
                tracing::debug!(tenant_id = %handle.tenant_id(), error = %err, "session already gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::acquisition::tests::{asset_files, FakeResolver};
    use crate::acquisition::AcquisitionPipeline;
    use crate::config::SessionSettings;
    use crate::events::EventBus;
    use crate::transport::mock::MockTransport;

    fn registry() -> (tempfile::TempDir, SessionRegistry, MockTransport) {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = asset_files(dir.path());
        let resolver = FakeResolver::new(dir.path().join("downloads"));
        let transport = MockTransport::new();
        let ctx = Arc::new(SessionContext {
            pipeline: Arc::new(AcquisitionPipeline::new(Arc::new(resolver), files.clone(), 2)),
            files,
            transport: Arc::new(transport.clone()),
            events: EventBus::new(),
            settings: SessionSettings::default(),
        });
        (dir, SessionRegistry::new(ctx), transport)
    }

    #[tokio::test]
    async fn one_session_per_tenant() {
        let (_dir, registry, _) = registry();
        let a = registry.get_or_create("g1");
        let b = registry.get_or_create("g1");
        let c = registry.get_or_create("g2");
        assert_eq!(a.session_id(), b.session_id());
        assert_ne!(a.session_id(), c.session_id());
        assert_eq!(registry.tenants(), vec!["g1".to_string(), "g2".to_string()]);
    }

    #[tokio::test]
    async fn get_does_not_create() {
        let (_dir, registry, _) = registry();
        assert!(registry.get("g1").is_none());
        assert!(registry.tenants().is_empty());
    }

    #[tokio::test]
    async fn stale_removal_leaves_new_session_alone() {
        let (_dir, registry, _) = registry();
        let old = registry.get_or_create("g1");
        old.join("room").await.expect("join");
        old.leave().await.expect("leave");

        let fresh = registry.get_or_create("g1");
        assert_ne!(old.session_id(), fresh.session_id());
        registry
            .inner
            .remove_session("g1", old.session_id());
        assert_eq!(
            registry.get("g1").map(|h| h.session_id().to_string()),
            Some(fresh.session_id().to_string())
        );
    }

    #[tokio::test]
    async fn removed_session_shuts_down_after_handles_drop() {
        let (_dir, registry, transport) = registry();
        let handle = registry.get_or_create("g1");
        handle.join("room").await.expect("join");
        let removed = registry.remove("g1").expect("mapped");
        drop(removed);
        let extra = handle.clone();
        drop(handle);
        assert!(!extra.is_closed());
        drop(extra);

        for _ in 0..100 {
            if transport.calls().contains(&"release".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(transport.calls().contains(&"release".to_string()));
    }

    #[tokio::test]
    async fn shutdown_all_leaves_every_session() {
        let (_dir, registry, transport) = registry();
        registry.get_or_create("g1").join("a").await.expect("join");
        registry.get_or_create("g2").join("b").await.expect("join");
        registry.shutdown_all().await;
        assert!(registry.tenants().is_empty());
        let releases = transport
            .calls()
            .iter()
            .filter(|call| call.as_str() == "release")
            .count();
        assert_eq!(releases, 2);
    }
}
