//! Actix server startup + app wiring.
//!
//! Builds the engine (store, pipeline, registry, bridge, reclaimer), routes,
//! middleware, and OpenAPI endpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::dev::{Service, ServiceRequest, ServiceResponse};
use actix_web::{App, Error, HttpServer, web};
use anyhow::Result;
use futures_util::future::{ok, LocalBoxFuture, Ready};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::acquisition::AcquisitionPipeline;
use crate::api;
use crate::asset_store::AssetStore;
use crate::assets::AssetFiles;
use crate::bridge_transport::BridgeTransport;
use crate::config;
use crate::control_bridge::ControlBridge;
use crate::events::{spawn_status_logger, EventBus};
use crate::openapi;
use crate::reclamation::{spawn_schedules, Reclaimer};
use crate::resolver::CommandResolver;
use crate::session::SessionContext;
use crate::session_registry::SessionRegistry;
use crate::state::AppState;

/// Build server state and start the Actix HTTP server.
pub(crate) async fn run(args: crate::Args) -> Result<()> {
    let cfg = load_config(args.config.as_ref())?;
    let bind = resolve_bind(args.bind, &cfg)?;
    let public_base_url = config::public_base_url_from_config(&cfg, bind)?;
    let asset_dir = resolve_asset_dir(args.asset_dir, &cfg)?;
    let db_path = config::db_path_from_config(&cfg, &asset_dir);
    let resolver_settings = config::resolver_from_config(&cfg)?;
    let session_settings = config::sessions_from_config(&cfg)?;
    let storage_settings = config::storage_from_config(&cfg)?;
    let transport_settings = config::transport_from_config(&cfg);
    tracing::info!(
        bind = %bind,
        public_base_url = %public_base_url,
        asset_dir = %asset_dir.display(),
        db_path = %db_path.display(),
        resolver = %resolver_settings.program,
        max_concurrent_acquisitions = session_settings.max_concurrent_acquisitions,
        quota_bytes = storage_settings.quota_bytes,
        "starting music-hub-server"
    );

    let store = AssetStore::open(&db_path)?;
    let files = Arc::new(AssetFiles::new(asset_dir, store)?);
    let pipeline = Arc::new(AcquisitionPipeline::new(
        Arc::new(CommandResolver::new(resolver_settings)),
        files.clone(),
        session_settings.max_concurrent_acquisitions,
    ));
    let transport = Arc::new(BridgeTransport::new(public_base_url, &transport_settings)?);

    let events = EventBus::new();
    spawn_status_logger(&events);
    let registry = SessionRegistry::new(Arc::new(SessionContext {
        pipeline: pipeline.clone(),
        files: files.clone(),
        transport,
        events,
        settings: session_settings,
    }));
    let bridge = Arc::new(ControlBridge::publish(registry.clone(), pipeline));
    tracing::info!(
        version = bridge.info().version,
        verbs = ?bridge.info().verbs,
        "control bridge published"
    );

    let reclaimer = Arc::new(Reclaimer::new(files.clone(), storage_settings));
    spawn_schedules(reclaimer.clone());

    let state = web::Data::new(AppState::new(bridge, registry.clone(), reclaimer, files));
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(FilteredLogger)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-doc/openapi.json", openapi::ApiDoc::openapi()),
            )
            .service(api::health::health)
            .service(api::control::control_info)
            .service(api::control::control_dispatch)
            .service(api::sessions::sessions_list)
            .service(api::storage::storage_report)
            .service(api::storage::storage_sweep)
            .service(api::storage::storage_quota_sweep)
            .service(api::storage::storage_reconcile)
            .service(api::library::tracks_search)
            .service(api::library::tracks_popular)
            .service(api::streams::stream_asset)
            .service(api::library::playlists_create)
            .service(api::library::playlist_tracks_add)
            .service(api::library::playlist_tracks_remove)
            .service(api::library::favorites_add)
            .service(api::library::favorites_remove)
    })
    .disable_signals()
    .bind(bind)?
    .run();

    setup_shutdown(registry, server.handle())?;
    server.await?;
    tracing::info!("music-hub-server stopped");
    Ok(())
}

/// On Ctrl-C, leave every session (releasing connections and files), then stop.
fn setup_shutdown(registry: SessionRegistry, server: actix_web::dev::ServerHandle) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    tokio::spawn(async move {
        if rx.recv().await.is_some() {
            tracing::info!(tenants = ?registry.tenants(), "shutdown requested");
            registry.shutdown_all().await;
            server.stop(true).await;
        }
    });
    Ok(())
}

/// Return true when the request path should be logged.
fn should_log_path(path: &str) -> bool {
    !(path == "/stream" || path == "/health" || path.starts_with("/swagger-ui"))
}

/// Actix middleware that filters noisy paths from logging.
struct FilteredLogger;

impl<S, B> actix_web::dev::Transform<S, ServiceRequest> for FilteredLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = FilteredLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(FilteredLoggerMiddleware { service })
    }
}

/// Service wrapper that applies the logging filter.
struct FilteredLoggerMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for FilteredLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let path = req.path().to_string();
        let should_log = should_log_path(&path);
        let method = req.method().clone();
        let peer = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("-")
            .to_string();
        let start = std::time::Instant::now();
        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            if should_log {
                tracing::info!(
                    method = %method,
                    path = %path,
                    status = %res.status().as_u16(),
                    peer = %peer,
                    elapsed_ms = %start.elapsed().as_millis(),
                    "http request"
                );
            }
            Ok(res)
        })
    }
}

/// Load server config from `--config` or `config.toml` beside the binary.
fn load_config(path: Option<&PathBuf>) -> Result<config::ServerConfig> {
    if let Some(path) = path {
        return config::ServerConfig::load(path);
    }
    let auto_path = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("config.toml")));
    match auto_path {
        Some(path) if path.exists() => config::ServerConfig::load(&path),
        _ => Err(anyhow::anyhow!("config file is required; use --config")),
    }
}

/// Resolve the final bind address from args + config.
fn resolve_bind(
    bind: Option<std::net::SocketAddr>,
    cfg: &config::ServerConfig,
) -> Result<std::net::SocketAddr> {
    Ok(match bind {
        Some(addr) => addr,
        None => config::bind_from_config(cfg)?
            .unwrap_or_else(|| std::net::SocketAddr::from(([0, 0, 0, 0], 8080))),
    })
}

/// Resolve the asset directory from args + config.
fn resolve_asset_dir(dir: Option<PathBuf>, cfg: &config::ServerConfig) -> Result<PathBuf> {
    Ok(match dir {
        Some(dir) => dir,
        None => config::asset_dir_from_config(cfg)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noisy_paths_are_not_logged() {
        assert!(!should_log_path("/stream"));
        assert!(!should_log_path("/health"));
        assert!(!should_log_path("/swagger-ui/index.html"));
        assert!(should_log_path("/control"));
        assert!(should_log_path("/storage/sweep"));
    }

    #[test]
    fn explicit_bind_wins_over_config() {
        let cfg = config::ServerConfig {
            bind: Some("127.0.0.1:9000".to_string()),
            ..config::ServerConfig::default()
        };
        let explicit: std::net::SocketAddr = "127.0.0.1:7000".parse().expect("addr");
        assert_eq!(resolve_bind(Some(explicit), &cfg).expect("bind"), explicit);
        assert_eq!(
            resolve_bind(None, &cfg).expect("bind").port(),
            9000
        );
        assert_eq!(
            resolve_bind(None, &config::ServerConfig::default())
                .expect("bind")
                .port(),
            8080
        );
    }

    #[test]
    fn load_config_reports_missing_file() {
        let missing = PathBuf::from("/definitely/not/here/config.toml");
        let err = load_config(Some(&missing)).expect_err("missing");
        assert!(err.to_string().contains("read config"));
    }
}
