//! Session listing.

use actix_web::{get, web, HttpResponse, Responder};
use music_hub_types::QueueSnapshot;
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Serialize, ToSchema)]
pub struct SessionsListResponse {
    pub sessions: Vec<QueueSnapshot>,
}

#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Live sessions", body = SessionsListResponse)
    )
)]
#[get("/sessions")]
/// Snapshot every live session.
pub async fn sessions_list(state: web::Data<AppState>) -> impl Responder {
    let mut sessions = Vec::new();
    for handle in state.registry.handles() {
        match handle.snapshot().await {
            Ok(snapshot) => sessions.push(snapshot),
            Err(err) => {
                tracing::debug!(tenant_id = %handle.tenant_id(), error = %err, "session vanished while listing");
            }
        }
    }
    HttpResponse::Ok().json(SessionsListResponse { sessions })
}
