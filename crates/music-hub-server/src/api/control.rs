//! Control bridge endpoints.
//!
//! Every request gets a `200` with a [`ControlResponse`]; failures are carried
//! in `ok = false` plus a `reason`, never as transport errors.

use actix_web::{get, post, web, HttpResponse, Responder};
use music_hub_types::{ControlInfo, ControlRequest, ControlResponse};

use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/control",
    responses(
        (status = 200, description = "Published control surface", body = ControlInfo)
    )
)]
#[get("/control")]
/// Describe the control surface: version and verbs.
pub async fn control_info(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.bridge.info())
}

#[utoipa::path(
    post,
    path = "/control",
    request_body = ControlRequest,
    responses(
        (status = 200, description = "Correlated command result", body = ControlResponse)
    )
)]
#[post("/control")]
/// Run one control command against a tenant's session.
pub async fn control_dispatch(
    state: web::Data<AppState>,
    body: web::Json<ControlRequest>,
) -> impl Responder {
    let response = state.bridge.dispatch(body.into_inner()).await;
    HttpResponse::Ok().json(response)
}
