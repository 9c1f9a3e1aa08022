//! Storage usage and reclamation endpoints.

use actix_web::{get, post, web, HttpResponse, Responder};
use music_hub_types::{QuotaSweepReport, ReconcileReport, StorageReport, SweepReport};

use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/storage",
    responses(
        (status = 200, description = "Disk usage against quota", body = StorageReport),
        (status = 500, description = "Usage could not be measured")
    )
)]
#[get("/storage")]
/// Report disk usage, quota, and track counts.
pub async fn storage_report(state: web::Data<AppState>) -> impl Responder {
    match state.reclaimer.storage_report().await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/storage/sweep",
    responses(
        (status = 200, description = "Retention sweep result", body = SweepReport),
        (status = 500, description = "Sweep could not start")
    )
)]
#[post("/storage/sweep")]
/// Run the retention sweep now.
pub async fn storage_sweep(state: web::Data<AppState>) -> impl Responder {
    match state.reclaimer.sweep().await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/storage/quota-sweep",
    responses(
        (status = 200, description = "Quota sweep result", body = QuotaSweepReport),
        (status = 500, description = "Sweep could not start")
    )
)]
#[post("/storage/quota-sweep")]
/// Run the quota check now, evicting if usage is above the threshold.
pub async fn storage_quota_sweep(state: web::Data<AppState>) -> impl Responder {
    match state.reclaimer.quota_sweep().await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/storage/reconcile",
    responses(
        (status = 200, description = "Rows whose file was missing", body = ReconcileReport),
        (status = 500, description = "Reconcile failed")
    )
)]
#[post("/storage/reconcile")]
/// Soft-delete live, unpinned, idle tracks whose file is gone.
pub async fn storage_reconcile(state: web::Data<AppState>) -> impl Responder {
    match state.files.reconcile().await {
        Ok(marked_deleted) => {
            tracing::info!(marked_deleted, "reconciled asset db with disk");
            HttpResponse::Ok().json(ReconcileReport { marked_deleted })
        }
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}
