//! Asset streaming for playback receivers.

use actix_files::NamedFile;
use actix_web::{get, web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::state::AppState;

/// Query parameters for stream requests.
#[derive(Deserialize, ToSchema)]
pub struct StreamQuery {
    /// Asset path, absolute or relative to the asset directory.
    pub path: String,
}

#[utoipa::path(
    get,
    path = "/stream",
    params(
        ("path" = String, Query, description = "Asset path under the asset directory")
    ),
    responses(
        (status = 200, description = "Full file stream"),
        (status = 206, description = "Partial content"),
        (status = 404, description = "No live track at that path"),
        (status = 500, description = "Asset db unavailable")
    )
)]
#[get("/stream")]
/// Stream a live track's asset with HTTP range support.
pub async fn stream_asset(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<StreamQuery>,
) -> impl Responder {
    let path = match state.files.resolve_stream_path(&query.path) {
        Ok(Some(path)) => path,
        Ok(None) => return HttpResponse::NotFound().finish(),
        Err(err) => return HttpResponse::InternalServerError().body(err.to_string()),
    };
    match NamedFile::open_async(&path).await {
        Ok(file) => file.use_etag(false).into_response(&req),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "stream open failed");
            HttpResponse::NotFound().finish()
        }
    }
}
