//! Track lookups plus playlist and favorite pins.
//!
//! Tracks referenced by a playlist or favorite are never eviction candidates.

use actix_web::{delete, get, post, web, HttpResponse, Responder};
use music_hub_types::TrackSummary;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Deserialize, Serialize, ToSchema)]
pub struct PlaylistCreateRequest {
    pub name: String,
    pub owner: String,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct PlaylistCreateResponse {
    pub id: i64,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct PlaylistTrackRequest {
    pub track_id: i64,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct FavoriteRequest {
    pub user_id: String,
    pub track_id: i64,
}

const DEFAULT_SEARCH_LIMIT: u32 = 20;
const DEFAULT_POPULAR_DAYS: u32 = 7;
const DEFAULT_POPULAR_LIMIT: u32 = 10;
const MAX_LIST_LIMIT: u32 = 100;

#[derive(Deserialize, ToSchema)]
pub struct TrackSearchQuery {
    /// Substring matched against title and author.
    pub q: String,
    pub limit: Option<u32>,
}

#[derive(Deserialize, ToSchema)]
pub struct PopularQuery {
    /// Window in days over `last_played`.
    pub days: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct TrackListResponse {
    pub tracks: Vec<TrackSummary>,
}

fn list_limit(limit: Option<u32>, default: u32) -> u32 {
    limit.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
}

fn track_exists(state: &AppState, track_id: i64) -> Result<bool, HttpResponse> {
    state
        .files
        .store()
        .find_by_id(track_id)
        .map(|track| track.is_some())
        .map_err(|err| HttpResponse::InternalServerError().body(err.to_string()))
}

#[utoipa::path(
    get,
    path = "/tracks/search",
    params(
        ("q" = String, Query, description = "Text matched against title or author"),
        ("limit" = Option<u32>, Query, description = "Max results (default 20)")
    ),
    responses(
        (status = 200, description = "Matching live tracks, most played first", body = TrackListResponse),
        (status = 400, description = "Empty query")
    )
)]
#[get("/tracks/search")]
/// Search live tracks by title or author.
pub async fn tracks_search(
    state: web::Data<AppState>,
    query: web::Query<TrackSearchQuery>,
) -> impl Responder {
    let text = query.q.trim();
    if text.is_empty() {
        return HttpResponse::BadRequest().body("q is required");
    }
    let limit = list_limit(query.limit, DEFAULT_SEARCH_LIMIT);
    match state.files.store().search(text, limit) {
        Ok(tracks) => HttpResponse::Ok().json(TrackListResponse {
            tracks: tracks.iter().map(|t| t.summary()).collect(),
        }),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[utoipa::path(
    get,
    path = "/tracks/popular",
    params(
        ("days" = Option<u32>, Query, description = "Play window in days (default 7)"),
        ("limit" = Option<u32>, Query, description = "Max results (default 10)")
    ),
    responses(
        (status = 200, description = "Most played live tracks in the window", body = TrackListResponse)
    )
)]
#[get("/tracks/popular")]
/// Most played tracks over the last few days.
pub async fn tracks_popular(
    state: web::Data<AppState>,
    query: web::Query<PopularQuery>,
) -> impl Responder {
    let days = query.days.unwrap_or(DEFAULT_POPULAR_DAYS);
    let limit = list_limit(query.limit, DEFAULT_POPULAR_LIMIT);
    match state.files.store().popular(days, limit) {
        Ok(tracks) => HttpResponse::Ok().json(TrackListResponse {
            tracks: tracks.iter().map(|t| t.summary()).collect(),
        }),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/playlists",
    request_body = PlaylistCreateRequest,
    responses(
        (status = 200, description = "Playlist created", body = PlaylistCreateResponse),
        (status = 400, description = "Invalid request")
    )
)]
#[post("/playlists")]
/// Create an empty playlist.
pub async fn playlists_create(
    state: web::Data<AppState>,
    body: web::Json<PlaylistCreateRequest>,
) -> impl Responder {
    let name = body.name.trim();
    let owner = body.owner.trim();
    if name.is_empty() || owner.is_empty() {
        return HttpResponse::BadRequest().body("name and owner are required");
    }
    match state.files.store().create_playlist(name, owner) {
        Ok(id) => HttpResponse::Ok().json(PlaylistCreateResponse { id }),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/playlists/{id}/tracks",
    params(
        ("id" = i64, Path, description = "Playlist id")
    ),
    request_body = PlaylistTrackRequest,
    responses(
        (status = 200, description = "Track added"),
        (status = 404, description = "Unknown track or playlist")
    )
)]
#[post("/playlists/{id}/tracks")]
/// Add a track to a playlist.
pub async fn playlist_tracks_add(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<PlaylistTrackRequest>,
) -> impl Responder {
    let playlist_id = path.into_inner();
    match track_exists(&state, body.track_id) {
        Ok(true) => {}
        Ok(false) => return HttpResponse::NotFound().body("unknown track"),
        Err(resp) => return resp,
    }
    match state.files.store().add_to_playlist(playlist_id, body.track_id) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => {
            tracing::debug!(playlist_id, track_id = body.track_id, error = %err, "add to playlist failed");
            HttpResponse::NotFound().body("unknown playlist")
        }
    }
}

#[utoipa::path(
    delete,
    path = "/playlists/{id}/tracks/{track_id}",
    params(
        ("id" = i64, Path, description = "Playlist id"),
        ("track_id" = i64, Path, description = "Track id")
    ),
    responses(
        (status = 200, description = "Track removed (or was not present)")
    )
)]
#[delete("/playlists/{id}/tracks/{track_id}")]
/// Remove a track from a playlist.
pub async fn playlist_tracks_remove(
    state: web::Data<AppState>,
    path: web::Path<(i64, i64)>,
) -> impl Responder {
    let (playlist_id, track_id) = path.into_inner();
    match state.files.store().remove_from_playlist(playlist_id, track_id) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/favorites",
    request_body = FavoriteRequest,
    responses(
        (status = 200, description = "Favorite recorded"),
        (status = 404, description = "Unknown track")
    )
)]
#[post("/favorites")]
/// Mark a track as a user's favorite.
pub async fn favorites_add(
    state: web::Data<AppState>,
    body: web::Json<FavoriteRequest>,
) -> impl Responder {
    let user_id = body.user_id.trim();
    if user_id.is_empty() {
        return HttpResponse::BadRequest().body("user_id is required");
    }
    match track_exists(&state, body.track_id) {
        Ok(true) => {}
        Ok(false) => return HttpResponse::NotFound().body("unknown track"),
        Err(resp) => return resp,
    }
    match state.files.store().add_favorite(user_id, body.track_id) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[utoipa::path(
    delete,
    path = "/favorites/{user_id}/{track_id}",
    params(
        ("user_id" = String, Path, description = "User id"),
        ("track_id" = i64, Path, description = "Track id")
    ),
    responses(
        (status = 200, description = "Favorite removed (or was not present)")
    )
)]
#[delete("/favorites/{user_id}/{track_id}")]
pub async fn favorites_remove(
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
) -> impl Responder {
    let (user_id, track_id) = path.into_inner();
    match state.files.store().remove_favorite(&user_id, track_id) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}
