use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::health::health,
        api::control::control_info,
        api::control::control_dispatch,
        api::sessions::sessions_list,
        api::storage::storage_report,
        api::storage::storage_sweep,
        api::storage::storage_quota_sweep,
        api::storage::storage_reconcile,
        api::library::tracks_search,
        api::library::tracks_popular,
        api::streams::stream_asset,
        api::library::playlists_create,
        api::library::playlist_tracks_add,
        api::library::playlist_tracks_remove,
        api::library::favorites_add,
        api::library::favorites_remove,
    ),
    components(
        schemas(
            api::health::HealthResponse,
            api::sessions::SessionsListResponse,
            api::streams::StreamQuery,
            api::library::PlaylistCreateRequest,
            api::library::PlaylistCreateResponse,
            api::library::PlaylistTrackRequest,
            api::library::FavoriteRequest,
            api::library::TrackSearchQuery,
            api::library::PopularQuery,
            api::library::TrackListResponse,
            music_hub_types::ControlVerb,
            music_hub_types::ControlArgs,
            music_hub_types::ControlRequest,
            music_hub_types::ControlResponse,
            music_hub_types::ControlInfo,
            music_hub_types::SessionState,
            music_hub_types::TrackSummary,
            music_hub_types::QueueEntrySummary,
            music_hub_types::QueueSnapshot,
            music_hub_types::EnqueueOutcome,
            music_hub_types::LoopState,
            music_hub_types::SweepReport,
            music_hub_types::SweepFailure,
            music_hub_types::QuotaSweepReport,
            music_hub_types::StorageReport,
            music_hub_types::ReconcileReport,
        )
    ),
    tags(
        (name = "music-hub-server", description = "Music session engine control API")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_control_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/control"));
        assert!(doc.paths.paths.contains_key("/storage/quota-sweep"));
        assert!(doc.paths.paths.contains_key("/storage/reconcile"));
        assert!(doc.paths.paths.contains_key("/tracks/search"));
    }
}
