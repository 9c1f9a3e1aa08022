//! SQLite asset store for acquired tracks.
//!
//! Owns the `tracks` table plus the playlist/favorite relations that pin a
//! track against eviction. One live row per source id is enforced by a partial
//! unique index, so a soft-deleted track can be acquired again later.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use music_hub_types::TrackSummary;

const SCHEMA_VERSION: i32 = 1;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

const TRACK_COLUMNS: &str = "t.id, t.source_id, t.title, t.author, t.duration_seconds, \
    t.thumbnail_url, t.source_url, t.file_path, t.file_size_bytes, t.play_count, \
    t.last_played_at_ms, t.created_at_ms, t.is_deleted, t.added_by";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("live track already exists for source id {0}")]
    DuplicateSourceId(String),
    #[error("track {0} not found")]
    NotFound(i64),
    #[error("asset db pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("asset db: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("asset db setup: {0}")]
    Setup(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A persisted track.
///
/// `is_deleted` marks the row as history only. A live row may still have no
/// file on disk: post-playback reclamation removes the file but keeps the row,
/// and the next acquisition of the same source restores the file in place.
/// Reconciliation soft-deletes live rows whose file went missing, except
/// pinned or in-use ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: i64,
    pub source_id: String,
    pub title: String,
    pub author: String,
    pub duration_seconds: u32,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
    pub file_path: PathBuf,
    pub file_size_bytes: u64,
    pub play_count: i64,
    pub last_played_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub is_deleted: bool,
    pub added_by: Option<String>,
}

impl Track {
    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            id: self.id,
            source_id: self.source_id.clone(),
            title: self.title.clone(),
            author: self.author.clone(),
            duration_seconds: self.duration_seconds,
            thumbnail_url: self.thumbnail_url.clone(),
            source_url: self.source_url.clone(),
        }
    }
}

/// Fields needed to register a freshly acquired track.
#[derive(Debug, Clone)]
pub struct NewTrack {
    pub source_id: String,
    pub title: String,
    pub author: String,
    pub duration_seconds: u32,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
    pub file_path: PathBuf,
    pub file_size_bytes: u64,
    pub added_by: Option<String>,
}

/// Live and soft-deleted row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackCounts {
    pub active: i64,
    pub deleted: i64,
}

#[derive(Clone)]
pub struct AssetStore {
    pool: Pool<SqliteConnectionManager>,
}

fn map_track_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Track> {
    let file_path: String = row.get(7)?;
    let file_size: i64 = row.get(8)?;
    let duration: i64 = row.get(4)?;
    let is_deleted: i64 = row.get(12)?;
    Ok(Track {
        id: row.get(0)?,
        source_id: row.get(1)?,
        title: row.get(2)?,
        author: row.get(3)?,
        duration_seconds: duration.max(0) as u32,
        thumbnail_url: row.get(5)?,
        source_url: row.get(6)?,
        file_path: PathBuf::from(file_path),
        file_size_bytes: file_size.max(0) as u64,
        play_count: row.get(9)?,
        last_played_at_ms: row.get(10)?,
        created_at_ms: row.get(11)?,
        is_deleted: is_deleted != 0,
        added_by: row.get(13)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl AssetStore {
    /// Open (or create) the store at `db_path`.
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Setup(format!("create db dir {:?}: {e}", parent)))?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            Ok(())
        });
        Self::from_manager(manager, 4)
    }

    /// Private in-memory store; a single pooled connection keeps one database.
    #[cfg(test)]
    pub fn open_in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });
        Self::from_manager(manager, 1)
    }

    fn from_manager(manager: SqliteConnectionManager, max_size: u32) -> StoreResult<Self> {
        let pool = Pool::builder().max_size(max_size).build(manager)?;
        {
            let conn = pool.get()?;
            init_schema(&conn)?;
        }
        Ok(Self { pool })
    }

    pub fn find_by_source_id(&self, source_id: &str) -> StoreResult<Option<Track>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {TRACK_COLUMNS} FROM tracks t WHERE t.source_id = ?1 AND t.is_deleted = 0"
        );
        let track = conn
            .query_row(&sql, params![source_id], map_track_row)
            .optional()?;
        Ok(track)
    }

    pub fn find_by_id(&self, id: i64) -> StoreResult<Option<Track>> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks t WHERE t.id = ?1");
        let track = conn.query_row(&sql, params![id], map_track_row).optional()?;
        Ok(track)
    }

    /// Insert a new live track; fails with `DuplicateSourceId` if one exists.
    pub fn create(&self, track: &NewTrack) -> StoreResult<Track> {
        self.create_at(track, now_ms())
    }

    pub(crate) fn create_at(&self, track: &NewTrack, created_at_ms: i64) -> StoreResult<Track> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            r#"
            INSERT INTO tracks (
                source_id, title, author, duration_seconds, thumbnail_url, source_url,
                file_path, file_size_bytes, play_count, last_played_at_ms, created_at_ms,
                is_deleted, added_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, ?9, 0, ?10)
            "#,
            params![
                track.source_id,
                track.title,
                track.author,
                track.duration_seconds as i64,
                track.thumbnail_url,
                track.source_url,
                track.file_path.to_string_lossy(),
                track.file_size_bytes as i64,
                created_at_ms,
                track.added_by,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::DuplicateSourceId(track.source_id.clone()));
            }
            Err(err) => return Err(err.into()),
        }
        let id = conn.last_insert_rowid();
        drop(conn);
        self.find_by_id(id)?.ok_or(StoreError::NotFound(id))
    }

    /// Soft-delete a track. The row stays for history.
    pub fn mark_deleted(&self, id: i64) -> StoreResult<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("UPDATE tracks SET is_deleted = 1 WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Bump play count and stamp `last_played_at_ms`.
    pub fn increment_play_count(&self, id: i64) -> StoreResult<()> {
        self.increment_play_count_at(id, now_ms())
    }

    pub(crate) fn increment_play_count_at(&self, id: i64, played_at_ms: i64) -> StoreResult<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE tracks SET play_count = play_count + 1, last_played_at_ms = ?2 WHERE id = ?1",
            params![id, played_at_ms],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Record a new on-disk copy for an existing live track.
    pub fn restore_file(&self, id: i64, file_path: &Path, size_bytes: u64) -> StoreResult<Track> {
        {
            let conn = self.pool.get()?;
            let changed = conn.execute(
                "UPDATE tracks SET file_path = ?2, file_size_bytes = ?3 WHERE id = ?1 AND is_deleted = 0",
                params![id, file_path.to_string_lossy(), size_bytes as i64],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
        }
        self.find_by_id(id)?.ok_or(StoreError::NotFound(id))
    }

    /// Live tracks not played or created within `retention_days` and not
    /// referenced by any playlist or favorite, oldest activity first.
    pub fn list_eviction_candidates(&self, retention_days: u32) -> StoreResult<Vec<Track>> {
        self.list_eviction_candidates_at(retention_days, now_ms())
    }

    pub(crate) fn list_eviction_candidates_at(
        &self,
        retention_days: u32,
        now_ms: i64,
    ) -> StoreResult<Vec<Track>> {
        let cutoff = now_ms - i64::from(retention_days) * DAY_MS;
        let conn = self.pool.get()?;
        let sql = format!(
            r#"
            SELECT {TRACK_COLUMNS}
            FROM tracks t
            WHERE t.is_deleted = 0
              AND (t.last_played_at_ms IS NULL OR t.last_played_at_ms < ?1)
              AND t.created_at_ms < ?1
              AND NOT EXISTS (SELECT 1 FROM playlist_tracks pt WHERE pt.track_id = t.id)
              AND NOT EXISTS (SELECT 1 FROM favorites f WHERE f.track_id = t.id)
            ORDER BY COALESCE(t.last_played_at_ms, t.created_at_ms) ASC, t.id ASC
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![cutoff], map_track_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Live track whose stored file path equals `file_path`.
    pub fn find_live_by_file_path(&self, file_path: &Path) -> StoreResult<Option<Track>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {TRACK_COLUMNS} FROM tracks t WHERE t.file_path = ?1 AND t.is_deleted = 0 \
             ORDER BY t.id DESC LIMIT 1"
        );
        let track = conn
            .query_row(&sql, params![file_path.to_string_lossy()], map_track_row)
            .optional()?;
        Ok(track)
    }

    /// Case-insensitive substring match on title or author over live tracks,
    /// most played first.
    pub fn search(&self, text: &str, limit: u32) -> StoreResult<Vec<Track>> {
        let pattern = format!("%{}%", escape_like(text.trim()));
        let conn = self.pool.get()?;
        let sql = format!(
            r#"
            SELECT {TRACK_COLUMNS}
            FROM tracks t
            WHERE t.is_deleted = 0
              AND (t.title LIKE ?1 ESCAPE '\' OR t.author LIKE ?1 ESCAPE '\')
            ORDER BY t.play_count DESC, t.created_at_ms DESC, t.id DESC
            LIMIT ?2
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern, i64::from(limit)], map_track_row)?;
        let tracks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tracks)
    }

    /// Live tracks played within the last `days`, by play count.
    pub fn popular(&self, days: u32, limit: u32) -> StoreResult<Vec<Track>> {
        self.popular_at(days, limit, now_ms())
    }

    pub(crate) fn popular_at(&self, days: u32, limit: u32, now_ms: i64) -> StoreResult<Vec<Track>> {
        let since = now_ms - i64::from(days) * DAY_MS;
        let conn = self.pool.get()?;
        let sql = format!(
            r#"
            SELECT {TRACK_COLUMNS}
            FROM tracks t
            WHERE t.is_deleted = 0
              AND t.play_count > 0
              AND t.last_played_at_ms >= ?1
            ORDER BY t.play_count DESC, t.last_played_at_ms DESC, t.id DESC
            LIMIT ?2
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![since, i64::from(limit)], map_track_row)?;
        let tracks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tracks)
    }

    /// Live tracks not referenced by any playlist or favorite.
    pub fn list_unpinned_live(&self) -> StoreResult<Vec<Track>> {
        let conn = self.pool.get()?;
        let sql = format!(
            r#"
            SELECT {TRACK_COLUMNS}
            FROM tracks t
            WHERE t.is_deleted = 0
              AND NOT EXISTS (SELECT 1 FROM playlist_tracks pt WHERE pt.track_id = t.id)
              AND NOT EXISTS (SELECT 1 FROM favorites f WHERE f.track_id = t.id)
            ORDER BY t.id ASC
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_track_row)?;
        let tracks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tracks)
    }

    pub fn track_counts(&self) -> StoreResult<TrackCounts> {
        let conn = self.pool.get()?;
        let (active, deleted) = conn.query_row(
            "SELECT COALESCE(SUM(is_deleted = 0), 0), COALESCE(SUM(is_deleted = 1), 0) FROM tracks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(TrackCounts { active, deleted })
    }

    pub fn create_playlist(&self, name: &str, owner: &str) -> StoreResult<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO playlists (name, owner, created_at_ms) VALUES (?1, ?2, ?3)",
            params![name, owner, now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a track to a playlist; adding it twice is a no-op.
    pub fn add_to_playlist(&self, playlist_id: i64, track_id: i64) -> StoreResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let next_position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM playlist_tracks WHERE playlist_id = ?1",
            params![playlist_id],
            |row| row.get(0),
        )?;
        tx.execute(
            r#"
            INSERT INTO playlist_tracks (playlist_id, track_id, position, added_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(playlist_id, track_id) DO NOTHING
            "#,
            params![playlist_id, track_id, next_position, now_ms()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_from_playlist(&self, playlist_id: i64, track_id: i64) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM playlist_tracks WHERE playlist_id = ?1 AND track_id = ?2",
            params![playlist_id, track_id],
        )?;
        Ok(())
    }

    pub fn add_favorite(&self, user_id: &str, track_id: i64) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO favorites (user_id, track_id, created_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, track_id) DO NOTHING
            "#,
            params![user_id, track_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn remove_favorite(&self, user_id: &str, track_id: i64) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM favorites WHERE user_id = ?1 AND track_id = ?2",
            params![user_id, track_id],
        )?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tracks (
            id INTEGER PRIMARY KEY,
            source_id TEXT NOT NULL,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            duration_seconds INTEGER NOT NULL DEFAULT 0,
            thumbnail_url TEXT,
            source_url TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL DEFAULT 0,
            play_count INTEGER NOT NULL DEFAULT 0,
            last_played_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            added_by TEXT
        );

        CREATE TABLE IF NOT EXISTS playlists (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            owner TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playlist_tracks (
            id INTEGER PRIMARY KEY,
            playlist_id INTEGER NOT NULL,
            track_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            added_at_ms INTEGER NOT NULL,
            UNIQUE(playlist_id, track_id),
            FOREIGN KEY(playlist_id) REFERENCES playlists(id) ON DELETE CASCADE,
            FOREIGN KEY(track_id) REFERENCES tracks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS favorites (
            id INTEGER PRIMARY KEY,
            user_id TEXT NOT NULL,
            track_id INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL,
            UNIQUE(user_id, track_id),
            FOREIGN KEY(track_id) REFERENCES tracks(id) ON DELETE CASCADE
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_tracks_live_source_id
            ON tracks(source_id) WHERE is_deleted = 0;
        CREATE INDEX IF NOT EXISTS idx_tracks_is_deleted ON tracks(is_deleted);
        CREATE INDEX IF NOT EXISTS idx_playlist_tracks_track_id ON playlist_tracks(track_id);
        CREATE INDEX IF NOT EXISTS idx_favorites_track_id ON favorites(track_id);
        "#,
    )?;

    let version_raw: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match version_raw.and_then(|raw| raw.parse::<i32>().ok()) {
        Some(version) if version > SCHEMA_VERSION => {
            return Err(StoreError::Setup(format!(
                "asset db schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        Some(_) => {}
        None => {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn new_track(source_id: &str, file_path: &Path) -> NewTrack {
        NewTrack {
            source_id: source_id.to_string(),
            title: format!("Title {source_id}"),
            author: "Artist".to_string(),
            duration_seconds: 180,
            thumbnail_url: None,
            source_url: format!("https://www.youtube.com/watch?v={source_id}"),
            file_path: file_path.to_path_buf(),
            file_size_bytes: 1024,
            added_by: Some("alice".to_string()),
        }
    }

    #[test]
    fn create_then_find_by_source_id() {
        let store = AssetStore::open_in_memory().expect("open store");
        let created = store
            .create(&new_track("youtube:abc", Path::new("/tmp/abc.mp3")))
            .expect("create");
        let found = store
            .find_by_source_id("youtube:abc")
            .expect("query")
            .expect("track present");
        assert_eq!(found, created);
        assert!(!found.is_deleted);
        assert_eq!(found.play_count, 0);
    }

    #[test]
    fn duplicate_live_source_id_is_rejected() {
        let store = AssetStore::open_in_memory().expect("open store");
        store
            .create(&new_track("youtube:abc", Path::new("/tmp/abc.mp3")))
            .expect("create");
        let err = store
            .create(&new_track("youtube:abc", Path::new("/tmp/abc-2.mp3")))
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicateSourceId(id) if id == "youtube:abc"));
    }

    #[test]
    fn soft_deleted_track_frees_its_source_id() {
        let store = AssetStore::open_in_memory().expect("open store");
        let first = store
            .create(&new_track("youtube:abc", Path::new("/tmp/abc.mp3")))
            .expect("create");
        store.mark_deleted(first.id).expect("mark deleted");
        assert!(store.find_by_source_id("youtube:abc").expect("query").is_none());

        let second = store
            .create(&new_track("youtube:abc", Path::new("/tmp/abc.mp3")))
            .expect("re-create");
        assert_ne!(second.id, first.id);
        let old = store.find_by_id(first.id).expect("query").expect("row kept");
        assert!(old.is_deleted);
    }

    #[test]
    fn increment_play_count_stamps_last_played() {
        let store = AssetStore::open_in_memory().expect("open store");
        let track = store
            .create(&new_track("youtube:abc", Path::new("/tmp/abc.mp3")))
            .expect("create");
        store.increment_play_count_at(track.id, 42).expect("increment");
        store.increment_play_count_at(track.id, 43).expect("increment");
        let track = store.find_by_id(track.id).expect("query").expect("row");
        assert_eq!(track.play_count, 2);
        assert_eq!(track.last_played_at_ms, Some(43));
    }

    #[test]
    fn eviction_candidates_respect_retention_and_references() {
        let store = AssetStore::open_in_memory().expect("open store");
        let now = 100 * DAY_MS;
        let old = now - 10 * DAY_MS;

        let stale = store
            .create_at(&new_track("youtube:stale", Path::new("/a/stale.mp3")), old)
            .expect("stale");
        let recent_play = store
            .create_at(&new_track("youtube:played", Path::new("/a/played.mp3")), old)
            .expect("played");
        store
            .increment_play_count_at(recent_play.id, now - DAY_MS)
            .expect("play");
        let fresh = store
            .create_at(&new_track("youtube:fresh", Path::new("/a/fresh.mp3")), now - DAY_MS)
            .expect("fresh");
        let in_playlist = store
            .create_at(&new_track("youtube:listed", Path::new("/a/listed.mp3")), old)
            .expect("listed");
        let favorite = store
            .create_at(&new_track("youtube:fav", Path::new("/a/fav.mp3")), old)
            .expect("fav");
        let deleted = store
            .create_at(&new_track("youtube:gone", Path::new("/a/gone.mp3")), old)
            .expect("gone");

        let playlist = store.create_playlist("mix", "alice").expect("playlist");
        store.add_to_playlist(playlist, in_playlist.id).expect("add");
        store.add_favorite("bob", favorite.id).expect("favorite");
        store.mark_deleted(deleted.id).expect("delete");

        let ids: Vec<i64> = store
            .list_eviction_candidates_at(7, now)
            .expect("candidates")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![stale.id]);
        let _ = fresh;

        store.remove_from_playlist(playlist, in_playlist.id).expect("remove");
        store.remove_favorite("bob", favorite.id).expect("unfavorite");
        let ids: Vec<i64> = store
            .list_eviction_candidates_at(7, now)
            .expect("candidates")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![stale.id, in_playlist.id, favorite.id]);
    }

    #[test]
    fn restore_file_updates_path_and_size() {
        let store = AssetStore::open_in_memory().expect("open store");
        let track = store
            .create(&new_track("youtube:abc", Path::new("/tmp/abc.mp3")))
            .expect("create");
        let restored = store
            .restore_file(track.id, Path::new("/srv/abc.mp3"), 4096)
            .expect("restore");
        assert_eq!(restored.file_path, PathBuf::from("/srv/abc.mp3"));
        assert_eq!(restored.file_size_bytes, 4096);
    }

    #[test]
    fn track_counts_split_live_and_deleted() {
        let store = AssetStore::open_in_memory().expect("open store");
        let a = store
            .create(&new_track("youtube:a", Path::new("/a.mp3")))
            .expect("a");
        store
            .create(&new_track("youtube:b", Path::new("/b.mp3")))
            .expect("b");
        store.mark_deleted(a.id).expect("delete");
        assert_eq!(
            store.track_counts().expect("counts"),
            TrackCounts { active: 1, deleted: 1 }
        );
    }

    #[test]
    fn search_matches_title_or_author_by_popularity() {
        let store = AssetStore::open_in_memory().expect("open store");
        let mut night = new_track("youtube:night", Path::new("/a/night.mp3"));
        night.title = "Night Drive".to_string();
        let night = store.create(&night).expect("night");
        let mut drive = new_track("youtube:drive", Path::new("/a/drive.mp3"));
        drive.title = "Morning".to_string();
        drive.author = "The Drivers".to_string();
        let drive = store.create(&drive).expect("drive");
        let mut other = new_track("youtube:other", Path::new("/a/other.mp3"));
        other.title = "Unrelated".to_string();
        store.create(&other).expect("other");
        let mut gone = new_track("youtube:gone", Path::new("/a/gone.mp3"));
        gone.title = "Drive Away".to_string();
        let gone = store.create(&gone).expect("gone");
        store.mark_deleted(gone.id).expect("delete");

        store.increment_play_count(drive.id).expect("play");
        let ids: Vec<i64> = store
            .search("drive", 20)
            .expect("search")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![drive.id, night.id]);

        let limited = store.search("DRIVE", 1).expect("search");
        assert_eq!(limited.len(), 1);
        assert!(store.search("100%", 20).expect("search").is_empty());
    }

    #[test]
    fn popular_only_counts_plays_inside_window() {
        let store = AssetStore::open_in_memory().expect("open store");
        let now = 100 * DAY_MS;
        let hot = store
            .create_at(&new_track("youtube:hot", Path::new("/a/hot.mp3")), 0)
            .expect("hot");
        let warm = store
            .create_at(&new_track("youtube:warm", Path::new("/a/warm.mp3")), 0)
            .expect("warm");
        let stale = store
            .create_at(&new_track("youtube:stale", Path::new("/a/stale.mp3")), 0)
            .expect("stale");
        store
            .create_at(&new_track("youtube:never", Path::new("/a/never.mp3")), 0)
            .expect("never");
        for _ in 0..3 {
            store.increment_play_count_at(hot.id, now - DAY_MS).expect("play");
        }
        store.increment_play_count_at(warm.id, now - 2 * DAY_MS).expect("play");
        for _ in 0..5 {
            store.increment_play_count_at(stale.id, now - 30 * DAY_MS).expect("play");
        }

        let ids: Vec<i64> = store
            .popular_at(7, 10, now)
            .expect("popular")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![hot.id, warm.id]);
        assert_eq!(store.popular_at(7, 1, now).expect("popular").len(), 1);
    }

    #[test]
    fn find_live_by_file_path_ignores_deleted_rows() {
        let store = AssetStore::open_in_memory().expect("open store");
        let path = Path::new("/srv/music/youtube_abc.mp3");
        let track = store.create(&new_track("youtube:abc", path)).expect("create");
        assert_eq!(
            store.find_live_by_file_path(path).expect("query").map(|t| t.id),
            Some(track.id)
        );
        store.mark_deleted(track.id).expect("delete");
        assert!(store.find_live_by_file_path(path).expect("query").is_none());
        assert!(
            store
                .find_live_by_file_path(Path::new("/srv/music/other.mp3"))
                .expect("query")
                .is_none()
        );
    }

    #[test]
    fn unpinned_live_skips_references_and_deleted() {
        let store = AssetStore::open_in_memory().expect("open store");
        let loose = store
            .create(&new_track("youtube:loose", Path::new("/a/loose.mp3")))
            .expect("loose");
        let fav = store
            .create(&new_track("youtube:fav", Path::new("/a/fav.mp3")))
            .expect("fav");
        let gone = store
            .create(&new_track("youtube:gone", Path::new("/a/gone.mp3")))
            .expect("gone");
        store.add_favorite("bob", fav.id).expect("favorite");
        store.mark_deleted(gone.id).expect("delete");
        let ids: Vec<i64> = store
            .list_unpinned_live()
            .expect("list")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![loose.id]);
    }

    #[test]
    fn schema_bootstrap_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open memory db");
        init_schema(&conn).expect("first init");
        init_schema(&conn).expect("second init");
        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| {
                row.get(0)
            })
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }
}
