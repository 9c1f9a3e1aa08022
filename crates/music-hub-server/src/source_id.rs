//! Stable source identifiers for resolved URLs.

use reqwest::Url;

/// Extract a stable id like `youtube:dQw4w9WgXcQ` from a resolved source URL.
///
/// Returns `None` when the URL is not from a recognised platform; callers then
/// fall back to [`unique_source_id`] and skip deduplication.
pub fn extract_source_id(url: &str) -> Option<String> {
    let url = Url::parse(url.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let mut segments = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();

    match host {
        "youtube.com" | "m.youtube.com" | "music.youtube.com" => {
            let id = match segments.as_slice() {
                ["watch"] => url
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned()),
                ["shorts", id] | ["embed", id] | ["live", id] => Some((*id).to_string()),
                _ => None,
            }?;
            youtube_id(&id)
        }
        "youtu.be" => youtube_id(segments.first()?),
        "soundcloud.com" | "m.soundcloud.com" => {
            if segments.len() != 2 || segments[1] == "sets" {
                return None;
            }
            let track = segments.pop()?;
            let user = segments.pop()?;
            Some(format!("soundcloud:{}/{}", user.to_ascii_lowercase(), track.to_ascii_lowercase()))
        }
        _ => None,
    }
}

fn youtube_id(raw: &str) -> Option<String> {
    let valid = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| format!("youtube:{raw}"))
}

/// Fresh id for sources without a recognisable identifier.
pub fn unique_source_id() -> String {
    format!("local:{}", uuid::Uuid::new_v4())
}

/// File name for a source id inside the asset directory.
pub fn asset_file_name(source_id: &str, extension: Option<&str>) -> String {
    let stem: String = source_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    match extension.map(str::trim).filter(|ext| !ext.is_empty()) {
        Some(ext) => format!("{stem}.{}", ext.to_ascii_lowercase()),
        None => stem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_watch_url_with_extra_params() {
        assert_eq!(
            extract_source_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42s&list=RD"),
            Some("youtube:dQw4w9WgXcQ".to_string())
        );
    }

    #[test]
    fn youtube_short_links_and_variants() {
        let expected = Some("youtube:dQw4w9WgXcQ".to_string());
        assert_eq!(extract_source_id("https://youtu.be/dQw4w9WgXcQ?si=abc"), expected);
        assert_eq!(extract_source_id("https://youtube.com/shorts/dQw4w9WgXcQ"), expected);
        assert_eq!(
            extract_source_id("https://music.youtube.com/watch?v=dQw4w9WgXcQ"),
            expected
        );
        assert_eq!(extract_source_id("https://m.youtube.com/watch?v=dQw4w9WgXcQ#x"), expected);
    }

    #[test]
    fn soundcloud_track_path() {
        assert_eq!(
            extract_source_id("https://soundcloud.com/Artist/Some-Track"),
            Some("soundcloud:artist/some-track".to_string())
        );
        assert_eq!(extract_source_id("https://soundcloud.com/artist/sets"), None);
    }

    #[test]
    fn unknown_or_malformed_urls_have_no_id() {
        assert_eq!(extract_source_id("https://example.com/song.mp3"), None);
        assert_eq!(extract_source_id("https://www.youtube.com/watch?list=abc"), None);
        assert_eq!(extract_source_id("https://youtu.be/"), None);
        assert_eq!(extract_source_id("not a url"), None);
        assert_eq!(extract_source_id("https://youtu.be/bad%20id"), None);
    }

    #[test]
    fn unique_ids_differ() {
        let a = unique_source_id();
        let b = unique_source_id();
        assert!(a.starts_with("local:"));
        assert_ne!(a, b);
    }

    #[test]
    fn asset_file_name_is_path_safe() {
        assert_eq!(asset_file_name("youtube:dQw4w9WgXcQ", Some("MP3")), "youtube_dQw4w9WgXcQ.mp3");
        assert_eq!(
            asset_file_name("soundcloud:artist/../track", Some("opus")),
            "soundcloud_artist____track.opus"
        );
        assert_eq!(asset_file_name("local:x", None), "local_x");
    }
}
