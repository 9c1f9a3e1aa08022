//! External resolver integration.
//!
//! The resolver is an out-of-process helper that turns a free-text query or URL
//! into a downloaded local file plus metadata. It prints one JSON object per
//! line; the last non-empty stdout line is the result. Anything that does not
//! parse into a complete [`Resolution`] is treated as a failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::ResolverSettings;
use crate::error::EngineError;

/// Validated resolver result.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub title: String,
    pub author: String,
    pub duration_seconds: u32,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
    /// Temporary file written by the resolver.
    pub local_file_path: PathBuf,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve and download `query`.
    async fn resolve(&self, query: &str) -> Result<Resolution, EngineError>;
}

/// Raw resolver output line. Field names follow the helper script.
#[derive(Debug, Deserialize)]
struct RawResolverOutput {
    success: Option<bool>,
    title: Option<String>,
    #[serde(alias = "uploader")]
    author: Option<String>,
    #[serde(alias = "duration_seconds")]
    duration: Option<f64>,
    #[serde(alias = "thumbnail_url")]
    thumbnail: Option<String>,
    #[serde(alias = "source_url")]
    url: Option<String>,
    #[serde(alias = "local_file_path")]
    file: Option<String>,
    error: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse resolver stdout into a [`Resolution`].
///
/// Relative file paths are resolved against `base_dir`.
pub fn parse_resolver_output(
    stdout: &str,
    base_dir: Option<&Path>,
) -> Result<Resolution, EngineError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| EngineError::ResolutionFailed("resolver produced no output".to_string()))?;
    let raw: RawResolverOutput = serde_json::from_str(line).map_err(|e| {
        EngineError::ResolutionFailed(format!("failed to parse resolver response: {e}"))
    })?;

    if raw.success != Some(true) {
        let reason = non_blank(raw.error).unwrap_or_else(|| "resolver reported failure".to_string());
        return Err(EngineError::ResolutionFailed(reason));
    }
    let missing = |field: &str| EngineError::ResolutionFailed(format!("resolver response missing {field}"));
    let title = non_blank(raw.title).ok_or_else(|| missing("title"))?;
    let source_url = non_blank(raw.url).ok_or_else(|| missing("url"))?;
    let file = non_blank(raw.file).ok_or_else(|| missing("file"))?;
    let duration_seconds = match raw.duration {
        Some(d) if d.is_finite() && d >= 0.0 => d.round().min(u32::MAX as f64) as u32,
        Some(d) => {
            return Err(EngineError::ResolutionFailed(format!(
                "resolver response has invalid duration {d}"
            )));
        }
        None => 0,
    };

    let mut local_file_path = PathBuf::from(file);
    if local_file_path.is_relative() {
        if let Some(base) = base_dir {
            local_file_path = base.join(local_file_path);
        }
    }

    Ok(Resolution {
        title,
        author: non_blank(raw.author).unwrap_or_else(|| "Unknown".to_string()),
        duration_seconds,
        thumbnail_url: non_blank(raw.thumbnail),
        source_url,
        local_file_path,
    })
}

/// Runs the configured resolver program with the query as its last argument.
pub struct CommandResolver {
    settings: ResolverSettings,
}

impl CommandResolver {
    pub fn new(settings: ResolverSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Resolver for CommandResolver {
    async fn resolve(&self, query: &str) -> Result<Resolution, EngineError> {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args)
            .arg(query)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.settings.working_dir.as_ref() {
            cmd.current_dir(dir);
        }

        tracing::info!(program = %self.settings.program, query = %query, "resolver start");
        let output = tokio::time::timeout(self.settings.timeout, cmd.output())
            .await
            .map_err(|_| {
                EngineError::ResolutionFailed(format!(
                    "resolver timed out after {}s",
                    self.settings.timeout.as_secs()
                ))
            })?
            .map_err(|e| EngineError::ResolutionFailed(format!("spawn resolver: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        match parse_resolver_output(&stdout, self.settings.working_dir.as_deref()) {
            Ok(resolution) => {
                tracing::info!(
                    query = %query,
                    title = %resolution.title,
                    file = %resolution.local_file_path.display(),
                    "resolver finished"
                );
                Ok(resolution)
            }
            Err(err) => {
                let stderr = stderr.trim();
                tracing::warn!(
                    query = %query,
                    status = ?output.status.code(),
                    error = %err,
                    stderr = %stderr,
                    "resolver failed"
                );
                if !output.status.success() && !stderr.is_empty() && stdout.trim().is_empty() {
                    let tail: String = stderr.lines().last().unwrap_or(stderr).to_string();
                    return Err(EngineError::ResolutionFailed(tail));
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_line_of_output() {
        let stdout = concat!(
            "[download] 100% of 3.2MiB\n",
            r#"{"success": true, "title": "Song", "author": "Band", "duration": 215.4, "thumbnail": "https://img/x.jpg", "url": "https://www.youtube.com/watch?v=abc", "file": "downloads/abc.mp3"}"#,
            "\n\n"
        );
        let res = parse_resolver_output(stdout, Some(Path::new("/opt/resolver"))).expect("parse");
        assert_eq!(res.title, "Song");
        assert_eq!(res.author, "Band");
        assert_eq!(res.duration_seconds, 215);
        assert_eq!(res.thumbnail_url.as_deref(), Some("https://img/x.jpg"));
        assert_eq!(res.local_file_path, PathBuf::from("/opt/resolver/downloads/abc.mp3"));
    }

    #[test]
    fn reported_failure_carries_resolver_error() {
        let err = parse_resolver_output(r#"{"success": false, "error": "No results found"}"#, None)
            .expect_err("failure");
        assert_eq!(err, EngineError::ResolutionFailed("No results found".to_string()));
    }

    #[test]
    fn missing_required_field_fails_closed() {
        let err = parse_resolver_output(
            r#"{"success": true, "title": "Song", "url": "https://youtu.be/abc"}"#,
            None,
        )
        .expect_err("missing file");
        assert_eq!(
            err,
            EngineError::ResolutionFailed("resolver response missing file".to_string())
        );
    }

    #[test]
    fn garbage_output_fails() {
        assert!(matches!(
            parse_resolver_output("Traceback (most recent call last):", None),
            Err(EngineError::ResolutionFailed(_))
        ));
        assert!(matches!(
            parse_resolver_output("  \n", None),
            Err(EngineError::ResolutionFailed(_))
        ));
    }

    #[test]
    fn author_defaults_and_aliases_are_accepted() {
        let res = parse_resolver_output(
            r#"{"success": true, "title": "Song", "source_url": "https://youtu.be/abc", "local_file_path": "/tmp/a.mp3"}"#,
            None,
        )
        .expect("parse");
        assert_eq!(res.author, "Unknown");
        assert_eq!(res.duration_seconds, 0);
        assert_eq!(res.local_file_path, PathBuf::from("/tmp/a.mp3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_resolver_runs_program_with_query() {
        let settings = ResolverSettings {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"echo "searching $0"; printf '{"success":true,"title":"%s","url":"https://youtu.be/abc","file":"/tmp/x.mp3"}\n' "$0""#.to_string(),
            ],
            working_dir: None,
            timeout: std::time::Duration::from_secs(10),
        };
        let res = CommandResolver::new(settings)
            .resolve("lofi beats")
            .await
            .expect("resolve");
        assert_eq!(res.title, "lofi beats");
        assert_eq!(res.source_url, "https://youtu.be/abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_resolver_reports_stderr_on_crash() {
        let settings = ResolverSettings {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo 'boom' >&2; exit 3".to_string()],
            working_dir: None,
            timeout: std::time::Duration::from_secs(10),
        };
        let err = CommandResolver::new(settings)
            .resolve("anything")
            .await
            .expect_err("crash");
        assert_eq!(err, EngineError::ResolutionFailed("boom".to_string()));
    }
}
