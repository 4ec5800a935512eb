use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::AppConfig;
use crate::cookies::CookieArgs;
use crate::util;

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

// Lines of stderr kept for error reporting.
const STDERR_TAIL_LINES: usize = 50;

/// Quality tier offered by the front end, mapped to a fixed format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    High,
    Medium,
    Low,
}

impl Quality {
    pub fn format_selector(self) -> &'static str {
        match self {
            Quality::High => "bestvideo+bestaudio/best",
            Quality::Medium => "bestvideo[height<=720]+bestaudio[ext=m4a]/best[height<=720]",
            Quality::Low => "bestvideo[height<=360]+bestaudio[ext=m4a]/best[height<=360]",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Quality::High => "High",
            Quality::Medium => "Medium (720p)",
            Quality::Low => "Low (360p)",
        }
    }
}

/// One entry of a flat playlist dump.
#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub url: String,
    pub duration: Option<f64>,
}

/// A failed yt-dlp invocation: what happened plus the last stderr lines.
#[derive(Debug)]
pub struct CommandFailure {
    pub message: String,
    pub stderr_tail: String,
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.stderr_tail.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.message, self.stderr_tail)
        }
    }
}

impl std::error::Error for CommandFailure {}

fn base_command(cfg: &AppConfig, cookies: &CookieArgs) -> Command {
    let mut cmd = Command::new(&cfg.ytdlp_bin);
    cmd.env("PATH", &cfg.ytdlp_path);

    if !cfg.inherit_proxy_env {
        // Avoid being accidentally bound to a dead local proxy (common in shell env).
        cmd.env_remove("http_proxy")
            .env_remove("https_proxy")
            .env_remove("HTTP_PROXY")
            .env_remove("HTTPS_PROXY")
            .env_remove("no_proxy")
            .env_remove("NO_PROXY");
    }

    if let Some(p) = &cfg.ytdlp_proxy {
        cmd.arg("--proxy").arg(p);
    }

    cmd.arg("--no-warnings");
    cookies.apply(&mut cmd);

    cmd
}

async fn run_capture(mut cmd: Command, what: &str) -> Result<Vec<u8>, CommandFailure> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let out = cmd.output().await.map_err(|e| CommandFailure {
        message: format!("Failed to run yt-dlp to {}: {}", what, e),
        stderr_tail: String::new(),
    })?;

    if !out.status.success() {
        return Err(CommandFailure {
            message: format!(
                "yt-dlp exited with error (status={}) while trying to {}",
                out.status, what
            ),
            stderr_tail: tail_of(&out.stderr),
        });
    }

    Ok(out.stdout)
}

fn tail_of(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Fetch the playlist title via `--dump-single-json`, falling back to
/// "playlist" when the field is absent.
pub async fn playlist_title(
    cfg: &AppConfig,
    cookies: &CookieArgs,
    url: &str,
) -> Result<String, CommandFailure> {
    let mut cmd = base_command(cfg, cookies);
    cmd.arg("--dump-single-json").arg(url);

    let stdout = run_capture(cmd, "fetch playlist metadata").await?;
    let meta: serde_json::Value = serde_json::from_slice(&stdout).map_err(|e| CommandFailure {
        message: format!("Failed to parse playlist metadata: {}", e),
        stderr_tail: String::new(),
    })?;

    Ok(meta
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or("playlist")
        .to_string())
}

/// Enumerate the playlist via `--flat-playlist --dump-json` (one JSON object
/// per stdout line).
pub async fn playlist_entries(
    cfg: &AppConfig,
    cookies: &CookieArgs,
    url: &str,
) -> Result<Vec<PlaylistEntry>, CommandFailure> {
    let mut cmd = base_command(cfg, cookies);
    cmd.arg("--flat-playlist").arg("--dump-json").arg(url);

    let stdout = run_capture(cmd, "enumerate playlist").await?;
    Ok(parse_flat_entries(&String::from_utf8_lossy(&stdout)))
}

pub fn parse_flat_entries(stdout: &str) -> Vec<PlaylistEntry> {
    let mut entries = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };

        // Some extractors omit `id` but still carry a watch URL.
        let id = v
            .get("id")
            .and_then(|x| x.as_str())
            .map(str::to_string)
            .or_else(|| {
                v.get("url")
                    .and_then(|x| x.as_str())
                    .and_then(util::video_id_from_url)
            });
        let Some(id) = id else { continue };

        let title = v
            .get("title")
            .and_then(|x| x.as_str())
            .unwrap_or("Unknown title")
            .to_string();
        let url = v
            .get("url")
            .and_then(|x| x.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}{}", WATCH_URL_PREFIX, id));
        let duration = v.get("duration").and_then(|x| x.as_f64());

        entries.push(PlaylistEntry {
            id,
            title,
            url,
            duration,
        });
    }

    entries
}

/// Output template for one video: `<dir>/<index> - <title>.<ext>`. The
/// enumeration index is substituted directly because single-video URLs carry
/// no `%(playlist_index)s` of their own.
pub fn output_template(dir: &Path, index: usize) -> String {
    let dir = util::escape_output_template(dir.to_string_lossy().as_ref());
    format!(
        "{}{}{} - %(title)s.%(ext)s",
        dir,
        std::path::MAIN_SEPARATOR,
        index
    )
}

pub fn download_args(
    ffmpeg: &Path,
    quality: Quality,
    dir: &Path,
    index: usize,
    video_url: &str,
) -> Vec<String> {
    vec![
        "--quiet".to_string(),
        "--no-progress".to_string(),
        "-f".to_string(),
        quality.format_selector().to_string(),
        "--merge-output-format".to_string(),
        "mp4".to_string(),
        "--ffmpeg-location".to_string(),
        ffmpeg.to_string_lossy().into_owned(),
        "-o".to_string(),
        output_template(dir, index),
        video_url.to_string(),
    ]
}

async fn collect_stderr(
    stderr: tokio::process::ChildStderr,
    buf: Arc<tokio::sync::Mutex<VecDeque<String>>>,
) {
    let mut r = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match r.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let l = line.trim_end().to_string();
                if !l.is_empty() {
                    eprintln!("{}", l);
                    let mut g = buf.lock().await;
                    if g.len() >= STDERR_TAIL_LINES {
                        g.pop_front();
                    }
                    g.push_back(l);
                }
            }
            Err(_) => break,
        }
    }
}

async fn render_tail(buf: &tokio::sync::Mutex<VecDeque<String>>) -> String {
    let g = buf.lock().await;
    if g.is_empty() {
        return "no stderr output captured".to_string();
    }
    g.iter().cloned().collect::<Vec<_>>().join("\n")
}

/// Run one blocking download invocation and judge it purely by exit code.
pub async fn download_video(
    cfg: &AppConfig,
    cookies: &CookieArgs,
    ffmpeg: &Path,
    quality: Quality,
    dir: &Path,
    index: usize,
    video_url: &str,
) -> Result<(), CommandFailure> {
    let mut cmd = base_command(cfg, cookies);
    cmd.args(download_args(ffmpeg, quality, dir, index, video_url))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| CommandFailure {
        message: format!("Failed to start yt-dlp: {}", e),
        stderr_tail: String::new(),
    })?;

    let stderr = child.stderr.take().ok_or_else(|| CommandFailure {
        message: "Failed to capture yt-dlp stderr".to_string(),
        stderr_tail: String::new(),
    })?;
    let tail_buf: Arc<tokio::sync::Mutex<VecDeque<String>>> =
        Arc::new(tokio::sync::Mutex::new(VecDeque::new()));
    let tail_buf_clone = tail_buf.clone();
    let stderr_task = tokio::spawn(async move { collect_stderr(stderr, tail_buf_clone).await });

    let status = match child.wait().await {
        Ok(s) => s,
        Err(e) => {
            let _ = stderr_task.await;
            return Err(CommandFailure {
                message: format!("Failed waiting for yt-dlp: {}", e),
                stderr_tail: render_tail(&tail_buf).await,
            });
        }
    };
    let _ = stderr_task.await;

    if !status.success() {
        return Err(CommandFailure {
            message: format!("yt-dlp exited with error (status={})", status),
            stderr_tail: render_tail(&tail_buf).await,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> AppConfig {
        AppConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            max_concurrent_downloads: 1,
            download_dir: PathBuf::from("downloads"),
            cookies_source: "upload".to_string(),
            cookies_file: PathBuf::from("cookies.txt"),
            cookies_browser: "edge".to_string(),
            cookies_refresh_max_age_secs: 1800,
            ytdlp_bin: PathBuf::from("yt-dlp"),
            ytdlp_path: "/usr/bin:/bin".to_string(),
            ffmpeg_bin: None,
            ytdlp_proxy: None,
            inherit_proxy_env: false,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn quality_selectors_are_fixed() {
        assert_eq!(Quality::High.format_selector(), "bestvideo+bestaudio/best");
        assert_eq!(
            Quality::Medium.format_selector(),
            "bestvideo[height<=720]+bestaudio[ext=m4a]/best[height<=720]"
        );
        assert_eq!(
            Quality::Low.format_selector(),
            "bestvideo[height<=360]+bestaudio[ext=m4a]/best[height<=360]"
        );
    }

    #[test]
    fn quality_deserializes_lowercase_and_defaults_high() {
        let q: Quality = serde_json::from_str("\"medium\"").expect("parse");
        assert_eq!(q, Quality::Medium);
        assert_eq!(Quality::default(), Quality::High);
        assert!(serde_json::from_str::<Quality>("\"4k\"").is_err());
    }

    #[test]
    fn base_command_carries_proxy_and_cookie_args() {
        let mut cfg = test_config();
        cfg.ytdlp_proxy = Some("socks5://127.0.0.1:7890".to_string());

        let cmd = base_command(&cfg, &CookieArgs::SkipAuthCheck);
        assert_eq!(
            args_of(&cmd),
            vec![
                "--proxy",
                "socks5://127.0.0.1:7890",
                "--no-warnings",
                "--extractor-args",
                "youtubetab:skip=authcheck",
            ]
        );
    }

    #[test]
    fn parse_skips_blank_and_junk_lines() {
        let stdout = concat!(
            "{\"id\":\"aaa\",\"title\":\"First\",\"url\":\"https://www.youtube.com/watch?v=aaa\",\"duration\":12.5}\n",
            "\n",
            "not json\n",
            "{\"id\":\"bbb\"}\n",
        );
        let entries = parse_flat_entries(stdout);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "aaa");
        assert_eq!(entries[0].duration, Some(12.5));
        assert_eq!(entries[1].title, "Unknown title");
        assert_eq!(entries[1].url, "https://www.youtube.com/watch?v=bbb");
    }

    #[test]
    fn parse_derives_id_from_url_when_missing() {
        let stdout = "{\"title\":\"Clip\",\"url\":\"https://www.youtube.com/watch?v=ccc\"}\n";
        let entries = parse_flat_entries(stdout);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "ccc");
    }

    #[test]
    fn parse_drops_entries_without_any_id() {
        let stdout = "{\"title\":\"mystery\"}\n";
        assert!(parse_flat_entries(stdout).is_empty());
    }

    #[test]
    fn output_template_places_index_and_escapes_percent() {
        let sep = std::path::MAIN_SEPARATOR;
        assert_eq!(
            output_template(Path::new("/media/My List"), 3),
            format!("/media/My List{}3 - %(title)s.%(ext)s", sep)
        );
        assert_eq!(
            output_template(Path::new("/media/100% Hits"), 1),
            format!("/media/100%% Hits{}1 - %(title)s.%(ext)s", sep)
        );
    }

    #[test]
    fn download_args_match_the_invocation_contract() {
        let args = download_args(
            Path::new("/usr/bin/ffmpeg"),
            Quality::Medium,
            Path::new("/dl/Pl"),
            2,
            "https://www.youtube.com/watch?v=xyz",
        );
        let sep = std::path::MAIN_SEPARATOR;
        assert_eq!(
            args,
            vec![
                "--quiet".to_string(),
                "--no-progress".to_string(),
                "-f".to_string(),
                "bestvideo[height<=720]+bestaudio[ext=m4a]/best[height<=720]".to_string(),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
                "--ffmpeg-location".to_string(),
                "/usr/bin/ffmpeg".to_string(),
                "-o".to_string(),
                format!("/dl/Pl{}2 - %(title)s.%(ext)s", sep),
                "https://www.youtube.com/watch?v=xyz".to_string(),
            ]
        );
    }
}
