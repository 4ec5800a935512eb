use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::AppConfig;

/// Locate ffmpeg: explicit config override first, then common install
/// locations, then a `-version` probe against the configured PATH.
/// Every download merges into mp4, so the result gates `/download`.
pub async fn detect(cfg: &AppConfig) -> Option<PathBuf> {
    if let Some(p) = &cfg.ffmpeg_bin {
        return Some(p.clone());
    }

    // Common macOS/Homebrew and Linux locations.
    for p in [
        "/opt/homebrew/bin/ffmpeg",
        "/usr/local/bin/ffmpeg",
        "/usr/bin/ffmpeg",
    ] {
        if Path::new(p).exists() {
            return Some(PathBuf::from(p));
        }
    }

    if probe("ffmpeg", &cfg.ytdlp_path).await {
        return Some(PathBuf::from("ffmpeg"));
    }

    None
}

// Exit status of `ffmpeg -version` is the only portable installedness signal.
async fn probe(bin: &str, path: &str) -> bool {
    Command::new(bin)
        .env("PATH", path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_override_wins() {
        let mut cfg = crate::config::AppConfig {
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
        };
        cfg.ffmpeg_bin = Some(PathBuf::from("/custom/ffmpeg"));
        assert_eq!(detect(&cfg).await, Some(PathBuf::from("/custom/ffmpeg")));
    }

    #[tokio::test]
    async fn probe_rejects_missing_binary() {
        assert!(!probe("definitely-not-ffmpeg-zzz", "/usr/bin:/bin").await);
    }
}
