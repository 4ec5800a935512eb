use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::AppConfig;

/// Cookie arguments for one request's worth of yt-dlp invocations.
pub enum CookieArgs {
    /// No cookies available; ask the YouTube tab extractor to skip its auth
    /// check so public playlists keep working.
    SkipAuthCheck,
    /// Server-side jar maintained by `ensure_cookies`.
    Jar(PathBuf),
    /// Browser-exported cookies.txt uploaded with the request. The temp file
    /// is removed when the request (and this value) is dropped.
    Uploaded(NamedTempFile),
}

impl CookieArgs {
    pub fn apply(&self, cmd: &mut Command) {
        match self {
            CookieArgs::SkipAuthCheck => {
                cmd.arg("--extractor-args").arg("youtubetab:skip=authcheck");
            }
            CookieArgs::Jar(path) => {
                cmd.arg("--cookies").arg(path.as_os_str());
            }
            CookieArgs::Uploaded(file) => {
                cmd.arg("--cookies").arg(file.path().as_os_str());
            }
        }
    }
}

/// Pick the cookie source for a request: an uploaded jar wins, then the
/// configured server-side jar, then the auth-check skip fallback.
pub async fn resolve(
    cfg: &AppConfig,
    uploaded: Option<&str>,
    cookie_lock: &AsyncMutex<()>,
) -> Result<CookieArgs> {
    if let Some(text) = uploaded {
        let mut file = tempfile::Builder::new()
            .prefix("yt-playlist-cookies-")
            .suffix(".txt")
            .tempfile()
            .context("Failed to create temp cookie file")?;
        file.write_all(text.as_bytes())
            .context("Failed to write uploaded cookies")?;
        file.flush().context("Failed to flush uploaded cookies")?;
        return Ok(CookieArgs::Uploaded(file));
    }

    if cfg.cookies_source == "file" {
        ensure_cookies(cfg, cookie_lock).await?;
        return Ok(CookieArgs::Jar(cfg.cookies_file.clone()));
    }

    Ok(CookieArgs::SkipAuthCheck)
}

/// Automatically refresh cookies (export from browser) into the cookies file.
pub async fn refresh_cookies(cfg: &AppConfig) -> Result<()> {
    eprintln!(
        "[COOKIES] Refreshing from browser: {}...",
        cfg.cookies_browser
    );

    // `--cookies FILE` reads from and dumps the cookie jar in that file.
    // We hit an arbitrary video URL but skip download; the goal is just to
    // populate/update the cookies file.
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

    let output = cmd
        .args(&[
            "--cookies-from-browser",
            cfg.cookies_browser.as_str(),
            "--cookies",
            cfg.cookies_file.to_string_lossy().as_ref(),
            "--skip-download",
            "--quiet",
            "--no-warnings",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        ])
        .output()
        .await
        .context("Failed to run yt-dlp for cookies")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("yt-dlp failed: {}", stderr));
    }

    eprintln!("[COOKIES] Refreshed successfully");
    Ok(())
}

/// Check if the server-side jar needs a refresh (missing or older than the
/// configured max age).
pub fn needs_refresh(cfg: &AppConfig) -> bool {
    if !cfg.cookies_file.exists() {
        return true;
    }

    if let Ok(metadata) = std::fs::metadata(&cfg.cookies_file) {
        if let Ok(modified) = metadata.modified() {
            if let Ok(elapsed) = modified.elapsed() {
                return elapsed.as_secs() > cfg.cookies_refresh_max_age_secs;
            }
        }
    }
    false
}

pub async fn ensure_cookies(cfg: &AppConfig, cookie_lock: &AsyncMutex<()>) -> Result<()> {
    if cfg.cookies_source != "file" {
        // Uploaded jars are request-scoped; nothing to maintain server-side.
        return Ok(());
    }

    // Avoid multiple concurrent refreshes under load (and avoid writing the
    // cookies file concurrently).
    let _guard = cookie_lock.lock().await;
    if needs_refresh(cfg) {
        refresh_cookies(cfg).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn needs_refresh_when_jar_missing() {
        let mut cfg = test_config();
        cfg.cookies_file = PathBuf::from("/nonexistent/cookies.txt");
        assert!(needs_refresh(&cfg));
    }

    #[test]
    fn fresh_jar_needs_no_refresh() {
        let jar = NamedTempFile::new().expect("temp jar");
        let mut cfg = test_config();
        cfg.cookies_file = jar.path().to_path_buf();
        assert!(!needs_refresh(&cfg));
    }

    #[tokio::test]
    async fn resolve_without_upload_skips_auth_check() {
        let cfg = test_config();
        let lock = AsyncMutex::new(());
        let args = resolve(&cfg, None, &lock).await.expect("resolve");

        let mut cmd = Command::new("yt-dlp");
        args.apply(&mut cmd);
        assert_eq!(
            args_of(&cmd),
            vec!["--extractor-args", "youtubetab:skip=authcheck"]
        );
    }

    #[tokio::test]
    async fn resolve_prefers_uploaded_jar() {
        let cfg = test_config();
        let lock = AsyncMutex::new(());
        let args = resolve(&cfg, Some("# Netscape HTTP Cookie File\n"), &lock)
            .await
            .expect("resolve");

        let path = match &args {
            CookieArgs::Uploaded(file) => file.path().to_path_buf(),
            _ => panic!("expected uploaded jar"),
        };
        let contents = std::fs::read_to_string(&path).expect("read jar");
        assert!(contents.starts_with("# Netscape"));

        let mut cmd = Command::new("yt-dlp");
        args.apply(&mut cmd);
        assert_eq!(
            args_of(&cmd),
            vec!["--cookies".to_string(), path.to_string_lossy().to_string()]
        );

        // Dropping the request's cookie args removes the jar from disk.
        drop(args);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn resolve_uses_configured_jar_in_file_mode() {
        let jar = NamedTempFile::new().expect("temp jar");
        let mut cfg = test_config();
        cfg.cookies_source = "file".to_string();
        cfg.cookies_file = jar.path().to_path_buf();

        let lock = AsyncMutex::new(());
        let args = resolve(&cfg, None, &lock).await.expect("resolve");
        match args {
            CookieArgs::Jar(path) => assert_eq!(path, jar.path()),
            _ => panic!("expected server-side jar"),
        }
    }
}
