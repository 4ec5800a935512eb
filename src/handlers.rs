use actix_web::{web, HttpResponse, Responder};
use async_stream::stream;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::OwnedSemaphorePermit;

use crate::state::AppState;
use crate::util;
use crate::ytdlp::{self, PlaylistEntry, Quality};
use crate::cookies;

#[derive(Deserialize)]
pub struct PlaylistRequest {
    pub url: String,
    // Netscape cookies.txt content exported from a logged-in browser.
    pub cookies: Option<String>,
}

#[derive(Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub quality: Quality,
    // 1-based playlist positions; omitted means the whole playlist.
    pub indices: Option<Vec<usize>>,
    pub cookies: Option<String>,
}

fn ndjson(v: serde_json::Value) -> Bytes {
    let mut line = v.to_string();
    line.push('\n');
    Bytes::from(line)
}

// Resolve requested playlist positions, keeping the request's order.
fn select_entries(
    entries: &[PlaylistEntry],
    indices: Option<&[usize]>,
) -> Result<Vec<(usize, PlaylistEntry)>, String> {
    match indices {
        None => Ok(entries
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, e)| (i + 1, e))
            .collect()),
        Some(picks) => {
            let mut selected = Vec::with_capacity(picks.len());
            for &idx in picks {
                if idx == 0 || idx > entries.len() {
                    return Err(format!(
                        "Index {} out of range (playlist has {} videos)",
                        idx,
                        entries.len()
                    ));
                }
                selected.push((idx, entries[idx - 1].clone()));
            }
            Ok(selected)
        }
    }
}

pub async fn index() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "service": "YouTube Playlist Download Service",
        "version": "0.2.0",
        "endpoints": {
            "GET /": "Health check",
            "POST /playlist": "Enumerate a playlist (body: {url, cookies})",
            "POST /download": "Download playlist videos; NDJSON progress stream (body: {url, quality, indices, cookies})"
        },
        "qualities": ["high", "medium", "low"]
    }))
}

pub async fn playlist(req: web::Json<PlaylistRequest>, state: web::Data<AppState>) -> impl Responder {
    let url = req.url.trim().to_string();
    if url.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Missing url"
        }));
    }

    eprintln!("[PLAYLIST] Request: url={}", url);

    let permit = match state.limiter.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => {
            return HttpResponse::TooManyRequests().json(serde_json::json!({
                "error": format!("Too many concurrent requests (max: {})", state.config.max_concurrent_downloads)
            }));
        }
    };

    let cookie_args = match cookies::resolve(
        state.config.as_ref(),
        req.cookies.as_deref(),
        state.cookie_lock.as_ref(),
    )
    .await
    {
        Ok(c) => c,
        Err(e) => {
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("Failed to prepare cookies: {:#}", e)
            }));
        }
    };

    // Keep the concurrency slot held while we run yt-dlp.
    let _permit: OwnedSemaphorePermit = permit;

    let cfg = state.config.as_ref();
    let title = match ytdlp::playlist_title(cfg, &cookie_args, &url).await {
        Ok(t) => t,
        Err(e) => {
            return HttpResponse::BadGateway().json(serde_json::json!({
                "error": e.message,
                "stderr_tail": e.stderr_tail
            }));
        }
    };

    let entries = match ytdlp::playlist_entries(cfg, &cookie_args, &url).await {
        Ok(v) => v,
        Err(e) => {
            return HttpResponse::BadGateway().json(serde_json::json!({
                "error": e.message,
                "stderr_tail": e.stderr_tail
            }));
        }
    };

    let listed: Vec<serde_json::Value> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            serde_json::json!({
                "index": i + 1,
                "id": e.id,
                "title": e.title,
                "url": e.url,
                "duration": e.duration,
            })
        })
        .collect();

    HttpResponse::Ok().json(serde_json::json!({
        "title": title,
        "folder": util::sanitize_title(&title),
        "count": listed.len(),
        "entries": listed,
    }))
}

pub async fn download(req: web::Json<DownloadRequest>, state: web::Data<AppState>) -> impl Responder {
    let url = req.url.trim().to_string();
    if url.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Missing url"
        }));
    }

    let quality = req.quality;
    eprintln!("[DOWNLOAD] Request: quality={} url={}", quality.label(), url);

    let permit = match state.limiter.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => {
            return HttpResponse::TooManyRequests().json(serde_json::json!({
                "error": format!("Too many concurrent downloads (max: {})", state.config.max_concurrent_downloads)
            }));
        }
    };

    // Every download merges into mp4, so ffmpeg is non-negotiable.
    let ffmpeg = match &state.ffmpeg {
        Some(p) => p.clone(),
        None => {
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "ffmpeg not found. Please install ffmpeg and ensure it's in your PATH, or set ffmpeg_bin in config.toml"
            }));
        }
    };

    let cookie_args = match cookies::resolve(
        state.config.as_ref(),
        req.cookies.as_deref(),
        state.cookie_lock.as_ref(),
    )
    .await
    {
        Ok(c) => c,
        Err(e) => {
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("Failed to prepare cookies: {:#}", e)
            }));
        }
    };

    // Resolve the playlist before the response starts so enumeration failures
    // are still proper HTTP errors.
    let cfg = state.config.clone();
    let title = match ytdlp::playlist_title(cfg.as_ref(), &cookie_args, &url).await {
        Ok(t) => t,
        Err(e) => {
            return HttpResponse::BadGateway().json(serde_json::json!({
                "error": e.message,
                "stderr_tail": e.stderr_tail
            }));
        }
    };

    let entries = match ytdlp::playlist_entries(cfg.as_ref(), &cookie_args, &url).await {
        Ok(v) => v,
        Err(e) => {
            return HttpResponse::BadGateway().json(serde_json::json!({
                "error": e.message,
                "stderr_tail": e.stderr_tail
            }));
        }
    };

    let selected = match select_entries(&entries, req.indices.as_deref()) {
        Ok(s) => s,
        Err(msg) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": msg
            }));
        }
    };

    let dir = cfg.download_dir.join(util::sanitize_title(&title));
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        return HttpResponse::InternalServerError().json(serde_json::json!({
            "error": format!("Failed to create download directory {}: {}", dir.display(), e)
        }));
    }

    eprintln!(
        "[DOWNLOAD] Playlist: {} ({} videos) -> {}",
        title,
        selected.len(),
        dir.display()
    );

    // Stream one NDJSON event per state change; the permit and the request's
    // cookie jar stay alive until the stream (and with it the batch) ends.
    let total = selected.len();
    let body = stream! {
        let _permit: OwnedSemaphorePermit = permit;
        let cookie_args = cookie_args;

        yield Ok::<Bytes, std::io::Error>(ndjson(serde_json::json!({
            "event": "queued",
            "title": title,
            "dir": dir.to_string_lossy(),
            "total": total,
        })));

        let mut ok = 0usize;
        for (index, entry) in selected {
            eprintln!("[DOWNLOAD] ({}/{}) {}", index, total, entry.url);
            yield Ok(ndjson(serde_json::json!({
                "event": "started",
                "index": index,
                "total": total,
                "id": entry.id,
                "title": entry.title,
            })));

            // Strictly sequential: each invocation blocks until yt-dlp exits.
            match ytdlp::download_video(
                cfg.as_ref(),
                &cookie_args,
                &ffmpeg,
                quality,
                &dir,
                index,
                &entry.url,
            )
            .await
            {
                Ok(()) => {
                    ok += 1;
                    yield Ok(ndjson(serde_json::json!({
                        "event": "finished",
                        "index": index,
                        "ok": true,
                    })));
                }
                Err(e) => {
                    // A failed video does not abort the batch.
                    eprintln!("[DOWNLOAD] Video {} failed: {}", index, e);
                    yield Ok(ndjson(serde_json::json!({
                        "event": "failed",
                        "index": index,
                        "ok": false,
                        "error": e.message,
                        "stderr_tail": e.stderr_tail,
                    })));
                }
            }
        }

        eprintln!("[DOWNLOAD] Done: {}/{} videos", ok, total);
        yield Ok(ndjson(serde_json::json!({
            "event": "summary",
            "ok": ok,
            "failed": total - ok,
            "total": total,
        })));
    };

    HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .append_header((actix_web::http::header::CACHE_CONTROL, "no-store"))
        .streaming(body)
}
