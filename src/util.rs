/// Sanitize a playlist title for use as a directory name: the Windows-reserved
/// set `< > : " / \ | ? *` becomes `_`, surrounding whitespace is trimmed and
/// trailing dots/spaces are stripped (invalid at the end of a Windows
/// directory name).
pub fn sanitize_title(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();

    let trimmed = replaced.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        // An empty component would make directory creation fail downstream.
        "playlist".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Escape a string used as a literal part of a yt-dlp `-o` output template.
/// yt-dlp expands `%(...)s` sequences, so literal percent signs must be doubled.
pub fn escape_output_template(s: &str) -> String {
    s.replace('%', "%%")
}

pub fn sanitize_filename_component(s: &str) -> String {
    // Keep this conservative: avoid path separators and other odd chars.
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
        .collect()
}

pub fn video_id_from_url(url: &str) -> Option<String> {
    // Very small heuristic; avoids adding a URL parser dependency.
    if let Some(idx) = url.find("v=") {
        let rest = &url[idx + 2..];
        let id = rest.split('&').next().unwrap_or(rest);
        let id = sanitize_filename_component(id);
        if !id.is_empty() {
            return Some(id);
        }
    }
    if let Some(idx) = url.find("youtu.be/") {
        let rest = &url[idx + "youtu.be/".len()..];
        let id = rest.split('?').next().unwrap_or(rest);
        let id = sanitize_filename_component(id);
        if !id.is_empty() {
            return Some(id);
        }
    }
    None
}
