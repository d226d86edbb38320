//! Extension to MIME mapping for served media.

use std::path::Path;

use mime_guess::MimeGuess;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const HLS_PLAYLIST: &str = "application/vnd.apple.mpegurl";

// Checked before `mime_guess`, whose answers for these extensions are either
// missing or not what HLS players expect.
const MEDIA_TYPES: &[(&str, &str)] = &[
    ("m3u8", HLS_PLAYLIST),
    ("ts", "video/mp2t"),
    ("m4s", "video/iso.segment"),
    ("mp4", "video/mp4"),
    ("mkv", "video/x-matroska"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("avi", "video/x-msvideo"),
    ("flv", "video/x-flv"),
    ("vtt", "text/vtt"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("zip", "application/zip"),
];

/// Resolves the `Content-Type` for `path` from its extension, defaulting to
/// `application/octet-stream`.
pub fn content_type_for(path: &Path) -> String {
    let Some(ext) = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
    else {
        return OCTET_STREAM.to_string();
    };

    if let Some((_, mime)) = MEDIA_TYPES.iter().find(|(known, _)| *known == ext) {
        return (*mime).to_string();
    }

    MimeGuess::from_ext(&ext)
        .first()
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Extensions listed as raw video files by the catalog.
pub fn is_video_extension(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("mp4" | "mkv" | "mov" | "webm" | "avi" | "ts")
    )
}
