//! HLS playlist parsing and derived playlist metadata.
//!
//! Parsing is delegated to `m3u8-rs`; this module turns its output into the
//! small model the rest of the server needs and keeps the original media
//! playlist around so clips can be cut from it without losing per-segment
//! tags.

use std::{
    fs,
    path::{Path, PathBuf},
};

use m3u8_rs::MediaPlaylist;
use serde::Serialize;

use crate::{
    error::{MediaError, MediaResult},
    security::resolve_within_root,
};

pub const MEDIA_PLAYLIST_FILE: &str = "playlist.m3u8";
pub const MASTER_PLAYLIST_FILE: &str = "master.m3u8";
pub const PLAYLIST_EXTENSION: &str = "m3u8";

/// One playable chunk of a media playlist.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub uri: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistKind {
    Media,
    Master,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    #[serde(skip)]
    pub path: PathBuf,
    pub kind: PlaylistKind,
    /// Playback order. Always empty for master playlists.
    pub segments: Vec<Segment>,
    /// Distinct `RESOLUTION=` values of a master playlist, in manifest order.
    pub variant_resolutions: Vec<String>,
    #[serde(skip)]
    media: Option<MediaPlaylist>,
}

impl Playlist {
    /// Reads and parses the playlist at `path`.
    pub fn parse(path: &Path) -> MediaResult<Self> {
        let bytes = fs::read(path).map_err(|err| MediaError::from_io(err, "playlist"))?;
        Self::from_bytes(path, &bytes)
    }

    pub fn from_bytes(path: &Path, bytes: &[u8]) -> MediaResult<Self> {
        let parsed = m3u8_rs::parse_playlist_res(bytes).map_err(|err| MediaError::InvalidFormat {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

        let playlist = match parsed {
            m3u8_rs::Playlist::MasterPlaylist(master) => {
                let mut variant_resolutions: Vec<String> = Vec::new();
                for resolution in master.variants.iter().filter_map(|v| v.resolution.as_ref()) {
                    let value = format!("{}x{}", resolution.width, resolution.height);
                    if !variant_resolutions.contains(&value) {
                        variant_resolutions.push(value);
                    }
                }
                Self {
                    path: path.to_path_buf(),
                    kind: PlaylistKind::Master,
                    segments: Vec::new(),
                    variant_resolutions,
                    media: None,
                }
            }
            m3u8_rs::Playlist::MediaPlaylist(media) => Self {
                path: path.to_path_buf(),
                kind: PlaylistKind::Media,
                segments: media
                    .segments
                    .iter()
                    .map(|segment| Segment {
                        uri: segment.uri.clone(),
                        duration_seconds: f64::from(segment.duration),
                    })
                    .collect(),
                variant_resolutions: Vec::new(),
                media: Some(media),
            },
        };

        Ok(playlist)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_seconds).sum()
    }

    pub fn average_segment_duration(&self) -> f64 {
        if self.segments.is_empty() {
            0.0
        } else {
            self.duration_seconds() / self.segments.len() as f64
        }
    }

    /// First non-empty variant resolution of a master playlist.
    pub fn manifest_resolution(&self) -> Option<&str> {
        self.variant_resolutions
            .iter()
            .map(String::as_str)
            .find(|value| !value.is_empty())
    }

    /// Directory segment URIs are relative to.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Local file for `segment` inside the playlist directory.
    ///
    /// `None` for remote or empty URIs and for URIs that climb out of the
    /// directory; those segments are treated like missing files. An absolute
    /// URI is taken relative to the directory.
    pub fn segment_path(&self, segment: &Segment) -> Option<PathBuf> {
        let uri = segment.uri.trim();
        if uri.is_empty() || uri.contains("://") {
            return None;
        }
        match resolve_within_root(self.directory(), uri) {
            Ok(path) => Some(path),
            Err(_) => {
                tracing::debug!(playlist = %self.path.display(), uri, "segment outside playlist directory");
                None
            }
        }
    }

    /// Sum of the sizes of referenced segment files. Missing files count as
    /// zero.
    pub fn size_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter_map(|segment| self.segment_path(segment))
            .filter_map(|path| fs::metadata(path).ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    /// First segment whose file exists on disk.
    pub fn first_playable_segment(&self) -> Option<PathBuf> {
        self.segments
            .iter()
            .filter_map(|segment| self.segment_path(segment))
            .find(|path| path.is_file())
    }

    pub(crate) fn media_playlist(&self) -> Option<&MediaPlaylist> {
        self.media.as_ref()
    }
}

/// Converts seconds to the whole seconds reported by listings.
pub fn whole_seconds(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds.trunc() as u64
    } else {
        0
    }
}
