//! Listing and describing what lives under the media root.
//!
//! An asset is a directory holding a `playlist.m3u8`, optionally a
//! `master.m3u8`, extra clip playlists and `keyframes/` or `nsfw/` frame
//! folders. Raw video files at the top level are listed separately.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    cache::ProbeCache,
    content_type::is_video_extension,
    error::{MediaError, MediaResult},
    playlist::{
        MASTER_PLAYLIST_FILE, MEDIA_PLAYLIST_FILE, PLAYLIST_EXTENSION, Playlist, whole_seconds,
    },
    probe::{Fallback, Prober, probe_or_unknown},
    security::{ensure_single_segment, resolve_within_root},
};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSummary {
    pub id: String,
    pub name: String,
    pub hls_url: String,
    pub created_at: Option<String>,
    pub duration: Option<u64>,
    pub resolution: Option<String>,
    pub size_bytes: u64,
    pub size_mb: u64,
    pub segment_count: usize,
    pub avg_segment_duration: f64,
    pub clips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyframes_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub resolution: Option<String>,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Keyframes,
    Nsfw,
}

impl FrameKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Keyframes => "keyframes",
            Self::Nsfw => "nsfw",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for FrameKind {
    type Err = MediaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "keyframes" => Ok(Self::Keyframes),
            "nsfw" => Ok(Self::Nsfw),
            other => Err(MediaError::InvalidName(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub file: String,
    pub url: String,
}

/// Read-only view of the media root plus the probe caches used to describe
/// it.
pub struct Catalog {
    root: PathBuf,
    cache: ProbeCache,
    prober: Arc<dyn Prober>,
}

impl Catalog {
    pub fn new(root: PathBuf, prober: Arc<dyn Prober>) -> Self {
        Self {
            root,
            cache: ProbeCache::default(),
            prober,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &ProbeCache {
        &self.cache
    }

    /// Every readable asset under the root, sorted by name.
    pub fn list_assets(&self) -> MediaResult<Vec<MediaSummary>> {
        let entries =
            fs::read_dir(&self.root).map_err(|err| MediaError::from_io(err, "media root"))?;
        let mut assets = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let dir = entry.path();
            if !dir.join(MEDIA_PLAYLIST_FILE).is_file() {
                continue;
            }
            match self.summarize(&name, &dir) {
                Ok(summary) => assets.push(summary),
                Err(err) => {
                    tracing::debug!(asset = %name, error = %err, "skipping asset");
                }
            }
        }
        assets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(assets)
    }

    pub fn describe_asset(&self, name: &str) -> MediaResult<MediaSummary> {
        let dir = self.asset_dir(name)?;
        self.summarize(name, &dir)
    }

    /// Parses `file` inside asset `name`.
    pub fn inspect_playlist(&self, name: &str, file: &str) -> MediaResult<Playlist> {
        let dir = self.asset_dir(name)?;
        ensure_single_segment(file)?;
        if Path::new(file).extension().and_then(|ext| ext.to_str()) != Some(PLAYLIST_EXTENSION) {
            return Err(MediaError::InvalidName(file.to_string()));
        }
        Playlist::parse(&dir.join(file))
    }

    /// The canonical media playlist of asset `name`.
    pub fn media_playlist(&self, name: &str) -> MediaResult<Playlist> {
        let dir = self.asset_dir(name)?;
        Playlist::parse(&dir.join(MEDIA_PLAYLIST_FILE))
    }

    /// Raw video files at the top level of the root, sorted by name.
    pub fn list_files(&self) -> MediaResult<Vec<FileSummary>> {
        let entries =
            fs::read_dir(&self.root).map_err(|err| MediaError::from_io(err, "media root"))?;
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() || !is_video_extension(&path) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let size = metadata.len();
            files.push(FileSummary {
                id: short_hash(format!("{name}|{size}").as_bytes(), 16),
                resolution: self.probed_resolution(&path),
                duration: self.probed_duration(&path).map(whole_seconds),
                name,
                size,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Removes asset `name` and everything in it.
    pub fn delete_asset(&self, name: &str) -> MediaResult<()> {
        let dir = self.asset_dir(name)?;
        if !dir.is_dir() {
            return Err(MediaError::not_found("asset"));
        }
        fs::remove_dir_all(&dir).map_err(|err| MediaError::from_io(err, "asset"))?;
        tracing::info!(asset = %name, "asset deleted");
        Ok(())
    }

    /// JPEG frames extracted for asset `name`, sorted by file name.
    pub fn list_frames(&self, name: &str, kind: FrameKind) -> MediaResult<Vec<Frame>> {
        let dir = self.asset_dir(name)?.join(kind.dir_name());
        let entries = fs::read_dir(&dir).map_err(|err| MediaError::from_io(err, "frames"))?;
        let mut files: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|file| is_frame_image(file))
            .collect();
        files.sort();
        Ok(files
            .into_iter()
            .map(|file| Frame {
                url: format!(
                    "/videos/{}/{kind}/{}",
                    urlencoding::encode(name),
                    urlencoding::encode(&file)
                ),
                file,
            })
            .collect())
    }

    fn asset_dir(&self, name: &str) -> MediaResult<PathBuf> {
        ensure_single_segment(name)?;
        resolve_within_root(&self.root, name)
    }

    fn summarize(&self, name: &str, dir: &Path) -> MediaResult<MediaSummary> {
        let playlist_path = dir.join(MEDIA_PLAYLIST_FILE);
        let bytes = fs::read(&playlist_path).map_err(|err| MediaError::from_io(err, "playlist"))?;
        let playlist = Playlist::from_bytes(&playlist_path, &bytes)?;

        let master_path = dir.join(MASTER_PLAYLIST_FILE);
        let master = master_path
            .is_file()
            .then(|| Playlist::parse(&master_path).ok())
            .flatten();
        let entry_file = if master.is_some() {
            MASTER_PLAYLIST_FILE
        } else {
            MEDIA_PLAYLIST_FILE
        };

        let resolution = Fallback::new("resolution")
            .then("manifest", || {
                master
                    .as_ref()
                    .and_then(|master| master.manifest_resolution())
                    .map(str::to_string)
            })
            .then("probe", || {
                let segment = playlist.first_playable_segment()?;
                self.probed_resolution(&segment)
            })
            .resolve();

        let duration = Fallback::new("duration")
            .then("segments", || {
                let total = playlist.duration_seconds();
                (total > 0.0).then_some(total)
            })
            .then("probe", || self.probed_duration(&playlist.path))
            .resolve()
            .map(whole_seconds);

        let size_bytes = playlist.size_bytes();
        let encoded = urlencoding::encode(name);
        Ok(MediaSummary {
            id: asset_id(dir, name, Some(&bytes)),
            name: name.to_string(),
            hls_url: format!("/videos/{encoded}/{entry_file}"),
            created_at: modified_rfc3339(dir),
            duration,
            resolution,
            size_bytes,
            size_mb: (size_bytes as f64 / BYTES_PER_MB).round() as u64,
            segment_count: playlist.segment_count(),
            avg_segment_duration: playlist.average_segment_duration(),
            clips: clip_playlists(dir),
            keyframes_url: dir
                .join(FrameKind::Keyframes.dir_name())
                .is_dir()
                .then(|| format!("/frames/{encoded}/keyframes")),
        })
    }

    fn probed_resolution(&self, path: &Path) -> Option<String> {
        self.cache.resolution.get_or_compute(path, || {
            probe_or_unknown(self.prober.resolution(path), path)
        })
    }

    fn probed_duration(&self, path: &Path) -> Option<f64> {
        self.cache
            .duration
            .get_or_compute(path, || probe_or_unknown(self.prober.duration(path), path))
    }
}

/// Stable identifier of an asset.
///
/// Hashes the directory path together with the playlist contents, so the id
/// changes when the playlist is rewritten. Without readable contents it falls
/// back to a shorter hash of the normalized folder name.
pub fn asset_id(dir: &Path, name: &str, playlist: Option<&[u8]>) -> String {
    match playlist {
        Some(bytes) => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(dir.as_os_str().as_encoded_bytes());
            hasher.update(bytes);
            encode_prefix(hasher.finalize().as_bytes(), 16)
        }
        None => short_hash(name.trim().to_lowercase().as_bytes(), 8),
    }
}

fn short_hash(input: &[u8], len: usize) -> String {
    encode_prefix(blake3::hash(input).as_bytes(), len)
}

fn encode_prefix(digest: &[u8; 32], len: usize) -> String {
    URL_SAFE_NO_PAD.encode(&digest[..len])
}

pub(crate) fn modified_rfc3339(path: &Path) -> Option<String> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Playlists in `dir` other than the canonical media and master ones.
fn clip_playlists(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut clips: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|file| {
            Path::new(file).extension().and_then(|ext| ext.to_str()) == Some(PLAYLIST_EXTENSION)
                && file != MEDIA_PLAYLIST_FILE
                && file != MASTER_PLAYLIST_FILE
        })
        .collect();
    clips.sort();
    clips
}

fn is_frame_image(file: &str) -> bool {
    matches!(
        Path::new(file)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("jpg" | "jpeg")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::FakeProber;
    use tempfile::{TempDir, tempdir};

    const MEDIA: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-TARGETDURATION:4\n\
        #EXTINF:4.0,\n\
        seg_000.ts\n\
        #EXTINF:4.0,\n\
        seg_001.ts\n\
        #EXTINF:2.5,\n\
        seg_002.ts\n\
        #EXT-X-ENDLIST\n";

    fn add_asset(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MEDIA_PLAYLIST_FILE), MEDIA).unwrap();
        for (i, size) in [1024usize, 2048, 512].into_iter().enumerate() {
            fs::write(dir.join(format!("seg_{i:03}.ts")), vec![0u8; size]).unwrap();
        }
        dir
    }

    fn catalog(root: &TempDir, prober: FakeProber) -> (Catalog, Arc<FakeProber>) {
        let prober = Arc::new(prober);
        let catalog = Catalog::new(root.path().to_path_buf(), prober.clone());
        (catalog, prober)
    }

    #[test]
    fn lists_assets_sorted_and_skips_non_assets() {
        let root = tempdir().unwrap();
        add_asset(root.path(), "zeta");
        add_asset(root.path(), "alpha");
        add_asset(root.path(), ".hidden");
        fs::create_dir(root.path().join("empty")).unwrap();
        let broken = root.path().join("broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join(MEDIA_PLAYLIST_FILE), "garbage").unwrap();
        fs::write(root.path().join("loose.mp4"), b"x").unwrap();

        let (catalog, _) = catalog(&root, FakeProber::default());
        let names: Vec<_> = catalog
            .list_assets()
            .unwrap()
            .into_iter()
            .map(|asset| asset.name)
            .collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[test]
    fn summary_reports_playlist_derived_fields() {
        let root = tempdir().unwrap();
        let dir = add_asset(root.path(), "movie");
        fs::write(dir.join("intro.m3u8"), MEDIA).unwrap();
        fs::create_dir(dir.join("keyframes")).unwrap();
        let segment = dir.join("seg_000.ts");

        let (catalog, _) = catalog(&root, FakeProber::default().with_resolution(&segment, "1280x720"));
        let summary = catalog.describe_asset("movie").unwrap();

        assert_eq!(summary.name, "movie");
        assert_eq!(summary.hls_url, "/videos/movie/playlist.m3u8");
        assert_eq!(summary.duration, Some(10));
        assert_eq!(summary.resolution.as_deref(), Some("1280x720"));
        assert_eq!(summary.segment_count, 3);
        assert!((summary.avg_segment_duration - 3.5).abs() < 1e-6);
        assert_eq!(summary.size_bytes, 3584);
        assert_eq!(summary.size_mb, 0);
        assert_eq!(summary.clips, ["intro.m3u8"]);
        assert_eq!(summary.keyframes_url.as_deref(), Some("/frames/movie/keyframes"));
        assert!(summary.created_at.is_some());
        assert_eq!(summary.id.len(), 22);
    }

    #[test]
    fn master_playlist_wins_for_url_and_resolution() {
        let root = tempdir().unwrap();
        let dir = add_asset(root.path(), "movie");
        fs::write(
            dir.join(MASTER_PLAYLIST_FILE),
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1920x1080\nplaylist.m3u8\n",
        )
        .unwrap();

        let (catalog, prober) = catalog(&root, FakeProber::default());
        let summary = catalog.describe_asset("movie").unwrap();
        assert_eq!(summary.hls_url, "/videos/movie/master.m3u8");
        assert_eq!(summary.resolution.as_deref(), Some("1920x1080"));
        assert!(summary.clips.is_empty());
        assert_eq!(prober.call_count("resolution"), 0);
    }

    #[test]
    fn probe_runs_once_per_segment_across_listings() {
        let root = tempdir().unwrap();
        let dir = add_asset(root.path(), "movie");
        let segment = dir.join("seg_000.ts");
        let (catalog, prober) = catalog(&root, FakeProber::default().with_resolution(&segment, "640x360"));

        for _ in 0..3 {
            let assets = catalog.list_assets().unwrap();
            assert_eq!(assets[0].resolution.as_deref(), Some("640x360"));
        }
        assert_eq!(prober.call_count("resolution"), 1);
    }

    #[test]
    fn probe_failure_leaves_resolution_unknown() {
        let root = tempdir().unwrap();
        add_asset(root.path(), "movie");
        let (catalog, _) = catalog(&root, FakeProber::default());
        let summary = catalog.describe_asset("movie").unwrap();
        assert_eq!(summary.resolution, None);
        assert_eq!(summary.duration, Some(10));
    }

    #[test]
    fn empty_playlist_duration_falls_back_to_probe() {
        let root = tempdir().unwrap();
        let dir = root.path().join("live");
        fs::create_dir(&dir).unwrap();
        let playlist = dir.join(MEDIA_PLAYLIST_FILE);
        fs::write(&playlist, "#EXTM3U\n#EXT-X-TARGETDURATION:4\n").unwrap();

        let (catalog, _) = catalog(&root, FakeProber::default().with_duration(&playlist, 42.9));
        let summary = catalog.describe_asset("live").unwrap();
        assert_eq!(summary.duration, Some(42));
        assert_eq!(summary.segment_count, 0);
    }

    #[test]
    fn describe_reports_missing_and_malformed_playlists() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("empty")).unwrap();
        let broken = root.path().join("broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join(MEDIA_PLAYLIST_FILE), "garbage").unwrap();

        let (catalog, _) = catalog(&root, FakeProber::default());
        assert!(matches!(catalog.describe_asset("empty"), Err(MediaError::NotFound(_))));
        assert!(matches!(catalog.describe_asset("broken"), Err(MediaError::InvalidFormat { .. })));
        assert!(matches!(catalog.describe_asset(".."), Err(MediaError::InvalidName(_))));
    }

    #[test]
    fn inspect_playlist_requires_playlist_file_name() {
        let root = tempdir().unwrap();
        let dir = add_asset(root.path(), "movie");
        fs::write(dir.join("clip.m3u8"), MEDIA).unwrap();
        let (catalog, _) = catalog(&root, FakeProber::default());

        let playlist = catalog.inspect_playlist("movie", "clip.m3u8").unwrap();
        assert_eq!(playlist.segment_count(), 3);
        assert!(matches!(
            catalog.inspect_playlist("movie", "seg_000.ts"),
            Err(MediaError::InvalidName(_))
        ));
        assert!(matches!(
            catalog.inspect_playlist("movie", "../movie/clip.m3u8"),
            Err(MediaError::InvalidName(_))
        ));
    }

    #[test]
    fn lists_top_level_video_files_with_probed_metadata() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("b.mkv"), vec![0u8; 10]).unwrap();
        fs::write(root.path().join("a.MP4"), vec![0u8; 20]).unwrap();
        fs::write(root.path().join("notes.txt"), b"x").unwrap();
        add_asset(root.path(), "movie");
        let a = root.path().join("a.MP4");

        let (catalog, prober) = catalog(
            &root,
            FakeProber::default()
                .with_resolution(&a, "1920x1080")
                .with_duration(&a, 61.7),
        );
        let files = catalog.list_files().unwrap();
        let names: Vec<_> = files.iter().map(|file| file.name.as_str()).collect();
        assert_eq!(names, ["a.MP4", "b.mkv"]);
        assert_eq!(files[0].size, 20);
        assert_eq!(files[0].resolution.as_deref(), Some("1920x1080"));
        assert_eq!(files[0].duration, Some(61));
        assert_eq!(files[1].resolution, None);
        assert_ne!(files[0].id, files[1].id);

        catalog.list_files().unwrap();
        // b.mkv has no scripted answer, so only it is probed again.
        assert_eq!(prober.call_count("resolution"), 3);
    }

    #[test]
    fn delete_removes_asset_directory() {
        let root = tempdir().unwrap();
        let dir = add_asset(root.path(), "movie");
        let (catalog, _) = catalog(&root, FakeProber::default());

        catalog.delete_asset("movie").unwrap();
        assert!(!dir.exists());
        assert!(matches!(catalog.delete_asset("movie"), Err(MediaError::NotFound(_))));
        assert!(matches!(catalog.delete_asset("a/b"), Err(MediaError::InvalidName(_))));
        assert!(root.path().exists());
    }

    #[test]
    fn lists_frames_sorted_and_filtered() {
        let root = tempdir().unwrap();
        let dir = add_asset(root.path(), "movie");
        let frames = dir.join("keyframes");
        fs::create_dir(&frames).unwrap();
        for file in ["0002.jpg", "0001.JPEG", "thumbs.db"] {
            fs::write(frames.join(file), b"x").unwrap();
        }
        let (catalog, _) = catalog(&root, FakeProber::default());

        let listed = catalog.list_frames("movie", FrameKind::Keyframes).unwrap();
        let files: Vec<_> = listed.iter().map(|frame| frame.file.as_str()).collect();
        assert_eq!(files, ["0001.JPEG", "0002.jpg"]);
        assert_eq!(listed[1].url, "/videos/movie/keyframes/0002.jpg");

        assert!(matches!(
            catalog.list_frames("movie", FrameKind::Nsfw),
            Err(MediaError::NotFound(_))
        ));
    }

    #[test]
    fn frame_kind_parses_known_values() {
        assert_eq!("nsfw".parse::<FrameKind>().unwrap(), FrameKind::Nsfw);
        assert_eq!(FrameKind::Keyframes.to_string(), "keyframes");
        assert!("thumbs".parse::<FrameKind>().is_err());
    }

    #[test]
    fn asset_id_depends_on_contents_and_falls_back_to_name() {
        let dir = Path::new("/media/movie");
        let a = asset_id(dir, "movie", Some(b"one"));
        let b = asset_id(dir, "movie", Some(b"two"));
        assert_ne!(a, b);
        assert_eq!(a, asset_id(dir, "movie", Some(b"one")));

        let fallback = asset_id(dir, " Movie ", None);
        assert_eq!(fallback, asset_id(dir, "movie", None));
        assert_eq!(fallback.len(), 11);
    }
}
