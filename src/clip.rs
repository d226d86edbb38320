//! Cutting sub-clips out of a media playlist.
//!
//! A clip is a new media playlist in the asset directory that references a
//! contiguous run of the source's segment files. Nothing is re-encoded or
//! copied.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use m3u8_rs::{Key, Map, MediaSegment};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::{
    error::{MediaError, MediaResult},
    playlist::{MASTER_PLAYLIST_FILE, MEDIA_PLAYLIST_FILE, PLAYLIST_EXTENSION, Playlist},
    security::ensure_single_segment,
};

const DEFAULT_HLS_VERSION: usize = 3;

/// Serializes writes per destination file; cuts to different files run in
/// parallel.
#[derive(Default)]
pub struct ClipCutter {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ClipCutter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes segments `[from, to)` of `source` as a new playlist next to it
    /// and returns the new file name.
    ///
    /// Without `name` the file is called `cut_{from}_{to}_{HHMMSS}`. An
    /// existing clip with the same name is overwritten.
    pub fn cut(
        &self,
        source: &Playlist,
        from: usize,
        to: usize,
        name: Option<&str>,
    ) -> MediaResult<String> {
        let media = source
            .media_playlist()
            .ok_or_else(|| MediaError::InvalidFormat {
                path: source.path.clone(),
                reason: "not a media playlist".to_string(),
            })?;

        let segment_count = media.segments.len();
        if from >= to || to > segment_count {
            return Err(MediaError::InvalidRange {
                from,
                to,
                segment_count,
            });
        }

        let file_name = clip_file_name(from, to, name)?;
        let dir = source.directory();
        let destination = dir.join(&file_name);

        let mut clip = media.clone();
        clip.segments = media.segments[from..to].to_vec();
        // m3u8-rs attaches MAP and KEY only to the segment they precede, so
        // the first kept segment inherits whatever was in force at `from`.
        if let Some(first) = clip.segments.first_mut() {
            let (map, key) = tags_in_force(&media.segments[..=from]);
            if first.map.is_none() {
                first.map = map;
            }
            if first.key.is_none() {
                first.key = key;
            }
        }
        clip.media_sequence = from as u64;
        clip.target_duration = target_duration(&clip.segments) as _;
        clip.version = clip.version.or(Some(DEFAULT_HLS_VERSION));
        clip.end_list = true;

        let mut encoded = Vec::new();
        clip.write_to(&mut encoded)?;

        let lock = self.lock_for(&destination);
        let written = {
            let _guard = lock.lock();
            write_atomically(dir, &destination, &encoded)
        };
        drop(lock);
        self.release(&destination);
        written?;

        tracing::info!(
            source = %source.path.display(),
            clip = %destination.display(),
            from,
            to,
            "clip created"
        );
        Ok(file_name)
    }

    fn lock_for(&self, destination: &Path) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(destination.to_path_buf())
                .or_default(),
        )
    }

    /// Drops the lock entry for `destination` once no cut holds it.
    fn release(&self, destination: &Path) {
        let mut locks = self.locks.lock();
        if locks
            .get(destination)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(destination);
        }
    }
}

/// Last `EXT-X-MAP` and `EXT-X-KEY` seen across `segments`.
fn tags_in_force(segments: &[MediaSegment]) -> (Option<Map>, Option<Key>) {
    segments.iter().fold((None, None), |(map, key), segment| {
        (
            segment.map.clone().or(map),
            segment.key.clone().or(key),
        )
    })
}

/// Smallest whole number of seconds that is at least every segment duration.
fn target_duration(segments: &[MediaSegment]) -> u64 {
    segments
        .iter()
        .map(|segment| f64::from(segment.duration).ceil() as u64)
        .max()
        .unwrap_or(0)
}

fn clip_file_name(from: usize, to: usize, name: Option<&str>) -> MediaResult<String> {
    let stem = match name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => {
            let stem = name
                .strip_suffix(&format!(".{PLAYLIST_EXTENSION}"))
                .unwrap_or(name);
            ensure_single_segment(stem)?;
            let file = format!("{stem}.{PLAYLIST_EXTENSION}");
            if file == MEDIA_PLAYLIST_FILE || file == MASTER_PLAYLIST_FILE {
                return Err(MediaError::InvalidName(stem.to_string()));
            }
            stem.to_string()
        }
        None => format!("cut_{from}_{to}_{}", Utc::now().format("%H%M%S")),
    };
    Ok(format!("{stem}.{PLAYLIST_EXTENSION}"))
}

fn write_atomically(dir: &Path, destination: &Path, contents: &[u8]) -> MediaResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(destination).map_err(|err| MediaError::Io(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::PlaylistKind;
    use tempfile::tempdir;

    const SOURCE: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-TARGETDURATION:7\n\
        #EXT-X-MEDIA-SEQUENCE:0\n\
        #EXTINF:4.0,\n\
        seg_000.ts\n\
        #EXTINF:6.2,\n\
        seg_001.ts\n\
        #EXTINF:4.0,\n\
        seg_002.ts\n\
        #EXTINF:2.5,\n\
        seg_003.ts\n\
        #EXT-X-ENDLIST\n";

    fn source_in(dir: &Path) -> Playlist {
        let path = dir.join(MEDIA_PLAYLIST_FILE);
        std::fs::write(&path, SOURCE).unwrap();
        Playlist::parse(&path).unwrap()
    }

    #[test]
    fn cut_keeps_selected_segments_in_order() {
        let dir = tempdir().unwrap();
        let source = source_in(dir.path());
        let cutter = ClipCutter::new();

        let file = cutter.cut(&source, 1, 3, Some("intro")).unwrap();
        assert_eq!(file, "intro.m3u8");

        let clip = Playlist::parse(&dir.path().join(&file)).unwrap();
        assert_eq!(clip.kind, PlaylistKind::Media);
        let uris: Vec<_> = clip.segments.iter().map(|s| s.uri.as_str()).collect();
        assert_eq!(uris, ["seg_001.ts", "seg_002.ts"]);

        let media = clip.media_playlist().unwrap();
        assert_eq!(media.media_sequence, 1);
        assert_eq!(media.target_duration as u64, 7);
        assert!(media.end_list);
    }

    #[test]
    fn full_range_reproduces_source() {
        let dir = tempdir().unwrap();
        let source = source_in(dir.path());
        let file = ClipCutter::new()
            .cut(&source, 0, source.segment_count(), Some("all"))
            .unwrap();

        let clip = Playlist::parse(&dir.path().join(file)).unwrap();
        assert_eq!(clip.segments, source.segments);
        assert_eq!(clip.media_playlist().unwrap().media_sequence, 0);
    }

    #[test]
    fn empty_or_out_of_bounds_ranges_are_rejected() {
        let dir = tempdir().unwrap();
        let source = source_in(dir.path());
        let cutter = ClipCutter::new();

        for (from, to) in [(1, 1), (3, 2), (0, 5), (4, 5)] {
            let err = cutter.cut(&source, from, to, Some("bad")).unwrap_err();
            assert!(
                matches!(err, MediaError::InvalidRange { segment_count: 4, .. }),
                "{from}..{to}"
            );
        }
        assert!(!dir.path().join("bad.m3u8").exists());
    }

    #[test]
    fn default_name_encodes_range() {
        let dir = tempdir().unwrap();
        let source = source_in(dir.path());
        let file = ClipCutter::new().cut(&source, 0, 2, None).unwrap();
        assert!(file.starts_with("cut_0_2_"), "{file}");
        assert!(file.ends_with(".m3u8"));
        assert!(dir.path().join(&file).is_file());
    }

    #[test]
    fn repeated_name_overwrites() {
        let dir = tempdir().unwrap();
        let source = source_in(dir.path());
        let cutter = ClipCutter::new();
        cutter.cut(&source, 0, 1, Some("clip.m3u8")).unwrap();
        cutter.cut(&source, 2, 4, Some("clip")).unwrap();

        let clip = Playlist::parse(&dir.path().join("clip.m3u8")).unwrap();
        assert_eq!(clip.segment_count(), 2);
        assert_eq!(clip.segments[0].uri, "seg_002.ts");
    }

    #[test]
    fn unsafe_or_reserved_names_are_rejected() {
        let dir = tempdir().unwrap();
        let source = source_in(dir.path());
        let cutter = ClipCutter::new();
        for name in ["../escape", "a/b", "..", "playlist", "master.m3u8"] {
            let err = cutter.cut(&source, 0, 1, Some(name)).unwrap_err();
            assert!(matches!(err, MediaError::InvalidName(_)), "{name}");
        }
    }

    #[test]
    fn master_playlist_cannot_be_cut() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MASTER_PLAYLIST_FILE);
        std::fs::write(
            &path,
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=640x360\nlow.m3u8\n",
        )
        .unwrap();
        let master = Playlist::parse(&path).unwrap();
        let err = ClipCutter::new().cut(&master, 0, 1, None).unwrap_err();
        assert!(matches!(err, MediaError::InvalidFormat { .. }));
    }

    const FMP4_SOURCE: &str = "#EXTM3U\n\
        #EXT-X-VERSION:7\n\
        #EXT-X-TARGETDURATION:4\n\
        #EXT-X-MAP:URI=\"init.mp4\"\n\
        #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
        #EXTINF:4.0,\n\
        seg0.m4s\n\
        #EXTINF:4.0,\n\
        seg1.m4s\n\
        #EXTINF:4.0,\n\
        seg2.m4s\n\
        #EXT-X-ENDLIST\n";

    #[test]
    fn clip_inherits_map_and_key_in_force_at_its_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MEDIA_PLAYLIST_FILE);
        std::fs::write(&path, FMP4_SOURCE).unwrap();
        let source = Playlist::parse(&path).unwrap();

        let file = ClipCutter::new().cut(&source, 1, 3, Some("tail")).unwrap();
        let text = std::fs::read_to_string(dir.path().join(&file)).unwrap();
        assert!(text.contains("#EXT-X-MAP:URI=\"init.mp4\""), "{text}");
        assert!(text.contains("#EXT-X-KEY:METHOD=AES-128"), "{text}");
        assert!(text.contains("key.bin"), "{text}");

        let clip = Playlist::parse(&dir.path().join(&file)).unwrap();
        let media = clip.media_playlist().unwrap();
        assert_eq!(media.segments.len(), 2);
        assert_eq!(
            media.segments[0].map.as_ref().map(|map| map.uri.as_str()),
            Some("init.mp4")
        );
        assert!(media.segments[0].key.is_some());
        assert!(media.segments[1].map.is_none());
    }

    #[test]
    fn later_map_replaces_earlier_one() {
        let segments = vec![
            MediaSegment {
                uri: "a.m4s".into(),
                map: Some(Map {
                    uri: "init-a.mp4".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            MediaSegment {
                uri: "b.m4s".into(),
                map: Some(Map {
                    uri: "init-b.mp4".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            MediaSegment {
                uri: "c.m4s".into(),
                ..Default::default()
            },
        ];
        let (map, key) = tags_in_force(&segments);
        assert_eq!(map.map(|map| map.uri), Some("init-b.mp4".to_string()));
        assert!(key.is_none());
    }

    #[test]
    fn lock_table_is_empty_after_cuts() {
        let dir = tempdir().unwrap();
        let source = source_in(dir.path());
        let cutter = ClipCutter::new();
        for name in ["one", "two", "one"] {
            cutter.cut(&source, 0, 2, Some(name)).unwrap();
        }
        assert!(cutter.locks.lock().is_empty());
    }

    #[test]
    fn target_duration_rounds_up() {
        let segments = vec![
            MediaSegment {
                uri: "a.ts".into(),
                duration: 4.0,
                ..Default::default()
            },
            MediaSegment {
                uri: "b.ts".into(),
                duration: 5.01,
                ..Default::default()
            },
        ];
        assert_eq!(target_duration(&segments), 6);
        assert_eq!(target_duration(&[]), 0);
    }
}
