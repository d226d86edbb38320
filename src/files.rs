//! General file management below the media root: browsing, uploads (whole or
//! in chunks), renames, deletes and folder creation.
//!
//! Every caller-supplied path goes through [`resolve_within_root`], so no
//! operation here can reach outside the root or act on the root itself.
//! Listing is the one exception that accepts the root, spelled `""` or `.`.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use serde::Serialize;
use tempfile::{NamedTempFile, TempPath};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

use crate::{
    catalog::modified_rfc3339,
    error::{MediaError, MediaResult},
    security::resolve_within_root,
};

const PARTIAL_UPLOAD_SUFFIX: &str = "part";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: Option<String>,
    /// Path relative to the media root, `/`-separated.
    pub path: String,
}

pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn resolve(&self, relative: &str) -> MediaResult<PathBuf> {
        resolve_within_root(&self.root, relative.trim())
    }

    /// Visible entries of folder `relative`, sorted by name. Dot-files,
    /// including in-progress uploads, are skipped.
    pub fn list_dir(&self, relative: &str) -> MediaResult<Vec<FileEntry>> {
        let dir = if names_root(relative) {
            self.root.clone()
        } else {
            self.resolve(relative)?
        };
        if !dir.is_dir() {
            return Err(MediaError::not_found("folder"));
        }
        let prefix = dir
            .strip_prefix(&self.root)
            .map(relative_string)
            .unwrap_or_default();

        let entries = fs::read_dir(&dir).map_err(|err| MediaError::from_io(err, "folder"))?;
        let mut listed = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                tracing::debug!(entry = %entry.path().display(), "skipping unreadable entry");
                continue;
            };
            listed.push(FileEntry {
                path: if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                },
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                mod_time: modified_rfc3339(&entry.path()),
                name,
            });
        }
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    /// Creates folder `relative` and any missing parents.
    pub fn create_folder(&self, relative: &str) -> MediaResult<()> {
        let dir = self.resolve(relative)?;
        fs::create_dir_all(&dir)?;
        tracing::info!(path = %dir.display(), "folder created");
        Ok(())
    }

    /// Moves `from` to `to`, replacing an existing file at `to`.
    pub fn rename(&self, from: &str, to: &str) -> MediaResult<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if target != source && target.starts_with(&source) {
            return Err(MediaError::InvalidName(to.trim().to_string()));
        }
        fs::rename(&source, &target).map_err(|err| MediaError::from_io(err, "file"))?;
        tracing::info!(from = %source.display(), to = %target.display(), "file renamed");
        Ok(())
    }

    /// Removes a file or an empty folder.
    pub fn delete(&self, relative: &str) -> MediaResult<()> {
        let path = self.resolve(relative)?;
        let metadata =
            fs::symlink_metadata(&path).map_err(|err| MediaError::from_io(err, "file"))?;
        let removed = if metadata.is_dir() {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => {
                return Err(MediaError::DirectoryNotEmpty);
            }
            Err(err) => return Err(MediaError::from_io(err, "file")),
        }
        tracing::info!(path = %path.display(), "file deleted");
        Ok(())
    }

    /// Opens an upload to `relative`. Parent folders are created; the target
    /// only appears once [`Upload::finish`] succeeds.
    pub async fn begin_upload(&self, relative: &str) -> MediaResult<Upload> {
        let destination = self.resolve(relative)?;
        if destination.is_dir() {
            return Err(MediaError::InvalidName(relative.trim().to_string()));
        }
        let parent = parent_of(&destination)?;
        tokio::fs::create_dir_all(parent).await?;
        let (file, temp) = NamedTempFile::new_in(parent)?.into_parts();
        Ok(Upload {
            file: File::from_std(file),
            temp,
            destination,
            written: 0,
        })
    }

    /// Adds chunk `index` of a chunked upload to `relative`. Chunk 0 starts
    /// the upload over; later chunks are appended in arrival order. Returns
    /// the bytes received so far.
    pub async fn append_chunk(&self, relative: &str, index: u64, chunk: &[u8]) -> MediaResult<u64> {
        let destination = self.resolve(relative)?;
        let partial = partial_path(&destination)?;
        let mut options = OpenOptions::new();
        if index == 0 {
            tokio::fs::create_dir_all(parent_of(&destination)?).await?;
            options.write(true).create(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options
            .open(&partial)
            .await
            .map_err(|err| MediaError::from_io(err, "upload"))?;
        file.write_all(chunk).await?;
        file.flush().await?;
        Ok(file.metadata().await?.len())
    }

    /// Moves a completed chunked upload into place and returns its size.
    pub async fn finalize_chunk_upload(&self, relative: &str) -> MediaResult<u64> {
        let destination = self.resolve(relative)?;
        let partial = partial_path(&destination)?;
        let file = File::open(&partial)
            .await
            .map_err(|err| MediaError::from_io(err, "upload"))?;
        file.sync_all().await?;
        let size = file.metadata().await?.len();
        drop(file);
        tokio::fs::rename(&partial, &destination).await?;
        tracing::info!(path = %destination.display(), size, "chunked upload complete");
        Ok(size)
    }
}

/// An upload in progress. Dropping it without [`Upload::finish`] removes the
/// partial data.
pub struct Upload {
    file: File,
    temp: TempPath,
    destination: PathBuf,
    written: u64,
}

impl Upload {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> MediaResult<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes the data and replaces the destination. Returns the bytes
    /// written.
    pub async fn finish(self) -> MediaResult<u64> {
        let Self {
            mut file,
            temp,
            destination,
            written,
        } = self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        temp.persist(&destination)
            .map_err(|err| MediaError::Io(err.error))?;
        tracing::info!(path = %destination.display(), size = written, "file uploaded");
        Ok(written)
    }
}

/// `Content-Disposition` value that makes browsers save `file_name`.
pub fn attachment_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

fn names_root(relative: &str) -> bool {
    Path::new(relative.trim())
        .components()
        .all(|component| matches!(component, Component::CurDir | Component::RootDir))
}

fn relative_string(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_of(path: &Path) -> MediaResult<&Path> {
    path.parent().ok_or(MediaError::PathViolation)
}

fn partial_path(destination: &Path) -> MediaResult<PathBuf> {
    let name = destination
        .file_name()
        .ok_or(MediaError::PathViolation)?
        .to_string_lossy();
    Ok(destination.with_file_name(format!(".{name}.{PARTIAL_UPLOAD_SUFFIX}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn manager() -> (TempDir, FileManager) {
        let root = tempdir().unwrap();
        let manager = FileManager::new(root.path().to_path_buf());
        (root, manager)
    }

    #[test]
    fn lists_root_and_subfolders_without_hidden_entries() {
        let (root, files) = manager();
        fs::create_dir(root.path().join("shows")).unwrap();
        fs::write(root.path().join("shows/ep1.mp4"), b"12345").unwrap();
        fs::write(root.path().join("a.txt"), b"a").unwrap();
        fs::write(root.path().join(".secret"), b"x").unwrap();

        for spelling in ["", ".", "/", " ./ "] {
            let names: Vec<_> = files
                .list_dir(spelling)
                .unwrap()
                .into_iter()
                .map(|entry| entry.name)
                .collect();
            assert_eq!(names, ["a.txt", "shows"], "{spelling:?}");
        }

        let listed = files.list_dir("shows").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "shows/ep1.mp4");
        assert_eq!(listed[0].size, 5);
        assert!(!listed[0].is_dir);
        assert!(listed[0].mod_time.is_some());

        let root_listing = files.list_dir(".").unwrap();
        assert!(root_listing[1].is_dir);
        assert_eq!(root_listing[1].path, "shows");
    }

    #[test]
    fn listing_missing_or_escaping_folders_fails() {
        let (root, files) = manager();
        fs::write(root.path().join("a.txt"), b"a").unwrap();
        assert!(matches!(files.list_dir("nope"), Err(MediaError::NotFound(_))));
        assert!(matches!(files.list_dir("a.txt"), Err(MediaError::NotFound(_))));
        assert!(matches!(files.list_dir("../"), Err(MediaError::PathViolation)));
        assert!(matches!(files.list_dir("x/../.."), Err(MediaError::PathViolation)));
    }

    #[tokio::test]
    async fn upload_creates_parents_and_replaces_atomically() {
        let (root, files) = manager();
        let mut upload = files.begin_upload("new/dir/clip.mp4").await.unwrap();
        upload.write_chunk(b"hello ").await.unwrap();
        upload.write_chunk(b"world").await.unwrap();
        let target = root.path().join("new/dir/clip.mp4");
        assert!(!target.exists());
        assert_eq!(upload.finish().await.unwrap(), 11);
        assert_eq!(fs::read(&target).unwrap(), b"hello world");

        let mut upload = files.begin_upload("new/dir/clip.mp4").await.unwrap();
        upload.write_chunk(b"v2").await.unwrap();
        upload.finish().await.unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"v2");
        assert_eq!(fs::read_dir(root.path().join("new/dir")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn abandoned_upload_leaves_nothing_behind() {
        let (root, files) = manager();
        let mut upload = files.begin_upload("clip.mp4").await.unwrap();
        upload.write_chunk(b"partial").await.unwrap();
        drop(upload);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn upload_outside_root_is_refused() {
        let (root, files) = manager();
        let outside = tempdir().unwrap();
        let escape = format!("../{}/x.mp4", outside.path().file_name().unwrap().to_string_lossy());
        assert!(matches!(
            files.begin_upload(&escape).await,
            Err(MediaError::PathViolation)
        ));
        assert!(matches!(files.begin_upload("").await, Err(MediaError::PathViolation)));
        fs::create_dir(root.path().join("dir")).unwrap();
        assert!(matches!(
            files.begin_upload("dir").await,
            Err(MediaError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn chunked_upload_appends_then_moves_into_place() {
        let (root, files) = manager();
        assert_eq!(files.append_chunk("up/movie.mp4", 0, b"abc").await.unwrap(), 3);
        assert_eq!(files.append_chunk("up/movie.mp4", 1, b"def").await.unwrap(), 6);
        assert!(files.list_dir("up").unwrap().is_empty());

        assert_eq!(files.finalize_chunk_upload("up/movie.mp4").await.unwrap(), 6);
        assert_eq!(fs::read(root.path().join("up/movie.mp4")).unwrap(), b"abcdef");
        assert!(!root.path().join("up/.movie.mp4.part").exists());
    }

    #[tokio::test]
    async fn chunk_zero_restarts_and_orphan_chunks_are_rejected() {
        let (root, files) = manager();
        assert!(matches!(
            files.append_chunk("movie.mp4", 3, b"late").await,
            Err(MediaError::NotFound(_))
        ));
        files.append_chunk("movie.mp4", 0, b"stale data").await.unwrap();
        files.append_chunk("movie.mp4", 0, b"fresh").await.unwrap();
        files.finalize_chunk_upload("movie.mp4").await.unwrap();
        assert_eq!(fs::read(root.path().join("movie.mp4")).unwrap(), b"fresh");

        assert!(matches!(
            files.finalize_chunk_upload("other.mp4").await,
            Err(MediaError::NotFound(_))
        ));
        assert!(matches!(
            files.append_chunk("../x.mp4", 0, b"x").await,
            Err(MediaError::PathViolation)
        ));
    }

    #[test]
    fn rename_moves_files_inside_the_root_only() {
        let (root, files) = manager();
        fs::write(root.path().join("a.mp4"), b"a").unwrap();
        fs::create_dir(root.path().join("dir")).unwrap();

        files.rename("a.mp4", "dir/b.mp4").unwrap();
        assert!(root.path().join("dir/b.mp4").is_file());
        assert!(!root.path().join("a.mp4").exists());

        assert!(matches!(
            files.rename("dir/b.mp4", "../../b.mp4"),
            Err(MediaError::PathViolation)
        ));
        assert!(matches!(files.rename("missing", "x"), Err(MediaError::NotFound(_))));
        assert!(matches!(
            files.rename("dir", "dir/inner"),
            Err(MediaError::InvalidName(_))
        ));
        assert!(root.path().join("dir/b.mp4").is_file());
    }

    #[test]
    fn delete_removes_files_and_empty_folders() {
        let (root, files) = manager();
        fs::create_dir_all(root.path().join("full/empty")).unwrap();
        fs::write(root.path().join("full/a.mp4"), b"a").unwrap();

        files.delete("full/a.mp4").unwrap();
        assert!(!root.path().join("full/a.mp4").exists());
        assert!(matches!(files.delete("full"), Err(MediaError::DirectoryNotEmpty)));
        files.delete("full/empty").unwrap();
        files.delete("full").unwrap();
        assert!(matches!(files.delete("full"), Err(MediaError::NotFound(_))));
        assert!(matches!(files.delete("."), Err(MediaError::PathViolation)));
        assert!(matches!(files.delete("../etc"), Err(MediaError::PathViolation)));
        assert!(root.path().is_dir());
    }

    #[test]
    fn create_folder_builds_missing_parents() {
        let (root, files) = manager();
        files.create_folder(" season/1 ").unwrap();
        assert!(root.path().join("season/1").is_dir());
        files.create_folder("season/1").unwrap();
        assert!(matches!(files.create_folder("../x"), Err(MediaError::PathViolation)));
    }

    #[test]
    fn disposition_quotes_safe_name_and_encodes_original() {
        assert_eq!(
            attachment_disposition("my clip.mp4"),
            "attachment; filename=\"my clip.mp4\"; filename*=UTF-8''my%20clip.mp4"
        );
        assert_eq!(
            attachment_disposition("été\".ts"),
            "attachment; filename=\"_t__.ts\"; filename*=UTF-8''%C3%A9t%C3%A9%22.ts"
        );
    }
}
