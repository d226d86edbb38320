//! The shared service object handed to every HTTP handler.
//!
//! Filesystem walks, playlist parsing, probe subprocesses and clip writes all
//! block, so the async entry points move them onto the blocking pool.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, header},
    response::Response,
};
use serde::Serialize;

use crate::{
    catalog::{Catalog, FileSummary, Frame, FrameKind, MediaSummary},
    clip::ClipCutter,
    config::RuntimeConfig,
    error::{MediaError, MediaResult},
    files::{FileEntry, FileManager, Upload, attachment_disposition},
    playlist::Playlist,
    probe::{FfprobeProber, Prober},
    range,
    security::{ensure_single_segment, resolve_within_root},
    signing::{CapabilitySigner, LinkParams, PublicLink},
};

#[derive(Debug, Clone, Serialize)]
pub struct CutOutcome {
    pub file: String,
    pub url: String,
}

pub struct MediaService {
    catalog: Catalog,
    files: FileManager,
    signer: CapabilitySigner,
    cutter: ClipCutter,
    link_ttl: Duration,
    public_base_url: String,
}

impl MediaService {
    /// `root` is canonicalized once here; every later path check is lexical
    /// against that canonical form.
    pub fn new(
        root: &Path,
        signer: CapabilitySigner,
        prober: Arc<dyn Prober>,
        link_ttl: Duration,
        public_base_url: impl Into<String>,
    ) -> MediaResult<Self> {
        let root = fs::canonicalize(root).map_err(|err| MediaError::from_io(err, "media root"))?;
        if !root.is_dir() {
            return Err(MediaError::not_found("media root"));
        }
        Ok(Self {
            files: FileManager::new(root.clone()),
            catalog: Catalog::new(root, prober),
            signer,
            cutter: ClipCutter::new(),
            link_ttl,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let signer = match config.signing_secret.as_deref() {
            Some(secret) => CapabilitySigner::new(secret.as_bytes()),
            None => {
                tracing::warn!(
                    "MEDIAFS_SIGNING_SECRET not set; public links will not survive a restart"
                );
                CapabilitySigner::ephemeral()
            }
        };
        let prober: Arc<dyn Prober> = Arc::new(FfprobeProber::new(&config.ffprobe));
        Self::new(
            &config.media_root,
            signer,
            prober,
            config.link_ttl,
            config.public_base_url.clone(),
        )
        .with_context(|| format!("Opening media root {}", config.media_root.display()))
    }

    pub fn root(&self) -> &Path {
        self.catalog.root()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Path under the root for a caller-supplied relative path.
    pub fn resolve(&self, relative: &str) -> MediaResult<PathBuf> {
        resolve_within_root(self.root(), relative)
    }

    /// Path of `file` inside asset `name`. `file` may not climb out of the
    /// asset directory.
    pub fn resolve_asset_file(&self, name: &str, file: &str) -> MediaResult<PathBuf> {
        ensure_single_segment(name)?;
        let dir = self.resolve(name)?;
        resolve_within_root(&dir, file)
    }

    pub async fn list_assets(self: &Arc<Self>) -> MediaResult<Vec<MediaSummary>> {
        self.blocking(|service| service.catalog.list_assets()).await
    }

    pub async fn describe_asset(self: &Arc<Self>, name: &str) -> MediaResult<MediaSummary> {
        let name = name.to_string();
        self.blocking(move |service| service.catalog.describe_asset(&name))
            .await
    }

    pub async fn inspect_playlist(self: &Arc<Self>, name: &str, file: &str) -> MediaResult<Playlist> {
        let (name, file) = (name.to_string(), file.to_string());
        self.blocking(move |service| service.catalog.inspect_playlist(&name, &file))
            .await
    }

    pub async fn list_files(self: &Arc<Self>) -> MediaResult<Vec<FileSummary>> {
        self.blocking(|service| service.catalog.list_files()).await
    }

    pub async fn delete_asset(self: &Arc<Self>, name: &str) -> MediaResult<()> {
        let name = name.to_string();
        self.blocking(move |service| service.catalog.delete_asset(&name))
            .await
    }

    pub async fn list_frames(self: &Arc<Self>, name: &str, kind: FrameKind) -> MediaResult<Vec<Frame>> {
        let name = name.to_string();
        self.blocking(move |service| service.catalog.list_frames(&name, kind))
            .await
    }

    /// Cuts segments `[from, to)` of asset `name` into a new clip playlist.
    pub async fn cut(
        self: &Arc<Self>,
        name: &str,
        from: usize,
        to: usize,
        clip_name: Option<String>,
    ) -> MediaResult<CutOutcome> {
        let name = name.to_string();
        self.blocking(move |service| {
            let source = service.catalog.media_playlist(&name)?;
            let file = service.cutter.cut(&source, from, to, clip_name.as_deref())?;
            Ok(CutOutcome {
                url: format!(
                    "/videos/{}/{}",
                    urlencoding::encode(&name),
                    urlencoding::encode(&file)
                ),
                file,
            })
        })
        .await
    }

    /// Entries of folder `relative`; `""` or `.` lists the root.
    pub async fn list_dir(self: &Arc<Self>, relative: &str) -> MediaResult<Vec<FileEntry>> {
        let relative = relative.to_string();
        self.blocking(move |service| service.files.list_dir(&relative))
            .await
    }

    pub async fn create_folder(self: &Arc<Self>, relative: &str) -> MediaResult<()> {
        let relative = relative.to_string();
        self.blocking(move |service| service.files.create_folder(&relative))
            .await
    }

    pub async fn rename(self: &Arc<Self>, from: &str, to: &str) -> MediaResult<()> {
        let (from, to) = (from.to_string(), to.to_string());
        self.blocking(move |service| service.files.rename(&from, &to))
            .await
    }

    pub async fn delete_file(self: &Arc<Self>, relative: &str) -> MediaResult<()> {
        let relative = relative.to_string();
        self.blocking(move |service| service.files.delete(&relative))
            .await
    }

    pub async fn begin_upload(&self, relative: &str) -> MediaResult<Upload> {
        self.files.begin_upload(relative).await
    }

    pub async fn append_chunk(&self, relative: &str, index: u64, chunk: &[u8]) -> MediaResult<u64> {
        self.files.append_chunk(relative, index, chunk).await
    }

    pub async fn finalize_chunk_upload(&self, relative: &str) -> MediaResult<u64> {
        self.files.finalize_chunk_upload(relative).await
    }

    /// Streams a file under the root as an attachment.
    pub async fn download(&self, relative: &str, range_header: Option<&str>) -> MediaResult<Response> {
        let path = self.files.resolve(relative)?;
        let mut response = range::stream_file(&path, range_header).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Ok(value) = HeaderValue::from_str(&attachment_disposition(&file_name)) {
            response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
        }
        Ok(response)
    }

    /// Streams any file under the root.
    pub async fn stream(&self, relative: &str, range_header: Option<&str>) -> MediaResult<Response> {
        let path = self.resolve(relative)?;
        range::stream_file(&path, range_header).await
    }

    pub async fn stream_asset_file(
        &self,
        name: &str,
        file: &str,
        range_header: Option<&str>,
    ) -> MediaResult<Response> {
        let path = self.resolve_asset_file(name, file)?;
        range::stream_file(&path, range_header).await
    }

    /// Issues a public link for an existing file under the root.
    pub async fn share(&self, relative: &str) -> MediaResult<PublicLink> {
        let relative = relative.trim();
        let path = self.resolve(relative)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| MediaError::from_io(err, "file"))?;
        if !metadata.is_file() {
            return Err(MediaError::not_found("file"));
        }
        let link = self
            .signer
            .issue_public_link(&self.public_base_url, relative, self.link_ttl);
        tracing::info!(path = relative, expires = link.expires, "public link issued");
        Ok(link)
    }

    /// Streams the file named by a public link after checking its signature
    /// and expiry.
    pub async fn stream_public(
        &self,
        params: &LinkParams,
        range_header: Option<&str>,
    ) -> MediaResult<Response> {
        self.signer.verify_link(params)?;
        tracing::info!(path = %params.path, "public link served");
        self.stream(&params.path, range_header).await
    }

    async fn blocking<T, F>(self: &Arc<Self>, work: F) -> MediaResult<T>
    where
        F: FnOnce(&MediaService) -> MediaResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = Arc::clone(self);
        tokio::task::spawn_blocking(move || work(&service))
            .await
            .map_err(|err| MediaError::Io(io::Error::other(err)))?
    }
}
