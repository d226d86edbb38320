//! External media probing and the fallback chains that use it.
//!
//! Probing shells out to `ffprobe`. Every failure (missing binary, non-zero
//! exit, unparsable output) degrades to "unknown" and is only logged.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use crate::error::{MediaError, MediaResult};

pub const DEFAULT_FFPROBE: &str = "ffprobe";

/// Source of container-level facts about a media file.
pub trait Prober: Send + Sync {
    /// `WIDTHxHEIGHT` of the first video stream.
    fn resolution(&self, path: &Path) -> MediaResult<String>;

    /// Container duration in seconds.
    fn duration(&self, path: &Path) -> MediaResult<f64>;
}

#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary: PathBuf,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str], path: &Path) -> MediaResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|err| {
                MediaError::ProbeUnavailable(format!("{}: {err}", self.binary.display()))
            })?;
        if !output.status.success() {
            return Err(MediaError::ProbeUnavailable(format!(
                "{} exited with {}",
                self.binary.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new(DEFAULT_FFPROBE)
    }
}

impl Prober for FfprobeProber {
    fn resolution(&self, path: &Path) -> MediaResult<String> {
        let stdout = self.run(
            &[
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=s=x:p=0",
            ],
            path,
        )?;
        parse_resolution(&stdout)
            .ok_or_else(|| MediaError::ProbeUnavailable(format!("unexpected output {stdout:?}")))
    }

    fn duration(&self, path: &Path) -> MediaResult<f64> {
        let stdout = self.run(
            &[
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ],
            path,
        )?;
        parse_duration(&stdout)
            .ok_or_else(|| MediaError::ProbeUnavailable(format!("unexpected output {stdout:?}")))
    }
}

/// First non-empty line of the form `<width>x<height>`.
pub fn parse_resolution(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    // csv output may carry a trailing separator on some builds.
    let line = line.trim_end_matches('x');
    let (width, height) = line.split_once('x')?;
    let width: u32 = width.parse().ok()?;
    let height: u32 = height.parse().ok()?;
    (width > 0 && height > 0).then(|| format!("{width}x{height}"))
}

pub fn parse_duration(stdout: &str) -> Option<f64> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    let value: f64 = line.parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

type Strategy<'a, T> = Box<dyn FnOnce() -> Option<T> + 'a>;

/// Ordered list of ways to obtain a value. The first strategy that yields
/// `Some` wins and the rest are never run.
pub struct Fallback<'a, T> {
    what: &'static str,
    strategies: Vec<(&'static str, Strategy<'a, T>)>,
}

impl<'a, T> Fallback<'a, T> {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            strategies: Vec::new(),
        }
    }

    pub fn then(mut self, name: &'static str, strategy: impl FnOnce() -> Option<T> + 'a) -> Self {
        self.strategies.push((name, Box::new(strategy)));
        self
    }

    pub fn resolve(self) -> Option<T> {
        for (name, strategy) in self.strategies {
            if let Some(value) = strategy() {
                tracing::debug!(what = self.what, strategy = name, "fallback resolved");
                return Some(value);
            }
        }
        tracing::debug!(what = self.what, "no fallback strategy produced a value");
        None
    }
}

/// Logs a probe failure and turns it into "unknown".
pub fn probe_or_unknown<T>(result: MediaResult<T>, path: &Path) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "probe failed");
            None
        }
    }
}
