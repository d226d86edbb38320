#![forbid(unsafe_code)]

//! Runtime configuration: CLI overrides, then the process environment, then
//! the `.env` file, then built-in defaults.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::probe::DEFAULT_FFPROBE;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_MEDIAFS_PORT: u16 = 8000;
pub const DEFAULT_MEDIAFS_HOST: &str = "127.0.0.1";
pub const DEFAULT_LINK_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    /// `None` means a random per-process secret.
    pub signing_secret: Option<String>,
    pub link_ttl: Duration,
    pub public_base_url: String,
    pub auth_token: String,
    pub ffprobe: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub public_base_url: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let media_root = overrides
        .media_root
        .or_else(|| lookup("MEDIA_ROOT").map(PathBuf::from))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set"))?;
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("MEDIAFS_HOST"))
        .unwrap_or_else(|| DEFAULT_MEDIAFS_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("MEDIAFS_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_MEDIAFS_PORT);
    let link_ttl = lookup("MEDIAFS_LINK_TTL_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_LINK_TTL_SECS);
    let public_base_url = overrides
        .public_base_url
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup("MEDIAFS_PUBLIC_BASE_URL"))
        .unwrap_or_else(|| format!("http://{host}:{port}"));
    let auth_token = lookup("MEDIAFS_AUTH_TOKEN")
        .ok_or_else(|| anyhow!("MEDIAFS_AUTH_TOKEN not set"))?;
    let ffprobe = lookup("MEDIAFS_FFPROBE").unwrap_or_else(|| DEFAULT_FFPROBE.to_string());

    Ok(RuntimeConfig {
        media_root,
        host,
        port,
        signing_secret: lookup("MEDIAFS_SIGNING_SECRET"),
        link_ttl: Duration::from_secs(link_ttl),
        public_base_url: public_base_url.trim_end_matches('/').to_string(),
        auth_token,
        ffprobe: PathBuf::from(ffprobe),
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
