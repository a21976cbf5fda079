#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_MEDIA_ROOT: &str = ".";
pub const DEFAULT_ARCHIVE_PORT: u16 = 5000;
pub const DEFAULT_ARCHIVE_HOST: &str = "127.0.0.1";
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_YT_DLP: &str = "yt-dlp";

/// Directory under the media root holding downloaded videos and thumbnails.
pub const ASSETS_SUBDIR: &str = "videos";
/// SQLite database file relative to the media root.
pub const DATABASE_FILE: &str = "videos.db";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub archive_host: String,
    pub archive_port: u16,
    pub workers: usize,
    pub yt_dlp: PathBuf,
}

impl RuntimeConfig {
    pub fn assets_dir(&self) -> PathBuf {
        self.media_root.join(ASSETS_SUBDIR)
    }

    pub fn database_path(&self) -> PathBuf {
        self.media_root.join(DATABASE_FILE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub archive_host: Option<String>,
    pub archive_port: Option<u16>,
    pub workers: Option<usize>,
    pub yt_dlp: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_config(&file_vars, env_var_string, overrides))
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let media_root = overrides
        .media_root
        .or_else(|| lookup_value("MEDIA_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT));
    let archive_host = overrides
        .archive_host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("ARCHIVE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ARCHIVE_HOST.to_string());
    let archive_port = overrides
        .archive_port
        .or_else(|| {
            lookup_value("ARCHIVE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_ARCHIVE_PORT);
    let workers = overrides
        .workers
        .or_else(|| {
            lookup_value("ARCHIVE_WORKERS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .unwrap_or(DEFAULT_WORKERS)
        .max(1);
    let yt_dlp = overrides
        .yt_dlp
        .or_else(|| lookup_value("YT_DLP_BIN", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP));

    RuntimeConfig {
        media_root,
        archive_host,
        archive_port,
        workers,
        yt_dlp,
    }
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
            .filter(|value| !value.trim().is_empty())
            .cloned()
    })
}

/// Parses a dotenv-style file. A missing file yields an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
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
