use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const DEFAULT_CONFIG_FILE: &str = "paper-fetch.json";
pub const DEFAULT_SHARD_SIZE: usize = 1000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_METADATA_INTERVAL_MS: u64 = 100;
pub const DEFAULT_METADATA_BASE: &str = "https://api.unpaywall.org";

/// On-disk configuration. Every field is optional; unset values fall back to
/// command-line flags and then to the defaults above.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub input: Option<Utf8PathBuf>,
    #[serde(default)]
    pub output_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub scratch_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub log_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub download_timeout_secs: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub shard_size: Option<usize>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata_base_url: Option<String>,
    #[serde(default)]
    pub metadata_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub append_log: Option<bool>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub columns: Option<ColumnNames>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ColumnNames {
    #[serde(default = "default_id_column")]
    pub id: String,
    #[serde(default = "default_doi_column")]
    pub doi: String,
    #[serde(default = "default_url_column")]
    pub url: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            id: default_id_column(),
            doi: default_doi_column(),
            url: default_url_column(),
        }
    }
}

fn default_id_column() -> String {
    "cnsid".to_string()
}

fn default_doi_column() -> String {
    "doi".to_string()
}

fn default_url_column() -> String {
    "pdf_url".to_string()
}

/// Process-wide settings, resolved once before any worker starts.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input: Utf8PathBuf,
    pub output_root: Utf8PathBuf,
    pub scratch_root: Utf8PathBuf,
    pub log_path: Utf8PathBuf,
    pub workers: usize,
    pub download_timeout: Duration,
    pub poll_interval: Duration,
    pub shard_size: usize,
    pub email: String,
    pub metadata_base_url: String,
    pub metadata_interval: Duration,
    pub max_attempts: u32,
    pub limit: Option<usize>,
    pub append_log: bool,
    pub user_agent: String,
    pub columns: ColumnNames,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the config file. An explicit path must exist; the implicit
    /// `paper-fetch.json` is optional.
    pub fn load(path: Option<&Utf8Path>) -> Result<FileConfig, HarvestError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Ok(FileConfig::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| HarvestError::ConfigParse(err.to_string()))
    }

    /// Layers `overrides` (usually the CLI flags) on top of `file` and fills
    /// in defaults.
    pub fn resolve(file: FileConfig, overrides: FileConfig) -> Result<RunConfig, HarvestError> {
        let merged = merge(file, overrides);

        let input = merged
            .input
            .ok_or_else(|| HarvestError::InvalidConfig("input table path is required".into()))?;
        let email = merged
            .email
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                HarvestError::InvalidConfig(
                    "contact email for the metadata service is required".into(),
                )
            })?;
        let output_root = merged
            .output_root
            .unwrap_or_else(|| Utf8PathBuf::from("pdfs_final"));
        let scratch_root = match merged.scratch_root {
            Some(path) => path,
            None => default_scratch_root()?,
        };
        let log_path = merged
            .log_path
            .unwrap_or_else(|| Utf8PathBuf::from("download_log.csv"));

        let workers = merged.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(HarvestError::InvalidConfig("workers must be at least 1".into()));
        }
        let shard_size = merged.shard_size.unwrap_or(DEFAULT_SHARD_SIZE);
        if shard_size == 0 {
            return Err(HarvestError::InvalidConfig("shard_size must be at least 1".into()));
        }
        let timeout_secs = merged
            .download_timeout_secs
            .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(HarvestError::InvalidConfig(
                "download_timeout_secs must be positive".into(),
            ));
        }
        let poll_ms = merged.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if poll_ms == 0 {
            return Err(HarvestError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        let max_attempts = merged.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1);

        Ok(RunConfig {
            input,
            output_root,
            scratch_root,
            log_path,
            workers,
            download_timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_millis(poll_ms),
            shard_size,
            email,
            metadata_base_url: merged
                .metadata_base_url
                .unwrap_or_else(|| DEFAULT_METADATA_BASE.to_string()),
            metadata_interval: Duration::from_millis(
                merged
                    .metadata_interval_ms
                    .unwrap_or(DEFAULT_METADATA_INTERVAL_MS),
            ),
            max_attempts,
            limit: merged.limit,
            append_log: merged.append_log.unwrap_or(true),
            user_agent: merged.user_agent.unwrap_or_else(default_user_agent),
            columns: merged.columns.unwrap_or_default(),
        })
    }
}

pub fn default_user_agent() -> String {
    format!("paper-fetch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_scratch_root() -> Result<Utf8PathBuf, HarvestError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.cache_dir().join("paper-fetch").join("scratch")).ok()
        })
        .ok_or_else(|| HarvestError::Filesystem("unable to resolve scratch directory".to_string()))
}

fn merge(base: FileConfig, top: FileConfig) -> FileConfig {
    FileConfig {
        input: top.input.or(base.input),
        output_root: top.output_root.or(base.output_root),
        scratch_root: top.scratch_root.or(base.scratch_root),
        log_path: top.log_path.or(base.log_path),
        workers: top.workers.or(base.workers),
        download_timeout_secs: top.download_timeout_secs.or(base.download_timeout_secs),
        poll_interval_ms: top.poll_interval_ms.or(base.poll_interval_ms),
        shard_size: top.shard_size.or(base.shard_size),
        email: top.email.or(base.email),
        metadata_base_url: top.metadata_base_url.or(base.metadata_base_url),
        metadata_interval_ms: top.metadata_interval_ms.or(base.metadata_interval_ms),
        max_attempts: top.max_attempts.or(base.max_attempts),
        limit: top.limit.or(base.limit),
        append_log: top.append_log.or(base.append_log),
        user_agent: top.user_agent.or(base.user_agent),
        columns: top.columns.or(base.columns),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> FileConfig {
        FileConfig {
            input: Some("jbc.csv".into()),
            email: Some("research@example.org".to_string()),
            scratch_root: Some("scratch".into()),
            ..FileConfig::default()
        }
    }

    #[test]
    fn resolve_applies_defaults() {
        let resolved = ConfigLoader::resolve(minimal(), FileConfig::default()).unwrap();
        assert_eq!(resolved.shard_size, DEFAULT_SHARD_SIZE);
        assert_eq!(resolved.workers, DEFAULT_WORKERS);
        assert_eq!(resolved.download_timeout, Duration::from_secs(15));
        assert_eq!(resolved.columns, ColumnNames::default());
        assert!(resolved.append_log);
    }

    #[test]
    fn overrides_win_over_file() {
        let overrides = FileConfig {
            workers: Some(8),
            shard_size: Some(10),
            ..FileConfig::default()
        };
        let resolved = ConfigLoader::resolve(minimal(), overrides).unwrap();
        assert_eq!(resolved.workers, 8);
        assert_eq!(resolved.shard_size, 10);
    }
}
