use camino::Utf8PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid DOI: {0}")]
    InvalidDoi(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    #[diagnostic(help("check paper-fetch.json and the command-line flags"))]
    InvalidConfig(String),

    #[error("failed to read input table {path}: {message}")]
    InputRead { path: Utf8PathBuf, message: String },

    #[error("input table is missing column `{0}`")]
    MissingColumn(String),

    #[error("failed to open result log {path}: {message}")]
    LogOpen { path: Utf8PathBuf, message: String },

    #[error("failed to write result log: {0}")]
    LogWrite(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("metadata service request failed: {0}")]
    MetadataHttp(String),

    #[error("download session error: {0}")]
    Session(String),

    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("download request failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status} for {url}")]
    DownloadStatus { status: u16, url: String },
}
