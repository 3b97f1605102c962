use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

const DOI_RESOLVER: &str = "https://doi.org/";
const DOI_PREFIXES: [&str; 5] = [
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi:",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Doi(String);

impl Doi {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resolver_url(&self) -> String {
        format!("{DOI_RESOLVER}{}", self.0)
    }
}

impl fmt::Display for Doi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Doi {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = strip_doi_prefix(value);
        let is_valid = normalized.starts_with("10.")
            && normalized
                .split_once('/')
                .map(|(registrant, suffix)| registrant.len() > 3 && !suffix.is_empty())
                .unwrap_or(false)
            && !normalized.chars().any(char::is_whitespace);
        if !is_valid {
            return Err(HarvestError::InvalidDoi(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// Trims the value and drops one leading resolver or `doi:` prefix.
fn strip_doi_prefix(value: &str) -> &str {
    let trimmed = value.trim();
    for prefix in DOI_PREFIXES {
        let matches = trimmed
            .get(..prefix.len())
            .map(|head| head.eq_ignore_ascii_case(prefix))
            .unwrap_or(false);
        if matches {
            return trimmed[prefix.len()..].trim_start();
        }
    }
    trimmed
}

/// One row of the input table. Position is the zero-based row index and
/// drives shard placement, so it must stay stable across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub position: usize,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        doi: Option<String>,
        url: Option<String>,
        position: usize,
    ) -> Self {
        Self {
            id: id.into().trim().to_string(),
            doi: non_empty(doi),
            url: non_empty(url),
            position,
        }
    }

    pub fn parsed_doi(&self) -> Option<Doi> {
        self.doi.as_deref().and_then(|raw| raw.parse().ok())
    }

    /// `https://doi.org/<doi>` for any DOI cell starting with `10.` once
    /// trimmed and stripped of a resolver prefix. Looser than [`Doi`]
    /// parsing: the resolver decides whether the rest is valid.
    pub fn doi_resolver_url(&self) -> Option<String> {
        let doi = strip_doi_prefix(self.doi.as_deref()?);
        doi.starts_with("10.").then(|| format!("{DOI_RESOLVER}{doi}"))
    }

    /// DOI string sent to the metadata service: the normalized form when it
    /// parses, otherwise the raw cell.
    pub fn lookup_doi(&self) -> Option<String> {
        match self.parsed_doi() {
            Some(doi) => Some(doi.as_str().to_string()),
            None => self.doi.clone(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetSource {
    MetadataService,
    InputUrl,
    ConstructedFromDoi,
}

impl fmt::Display for TargetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSource::MetadataService => write!(f, "metadata-service"),
            TargetSource::InputUrl => write!(f, "input-url"),
            TargetSource::ConstructedFromDoi => write!(f, "constructed-from-doi"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub id: String,
    pub url: String,
    pub source: TargetSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Skipped,
    Migrated,
    Success,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Skipped => write!(f, "Skipped"),
            Status::Migrated => write!(f, "Migrated"),
            Status::Success => write!(f, "Success"),
            Status::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped(String),
    Migrated(Utf8PathBuf),
    Success(Utf8PathBuf),
    Failed(String),
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Skipped(_) => Status::Skipped,
            Outcome::Migrated(_) => Status::Migrated,
            Outcome::Success(_) => Status::Success,
            Outcome::Failed(_) => Status::Failed,
        }
    }
}

/// A persisted result-log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub identifier: String,
    pub doi: String,
    pub original_url: String,
    pub resolved_download_url: String,
    pub status: Status,
    pub error_message: String,
}

impl OutcomeRow {
    pub const HEADER: [&'static str; 6] = [
        "identifier",
        "doi",
        "original_url",
        "resolved_download_url",
        "status",
        "error_message",
    ];

    pub fn new(record: &Record, target: Option<&ResolvedTarget>, outcome: &Outcome) -> Self {
        let error_message = match outcome {
            Outcome::Failed(reason) => reason.clone(),
            _ => String::new(),
        };
        Self {
            identifier: record.id.clone(),
            doi: record.doi.clone().unwrap_or_default(),
            original_url: record.url.clone().unwrap_or_default(),
            resolved_download_url: target.map(|t| t.url.clone()).unwrap_or_default(),
            status: outcome.status(),
            error_message,
        }
    }
}
