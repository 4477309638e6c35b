use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use dimse::RemoteNode;

/// Where a series row came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum Origin {
    /// Scanned from a local archive rooted at this path
    Archive(PathBuf),
    /// Indexed from a remote node, stored as `dimse://AE@host:port`
    Remote(String),
}

impl Origin {
    pub fn remote(node: &RemoteNode) -> Self {
        Origin::Remote(format!("dimse://{}", node))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Archive(path) => write!(f, "{}", path.display()),
            Origin::Remote(uri) => write!(f, "{}", uri),
        }
    }
}

/// Series attributes; everything but the series UID may be absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub series_instance_uid: String,
    #[serde(default)]
    pub study_instance_uid: Option<String>,
    #[serde(default)]
    pub study_description: Option<String>,
    #[serde(default)]
    pub series_description: Option<String>,
    #[serde(default)]
    pub patient_name: Option<String>,
    #[serde(default)]
    pub patient_id: Option<String>,
    /// YYYYMMDD
    #[serde(default)]
    pub study_date: Option<String>,
    pub origin: Origin,
}

impl SeriesMetadata {
    pub fn new(series_instance_uid: impl Into<String>, origin: Origin) -> Self {
        Self {
            series_instance_uid: series_instance_uid.into(),
            study_instance_uid: None,
            study_description: None,
            series_description: None,
            patient_name: None,
            patient_id: None,
            study_date: None,
            origin,
        }
    }
}

/// A stored series row
pub type SeriesRecord = SeriesMetadata;

/// Natural key of a series row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey(pub String);

impl SeriesKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an upsert created the series row or found it already present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
    pub path: PathBuf,
}

/// Everything the scanner extracts from one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub series: SeriesMetadata,
    pub sop_instance_uid: String,
    pub path: PathBuf,
}

/// Result of writing a batch of files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordSummary {
    pub series_created: usize,
    pub instances_inserted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogCounts {
    pub series: u64,
    pub instances: u64,
}
