use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::PUBLIC_BOARD_SECRET;

#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("navigation: {0}")]
    Navigation(String),
    #[error("timeout after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
    #[error("browser: {0}")]
    Browser(String),
    #[error("download: {0}")]
    Download(String),
    #[error("checkpoint {path:?}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },
    #[error("missing input {0:?}, run the previous phase first")]
    MissingInput(PathBuf),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrawlerError {
    /// Failures recovered by re-establishing the listing session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CrawlerError::Navigation(_) | CrawlerError::Timeout(..) | CrawlerError::Browser(_)
        )
    }
}

/// One listing entry, written once by the metadata phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(rename = "seq")]
    pub id: String,
    #[serde(rename = "display_num")]
    pub display_index: String,
    pub title: String,
    pub date: String,
    #[serde(rename = "views")]
    pub view_count: String,
    #[serde(rename = "board_secret")]
    pub visibility_flag: String,
}

impl MetadataRecord {
    pub fn is_public(&self) -> bool {
        self.visibility_flag == PUBLIC_BOARD_SECRET
    }
}

/// An attachment announced by the file inventory of one detail view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_name: String,
    pub file_sequence: u32,
    pub owning_record_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadOutcome {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "NO_FILE")]
    NoFile,
}

impl DownloadOutcome {
    pub fn classify(results: &[DownloadResult]) -> DownloadOutcome {
        if results.is_empty() {
            DownloadOutcome::NoFile
        } else if results.iter().all(DownloadResult::is_materialized) {
            DownloadOutcome::Ok
        } else {
            DownloadOutcome::Fail
        }
    }
}

/// Per-file result of the download orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadResult {
    Materialized(PathBuf),
    Failed,
}

impl DownloadResult {
    pub fn is_materialized(&self) -> bool {
        matches!(self, DownloadResult::Materialized(_))
    }

    pub fn path_string(&self) -> String {
        match self {
            DownloadResult::Materialized(p) => p.to_string_lossy().into_owned(),
            DownloadResult::Failed => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResultRecord {
    #[serde(rename = "seq")]
    pub id: String,
    #[serde(rename = "display_num")]
    pub display_index: String,
    pub title: String,
    pub date: String,
    #[serde(rename = "apt_name")]
    pub derived_entity_name: String,
    pub file_count: usize,
    pub file_names: String,
    pub file_paths: String,
    #[serde(rename = "download_status")]
    pub outcome: DownloadOutcome,
}

/// A stateful form submission: set `fields` on the named form, point it at
/// `action` and submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationIntent {
    pub form: String,
    pub action: String,
    pub fields: Vec<(String, String)>,
}

impl NavigationIntent {
    pub fn new(form: &str, action: &str) -> Self {
        NavigationIntent {
            form: form.into(),
            action: action.into(),
            fields: vec![],
        }
    }

    pub fn field(mut self, name: &str, value: impl ToString) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }

    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// How a download event is provoked on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTrigger {
    /// click an existing control
    Click(String),
    /// inject an anchor pointing at `url` and activate it
    SyntheticLink(String),
}

/// Fixed delays honoured around navigation. The only backpressure applied
/// against the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// after (re)opening the listing root
    pub settle: Duration,
    /// after a form navigation
    pub navigation_settle: Duration,
    pub page_delay: Duration,
    pub record_delay: Duration,
    pub pagination_wait: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing {
            settle: Duration::from_secs(2),
            navigation_settle: Duration::from_millis(500),
            page_delay: Duration::from_millis(800),
            record_delay: Duration::from_millis(1500),
            pagination_wait: Duration::from_secs(10),
        }
    }
}

impl Pacing {
    pub fn immediate() -> Self {
        Pacing {
            settle: Duration::ZERO,
            navigation_settle: Duration::ZERO,
            page_delay: Duration::ZERO,
            record_delay: Duration::ZERO,
            pagination_wait: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PhaseSummary {
    pub processed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub output: PathBuf,
}
