use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a tracked transfer, stable for the job's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Breadth of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    Connection,
    Database { database: String },
    Collection { database: String, collection: String },
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Connection => "connection",
            Scope::Database { .. } => "database",
            Scope::Collection { .. } => "collection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Import,
    Export,
}

/// Conflict policy for records that already exist at the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    #[default]
    Skip,
    /// Drop and replace. Destructive.
    Override,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFormat {
    #[default]
    Json,
    Csv,
    /// Dump archive produced by an external tool.
    Archive,
}

impl TransferFormat {
    /// External-tool archives run to completion once started.
    pub fn supports_pause(&self) -> bool {
        !matches!(self, TransferFormat::Archive)
    }
}

impl std::str::FromStr for TransferFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "archive" | "bson" => Ok(Self::Archive),
            other => Err(format!("unknown format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Starting,
    /// Shown as "importing" or "downloading" depending on direction.
    Transferring,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl JobPhase {
    /// Job holds (or is about to hold) the engine.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobPhase::Starting | JobPhase::Transferring | JobPhase::Paused
        )
    }
}

/// Last known progress of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub current_item: Option<String>,
    pub item_index: u32,
    pub item_total: u32,
    pub processed_units: u64,
    pub total_units: u64,
}

/// Partial update merged into a job by the registry. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub phase: Option<JobPhase>,
    pub percent: Option<u8>,
    pub current_item: Option<String>,
    pub item_index: Option<u32>,
    pub item_total: Option<u32>,
    pub processed_units: Option<u64>,
    pub total_units: Option<u64>,
}

impl JobUpdate {
    pub fn phase(phase: JobPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }
}

/// One user-visible tracked transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: JobId,
    pub connection_id: String,
    pub direction: TransferDirection,
    pub scope: Scope,
    pub selection: Vec<String>,
    pub label: String,
    pub phase: JobPhase,
    pub progress: JobProgress,
    pub result_file_path: Option<PathBuf>,
    pub can_pause: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    pub fn phase_label(&self) -> &'static str {
        match self.phase {
            JobPhase::Starting => "starting",
            JobPhase::Transferring => match self.direction {
                TransferDirection::Import => "importing",
                TransferDirection::Export => "downloading",
            },
            JobPhase::Paused => "paused",
            JobPhase::Completed => "completed",
            JobPhase::Cancelled => "cancelled",
            JobPhase::Failed => "failed",
        }
    }
}

/// Parameters for a new registry entry.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub connection_id: String,
    pub direction: TransferDirection,
    pub scope: Scope,
    pub selection: Vec<String>,
    pub label: String,
    pub can_pause: bool,
}

/// Everything the engine needs to run or simulate a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub connection_id: String,
    pub direction: TransferDirection,
    pub scope: Scope,
    pub selection: Vec<String>,
    pub mode: TransferMode,
    pub format: TransferFormat,
    /// Target database for scoped imports.
    pub destination: Option<String>,
    /// Output file for exports.
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub name: String,
    pub inserted: u64,
    pub skipped: u64,
}

/// Counts reported for a finished, cancelled or failed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub items_processed: Vec<ItemResult>,
    pub total_inserted: u64,
    pub total_skipped: u64,
    pub total_dropped: Option<u64>,
    pub errors: Vec<String>,
}

impl TransferResult {
    pub fn has_completed_work(&self) -> bool {
        self.total_inserted > 0
            || self.total_skipped > 0
            || self
                .items_processed
                .iter()
                .any(|item| item.inserted > 0 || item.skipped > 0)
    }

    /// Fold the counts of a later attempt into this one. Items with the same
    /// name are summed; new items keep their order.
    pub fn merge(&mut self, other: TransferResult) {
        for item in other.items_processed {
            match self.items_processed.iter_mut().find(|i| i.name == item.name) {
                Some(existing) => {
                    existing.inserted += item.inserted;
                    existing.skipped += item.skipped;
                }
                None => self.items_processed.push(item),
            }
        }
        self.total_inserted += other.total_inserted;
        self.total_skipped += other.total_skipped;
        self.total_dropped = match (self.total_dropped, other.total_dropped) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunItem {
    pub name: String,
    pub would_insert: u64,
    pub would_skip: u64,
    pub would_drop: u64,
}

/// Simulated outcome of a transfer. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunResult {
    pub items: Vec<DryRunItem>,
    pub errors: Vec<String>,
    /// Simulated with override mode.
    pub destructive: bool,
}

impl DryRunResult {
    pub fn total_insert(&self) -> u64 {
        self.items.iter().map(|i| i.would_insert).sum()
    }

    pub fn total_skip(&self) -> u64 {
        self.items.iter().map(|i| i.would_skip).sum()
    }

    pub fn total_drop(&self) -> u64 {
        self.items.iter().map(|i| i.would_drop).sum()
    }

    /// Records and items that an override run would destroy.
    pub fn at_risk(&self) -> AtRisk {
        AtRisk {
            records: self.total_drop(),
            items: self.items.iter().filter(|i| i.would_drop > 0).count(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtRisk {
    pub records: u64,
    pub items: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Clean,
    Cancelled,
    /// Accepted after a failure; the failure message is in the result's errors.
    Partial,
}

/// Final totals shown when a dialog reaches `Completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub outcome: Outcome,
    pub result: TransferResult,
    pub result_file_path: Option<PathBuf>,
}

impl TransferSummary {
    /// Plain-text report for copying out of the summary view.
    pub fn to_clipboard_text(&self) -> String {
        let headline = match self.outcome {
            Outcome::Clean if self.result.errors.is_empty() => "Completed",
            Outcome::Clean | Outcome::Partial => "Completed with errors",
            Outcome::Cancelled => "Cancelled",
        };

        let mut out = format!(
            "{headline}: {} inserted, {} skipped",
            self.result.total_inserted, self.result.total_skipped
        );
        if let Some(dropped) = self.result.total_dropped {
            out.push_str(&format!(", {dropped} dropped"));
        }
        out.push('\n');

        for item in &self.result.items_processed {
            out.push_str(&format!(
                "  {}: {} inserted, {} skipped\n",
                item.name, item.inserted, item.skipped
            ));
        }
        if let Some(path) = &self.result_file_path {
            out.push_str(&format!("Output: {}\n", path.display()));
        }
        if !self.result.errors.is_empty() {
            out.push_str("Errors:\n");
            for err in &self.result.errors {
                out.push_str(&format!("  - {err}\n"));
            }
        }
        out
    }
}
