use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, ImageId, JobId};

/// Discriminant for the work queues. Stored next to the encoded payload so
/// old rows stay resumable across deployments even if payload fields grow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ScanCollection,
    GenerateThumbnails,
    GenerateCache,
    RegenerateThumbnails,
    BulkAdd,
    Redistribute,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScanCollection => "scan_collection",
            Self::GenerateThumbnails => "generate_thumbnails",
            Self::GenerateCache => "generate_cache",
            Self::RegenerateThumbnails => "regenerate_thumbnails",
            Self::BulkAdd => "bulk_add",
            Self::Redistribute => "redistribute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scan_collection" => Some(Self::ScanCollection),
            "generate_thumbnails" => Some(Self::GenerateThumbnails),
            "generate_cache" => Some(Self::GenerateCache),
            "regenerate_thumbnails" => Some(Self::RegenerateThumbnails),
            "bulk_add" => Some(Self::BulkAdd),
            "redistribute" => Some(Self::Redistribute),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job life-cycle states. Transitions are monotonic except Running⇄Paused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the edge `self -> next` is on the allowed transition graph.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Running, Pending) // watchdog reclaim
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Paused, Pending) // startup reclaim
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for jobs that walk a single collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParams {
    pub collection_id: CollectionId,
}

/// Parameters for the bulk-add parent job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkAddParams {
    pub parent_path: PathBuf,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub include_subfolders: bool,
    /// Collections are created for matching children when set; otherwise the
    /// job only reports what it would have added.
    #[serde(default = "default_true")]
    pub auto_add: bool,
    /// Child scan jobs spawned by this parent, recorded for aggregation.
    #[serde(default)]
    pub child_job_ids: Vec<JobId>,
}

fn default_true() -> bool {
    true
}

/// Structured payload per job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum JobPayload {
    ScanCollection(ScanParams),
    GenerateThumbnails(ScanParams),
    GenerateCache(ScanParams),
    RegenerateThumbnails(ScanParams),
    BulkAdd(BulkAddParams),
    Redistribute,
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::ScanCollection(_) => JobKind::ScanCollection,
            Self::GenerateThumbnails(_) => JobKind::GenerateThumbnails,
            Self::GenerateCache(_) => JobKind::GenerateCache,
            Self::RegenerateThumbnails(_) => JobKind::RegenerateThumbnails,
            Self::BulkAdd(_) => JobKind::BulkAdd,
            Self::Redistribute => JobKind::Redistribute,
        }
    }

    pub fn collection_id(&self) -> Option<CollectionId> {
        match self {
            Self::ScanCollection(p)
            | Self::GenerateThumbnails(p)
            | Self::GenerateCache(p)
            | Self::RegenerateThumbnails(p) => Some(p.collection_id),
            Self::BulkAdd(_) | Self::Redistribute => None,
        }
    }
}

/// Durable record of a long-running operation.
///
/// `processed_item_ids ∪ failed_item_ids` forms the resumption filter: a
/// reclaimed job skips those items instead of re-producing artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,
    pub state: JobState,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub processed_item_ids: HashSet<ImageId>,
    pub failed_item_ids: HashSet<ImageId>,
    pub attempts: u16,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub can_resume: bool,
}

impl JobRecord {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: JobId::new(),
            payload,
            state: JobState::Pending,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            skipped_items: 0,
            processed_item_ids: HashSet::new(),
            failed_item_ids: HashSet::new(),
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            last_progress_at: None,
            completed_at: None,
            error_message: None,
            can_resume: true,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        let handled =
            self.completed_items + self.skipped_items + self.failed_items;
        handled as f64 / self.total_items as f64 * 100.0
    }

    pub fn already_handled(&self, item: &ImageId) -> bool {
        self.processed_item_ids.contains(item)
            || self.failed_item_ids.contains(item)
    }
}

/// Incremental progress emitted by workers over the updater channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub completed_delta: u64,
    pub failed_delta: u64,
    pub skipped_delta: u64,
    pub processed_ids: Vec<ImageId>,
    pub failed_ids: Vec<ImageId>,
}

impl JobProgress {
    pub fn completed(job_id: JobId, item: ImageId) -> Self {
        Self {
            job_id,
            completed_delta: 1,
            failed_delta: 0,
            skipped_delta: 0,
            processed_ids: vec![item],
            failed_ids: Vec::new(),
        }
    }

    pub fn failed(job_id: JobId, item: ImageId) -> Self {
        Self {
            job_id,
            completed_delta: 0,
            failed_delta: 1,
            skipped_delta: 0,
            processed_ids: Vec::new(),
            failed_ids: vec![item],
        }
    }

    pub fn skipped(job_id: JobId, count: u64) -> Self {
        Self {
            job_id,
            completed_delta: 0,
            failed_delta: 0,
            skipped_delta: count,
            processed_ids: Vec::new(),
            failed_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_state_machine() {
        use JobState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn progress_percent_counts_all_outcomes() {
        let mut record =
            JobRecord::new(JobPayload::Redistribute);
        record.total_items = 10;
        record.completed_items = 5;
        record.failed_items = 2;
        record.skipped_items = 3;
        assert!((record.progress_percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn payload_serialization_is_tagged() {
        let payload = JobPayload::ScanCollection(ScanParams {
            collection_id: CollectionId::new(),
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "scan_collection");
        assert!(value["params"]["collection_id"].is_string());

        let back: JobPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}
