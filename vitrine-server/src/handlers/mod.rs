pub mod cache;
pub mod collections;
pub mod health;
pub mod images;
pub mod jobs;

use serde::Serialize;
use vitrine_model::JobRecord;

/// `202 Accepted` body for every operation that reduces to a job enqueue.
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub kind: String,
    pub state: String,
}

impl From<&JobRecord> for JobAccepted {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.to_string(),
            kind: job.kind().to_string(),
            state: job.state.to_string(),
        }
    }
}
