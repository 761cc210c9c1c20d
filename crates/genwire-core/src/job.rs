use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

/// Lifecycle of one generation request.
///
/// Only advances `Running → Completed | Error`. The first terminal status
/// sticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Queued,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Client-side state for one generation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub request_id: RequestId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Normalised to [0, 1].
    pub overall_percent: f64,
    /// Normalised to [0, 1].
    pub current_percent: f64,
    pub preview: Option<String>,
    /// Arrival order, not batch order.
    pub images: Vec<String>,
    /// `None` values record an explicit "no metadata" from the server.
    pub metadata_by_batch_index: BTreeMap<String, Option<String>>,
    pub error: Option<String>,
}

/// Fields carried by one progress frame. Unset fields leave the job as is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressUpdate {
    pub batch_index: String,
    pub overall_percent: Option<f64>,
    pub current_percent: Option<f64>,
    pub preview: Option<String>,
    /// Outer `None`: not supplied. `Some(None)`: explicit null.
    pub metadata: Option<Option<String>>,
}

impl Job {
    pub fn new(request_id: RequestId) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            status: JobStatus::Running,
            created_at: now,
            last_updated_at: now,
            overall_percent: 0.0,
            current_percent: 0.0,
            preview: None,
            images: Vec::new(),
            metadata_by_batch_index: BTreeMap::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn apply_progress(&mut self, update: ProgressUpdate) {
        if let Some(overall) = update.overall_percent {
            self.overall_percent = overall.clamp(0.0, 1.0);
        }
        if let Some(current) = update.current_percent {
            self.current_percent = current.clamp(0.0, 1.0);
        }
        if let Some(preview) = update.preview {
            self.preview = Some(preview);
        }
        if let Some(metadata) = update.metadata {
            self.metadata_by_batch_index.insert(update.batch_index, metadata);
        }
        if matches!(self.status, JobStatus::Idle | JobStatus::Queued) {
            self.status = JobStatus::Running;
        }
        self.touch();
    }

    pub fn push_image(&mut self, batch_index: String, image: String, metadata: Option<Option<String>>) {
        self.images.push(image);
        if let Some(metadata) = metadata {
            self.metadata_by_batch_index.insert(batch_index, metadata);
        }
        self.touch();
    }

    /// No-op once the job is terminal, so the first error message is kept and
    /// a completed job stays completed.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Error;
        self.error = Some(message.into());
        self.touch();
    }

    pub fn complete(&mut self) {
        if self.status == JobStatus::Error {
            return;
        }
        self.status = JobStatus::Completed;
        self.overall_percent = 1.0;
        self.current_percent = 1.0;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

/// Map a raw server percent (0–1 or 0–100) onto [0, 1].
pub fn normalize_percent(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }
    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    scaled.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(RequestId::from_raw("req-1"))
    }

    #[test]
    fn new_job_is_running_and_empty() {
        let job = job();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.overall_percent, 0.0);
        assert!(job.images.is_empty());
        assert!(job.error.is_none());
    }

    #[test]
    fn progress_merges_only_supplied_fields() {
        let mut job = job();
        job.apply_progress(ProgressUpdate {
            batch_index: "0".into(),
            overall_percent: Some(0.5),
            preview: Some("data:preview".into()),
            ..Default::default()
        });
        job.apply_progress(ProgressUpdate {
            batch_index: "0".into(),
            current_percent: Some(0.25),
            ..Default::default()
        });
        assert_eq!(job.overall_percent, 0.5);
        assert_eq!(job.current_percent, 0.25);
        assert_eq!(job.preview.as_deref(), Some("data:preview"));
        assert!(job.metadata_by_batch_index.is_empty());
    }

    #[test]
    fn explicit_null_metadata_is_recorded() {
        let mut job = job();
        job.apply_progress(ProgressUpdate {
            batch_index: "2".into(),
            metadata: Some(None),
            ..Default::default()
        });
        assert_eq!(job.metadata_by_batch_index.get("2"), Some(&None));
    }

    #[test]
    fn error_is_sticky_over_completion() {
        let mut job = job();
        job.fail("no model selected");
        job.complete();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("no model selected"));
    }

    #[test]
    fn fail_keeps_first_message() {
        let mut job = job();
        job.fail("first");
        job.fail("second");
        assert_eq!(job.error.as_deref(), Some("first"));
    }

    #[test]
    fn fail_after_completion_is_ignored() {
        let mut job = job();
        job.complete();
        job.fail("late error");
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[test]
    fn completion_snaps_percents() {
        let mut job = job();
        job.apply_progress(ProgressUpdate {
            batch_index: "0".into(),
            overall_percent: Some(0.3),
            current_percent: Some(0.9),
            ..Default::default()
        });
        job.complete();
        assert_eq!(job.overall_percent, 1.0);
        assert_eq!(job.current_percent, 1.0);
    }

    #[test]
    fn late_progress_does_not_reopen_completed_job() {
        let mut job = job();
        job.complete();
        job.apply_progress(ProgressUpdate {
            batch_index: "1".into(),
            overall_percent: Some(0.1),
            ..Default::default()
        });
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn normalize_handles_both_scales() {
        assert_eq!(normalize_percent(0.4), 0.4);
        assert_eq!(normalize_percent(40.0), 0.4);
        assert_eq!(normalize_percent(100.0), 1.0);
        assert_eq!(normalize_percent(250.0), 1.0);
        assert_eq!(normalize_percent(-3.0), 0.0);
        assert_eq!(normalize_percent(f64::NAN), 0.0);
    }
}
