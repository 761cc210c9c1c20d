//! In-memory job state keyed by request id.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use genwire_core::ids::RequestId;
use genwire_core::job::{Job, ProgressUpdate};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Published after every mutation that changed the store.
#[derive(Clone, Debug, PartialEq)]
pub enum JobUpdate {
    Changed(Job),
    Cleared,
}

#[derive(Default)]
struct JobState {
    jobs: HashMap<RequestId, Job>,
    active: Option<RequestId>,
}

/// Authoritative job container.
///
/// Every mutation runs under one write lock, so readers only ever see whole
/// jobs. Jobs live until [`JobStore::clear`].
pub struct JobStore {
    state: RwLock<JobState>,
    updates: broadcast::Sender<JobUpdate>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(JobState::default()),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    /// Create a `Running` job unless one already exists.
    pub fn ensure_job(&self, id: &RequestId) {
        let created = {
            let mut state = self.state.write();
            if state.jobs.contains_key(id) {
                None
            } else {
                let job = Job::new(id.clone());
                let _ = state.jobs.insert(id.clone(), job.clone());
                Some(job)
            }
        };
        if let Some(job) = created {
            debug!(request_id = %id, "job created");
            self.publish(JobUpdate::Changed(job));
        }
    }

    pub fn update_progress(&self, id: &RequestId, update: ProgressUpdate) {
        self.mutate(id, |job| job.apply_progress(update));
    }

    pub fn add_image(
        &self,
        id: &RequestId,
        batch_index: impl Into<String>,
        image: impl Into<String>,
        metadata: Option<Option<String>>,
    ) {
        let (batch_index, image) = (batch_index.into(), image.into());
        self.mutate(id, |job| job.push_image(batch_index, image, metadata));
    }

    /// Idempotent; ignored once the job is terminal.
    pub fn mark_error(&self, id: &RequestId, message: impl Into<String>) {
        let message = message.into();
        self.mutate(id, |job| job.fail(message));
    }

    /// Idempotent; ignored once the job has errored.
    pub fn mark_complete(&self, id: &RequestId) {
        self.mutate(id, Job::complete);
    }

    pub fn clear(&self) {
        {
            let mut state = self.state.write();
            state.jobs.clear();
            state.active = None;
        }
        self.publish(JobUpdate::Cleared);
    }

    pub fn get(&self, id: &RequestId) -> Option<Job> {
        self.state.read().jobs.get(id).cloned()
    }

    /// All jobs, oldest first.
    pub fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        jobs
    }

    pub fn active(&self) -> Option<RequestId> {
        self.state.read().active.clone()
    }

    pub fn set_active(&self, id: Option<RequestId>) {
        self.state.write().active = id;
    }

    pub fn len(&self) -> usize {
        self.state.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mutate(&self, id: &RequestId, f: impl FnOnce(&mut Job)) {
        let snapshot = {
            let mut state = self.state.write();
            let Some(job) = state.jobs.get_mut(id) else {
                return;
            };
            f(job);
            job.clone()
        };
        self.publish(JobUpdate::Changed(snapshot));
    }

    fn publish(&self, update: JobUpdate) {
        // No receivers is fine.
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genwire_core::job::JobStatus;

    fn id(s: &str) -> RequestId {
        RequestId::from_raw(s)
    }

    #[test]
    fn ensure_job_does_not_reset_state() {
        let store = JobStore::new();
        let r = id("r1");
        store.ensure_job(&r);
        store.add_image(&r, "0", "a.png", None);
        store.ensure_job(&r);
        assert_eq!(store.get(&r).unwrap().images, vec!["a.png"]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn mutations_on_absent_job_are_noops() {
        let store = JobStore::new();
        let r = id("ghost");
        store.update_progress(&r, ProgressUpdate::default());
        store.add_image(&r, "0", "a.png", None);
        store.mark_error(&r, "x");
        store.mark_complete(&r);
        assert!(store.is_empty());
    }

    #[test]
    fn error_then_complete_stays_error() {
        let store = JobStore::new();
        let r = id("r1");
        store.ensure_job(&r);
        store.mark_error(&r, "boom");
        store.mark_complete(&r);
        let job = store.get(&r).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn late_image_after_completion_keeps_status() {
        let store = JobStore::new();
        let r = id("r1");
        store.ensure_job(&r);
        store.add_image(&r, "0", "a.png", Some(Some("{}".into())));
        store.mark_complete(&r);
        store.add_image(&r, "1", "b.png", None);

        let job = store.get(&r).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.images, vec!["a.png", "b.png"]);
        assert_eq!(job.metadata_by_batch_index.get("0"), Some(&Some("{}".into())));
        assert!(!job.metadata_by_batch_index.contains_key("1"));
    }

    #[test]
    fn clear_drops_jobs_and_active_pointer() {
        let store = JobStore::new();
        let r = id("r1");
        store.ensure_job(&r);
        store.set_active(Some(r.clone()));
        assert_eq!(store.active(), Some(r));
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.active(), None);
    }

    #[test]
    fn all_is_ordered_by_creation() {
        let store = JobStore::new();
        for name in ["c", "a", "b"] {
            store.ensure_job(&id(name));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let ids: Vec<String> = store.all().into_iter().map(|j| j.request_id.to_string()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn all_breaks_creation_ties_by_request_id() {
        let store = JobStore::new();
        let created_at = chrono::Utc::now();
        {
            let mut state = store.state.write();
            for name in ["z", "m", "a"] {
                let mut job = Job::new(id(name));
                job.created_at = created_at;
                state.jobs.insert(id(name), job);
            }
        }
        let ids: Vec<String> = store.all().into_iter().map(|j| j.request_id.to_string()).collect();
        assert_eq!(ids, vec!["a", "m", "z"]);
    }

    #[tokio::test]
    async fn subscribers_receive_snapshots() {
        let store = JobStore::new();
        let mut rx = store.subscribe();
        let r = id("r1");

        store.ensure_job(&r);
        store.update_progress(
            &r,
            ProgressUpdate {
                batch_index: "0".into(),
                overall_percent: Some(0.5),
                ..Default::default()
            },
        );
        store.clear();

        let JobUpdate::Changed(created) = rx.recv().await.unwrap() else {
            panic!("expected Changed");
        };
        assert_eq!(created.overall_percent, 0.0);
        let JobUpdate::Changed(progressed) = rx.recv().await.unwrap() else {
            panic!("expected Changed");
        };
        assert_eq!(progressed.overall_percent, 0.5);
        assert_eq!(rx.recv().await.unwrap(), JobUpdate::Cleared);
    }

    #[test]
    fn redundant_ensure_publishes_once() {
        let store = JobStore::new();
        let mut rx = store.subscribe();
        let r = id("r1");
        store.ensure_job(&r);
        store.ensure_job(&r);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
