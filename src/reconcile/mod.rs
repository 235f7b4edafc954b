//! Reconciliation of local job state with the optimization server
//!
//! [`reconcile`] is the pure merge: remote jobs replace local ones, except
//! that a job this device is downloading stays as the local copy for as long
//! as the server still lists it. [`Reconciler`] adds completion tracking on
//! top so each finished job is surfaced exactly once, including across
//! restarts.

pub mod poller;

use crate::api::models::{Job, JobStatus};
use std::collections::{HashMap, HashSet};

pub use poller::{PollLoop, PollTarget};

/// Result of merging one remote listing
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// New local job list, in remote order
    pub jobs: Vec<Job>,
    /// False when `jobs` equals the previous list
    pub changed: bool,
    /// Jobs that went from `Optimizing` to `Completed`
    pub newly_completed: Vec<Job>,
}

/// Merge a remote job listing into the previous local state
pub fn reconcile(previous: &[Job], remote: &[Job]) -> Reconciliation {
    let local: HashMap<&str, &Job> = previous.iter().map(|j| (j.id.as_str(), j)).collect();

    let mut jobs = Vec::with_capacity(remote.len());
    let mut newly_completed = Vec::new();

    for remote_job in remote {
        match local.get(remote_job.id.as_str()) {
            // Local transfer in progress wins
            Some(local_job) if local_job.status == JobStatus::Downloading => {
                jobs.push((*local_job).clone());
            }
            Some(local_job) => {
                if local_job.status == JobStatus::Optimizing && remote_job.status == JobStatus::Completed {
                    newly_completed.push(remote_job.clone());
                }
                jobs.push(remote_job.clone());
            }
            None => jobs.push(remote_job.clone()),
        }
    }

    let changed = jobs.as_slice() != previous;
    Reconciliation {
        jobs,
        changed,
        newly_completed,
    }
}

/// What one reconciliation pass decided
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub jobs: Vec<Job>,
    pub changed: bool,
    /// Completed jobs to hand to the user (auto-download or notification)
    pub ready: Vec<Job>,
    /// True when the acknowledged set must be persisted
    pub acknowledged_changed: bool,
}

/// Completion tracker around [`reconcile`]
///
/// Keeps the ids of completed jobs that were already surfaced. On the first
/// pass of a process, completed jobs that were never surfaced are surfaced
/// once, unless their item is already downloaded.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    acknowledged: HashSet<String>,
    first_pass_done: bool,
}

impl Reconciler {
    pub fn new(acknowledged: HashSet<String>) -> Self {
        Self {
            acknowledged,
            first_pass_done: false,
        }
    }

    pub fn acknowledged(&self) -> &HashSet<String> {
        &self.acknowledged
    }

    /// Sorted copy of the acknowledged ids, for persistence
    pub fn acknowledged_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.acknowledged.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Mark a job as surfaced without going through a pass
    pub fn acknowledge(&mut self, job_id: &str) -> bool {
        self.acknowledged.insert(job_id.to_string())
    }

    pub fn reset(&mut self) -> bool {
        let had = !self.acknowledged.is_empty();
        self.acknowledged.clear();
        had
    }

    /// Run one pass
    ///
    /// `is_downloaded` tells whether an item already has a local file.
    pub fn apply<F>(&mut self, previous: &[Job], remote: &[Job], is_downloaded: F) -> ReconcileOutcome
    where
        F: Fn(&str) -> bool,
    {
        let merged = reconcile(previous, remote);
        let mut candidates = merged.newly_completed;

        if !self.first_pass_done {
            self.first_pass_done = true;
            for job in &merged.jobs {
                if job.status == JobStatus::Completed
                    && !candidates.iter().any(|c| c.id == job.id)
                    && !is_downloaded(&job.item.id)
                {
                    candidates.push(job.clone());
                }
            }
        }

        let mut acknowledged_changed = false;
        let mut ready = Vec::new();
        for job in candidates {
            if self.acknowledged.insert(job.id.clone()) {
                acknowledged_changed = true;
                ready.push(job);
            }
        }

        // Forget ids the server no longer lists
        let listed: HashSet<&str> = remote.iter().map(|j| j.id.as_str()).collect();
        let before = self.acknowledged.len();
        self.acknowledged.retain(|id| listed.contains(id.as_str()));
        acknowledged_changed |= self.acknowledged.len() != before;

        ReconcileOutcome {
            jobs: merged.jobs,
            changed: merged.changed,
            ready,
            acknowledged_changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::MediaItem;

    fn job(id: &str, status: JobStatus, progress: f64) -> Job {
        let mut job = Job::optimizing(id, MediaItem::new(format!("item-{}", id), id));
        job.status = status;
        job.progress = progress;
        job.timestamp = None;
        job
    }

    #[test]
    fn test_remote_replaces_local() {
        let previous = vec![job("a", JobStatus::Optimizing, 10.0)];
        let remote = vec![job("a", JobStatus::Optimizing, 55.0), job("b", JobStatus::Optimizing, 0.0)];

        let result = reconcile(&previous, &remote);

        assert!(result.changed);
        assert_eq!(result.jobs, remote);
        assert!(result.newly_completed.is_empty());
    }

    #[test]
    fn test_local_downloading_wins() {
        let previous = vec![job("a", JobStatus::Downloading, 40.0)];
        let remote = vec![job("b", JobStatus::Optimizing, 0.0), job("a", JobStatus::Completed, 100.0)];

        let result = reconcile(&previous, &remote);

        assert_eq!(result.jobs[0].id, "b");
        assert_eq!(result.jobs[1], previous[0]);
        assert!(result.newly_completed.is_empty());
    }

    #[test]
    fn test_downloading_dropped_when_server_forgets_it() {
        let previous = vec![job("a", JobStatus::Downloading, 40.0)];
        let result = reconcile(&previous, &[]);
        assert!(result.jobs.is_empty());
        assert!(result.changed);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let previous = vec![job("a", JobStatus::Downloading, 40.0), job("b", JobStatus::Optimizing, 5.0)];
        let remote = vec![job("a", JobStatus::Completed, 100.0), job("b", JobStatus::Completed, 100.0)];

        let once = reconcile(&previous, &remote);
        let twice = reconcile(&once.jobs, &remote);

        assert_eq!(once.jobs, twice.jobs);
        assert!(!twice.changed);
        assert!(twice.newly_completed.is_empty());
    }

    #[test]
    fn test_completion_surfaced_once() {
        let mut reconciler = Reconciler::default();
        let optimizing = vec![job("a", JobStatus::Optimizing, 50.0)];
        let completed = vec![job("a", JobStatus::Completed, 100.0)];

        let first = reconciler.apply(&[], &optimizing, |_| false);
        assert!(first.ready.is_empty());

        let second = reconciler.apply(&first.jobs, &completed, |_| false);
        assert_eq!(second.ready.len(), 1);
        assert!(second.acknowledged_changed);

        let third = reconciler.apply(&second.jobs, &completed, |_| false);
        assert!(third.ready.is_empty());
        assert!(!third.changed);
        assert!(!third.acknowledged_changed);
    }

    #[test]
    fn test_first_pass_surfaces_unacknowledged_completions() {
        let remote = vec![
            job("done", JobStatus::Completed, 100.0),
            job("seen", JobStatus::Completed, 100.0),
            job("local", JobStatus::Completed, 100.0),
        ];
        let mut reconciler = Reconciler::new(["seen".to_string()].into_iter().collect());

        let first = reconciler.apply(&[], &remote, |item_id| item_id == "item-local");
        let ids: Vec<&str> = first.ready.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["done"]);

        // Later passes only react to transitions
        let second = reconciler.apply(&[], &remote, |_| false);
        assert!(second.ready.is_empty());
    }

    #[test]
    fn test_acknowledged_pruned_when_job_disappears() {
        let mut reconciler = Reconciler::new(["gone".to_string()].into_iter().collect());
        let outcome = reconciler.apply(&[], &[], |_| false);
        assert!(outcome.acknowledged_changed);
        assert!(reconciler.acknowledged().is_empty());
    }
}
