//! Known workers, their liveness and their current assignment.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// A registered worker.
///
/// `current_job` is set exactly when `status` is `Busy`; the two only change
/// together through [`WorkerRegistry::assign`] and [`WorkerRegistry::release`].
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub id: String,
    /// Push-mode callback base URL. Pull-mode workers have none.
    pub endpoint: Option<String>,
    status: WorkerStatus,
    current_job: Option<JobId>,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
}

impl WorkerEntry {
    fn new(id: &str, endpoint: Option<String>, now: Instant) -> Self {
        Self {
            id: id.to_owned(),
            endpoint,
            status: WorkerStatus::Idle,
            current_job: None,
            last_seen: now,
            last_seen_at: Utc::now(),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.current_job
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_seen_at = Utc::now();
    }
}

/// Worker view exposed through the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: String,
    pub status: WorkerStatus,
    pub current_job: Option<JobId>,
    pub last_seen: DateTime<Utc>,
    pub mode: &'static str,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a worker as idle.
    ///
    /// Returns the job the overwritten entry was holding, if any.
    pub fn upsert(&mut self, id: &str, endpoint: Option<String>, now: Instant) -> Option<JobId> {
        self.workers
            .insert(id.to_owned(), WorkerEntry::new(id, endpoint, now))
            .and_then(|previous| previous.current_job)
    }

    /// Refreshes liveness. Returns false for unknown workers.
    pub fn touch(&mut self, id: &str, now: Instant) -> bool {
        match self.workers.get_mut(id) {
            Some(worker) => {
                worker.touch(now);
                true
            }
            None => false,
        }
    }

    /// Refreshes liveness, registering the worker first if unknown.
    /// Returns true if the worker was newly registered.
    pub fn ensure(&mut self, id: &str, now: Instant) -> bool {
        if self.touch(id, now) {
            return false;
        }
        self.workers
            .insert(id.to_owned(), WorkerEntry::new(id, None, now));
        true
    }

    pub fn get(&self, id: &str) -> Option<&WorkerEntry> {
        self.workers.get(id)
    }

    /// Marks an idle worker busy with a job. Returns false if the worker is
    /// unknown or already busy.
    pub fn assign(&mut self, id: &str, job_id: JobId) -> bool {
        match self.workers.get_mut(id) {
            Some(worker) if worker.is_idle() => {
                worker.status = WorkerStatus::Busy;
                worker.current_job = Some(job_id);
                true
            }
            _ => false,
        }
    }

    /// Frees a worker, but only if it still holds `job_id`.
    pub fn release(&mut self, id: &str, job_id: JobId) -> bool {
        match self.workers.get_mut(id) {
            Some(worker) if worker.current_job == Some(job_id) => {
                worker.status = WorkerStatus::Idle;
                worker.current_job = None;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<WorkerEntry> {
        self.workers.remove(id)
    }

    /// Ids of workers not seen for longer than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.workers
            .values()
            .filter(|w| now.saturating_duration_since(w.last_seen) > timeout)
            .map(|w| w.id.clone())
            .collect()
    }

    /// Idle workers that can receive pushed jobs, as `(id, endpoint)`.
    pub fn idle_push_targets(&self) -> Vec<(String, String)> {
        self.workers
            .values()
            .filter(|w| w.is_idle())
            .filter_map(|w| w.endpoint.clone().map(|endpoint| (w.id.clone(), endpoint)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn idle_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_idle()).count()
    }

    pub fn busy_count(&self) -> usize {
        self.len() - self.idle_count()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .values()
            .map(|w| WorkerSnapshot {
                id: w.id.clone(),
                status: w.status,
                current_job: w.current_job,
                last_seen: w.last_seen_at,
                mode: if w.endpoint.is_some() { "push" } else { "pull" },
            })
            .collect()
    }
}
