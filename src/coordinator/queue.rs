//! Pending job queue.
//!
//! New jobs join at the tail. Jobs coming back from a failed delivery or an
//! evicted worker rejoin at the head, ahead of work that has never been tried.

use std::collections::VecDeque;

use super::job::{Job, JobId};

#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new job; returns the number of jobs ahead of it.
    pub fn push_back(&mut self, job: Job) -> usize {
        let ahead = self.jobs.len();
        self.jobs.push_back(job);
        ahead
    }

    /// Reinserts a job that was already dispatched once.
    pub fn requeue_front(&mut self, mut job: Job) {
        job.assignment = None;
        self.jobs.push_front(job);
    }

    pub fn pop_front(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Zero-based position of a job, if queued.
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        self.jobs.iter().position(|job| job.id == job_id)
    }
}
