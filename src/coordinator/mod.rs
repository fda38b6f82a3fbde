//! Worker registry, job queue and job lifecycle.
//!
//! All mutable state (registry, queue, active jobs, stats and history) lives
//! behind one mutex owned by [`Coordinator`]. Outbound calls never run under
//! that lock: state is changed optimistically first (worker marked busy, job
//! popped) and rolled back if the call fails.
//!
//! Every job is in exactly one place at a time: the queue, the active map, or
//! the archive.

mod dispatch;
mod error;
mod job;
mod queue;
mod registry;
mod stats;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{after, bounded, select, tick, Receiver, Sender};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::matcher::extract_pattern;

pub use dispatch::{DownstreamSink, HttpDispatcher, HttpDownstream, JobDispatcher};
pub use error::{DispatchError, DownstreamError, ValidationError};
pub use job::{
    Assignment, CompletionReport, IntakeReceipt, Job, JobAssignment, JobId, JobOutcome,
    JobPayload, JobResult, SearchOptions,
};
pub use queue::JobQueue;
pub use registry::{WorkerEntry, WorkerRegistry, WorkerSnapshot, WorkerStatus};
pub use stats::{ArchiveStatus, ArchivedJob, JobStats, StatsSnapshot};

/// Default time a synchronous intake waits for its job.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(600);

/// Timing and sizing knobs for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// A worker not heard from for longer than this is evicted.
    pub worker_timeout: Duration,
    /// How often the liveness sweep runs.
    pub sweep_interval: Duration,
    /// Number of finished jobs kept in the recent history.
    pub history_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            history_capacity: 100,
        }
    }
}

/// Where a job currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLocation {
    Queued,
    Active,
    Archived,
}

/// Whether a completion report changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAck {
    Recorded,
    /// Unknown or already finished job; nothing changed.
    Ignored,
}

/// Result of waiting on a synchronous intake.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(JobOutcome),
    TimedOut { job_id: JobId, waited: Duration },
}

/// The caller's end of a synchronous intake.
#[derive(Debug)]
pub struct CompletionWaiter {
    job_id: JobId,
    started: Instant,
    rx: Receiver<JobOutcome>,
}

impl CompletionWaiter {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Blocks until the job finishes or `timeout` elapses, whichever is first.
    ///
    /// Timing out does not cancel the job. Its eventual outcome is dropped
    /// at the coordinator since nobody is listening anymore.
    pub fn wait(self, timeout: Duration) -> SyncOutcome {
        select! {
            recv(self.rx) -> outcome => match outcome {
                Ok(outcome) => SyncOutcome::Completed(outcome),
                // resolver dropped without firing
                Err(_) => SyncOutcome::TimedOut {
                    job_id: self.job_id,
                    waited: self.started.elapsed(),
                },
            },
            recv(after(timeout)) -> _ => SyncOutcome::TimedOut {
                job_id: self.job_id,
                waited: self.started.elapsed(),
            },
        }
    }
}

struct PendingDelivery {
    worker_id: String,
    endpoint: String,
    assignment: JobAssignment,
    attempt: u64,
}

struct CoordinatorState {
    registry: WorkerRegistry,
    queue: JobQueue,
    active: HashMap<JobId, Job>,
    stats: JobStats,
    attempts: u64,
}

impl CoordinatorState {
    fn new(history_capacity: usize) -> Self {
        Self {
            registry: WorkerRegistry::new(),
            queue: JobQueue::new(),
            active: HashMap::new(),
            stats: JobStats::new(history_capacity),
            attempts: 0,
        }
    }

    /// Moves a job into the active set under an idle worker. Returns the
    /// wire assignment and the attempt number of this hand-out.
    fn activate(&mut self, worker_id: &str, mut job: Job, now: Instant) -> (JobAssignment, u64) {
        self.attempts += 1;
        let attempt = self.attempts;
        self.registry.assign(worker_id, job.id);
        job.assignment = Some(Assignment {
            worker_id: worker_id.to_owned(),
            dispatched_at: now,
            attempt,
        });
        let assignment = job.assignment_for(worker_id);
        self.active.insert(job.id, job);
        (assignment, attempt)
    }

    /// Moves an active job back to the queue head.
    fn requeue_active(&mut self, job_id: JobId) -> bool {
        match self.active.remove(&job_id) {
            Some(job) => {
                self.queue.requeue_front(job);
                true
            }
            None => false,
        }
    }

    /// Removes a worker, requeueing its job. Returns `None` for unknown
    /// workers, otherwise the requeued job id if there was one.
    fn remove_worker(&mut self, worker_id: &str) -> Option<Option<JobId>> {
        let entry = self.registry.remove(worker_id)?;
        Some(
            entry
                .current_job()
                .filter(|job_id| self.requeue_active(*job_id)),
        )
    }

    /// Pairs each idle push worker with the next queued job.
    fn take_deliveries(&mut self, now: Instant) -> Vec<PendingDelivery> {
        let mut deliveries = Vec::new();
        for (worker_id, endpoint) in self.registry.idle_push_targets() {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            let (assignment, attempt) = self.activate(&worker_id, job, now);
            deliveries.push(PendingDelivery {
                worker_id,
                endpoint,
                assignment,
                attempt,
            });
        }
        deliveries
    }
}

struct Inner {
    state: Mutex<CoordinatorState>,
    dispatcher: Arc<dyn JobDispatcher>,
    downstream: Option<Arc<dyn DownstreamSink>>,
    settings: CoordinatorSettings,
    started: Instant,
}

/// Shared handle to the coordinator. Cloning is cheap.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        dispatcher: Arc<dyn JobDispatcher>,
        downstream: Option<Arc<dyn DownstreamSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoordinatorState::new(settings.history_capacity)),
                dispatcher,
                downstream,
                settings,
                started: Instant::now(),
            }),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers (or re-registers) a push-mode worker as idle.
    pub fn register(&self, worker_id: &str, endpoint: &str) {
        let requeued = {
            let mut state = self.lock();
            state
                .registry
                .upsert(worker_id, Some(endpoint.to_owned()), Instant::now())
                .filter(|job_id| state.requeue_active(*job_id))
        };

        if let Some(job_id) = requeued {
            warn!(%worker_id, %job_id, "Worker re-registered while holding a job, requeued it");
        }
        info!(%worker_id, %endpoint, "Worker registered");
        self.dispatch_pending();
    }

    /// Refreshes a worker's liveness. Returns false for unknown workers.
    pub fn heartbeat(&self, worker_id: &str) -> bool {
        let known = self.lock().registry.touch(worker_id, Instant::now());
        if !known {
            debug!(%worker_id, "Heartbeat from unknown worker");
        }
        known
    }

    /// Removes a worker on request, requeueing its job at the head.
    pub fn deregister(&self, worker_id: &str) -> bool {
        let removed = self.lock().remove_worker(worker_id);
        match removed {
            Some(requeued) => {
                info!(%worker_id, "Worker deregistered");
                if requeued.is_some() {
                    self.dispatch_pending();
                }
                true
            }
            None => false,
        }
    }

    /// Pull-mode poll: registers unknown workers, refreshes liveness and
    /// hands out the queue head if the worker is idle.
    pub fn poll(&self, worker_id: &str) -> Option<JobAssignment> {
        let now = Instant::now();
        let mut state = self.lock();

        if state.registry.ensure(worker_id, now) {
            info!(%worker_id, "Worker registered via poll");
        }

        let idle = state.registry.get(worker_id).is_some_and(WorkerEntry::is_idle);
        if !idle {
            return None;
        }

        let job = state.queue.pop_front()?;
        let (assignment, _) = state.activate(worker_id, job, now);
        info!(
            job_id = %assignment.job_id,
            %worker_id,
            queue = state.queue.len(),
            "Assigned job"
        );
        Some(assignment)
    }

    /// Queues a job and returns at once.
    pub fn intake(&self, payload: JobPayload) -> Result<IntakeReceipt, ValidationError> {
        self.admit(Ok(payload), None)
    }

    /// Like [`Coordinator::intake`], for a raw request body.
    pub fn intake_json(&self, body: Value) -> Result<IntakeReceipt, ValidationError> {
        self.admit(JobPayload::from_value(body), None)
    }

    /// Queues a job whose outcome the caller will wait for.
    pub fn intake_sync(
        &self,
        payload: JobPayload,
    ) -> Result<(IntakeReceipt, CompletionWaiter), ValidationError> {
        self.admit_sync(Ok(payload))
    }

    /// Like [`Coordinator::intake_sync`], for a raw request body.
    pub fn intake_sync_json(
        &self,
        body: Value,
    ) -> Result<(IntakeReceipt, CompletionWaiter), ValidationError> {
        self.admit_sync(JobPayload::from_value(body))
    }

    fn admit_sync(
        &self,
        payload: Result<JobPayload, ValidationError>,
    ) -> Result<(IntakeReceipt, CompletionWaiter), ValidationError> {
        let (resolver, rx) = bounded(1);
        let receipt = self.admit(payload, Some(resolver))?;
        let waiter = CompletionWaiter {
            job_id: receipt.job_id,
            started: Instant::now(),
            rx,
        };
        Ok((receipt, waiter))
    }

    /// Queues a job and blocks until it finishes or `timeout` elapses.
    pub fn intake_and_wait(
        &self,
        payload: JobPayload,
        timeout: Duration,
    ) -> Result<SyncOutcome, ValidationError> {
        let (_, waiter) = self.intake_sync(payload)?;
        Ok(waiter.wait(timeout))
    }

    fn admit(
        &self,
        payload: Result<JobPayload, ValidationError>,
        resolver: Option<Sender<JobOutcome>>,
    ) -> Result<IntakeReceipt, ValidationError> {
        let receipt = {
            let mut state = self.lock();
            state.stats.total_requests += 1;

            let checked = payload.and_then(|payload| {
                let pattern = extract_pattern(payload.validated_target()?);
                Ok((pattern, payload))
            });
            let (pattern, payload) = match checked {
                Ok(checked) => checked,
                Err(e) => {
                    state.stats.rejected_count += 1;
                    return Err(e);
                }
            };

            let job = Job::new(pattern, payload, resolver);
            let job_id = job.id;
            let pattern = job.pattern.clone();
            let available_workers = state.registry.idle_count();
            let queue_position = state.queue.push_back(job);
            state.stats.jobs_created += 1;

            IntakeReceipt {
                job_id,
                pattern,
                queue_position,
                available_workers,
            }
        };

        info!(
            job_id = %receipt.job_id,
            pattern = %receipt.pattern,
            queue_position = receipt.queue_position,
            "Job queued"
        );
        self.dispatch_pending();
        Ok(receipt)
    }

    /// Records a worker's completion report.
    ///
    /// Reports for jobs that are not active (unknown, or already finished)
    /// are ignored, so duplicates and late reports are harmless.
    pub fn complete(&self, report: CompletionReport) -> CompletionAck {
        let reporter = report.worker_id.clone();
        let job_id = report.job_id;

        let (resolver, outcome, forward) = {
            let mut state = self.lock();
            let Some(mut job) = state.active.remove(&job_id) else {
                drop(state);
                debug!(%job_id, worker_id = %reporter, "Ignoring completion for inactive job");
                return CompletionAck::Ignored;
            };

            let owner = job.assigned_worker().unwrap_or(&reporter).to_owned();
            if owner != reporter {
                warn!(%job_id, %owner, %reporter, "Completion reported by a worker that does not own the job");
            }
            state.registry.release(&owner, job_id);

            let elapsed = job.created_at.elapsed();
            let result = report.into_result();
            let entry = ArchivedJob {
                timestamp: Utc::now(),
                job_id,
                worker_id: owner.clone(),
                pattern: job.pattern.clone(),
                address: result.as_ref().ok().map(|r| r.derived_address.clone()),
                tx_hash: result.as_ref().ok().and_then(|r| r.tx_hash.clone()),
                chain_id: job.payload.options().chain_id,
                error: result.as_ref().err().cloned(),
                elapsed: round_secs(elapsed),
                status: if result.is_ok() {
                    ArchiveStatus::Success
                } else {
                    ArchiveStatus::Error
                },
            };
            state.stats.archive(entry);

            let forward = match (&result, &self.inner.downstream) {
                (Ok(result), Some(_)) => Some(job.payload.merged_with(result)),
                _ => None,
            };
            let outcome = JobOutcome {
                job_id,
                worker_id: owner,
                result,
                elapsed,
            };
            (job.take_resolver(), outcome, forward)
        };

        match &outcome.result {
            Ok(result) => info!(
                %job_id,
                worker_id = %outcome.worker_id,
                address = %result.derived_address,
                elapsed = round_secs(outcome.elapsed),
                "Job completed"
            ),
            Err(e) => warn!(
                %job_id,
                worker_id = %outcome.worker_id,
                error = %e,
                elapsed = round_secs(outcome.elapsed),
                "Job failed"
            ),
        }

        if let Some(resolver) = resolver {
            if resolver.try_send(outcome).is_err() {
                debug!(%job_id, "Synchronous caller already gave up");
            }
        }
        if let Some(body) = forward {
            self.spawn_forward(job_id, body);
        }

        self.dispatch_pending();
        CompletionAck::Recorded
    }

    /// Evicts workers that have not been seen within the timeout.
    pub fn evict_expired(&self) -> Vec<String> {
        self.evict_expired_at(Instant::now())
    }

    /// Same as [`evict_expired`](Self::evict_expired) with an explicit clock.
    pub fn evict_expired_at(&self, now: Instant) -> Vec<String> {
        let timeout = self.inner.settings.worker_timeout;
        let (evicted, requeued) = {
            let mut state = self.lock();
            let expired = state.registry.expired(now, timeout);
            let mut requeued = Vec::new();
            for worker_id in &expired {
                if let Some(Some(job_id)) = state.remove_worker(worker_id) {
                    requeued.push(job_id);
                }
            }
            (expired, requeued)
        };

        for worker_id in &evicted {
            warn!(%worker_id, "Worker timed out, evicted");
        }
        for job_id in &requeued {
            info!(%job_id, "Requeued job of evicted worker at head");
        }
        if !requeued.is_empty() {
            self.dispatch_pending();
        }
        evicted
    }

    /// Starts the periodic liveness sweep on its own thread.
    pub fn spawn_liveness_sweeper(&self) -> io::Result<LivenessSweeper> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(self.inner.settings.sweep_interval);
        let coordinator = self.clone();

        let handle = thread::Builder::new()
            .name("liveness-sweeper".into())
            .spawn(move || loop {
                let running = select! {
                    recv(ticker) -> _ => {
                        coordinator.evict_expired();
                        true
                    }
                    recv(stop_rx) -> _ => false,
                };
                if !running {
                    break;
                }
            })?;

        Ok(LivenessSweeper {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Where a job currently is, if the coordinator still knows about it.
    pub fn locate(&self, job_id: JobId) -> Option<JobLocation> {
        let state = self.lock();
        if state.queue.position(job_id).is_some() {
            Some(JobLocation::Queued)
        } else if state.active.contains_key(&job_id) {
            Some(JobLocation::Active)
        } else if state.stats.is_archived(job_id) {
            Some(JobLocation::Archived)
        } else {
            None
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let state = self.lock();
        StatsSnapshot {
            workers: state.registry.snapshot(),
            worker_count: state.registry.len(),
            active_workers: state.registry.busy_count(),
            idle_workers: state.registry.idle_count(),
            queue_length: state.queue.len(),
            active_jobs: state.active.len(),
            total_requests: state.stats.total_requests,
            rejected_count: state.stats.rejected_count,
            success_count: state.stats.success_count,
            error_count: state.stats.error_count,
            jobs_created: state.stats.jobs_created,
            recent_requests: state.stats.recent().cloned().collect(),
            uptime: self.inner.started.elapsed().as_secs_f64(),
        }
    }

    /// Hands queued jobs to idle push workers.
    fn dispatch_pending(&self) {
        let deliveries = self.lock().take_deliveries(Instant::now());
        for delivery in deliveries {
            self.spawn_delivery(delivery);
        }
    }

    fn spawn_delivery(&self, delivery: PendingDelivery) {
        let worker_id = delivery.worker_id.clone();
        let job_id = delivery.assignment.job_id;
        let attempt = delivery.attempt;
        let coordinator = self.clone();

        let spawned = thread::Builder::new()
            .name(format!("dispatch-{}", worker_id))
            .spawn(move || coordinator.deliver(delivery));

        if let Err(e) = spawned {
            error!(%worker_id, %job_id, error = %e, "Failed to spawn dispatch thread");
            self.rollback_delivery(&worker_id, job_id, attempt);
        }
    }

    fn deliver(&self, delivery: PendingDelivery) {
        let PendingDelivery {
            worker_id,
            endpoint,
            assignment,
            attempt,
        } = delivery;

        match self.inner.dispatcher.deliver(&endpoint, &assignment) {
            Ok(()) => info!(job_id = %assignment.job_id, %worker_id, "Dispatched job"),
            Err(e) => {
                warn!(
                    job_id = %assignment.job_id,
                    %worker_id,
                    error = %e,
                    "Dispatch failed, requeueing job at head"
                );
                self.rollback_delivery(&worker_id, assignment.job_id, attempt);
            }
        }
    }

    /// Undoes an optimistic assignment, unless the job has been handed out
    /// again since.
    fn rollback_delivery(&self, worker_id: &str, job_id: JobId, attempt: u64) {
        let mut state = self.lock();
        let still_assigned = state
            .active
            .get(&job_id)
            .is_some_and(|job| job.is_assigned(worker_id, attempt));
        if !still_assigned {
            return;
        }
        state.registry.release(worker_id, job_id);
        state.requeue_active(job_id);
    }

    fn spawn_forward(&self, job_id: JobId, body: Value) {
        let Some(sink) = self.inner.downstream.clone() else {
            return;
        };

        let spawned = thread::Builder::new()
            .name("downstream-forward".into())
            .spawn(move || match sink.forward(&body) {
                Ok(()) => debug!(%job_id, "Forwarded result downstream"),
                Err(e) => error!(%job_id, error = %e, "Downstream forward failed"),
            });

        if let Err(e) = spawned {
            error!(%job_id, error = %e, "Failed to spawn downstream thread");
        }
    }
}

/// Handle to the liveness sweep thread. Dropping it stops the sweep.
pub struct LivenessSweeper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LivenessSweeper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Disconnecting the channel wakes the sweep thread.
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LivenessSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Seconds rounded to two decimals.
fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingDispatcher {
        delivered: Sender<(String, JobAssignment)>,
        fail: AtomicBool,
    }

    impl JobDispatcher for RecordingDispatcher {
        fn deliver(&self, endpoint: &str, assignment: &JobAssignment) -> Result<(), DispatchError> {
            let _ = self.delivered.send((endpoint.to_owned(), assignment.clone()));
            if self.fail.load(Ordering::SeqCst) {
                Err(DispatchError::Rejected {
                    endpoint: endpoint.to_owned(),
                    status: 503,
                })
            } else {
                Ok(())
            }
        }
    }

    struct RecordingSink {
        forwarded: Sender<Value>,
        fail: bool,
    }

    impl DownstreamSink for RecordingSink {
        fn forward(&self, body: &Value) -> Result<(), DownstreamError> {
            let _ = self.forwarded.send(body.clone());
            if self.fail {
                Err(DownstreamError::Status(502))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        coordinator: Coordinator,
        dispatcher: Arc<RecordingDispatcher>,
        delivered: Receiver<(String, JobAssignment)>,
    }

    fn harness_with(settings: CoordinatorSettings, sink: Option<Arc<dyn DownstreamSink>>) -> Harness {
        let (tx, delivered) = crossbeam_channel::unbounded();
        let dispatcher = Arc::new(RecordingDispatcher {
            delivered: tx,
            fail: AtomicBool::new(false),
        });
        Harness {
            coordinator: Coordinator::new(settings, dispatcher.clone(), sink),
            dispatcher,
            delivered,
        }
    }

    fn harness() -> Harness {
        harness_with(CoordinatorSettings::default(), None)
    }

    fn target_payload(target: &str) -> JobPayload {
        JobPayload::from_value(json!({ "R": target, "chain_id": 8453 })).unwrap()
    }

    fn payload() -> JobPayload {
        target_payload("0xaaaabbbbccccddddeeee000011112222333344445555")
    }

    fn result() -> JobResult {
        JobResult {
            derived_private_key: format!("0x{}", "1".repeat(64)),
            derived_public_key: format!("0x04{}", "2".repeat(128)),
            derived_address: "0xaaaabb0000000000000000000000000000005555".into(),
            tx_hash: None,
            address_verified: Some(true),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn assert_accounted(coordinator: &Coordinator) {
        let stats = coordinator.stats();
        assert_eq!(
            stats.queue_length as u64 + stats.active_jobs as u64 + stats.success_count + stats.error_count,
            stats.jobs_created
        );
    }

    #[test]
    fn test_missing_target_never_reaches_queue() {
        let h = harness();
        let err = h
            .coordinator
            .intake(JobPayload::from_value(json!({"s": "0x1"})).unwrap())
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingTarget);

        let stats = h.coordinator.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.rejected_count, 1);
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.jobs_created, 0);
        assert_eq!(stats.error_count, 0);
    }

    #[test]
    fn test_non_object_body_counts_as_rejected() {
        let h = harness();
        let err = h.coordinator.intake_json(json!(["R", "0xaaaa"])).unwrap_err();
        assert_eq!(err, ValidationError::NotAnObject);
        let err = h.coordinator.intake_sync_json(json!("0xaaaa")).unwrap_err();
        assert_eq!(err, ValidationError::NotAnObject);

        let stats = h.coordinator.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.rejected_count, 2);
        assert_eq!(stats.jobs_created, 0);
    }

    #[test]
    fn test_intake_receipt() {
        let h = harness();
        h.coordinator.poll("idle-puller");
        let first = h.coordinator.intake(payload()).unwrap();
        assert_eq!(first.pattern, "aaaabbXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX5555");
        assert_eq!(first.queue_position, 0);
        assert_eq!(first.available_workers, 1);

        let second = h.coordinator.intake(payload()).unwrap();
        assert_eq!(second.queue_position, 1);
        assert_eq!(h.coordinator.locate(first.job_id), Some(JobLocation::Queued));
    }

    #[test]
    fn test_pull_lifecycle() {
        let h = harness();
        let receipt = h.coordinator.intake(payload()).unwrap();

        let assignment = h.coordinator.poll("w1").expect("job handed out");
        assert_eq!(assignment.job_id, receipt.job_id);
        assert_eq!(assignment.pattern, receipt.pattern);
        assert_eq!(h.coordinator.locate(receipt.job_id), Some(JobLocation::Active));
        assert_accounted(&h.coordinator);

        h.coordinator.intake(payload()).unwrap();
        assert!(h.coordinator.poll("w1").is_none(), "busy worker gets nothing");

        let ack = h
            .coordinator
            .complete(CompletionReport::succeeded("w1", receipt.job_id, result()));
        assert_eq!(ack, CompletionAck::Recorded);
        assert_eq!(h.coordinator.locate(receipt.job_id), Some(JobLocation::Archived));

        let stats = h.coordinator.stats();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.recent_requests[0].job_id, receipt.job_id);
        assert_eq!(stats.recent_requests[0].chain_id, Some(8453));
        assert_eq!(stats.workers[0].status, WorkerStatus::Idle);
        assert_accounted(&h.coordinator);
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let h = harness();
        let receipt = h.coordinator.intake(payload()).unwrap();
        h.coordinator.poll("w1").unwrap();
        h.coordinator
            .complete(CompletionReport::failed("w1", receipt.job_id, "engine exited"));

        let before = h.coordinator.stats();
        let ack = h
            .coordinator
            .complete(CompletionReport::succeeded("w1", receipt.job_id, result()));
        assert_eq!(ack, CompletionAck::Ignored);

        let after = h.coordinator.stats();
        assert_eq!(after.success_count, before.success_count);
        assert_eq!(after.error_count, 1);
        assert_eq!(after.recent_requests.len(), 1);
        assert_eq!(after.recent_requests[0].status, ArchiveStatus::Error);

        let unknown = CompletionReport::succeeded("w1", uuid::Uuid::new_v4(), result());
        assert_eq!(h.coordinator.complete(unknown), CompletionAck::Ignored);
    }

    #[test]
    fn test_fifo_across_pollers() {
        let h = harness();
        let a = h.coordinator.intake(payload()).unwrap();
        let b = h.coordinator.intake(payload()).unwrap();
        assert_eq!(h.coordinator.poll("w1").unwrap().job_id, a.job_id);
        assert_eq!(h.coordinator.poll("w2").unwrap().job_id, b.job_id);
        assert!(h.coordinator.poll("w3").is_none());
    }

    #[test]
    fn test_push_dispatch() {
        let h = harness();
        h.coordinator.register("w1", "http://w1:3001");
        let receipt = h.coordinator.intake(payload()).unwrap();

        let (endpoint, assignment) = h.delivered.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(endpoint, "http://w1:3001");
        assert_eq!(assignment.job_id, receipt.job_id);
        assert_eq!(assignment.worker_id.as_deref(), Some("w1"));

        let stats = h.coordinator.stats();
        assert_eq!(stats.active_jobs, 1);
        assert_eq!(stats.active_workers, 1);
    }

    #[test]
    fn test_register_dispatches_waiting_jobs() {
        let h = harness();
        let receipt = h.coordinator.intake(payload()).unwrap();
        assert!(h.delivered.try_recv().is_err());

        h.coordinator.register("w1", "http://w1");
        let (_, assignment) = h.delivered.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(assignment.job_id, receipt.job_id);
    }

    #[test]
    fn test_failed_delivery_requeues_at_head() {
        let h = harness();
        h.dispatcher.fail.store(true, Ordering::SeqCst);
        h.coordinator.register("w1", "http://w1");
        let first = h.coordinator.intake(payload()).unwrap();

        h.delivered.recv_timeout(Duration::from_secs(2)).unwrap();
        wait_until(|| {
            let stats = h.coordinator.stats();
            stats.queue_length == 1 && stats.idle_workers == 1
        });
        assert_eq!(h.coordinator.locate(first.job_id), Some(JobLocation::Queued));

        assert!(h.coordinator.deregister("w1"));
        let second = h.coordinator.intake(payload()).unwrap();

        assert_eq!(h.coordinator.poll("w2").unwrap().job_id, first.job_id);
        assert_eq!(h.coordinator.poll("w3").unwrap().job_id, second.job_id);
        assert_accounted(&h.coordinator);
    }

    #[test]
    fn test_stale_rollback_leaves_newer_delivery_alone() {
        let h = harness();
        h.coordinator.register("w1", "http://w1");
        let receipt = h.coordinator.intake(payload()).unwrap();
        h.delivered.recv_timeout(Duration::from_secs(2)).unwrap();
        let attempt_of = |c: &Coordinator| {
            c.lock().active[&receipt.job_id]
                .assignment
                .as_ref()
                .unwrap()
                .attempt
        };
        let stale = attempt_of(&h.coordinator);

        // The worker drops out and comes back; the job goes to it again.
        assert!(h.coordinator.deregister("w1"));
        h.coordinator.register("w1", "http://w1");
        h.delivered.recv_timeout(Duration::from_secs(2)).unwrap();
        let current = attempt_of(&h.coordinator);
        assert_ne!(stale, current);

        h.coordinator.rollback_delivery("w1", receipt.job_id, stale);
        assert_eq!(h.coordinator.locate(receipt.job_id), Some(JobLocation::Active));
        let stats = h.coordinator.stats();
        assert_eq!(stats.active_workers, 1);
        assert_eq!(stats.queue_length, 0);

        h.coordinator.rollback_delivery("w1", receipt.job_id, current);
        assert_eq!(h.coordinator.locate(receipt.job_id), Some(JobLocation::Queued));
        assert_eq!(h.coordinator.stats().idle_workers, 1);
        assert_accounted(&h.coordinator);
    }

    #[test]
    fn test_eviction_requeues_only_the_evicted_workers_job() {
        let h = harness();
        let start = Instant::now();
        let held = h.coordinator.intake(payload()).unwrap();
        h.coordinator.poll("busy").unwrap();
        h.coordinator.poll("idle");
        let waiting = h.coordinator.intake(payload()).unwrap();

        let mut evicted = h.coordinator.evict_expired_at(start + Duration::from_secs(31));
        evicted.sort();
        assert_eq!(evicted, vec!["busy".to_string(), "idle".to_string()]);

        let stats = h.coordinator.stats();
        assert_eq!(stats.worker_count, 0);
        assert_eq!(stats.queue_length, 2);
        assert_eq!(stats.active_jobs, 0);

        assert_eq!(h.coordinator.poll("fresh").unwrap().job_id, held.job_id);
        assert_eq!(h.coordinator.poll("fresh2").unwrap().job_id, waiting.job_id);
    }

    #[test]
    fn test_live_workers_survive_sweep() {
        let h = harness();
        h.coordinator.poll("w1");
        assert!(h.coordinator.evict_expired().is_empty());
        assert!(h.coordinator.heartbeat("w1"));
        assert!(!h.coordinator.heartbeat("ghost"));
        assert_eq!(h.coordinator.stats().worker_count, 1);
    }

    #[test]
    fn test_reregistration_requeues_held_job() {
        let h = harness();
        h.coordinator.register("w1", "http://w1");
        let receipt = h.coordinator.intake(payload()).unwrap();
        h.delivered.recv_timeout(Duration::from_secs(2)).unwrap();

        // The re-registered worker is idle again and gets the requeued job.
        h.coordinator.register("w1", "http://w1");
        let (_, again) = h.delivered.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(again.job_id, receipt.job_id);
        assert_accounted(&h.coordinator);
    }

    #[test]
    fn test_completion_by_non_owner_frees_owner() {
        let h = harness();
        let receipt = h.coordinator.intake(payload()).unwrap();
        h.coordinator.poll("owner").unwrap();
        h.coordinator.poll("other");

        let ack = h
            .coordinator
            .complete(CompletionReport::succeeded("other", receipt.job_id, result()));
        assert_eq!(ack, CompletionAck::Recorded);
        let stats = h.coordinator.stats();
        assert_eq!(stats.idle_workers, 2);
        assert_eq!(stats.recent_requests[0].worker_id, "owner");
    }

    #[test]
    fn test_sync_intake_completes() {
        let h = harness();
        let (receipt, waiter) = h.coordinator.intake_sync(payload()).unwrap();
        assert_eq!(waiter.job_id(), receipt.job_id);

        let coordinator = h.coordinator.clone();
        let worker = thread::spawn(move || {
            let assignment = coordinator.poll("w1").unwrap();
            coordinator.complete(CompletionReport::succeeded("w1", assignment.job_id, result()))
        });

        match waiter.wait(Duration::from_secs(5)) {
            SyncOutcome::Completed(outcome) => {
                assert_eq!(outcome.job_id, receipt.job_id);
                assert_eq!(outcome.worker_id, "w1");
                assert_eq!(outcome.result, Ok(result()));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(worker.join().unwrap(), CompletionAck::Recorded);
    }

    #[test]
    fn test_sync_intake_reports_failure() {
        let h = harness();
        let (receipt, waiter) = h.coordinator.intake_sync(payload()).unwrap();
        h.coordinator.poll("w1").unwrap();
        h.coordinator
            .complete(CompletionReport::failed("w1", receipt.job_id, "timeout after 300s"));

        match waiter.wait(Duration::from_secs(1)) {
            SyncOutcome::Completed(outcome) => {
                assert_eq!(outcome.result, Err("timeout after 300s".to_string()))
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_sync_timeout_does_not_cancel_job() {
        let h = harness();
        let (receipt, waiter) = h.coordinator.intake_sync(payload()).unwrap();

        match waiter.wait(Duration::from_millis(20)) {
            SyncOutcome::TimedOut { job_id, .. } => assert_eq!(job_id, receipt.job_id),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(h.coordinator.locate(receipt.job_id), Some(JobLocation::Queued));

        h.coordinator.poll("w1").unwrap();
        let ack = h
            .coordinator
            .complete(CompletionReport::succeeded("w1", receipt.job_id, result()));
        assert_eq!(ack, CompletionAck::Recorded);
        assert_eq!(h.coordinator.stats().success_count, 1);
        assert_eq!(h.coordinator.locate(receipt.job_id), Some(JobLocation::Archived));
    }

    #[test]
    fn test_intake_and_wait_times_out_without_workers() {
        let h = harness();
        let outcome = h
            .coordinator
            .intake_and_wait(payload(), Duration::from_millis(10))
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::TimedOut { .. }));
    }

    #[test]
    fn test_success_is_forwarded_downstream() {
        let (tx, forwarded) = crossbeam_channel::unbounded();
        let sink: Arc<dyn DownstreamSink> = Arc::new(RecordingSink {
            forwarded: tx,
            fail: false,
        });
        let h = harness_with(CoordinatorSettings::default(), Some(sink));

        let ok = h.coordinator.intake(payload()).unwrap();
        h.coordinator.poll("w1").unwrap();
        h.coordinator
            .complete(CompletionReport::succeeded("w1", ok.job_id, result()));

        let body = forwarded.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(body["R"], "0xaaaabbbbccccddddeeee000011112222333344445555");
        assert_eq!(body["chain_id"], 8453);
        assert_eq!(body["derivedAddress"], result().derived_address.as_str());

        let failed = h.coordinator.intake(payload()).unwrap();
        h.coordinator.poll("w1").unwrap();
        h.coordinator
            .complete(CompletionReport::failed("w1", failed.job_id, "no match"));
        assert!(forwarded.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_downstream_failure_does_not_change_outcome() {
        let (tx, forwarded) = crossbeam_channel::unbounded();
        let sink: Arc<dyn DownstreamSink> = Arc::new(RecordingSink {
            forwarded: tx,
            fail: true,
        });
        let h = harness_with(CoordinatorSettings::default(), Some(sink));

        let (receipt, waiter) = h.coordinator.intake_sync(payload()).unwrap();
        h.coordinator.poll("w1").unwrap();
        h.coordinator
            .complete(CompletionReport::succeeded("w1", receipt.job_id, result()));

        forwarded.recv_timeout(Duration::from_secs(2)).unwrap();
        match waiter.wait(Duration::from_secs(1)) {
            SyncOutcome::Completed(outcome) => assert!(outcome.result.is_ok()),
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(h.coordinator.stats().success_count, 1);
    }

    #[test]
    fn test_accounting_holds_across_states() {
        let h = harness();
        let done = h.coordinator.intake(payload()).unwrap();
        h.coordinator.poll("w1").unwrap();
        h.coordinator
            .complete(CompletionReport::succeeded("w1", done.job_id, result()));
        h.coordinator.intake(payload()).unwrap();
        h.coordinator.poll("w2").unwrap();
        h.coordinator.intake(payload()).unwrap();
        h.coordinator.intake(payload()).unwrap();

        let stats = h.coordinator.stats();
        assert_eq!(stats.jobs_created, 4);
        assert_eq!(stats.queue_length, 1);
        assert_eq!(stats.active_jobs, 1);
        assert_accounted(&h.coordinator);
    }

    #[test]
    fn test_history_capacity() {
        let settings = CoordinatorSettings {
            history_capacity: 2,
            ..CoordinatorSettings::default()
        };
        let h = harness_with(settings, None);
        for _ in 0..3 {
            let receipt = h.coordinator.intake(payload()).unwrap();
            h.coordinator.poll("w1").unwrap();
            h.coordinator
                .complete(CompletionReport::succeeded("w1", receipt.job_id, result()));
        }
        let stats = h.coordinator.stats();
        assert_eq!(stats.recent_requests.len(), 2);
        assert_eq!(stats.success_count, 3);
        assert_accounted(&h.coordinator);
    }

    #[test]
    fn test_liveness_sweeper_evicts_on_its_own() {
        let settings = CoordinatorSettings {
            worker_timeout: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(10),
            ..CoordinatorSettings::default()
        };
        let h = harness_with(settings, None);
        let receipt = h.coordinator.intake(payload()).unwrap();
        h.coordinator.poll("w1").unwrap();

        let sweeper = h.coordinator.spawn_liveness_sweeper().unwrap();
        wait_until(|| h.coordinator.stats().worker_count == 0);
        sweeper.stop();

        assert_eq!(h.coordinator.locate(receipt.job_id), Some(JobLocation::Queued));
    }
}
