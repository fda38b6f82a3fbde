//! Worker slot management.
//!
//! A worker process runs a fixed number of slots. Each slot is a separate
//! worker as far as the coordinator is concerned, so the coordinator's
//! one-job-per-worker rule caps how many searches run at once.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, tick, Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::coordinator::{JobAssignment, JobId};

use super::client::CoordinatorApi;
use super::processor::JobProcessor;

/// Attempts made to deliver a completion report before giving up.
const COMPLETE_ATTEMPTS: u32 = 3;

/// How slots get their jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchMode {
    /// Slots poll the coordinator while idle.
    Pull,
    /// The coordinator posts jobs to `callback_url`.
    Push { callback_url: String },
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub worker_id: String,
    pub slots: usize,
    pub mode: DispatchMode,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Delay between failed registration attempts.
    pub register_retry: Duration,
}

impl PoolSettings {
    pub fn new(worker_id: impl Into<String>, mode: DispatchMode) -> Self {
        Self {
            worker_id: worker_id.into(),
            slots: 1,
            mode,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            register_retry: Duration::from_secs(5),
        }
    }

    /// Coordinator-facing id of every slot.
    pub fn slot_ids(&self) -> Vec<String> {
        if self.slots <= 1 {
            vec![self.worker_id.clone()]
        } else {
            (0..self.slots)
                .map(|slot| format!("{}-{}", self.worker_id, slot))
                .collect()
        }
    }
}

/// Why the push receiver turned a job away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboxError {
    #[error("Unknown worker slot: {0}")]
    UnknownSlot(String),

    #[error("Worker busy")]
    Busy,

    #[error("Worker is shutting down")]
    Closed,
}

/// What a slot is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub id: String,
    pub current_job: Option<JobId>,
}

struct Slot {
    id: String,
    current: Mutex<Option<JobId>>,
    inbox: Sender<JobAssignment>,
}

impl Slot {
    fn current(&self) -> MutexGuard<'_, Option<JobId>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self, job_id: JobId) -> bool {
        let mut current = self.current();
        if current.is_some() {
            return false;
        }
        *current = Some(job_id);
        true
    }

    fn release(&self) {
        *self.current() = None;
    }

    fn is_idle(&self) -> bool {
        self.current().is_none()
    }

    fn status(&self) -> SlotStatus {
        SlotStatus {
            id: self.id.clone(),
            current_job: *self.current(),
        }
    }
}

fn build_slots(ids: Vec<String>) -> (Arc<[Arc<Slot>]>, Vec<Receiver<JobAssignment>>) {
    let mut slots = Vec::with_capacity(ids.len());
    let mut receivers = Vec::with_capacity(ids.len());
    for id in ids {
        let (inbox, rx) = bounded(1);
        slots.push(Arc::new(Slot {
            id,
            current: Mutex::new(None),
            inbox,
        }));
        receivers.push(rx);
    }
    (slots.into(), receivers)
}

/// Entry point for jobs pushed by the coordinator.
#[derive(Clone)]
pub struct JobInbox {
    worker_id: String,
    slots: Arc<[Arc<Slot>]>,
}

impl JobInbox {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Hands a job to its slot, or to the first idle one when the
    /// assignment names none.
    pub fn offer(&self, assignment: JobAssignment) -> Result<(), InboxError> {
        let slot = match assignment.worker_id.as_deref() {
            Some(id) => self
                .slots
                .iter()
                .find(|slot| slot.id == id)
                .ok_or_else(|| InboxError::UnknownSlot(id.to_string()))?,
            None => self
                .slots
                .iter()
                .find(|slot| slot.is_idle())
                .ok_or(InboxError::Busy)?,
        };

        if !slot.try_claim(assignment.job_id) {
            return Err(InboxError::Busy);
        }
        match slot.inbox.try_send(assignment) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                slot.release();
                Err(InboxError::Busy)
            }
            Err(TrySendError::Disconnected(_)) => {
                slot.release();
                Err(InboxError::Closed)
            }
        }
    }

    pub fn slots(&self) -> Vec<SlotStatus> {
        self.slots.iter().map(|slot| slot.status()).collect()
    }
}

/// Everything a slot thread needs.
#[derive(Clone)]
struct SlotContext {
    api: Arc<dyn CoordinatorApi>,
    processor: Arc<JobProcessor>,
    stop_rx: Receiver<()>,
}

impl SlotContext {
    fn execute(&self, slot: &Slot, assignment: JobAssignment) {
        info!(job_id = %assignment.job_id, slot = %slot.id, pattern = %assignment.pattern, "Processing job");
        let report = self.processor.process(&slot.id, &assignment);

        for attempt in 1..=COMPLETE_ATTEMPTS {
            match self.api.complete(&report) {
                Ok(()) => break,
                Err(e) if attempt < COMPLETE_ATTEMPTS => {
                    warn!(job_id = %report.job_id, attempt, error = %e, "Failed to report completion, retrying");
                    thread::sleep(Duration::from_secs(1));
                }
                Err(e) => {
                    error!(job_id = %report.job_id, error = %e, "Giving up on completion report")
                }
            }
        }
        slot.release();
    }

    /// Waits for `delay` unless stopped first. Returns false once stopped.
    fn pause(&self, delay: Duration) -> bool {
        select! {
            recv(self.stop_rx) -> _ => false,
            recv(after(delay)) -> _ => true,
        }
    }

    fn run_pull(&self, slot: &Slot, poll_interval: Duration) {
        loop {
            if slot.is_idle() {
                match self.api.poll(&slot.id) {
                    Ok(Some(assignment)) => {
                        slot.try_claim(assignment.job_id);
                        self.execute(slot, assignment);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(slot = %slot.id, error = %e, "Poll failed"),
                }
            }
            if !self.pause(poll_interval) {
                break;
            }
        }
    }

    fn run_push(&self, slot: &Slot, jobs: Receiver<JobAssignment>) {
        loop {
            let next = select! {
                recv(jobs) -> job => job.ok(),
                recv(self.stop_rx) -> _ => None,
            };
            let Some(assignment) = next else {
                break;
            };
            self.execute(slot, assignment);
        }
    }

    fn register_until_ok(&self, slot_id: &str, url: &str, retry: Duration) -> bool {
        loop {
            match self.api.register(slot_id, url) {
                Ok(()) => {
                    info!(slot = %slot_id, %url, "Registered with coordinator");
                    return true;
                }
                Err(e) => warn!(slot = %slot_id, error = %e, "Failed to register with coordinator"),
            }
            if !self.pause(retry) {
                return false;
            }
        }
    }

    fn run_heartbeat(&self, slots: &[Arc<Slot>], settings: &PoolSettings) {
        if let DispatchMode::Push { callback_url } = &settings.mode {
            for slot in slots {
                if !self.register_until_ok(&slot.id, callback_url, settings.register_retry) {
                    return;
                }
            }
        }

        let ticker = tick(settings.heartbeat_interval);
        loop {
            let running = select! {
                recv(ticker) -> _ => true,
                recv(self.stop_rx) -> _ => false,
            };
            if !running {
                break;
            }

            for slot in slots {
                match self.api.heartbeat(&slot.id) {
                    Ok(true) => {}
                    Ok(false) => match &settings.mode {
                        DispatchMode::Push { callback_url } => {
                            warn!(slot = %slot.id, "Coordinator no longer knows this slot, re-registering");
                            if let Err(e) = self.api.register(&slot.id, callback_url) {
                                warn!(slot = %slot.id, error = %e, "Re-registration failed");
                            }
                        }
                        // The next poll registers the slot again.
                        DispatchMode::Pull => debug!(slot = %slot.id, "Coordinator no longer knows this slot"),
                    },
                    Err(e) => warn!(slot = %slot.id, error = %e, "Heartbeat failed"),
                }
            }
        }
    }
}

/// Running slots plus their heartbeat thread.
pub struct WorkerPool {
    settings: PoolSettings,
    api: Arc<dyn CoordinatorApi>,
    slots: Arc<[Arc<Slot>]>,
    stop_tx: Option<Sender<()>>,
    handles: Option<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts one thread per slot and a heartbeat thread.
    pub fn start(
        settings: PoolSettings,
        api: Arc<dyn CoordinatorApi>,
        processor: Arc<JobProcessor>,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (slots, receivers) = build_slots(settings.slot_ids());
        let context = SlotContext {
            api: api.clone(),
            processor,
            stop_rx,
        };

        let mut pool = Self {
            settings,
            api,
            slots: slots.clone(),
            stop_tx: Some(stop_tx),
            handles: Some(Vec::with_capacity(slots.len() + 1)),
        };

        for (slot, jobs) in slots.iter().cloned().zip(receivers) {
            let context = context.clone();
            let mode = pool.settings.mode.clone();
            let poll_interval = pool.settings.poll_interval;
            let handle = thread::Builder::new()
                .name(format!("slot-{}", slot.id))
                .spawn(move || match mode {
                    DispatchMode::Pull => context.run_pull(&slot, poll_interval),
                    DispatchMode::Push { .. } => context.run_push(&slot, jobs),
                })?;
            pool.track(handle);
        }

        let settings = pool.settings.clone();
        let handle = thread::Builder::new()
            .name("heartbeat".into())
            .spawn(move || context.run_heartbeat(&slots, &settings))?;
        pool.track(handle);

        info!(
            worker_id = %pool.settings.worker_id,
            slots = pool.slots.len(),
            mode = ?pool.settings.mode,
            "Worker pool started"
        );
        Ok(pool)
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        if let Some(handles) = self.handles.as_mut() {
            handles.push(handle);
        }
    }

    /// Receiver for pushed jobs.
    pub fn inbox(&self) -> JobInbox {
        JobInbox {
            worker_id: self.settings.worker_id.clone(),
            slots: self.slots.clone(),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn slots(&self) -> Vec<SlotStatus> {
        self.slots.iter().map(|slot| slot.status()).collect()
    }

    /// Stops polling, lets running jobs finish, then deregisters every slot.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Disconnecting the channel wakes every thread.
        drop(self.stop_tx.take());
        let Some(handles) = self.handles.take() else {
            return;
        };
        for handle in handles {
            let _ = handle.join();
        }
        for slot in self.slots.iter() {
            match self.api.deregister(&slot.id) {
                Ok(()) => info!(slot = %slot.id, "Deregistered from coordinator"),
                Err(e) => warn!(slot = %slot.id, error = %e, "Failed to deregister"),
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
