//! The search worker.
//!
//! - `engine`: runs the external search engine and reads its output
//! - `processor`: turns an engine match into derived keys and a report
//! - `client`: talks to the coordinator
//! - `pool`: job slots, polling, heartbeats and the push inbox

mod client;
mod engine;
mod pool;
mod processor;
mod scanner;

pub use client::{ClientError, CoordinatorApi, HttpCoordinatorClient};
pub use engine::{EngineError, EngineMatch, Search, SearchEngine, DEFAULT_INVERSE_MULTIPLE};
pub use pool::{DispatchMode, InboxError, JobInbox, PoolSettings, SlotStatus, WorkerPool};
pub use processor::{JobError, JobProcessor};
pub use scanner::{scan_line, ScanEvent, MAX_LINE_LEN};

#[cfg(test)]
pub(crate) use processor::tests as testing;
