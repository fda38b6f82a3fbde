//! # vanity_cluster
//!
//! Coordinator and workers for distributed Ethereum vanity key search.
//!
//! ## Architecture
//!
//! - `coordinator`: worker registry, FIFO job queue and job lifecycle
//! - `worker`: search engine runner, job slots and the coordinator client
//! - `crypto`: seed offset arithmetic, key and address derivation
//! - `matcher`: target address to search template
//! - `server`: HTTP routes for both processes
//! - `config`: runtime configuration

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod matcher;
pub mod server;
pub mod worker;

pub use config::{Cli, Command, CoordinatorConfig, WorkerConfig};
pub use coordinator::{Coordinator, CoordinatorSettings, JobPayload, SyncOutcome};
pub use crypto::{derive_final_keys, Address, DerivedKeys, Keypair, SeedKey};
pub use matcher::{extract_pattern, MatchPattern};
pub use worker::{JobProcessor, SearchEngine, WorkerPool};
