//! Turns an assignment into a completion report.

use std::sync::Arc;

use tracing::{info, warn};

use crate::coordinator::{CompletionReport, JobAssignment, JobResult};
use crate::crypto::{DerivationError, SeedKey};
use crate::matcher::{MatchPattern, PatternError};

use super::engine::{EngineError, Search};

/// Why a job failed on the worker side.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),
}

/// Runs the search for a job and derives the final key from its result.
pub struct JobProcessor {
    search: Arc<dyn Search>,
    seed: SeedKey,
    seed_public_key: String,
}

impl JobProcessor {
    /// `seed_public_key` is what the engine is given; it defaults to the
    /// point derived from `seed`.
    pub fn new(search: Arc<dyn Search>, seed: SeedKey, seed_public_key: Option<String>) -> Self {
        let seed_public_key = seed_public_key.unwrap_or_else(|| seed.engine_public_key());
        Self {
            search,
            seed,
            seed_public_key,
        }
    }

    pub fn run(&self, assignment: &JobAssignment) -> Result<JobResult, JobError> {
        let pattern = MatchPattern::new(&assignment.pattern)?;
        let options = assignment.webhook_data.options();
        let found = self.search.search(&pattern, &self.seed_public_key, &options)?;

        let keys = self.seed.derive(&found.offset, &found.reported_address)?;
        if !pattern.matches(&keys.address).is_match() {
            warn!(
                job_id = %assignment.job_id,
                address = %keys.address.to_hex_prefixed(),
                pattern = %pattern,
                "Derived address does not fit the requested pattern"
            );
        }

        Ok(JobResult {
            derived_private_key: format!("0x{}", keys.private_key),
            derived_public_key: format!("0x{}", keys.public_key),
            derived_address: keys.address.to_hex_prefixed(),
            tx_hash: found.tx_hash,
            address_verified: Some(keys.address_verified),
        })
    }

    /// Runs a job and packages the outcome for the coordinator.
    pub fn process(&self, worker_id: &str, assignment: &JobAssignment) -> CompletionReport {
        match self.run(assignment) {
            Ok(result) => {
                info!(job_id = %assignment.job_id, address = %result.derived_address, "Job completed successfully");
                CompletionReport::succeeded(worker_id, assignment.job_id, result)
            }
            Err(e) => {
                warn!(job_id = %assignment.job_id, error = %e, "Job failed");
                CompletionReport::failed(worker_id, assignment.job_id, e.to_string())
            }
        }
    }
}
