//! Runtime configuration for the coordinator and worker processes.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::Rng;

use crate::coordinator::CoordinatorSettings;
use crate::crypto::{DerivationError, SeedKey};
use crate::worker::{DispatchMode, PoolSettings, SearchEngine, DEFAULT_INVERSE_MULTIPLE};

/// Distributed vanity address search cluster
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Accept webhook jobs and hand them out to workers
    Coordinator(CoordinatorConfig),
    /// Run searches for a coordinator
    Worker(WorkerConfig),
}

#[derive(Args, Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address to listen on
    #[arg(long, env = "BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// HTTP port
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Where merged results of successful jobs are POSTed
    #[arg(long, env = "DOWNSTREAM_URL")]
    pub downstream_url: Option<String>,

    /// Seconds without a heartbeat before a worker is evicted
    #[arg(long, env = "WORKER_TIMEOUT_SECONDS", default_value = "30")]
    pub worker_timeout: u64,

    /// Seconds between liveness sweeps
    #[arg(long, default_value = "10")]
    pub sweep_interval: u64,

    /// Finished jobs kept in the stats history
    #[arg(long, default_value = "100")]
    pub history_size: usize,

    /// Timeout in seconds for pushing a job to a worker
    #[arg(long, default_value = "30")]
    pub dispatch_timeout: u64,

    /// Timeout in seconds for the downstream POST
    #[arg(long, default_value = "30")]
    pub downstream_timeout: u64,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_timeout == 0 {
            return Err(ConfigError::ZeroDuration("worker-timeout"));
        }
        if self.sweep_interval == 0 {
            return Err(ConfigError::ZeroDuration("sweep-interval"));
        }
        if self.dispatch_timeout == 0 {
            return Err(ConfigError::ZeroDuration("dispatch-timeout"));
        }
        if self.history_size == 0 {
            return Err(ConfigError::EmptyHistory);
        }
        if let Some(url) = &self.downstream_url {
            check_http_url("downstream-url", url)?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            worker_timeout: Duration::from_secs(self.worker_timeout),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            history_capacity: self.history_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Poll the coordinator for jobs
    Pull,
    /// Serve an HTTP endpoint the coordinator posts jobs to
    Push,
}

/// Seed private key as given on the command line. `Debug` never shows it.
#[derive(Clone)]
pub struct SeedSecret(String);

impl SeedSecret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SeedSecret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SeedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SeedSecret(<redacted>)")
    }
}

#[derive(Args, Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator base URL
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:3000")]
    pub coordinator_url: String,

    /// Worker id (default: worker-<hostname>-<random>)
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Seed private key, 64 hex digits
    #[arg(long = "seed-private-key", env = "SEED_PRIVATE_KEY", hide_env_values = true)]
    pub seed: SeedSecret,

    /// Seed public key handed to the engine (default: derived from the seed)
    #[arg(long, env = "SEED_PUBLIC_KEY")]
    pub seed_public_key: Option<String>,

    /// Search engine binary
    #[arg(long, env = "PROFANITY_PATH", default_value = "./profanity2.x64")]
    pub engine_path: PathBuf,

    /// Working directory for the engine (it loads its kernels from there)
    #[arg(long, env = "PROFANITY_DIR")]
    pub engine_dir: Option<PathBuf>,

    /// Seconds before a search is killed
    #[arg(short, long = "timeout", env = "TIMEOUT_SECONDS", default_value = "300")]
    pub timeout_seconds: u64,

    /// Engine inverse multiple (-I)
    #[arg(long, default_value_t = DEFAULT_INVERSE_MULTIPLE)]
    pub inverse_multiple: u32,

    /// Jobs run at once; each slot registers as its own worker
    #[arg(short = 'j', long, env = "MAX_CONCURRENT_JOBS", default_value = "1")]
    pub max_concurrent_jobs: usize,

    /// Kill the engine on its first match instead of letting it exit
    #[arg(long, env = "EARLY_EXIT_ON_MATCH")]
    pub early_exit_on_match: bool,

    /// How jobs reach this worker
    #[arg(short, long, value_enum, env = "DISPATCH_MODE", default_value = "pull")]
    pub mode: ModeArg,

    /// HTTP port for push mode
    #[arg(short, long, env = "PORT", default_value = "3001")]
    pub port: u16,

    /// URL the coordinator uses to reach this worker (push mode)
    #[arg(long, env = "WORKER_URL")]
    pub callback_url: Option<String>,

    /// Milliseconds between polls while idle (pull mode)
    #[arg(long, default_value = "2000")]
    pub poll_interval_ms: u64,

    /// Seconds between heartbeats
    #[arg(long, default_value = "10")]
    pub heartbeat_interval: u64,
}

impl WorkerConfig {
    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let seed = self.seed_key()?;
        if let Some(given) = &self.seed_public_key {
            let given = normalize_public_key(given)?;
            if given != seed.engine_public_key() {
                return Err(ConfigError::SeedMismatch);
            }
        }

        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ZeroSlots);
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::ZeroDuration("timeout"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration("poll-interval-ms"));
        }
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::ZeroDuration("heartbeat-interval"));
        }
        check_http_url("coordinator-url", &self.coordinator_url)?;
        if let Some(url) = &self.callback_url {
            check_http_url("callback-url", url)?;
        }
        Ok(())
    }

    pub fn seed_key(&self) -> Result<SeedKey, ConfigError> {
        SeedKey::from_hex(self.seed.expose()).map_err(ConfigError::InvalidSeed)
    }

    /// The configured worker id, or a fresh `worker-<host>-<random>` one.
    pub fn resolved_worker_id(&self) -> String {
        match &self.worker_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => generated_worker_id(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }

    pub fn engine(&self) -> SearchEngine {
        let mut engine = SearchEngine::new(self.engine_path.clone(), Duration::from_secs(self.timeout_seconds));
        engine.working_dir = self.engine_dir.clone();
        engine.early_exit_on_match = self.early_exit_on_match;
        engine.inverse_multiple = self.inverse_multiple;
        engine
    }

    pub fn pool_settings(&self, worker_id: &str) -> PoolSettings {
        let mode = match self.mode {
            ModeArg::Pull => DispatchMode::Pull,
            ModeArg::Push => DispatchMode::Push {
                callback_url: self
                    .callback_url
                    .clone()
                    .unwrap_or_else(|| format!("http://{}:{}", hostname(), self.port)),
            },
        };
        let mut settings = PoolSettings::new(worker_id, mode);
        settings.slots = self.max_concurrent_jobs;
        settings.poll_interval = Duration::from_millis(self.poll_interval_ms);
        settings.heartbeat_interval = Duration::from_secs(self.heartbeat_interval);
        settings
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn generated_worker_id() -> String {
    let suffix: [u8; 4] = rand::thread_rng().gen();
    format!("worker-{}-{}", hostname(), hex::encode(suffix))
}

/// Lowercase 128-digit point, accepting `0x` and a leading `04`.
fn normalize_public_key(input: &str) -> Result<String, ConfigError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits = match digits.len() {
        130 if digits.starts_with("04") => &digits[2..],
        _ => digits,
    };
    if digits.len() != 128 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidPublicKey);
    }
    Ok(digits.to_ascii_lowercase())
}

fn check_http_url(name: &'static str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            name,
            url: url.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid seed private key: {0}")]
    InvalidSeed(#[source] DerivationError),

    #[error("Seed public key must be 128 hex digits (optionally prefixed with 04)")]
    InvalidPublicKey,

    #[error("Seed public key does not belong to the seed private key")]
    SeedMismatch,

    #[error("At least one concurrent job is required")]
    ZeroSlots,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("History size must be greater than zero")]
    EmptyHistory,

    #[error("{name} must be an http(s) URL, got {url:?}")]
    InvalidUrl { name: &'static str, url: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    fn worker_with_seed(seed: &str, extra: &[&str]) -> WorkerConfig {
        let mut args = vec!["vanity_cluster", "worker", "--seed-private-key", seed];
        args.extend_from_slice(extra);
        match Cli::try_parse_from(args).unwrap().command {
            Command::Worker(config) => config,
            other => panic!("expected worker config, got {:?}", other),
        }
    }

    fn worker(extra: &[&str]) -> WorkerConfig {
        worker_with_seed(SEED_ONE, extra)
    }

    fn coordinator(extra: &[&str]) -> CoordinatorConfig {
        let mut args = vec!["vanity_cluster", "coordinator"];
        args.extend_from_slice(extra);
        match Cli::try_parse_from(args).unwrap().command {
            Command::Coordinator(config) => config,
            other => panic!("expected coordinator config, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_worker_config() {
        let config = worker(&[]);
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout_seconds, 300);
        assert_eq!(config.mode, ModeArg::Pull);
        assert!(!config.early_exit_on_match);
    }

    #[test]
    fn test_invalid_seed() {
        let config = worker_with_seed("xyz", &[]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSeed(_))));
    }

    #[test]
    fn test_seed_is_redacted() {
        let config = worker(&[]);
        let printed = format!("{:?}", config);
        assert!(!printed.contains(SEED_ONE));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_seed_public_key_must_match() {
        let seed = SeedKey::from_hex(SEED_ONE).unwrap();
        let matching = format!("0x04{}", seed.engine_public_key().to_uppercase());
        assert!(worker(&["--seed-public-key", &matching]).validate().is_ok());

        let other = SeedKey::from_hex(&format!("{:064x}", 2)).unwrap();
        let config = worker(&["--seed-public-key", &other.engine_public_key()]);
        assert!(matches!(config.validate(), Err(ConfigError::SeedMismatch)));

        let config = worker(&["--seed-public-key", "04abcd"]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPublicKey)));
    }

    #[test]
    fn test_zero_slots() {
        let config = worker(&["-j", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroSlots)));
    }

    #[test]
    fn test_pool_settings() {
        let config = worker(&["-j", "2", "--mode", "push", "--callback-url", "http://w:3001"]);
        let settings = config.pool_settings("w");
        assert_eq!(settings.slot_ids(), vec!["w-0", "w-1"]);
        assert_eq!(
            settings.mode,
            DispatchMode::Push {
                callback_url: "http://w:3001".into()
            }
        );
    }

    #[test]
    fn test_generated_worker_id() {
        let id = worker(&[]).resolved_worker_id();
        assert!(id.starts_with("worker-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert_eq!(worker(&["--worker-id", "gpu-1"]).resolved_worker_id(), "gpu-1");
    }

    #[test]
    fn test_engine_settings() {
        let engine = worker(&["--early-exit-on-match", "--timeout", "60"]).engine();
        assert!(engine.early_exit_on_match);
        assert_eq!(engine.timeout, Duration::from_secs(60));
        assert_eq!(engine.inverse_multiple, DEFAULT_INVERSE_MULTIPLE);
    }

    #[test]
    fn test_coordinator_defaults() {
        let config = coordinator(&[]);
        assert!(config.validate().is_ok());
        let settings = config.settings();
        assert_eq!(settings.worker_timeout, Duration::from_secs(30));
        assert_eq!(settings.history_capacity, 100);
    }

    #[test]
    fn test_coordinator_rejects_bad_downstream() {
        let config = coordinator(&["--downstream-url", "ftp://x"]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));
        let config = coordinator(&["--history-size", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::EmptyHistory)));
    }
}
