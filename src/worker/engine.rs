//! Runs the external search engine and waits for a match.

use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, select};
use tracing::{debug, info, warn};

use crate::coordinator::SearchOptions;
use crate::matcher::MatchPattern;

use super::scanner::{read_line_bounded, scan_line, ScanEvent};

/// Bytes of stderr kept for error reports.
const STDERR_TAIL: usize = 4096;

/// Lines buffered between the reader thread and the scanner.
const LINE_BUFFER: usize = 256;

/// Default `-I` (inverse multiple) argument. Lower values use less GPU memory.
pub const DEFAULT_INVERSE_MULTIPLE: u32 = 64;

/// What the engine reported for a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMatch {
    /// Offset to add to the seed private key, 64 hex digits.
    pub offset: String,
    /// Address the engine claims for `seed + offset`, 40 hex digits.
    pub reported_address: String,
    /// Funding transaction, if the engine sent one.
    pub tx_hash: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to spawn search engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Timeout after {0}s")]
    Timeout(u64),

    #[error("Search engine exited with {status} without a match. stderr: {stderr}")]
    NoMatch { status: String, stderr: String },
}

/// Something that can search for key offsets matching a template.
pub trait Search: Send + Sync {
    fn search(
        &self,
        pattern: &MatchPattern,
        seed_public_key: &str,
        options: &SearchOptions,
    ) -> Result<EngineMatch, EngineError>;
}

/// The external brute-force engine, run as a child process.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    pub path: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    /// Kill the engine on the first match instead of letting it finish.
    pub early_exit_on_match: bool,
    pub inverse_multiple: u32,
}

impl SearchEngine {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            working_dir: None,
            timeout,
            early_exit_on_match: false,
            inverse_multiple: DEFAULT_INVERSE_MULTIPLE,
        }
    }

    /// Command-line arguments for one search.
    pub fn build_args(
        &self,
        pattern: &MatchPattern,
        seed_public_key: &str,
        options: &SearchOptions,
    ) -> Vec<String> {
        let mut args = vec![
            "--matching".to_string(),
            pattern.as_str().to_string(),
            "-z".to_string(),
            seed_public_key.to_string(),
            "-I".to_string(),
            self.inverse_multiple.to_string(),
        ];

        let optional = [
            ("--contract-address", options.contract.clone()),
            ("--sender", options.sender.clone()),
            ("--rpc", options.rpc_url.clone()),
            ("--chain-id", options.chain_id.map(|id| id.to_string())),
            ("--wss", options.wss.clone()),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        }

        args
    }

    fn spawn(&self, args: &[String]) -> Result<Child, EngineError> {
        let mut command = Command::new(&self.path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command.spawn().map_err(EngineError::Spawn)
    }
}

impl Search for SearchEngine {
    fn search(
        &self,
        pattern: &MatchPattern,
        seed_public_key: &str,
        options: &SearchOptions,
    ) -> Result<EngineMatch, EngineError> {
        let args = self.build_args(pattern, seed_public_key, options);
        info!(
            engine = %self.path.display(),
            pattern = %pattern,
            difficulty = %pattern.difficulty_description(),
            "Starting search engine"
        );

        let deadline = Instant::now() + self.timeout;
        let mut child = self.spawn(&args)?;

        let (line_tx, line_rx) = bounded::<String>(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut raw = Vec::new();
                loop {
                    match read_line_bounded(&mut reader, &mut raw) {
                        Ok(0) | Err(_) => break,
                        Ok(_) if raw.is_empty() => continue,
                        Ok(_) => {
                            // Device names and the like are not always UTF-8.
                            let line = String::from_utf8_lossy(&raw).into_owned();
                            if line_tx.send(line).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        let (stderr_tx, stderr_rx) = bounded::<String>(1);
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                let _ = stderr_tx.send(read_tail(stderr));
            });
        }

        let mut found: Option<EngineMatch> = None;
        let mut timed_out = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = select! {
                recv(line_rx) -> line => line.ok(),
                recv(after(remaining)) -> _ => {
                    timed_out = true;
                    None
                }
            };
            let Some(line) = line else {
                break;
            };

            match scan_line(&line) {
                Some(ScanEvent::Match { offset, address }) if found.is_none() => {
                    info!(address = %format!("0x{}", address), "Search engine found a match");
                    found = Some(EngineMatch {
                        offset,
                        reported_address: address,
                        tx_hash: None,
                    });
                    if self.early_exit_on_match {
                        break;
                    }
                }
                Some(ScanEvent::TransactionHash(hash)) => {
                    info!(tx_hash = %hash, "Captured transaction hash");
                    if let Some(found) = found.as_mut() {
                        found.tx_hash = Some(hash);
                    }
                }
                _ => debug!(line = line.trim_end(), "engine"),
            }
        }

        // Stdout closed or we are done listening; make sure the process ends
        // by the deadline.
        let status = if timed_out || (found.is_some() && self.early_exit_on_match) {
            let _ = child.kill();
            child.wait().ok()
        } else {
            wait_until(&mut child, deadline)
        };
        // Grandchildren may hold stderr open; do not wait on them for long.
        let stderr = stderr_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap_or_default();

        match (found, status) {
            (Some(found), _) => {
                if status.is_none() || timed_out {
                    warn!("Search engine did not finish in time after the match; keeping the match");
                }
                Ok(found)
            }
            (None, _) if timed_out => Err(EngineError::Timeout(self.timeout.as_secs())),
            (None, None) => Err(EngineError::Timeout(self.timeout.as_secs())),
            (None, Some(status)) => Err(EngineError::NoMatch {
                status: status.to_string(),
                stderr,
            }),
        }
    }
}

/// Waits for the child until `deadline`, killing it if it overruns.
/// Returns `None` if the child had to be killed.
fn wait_until(child: &mut Child, deadline: Instant) -> Option<std::process::ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }
}

/// Drains a stream, keeping only the last [`STDERR_TAIL`] bytes.
fn read_tail(mut stream: impl Read) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL {
                    tail.drain(..tail.len() - STDERR_TAIL);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}
