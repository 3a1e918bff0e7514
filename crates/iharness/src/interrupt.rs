//! Interrupting a command once a file it writes reaches a given size.
//!
//! Used to exercise partial-transfer handling: start a transfer, wait until
//! the destination has grown past a threshold, then stop the transfer.

use crate::executor::{self, CommandEnv, CommandHandle, CommandSpec, ExecError, ProcessState};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long to wait for output still in flight once a command has been
/// stopped at the deadline.
const STOPPED_OUTPUT_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct InterruptConfig {
    /// Size at which the command is interrupted.
    pub threshold_bytes: u64,
    /// Deadline for the file to reach the threshold, measured from spawn.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Time allowed between terminate and kill.
    pub terminate_grace: Duration,
}

impl InterruptConfig {
    pub fn new(threshold_bytes: u64) -> Self {
        Self {
            threshold_bytes,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            terminate_grace: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }
}

/// What was observed when an interrupt did not happen.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub watched_path: PathBuf,
    pub observed_size: Option<u64>,
    /// `name size` entries of the watched file's directory.
    pub directory_listing: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Long listing of the current collection, taken after the failure.
    pub collection_listing: Option<String>,
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "watched file: {}", self.watched_path.display())?;
        match self.observed_size {
            Some(size) => writeln!(f, "last observed size: {size}")?,
            None => writeln!(f, "file never appeared")?,
        }
        writeln!(f, "directory listing:")?;
        for entry in &self.directory_listing {
            writeln!(f, "    {entry}")?;
        }
        writeln!(f, "stdout:\n{}", self.stdout)?;
        write!(f, "stderr:\n{}", self.stderr)?;
        if let Some(listing) = &self.collection_listing {
            write!(f, "\n--- collection listing (ils -l) ---\n{listing}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum InterruptOutcome {
    /// The file reached the threshold while the command ran, and the command
    /// was stopped.
    Interrupted {
        elapsed: Duration,
        observed_size: u64,
        final_state: ProcessState,
    },
    /// The deadline passed before the file reached the threshold.
    TimedOut {
        elapsed: Duration,
        diagnostics: Diagnostics,
    },
    /// The command ended before it could be interrupted.
    ExitedEarly {
        state: ProcessState,
        diagnostics: Diagnostics,
    },
}

impl InterruptOutcome {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Diagnostics of a failed interrupt, if any.
    pub fn diagnostics_mut(&mut self) -> Option<&mut Diagnostics> {
        match self {
            Self::Interrupted { .. } => None,
            Self::TimedOut { diagnostics, .. } | Self::ExitedEarly { diagnostics, .. } => {
                Some(diagnostics)
            }
        }
    }

    /// Panic with the collected diagnostics unless the command was interrupted.
    pub fn assert_interrupted(&self) -> Duration {
        match self {
            Self::Interrupted { elapsed, .. } => *elapsed,
            Self::TimedOut {
                elapsed,
                diagnostics,
            } => panic!(
                "file did not reach the interrupt threshold within {:.3}s\n{diagnostics}",
                elapsed.as_secs_f64()
            ),
            Self::ExitedEarly { state, diagnostics } => {
                panic!("command ended ({state:?}) before it could be interrupted\n{diagnostics}")
            }
        }
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|meta| meta.len())
}

fn list_directory(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![format!("<cannot read {}>", dir.display())];
    };
    let mut listing: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            format!("{} {size}", entry.file_name().to_string_lossy())
        })
        .collect();
    listing.sort();
    listing
}

async fn collect_diagnostics(
    handle: &mut CommandHandle,
    watched: &Path,
    output_wait: Duration,
) -> Diagnostics {
    let (stdout, stderr) = handle.collect_remaining_within(output_wait).await;
    Diagnostics {
        watched_path: watched.to_path_buf(),
        observed_size: file_size(watched),
        directory_listing: watched.parent().map(list_directory).unwrap_or_default(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        collection_listing: None,
    }
}

/// Run `command` and stop it once `watched` holds at least
/// `config.threshold_bytes` bytes.
///
/// The deadline is fixed when the command is spawned; polling never extends
/// it. A command still running at the deadline is stopped before returning.
pub async fn run_until_file_reaches_size(
    command: &CommandSpec,
    env: &CommandEnv,
    watched: &Path,
    config: &InterruptConfig,
) -> Result<InterruptOutcome, ExecError> {
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut handle = executor::spawn(command, env)?;
    debug!(
        command = %command,
        watched = %watched.display(),
        threshold = config.threshold_bytes,
        "waiting for file to grow"
    );

    loop {
        if let Some(size) = file_size(watched).filter(|size| *size >= config.threshold_bytes) {
            let state = handle.poll()?;
            if state.is_running() {
                let elapsed = started.elapsed();
                let final_state = handle.terminate(config.terminate_grace).await?;
                info!(
                    command = %command,
                    size,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "command interrupted"
                );
                return Ok(InterruptOutcome::Interrupted {
                    elapsed,
                    observed_size: size,
                    final_state,
                });
            }
            let diagnostics =
                collect_diagnostics(&mut handle, watched, executor::IO_CAPTURE_TIMEOUT).await;
            return Ok(InterruptOutcome::ExitedEarly { state, diagnostics });
        }

        let state = handle.poll()?;
        if !state.is_running() {
            warn!(command = %command, ?state, "command ended before reaching threshold");
            let diagnostics =
                collect_diagnostics(&mut handle, watched, executor::IO_CAPTURE_TIMEOUT).await;
            return Ok(InterruptOutcome::ExitedEarly { state, diagnostics });
        }

        if Instant::now() >= deadline {
            let elapsed = started.elapsed();
            warn!(
                command = %command,
                timeout_ms = config.timeout.as_millis() as u64,
                "file did not reach threshold before deadline"
            );
            handle.terminate(config.terminate_grace).await?;
            let diagnostics = collect_diagnostics(&mut handle, watched, STOPPED_OUTPUT_WAIT).await;
            return Ok(InterruptOutcome::TimedOut {
                elapsed,
                diagnostics,
            });
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}
