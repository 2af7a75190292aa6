//! Process supervision
//!
//! Launches the external binaries, optionally scans their output for the
//! tunnel hostname, and relaunches them after every exit. There is no
//! terminal state: a process that keeps crashing keeps being restarted after
//! a fixed delay.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::scan::extract_last_host;

/// Delay between an exit and the next launch
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(3);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Called with each hostname found in a scanned process's output
pub type MatchHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Supervision errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {name} ({program}): {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// What to do with a child's stdout/stderr
#[derive(Clone)]
pub enum OutputMode {
    /// Discard output
    Ignore,
    /// Share the supervisor's stdout/stderr
    Inherit,
    /// Pipe both streams and scan every chunk for `pattern`
    Scan {
        pattern: Regex,
        on_match: MatchHandler,
    },
}

impl OutputMode {
    pub fn is_scan(&self) -> bool {
        matches!(self, OutputMode::Scan { .. })
    }
}

impl fmt::Debug for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Ignore => f.write_str("Ignore"),
            OutputMode::Inherit => f.write_str("Inherit"),
            OutputMode::Scan { pattern, .. } => f
                .debug_struct("Scan")
                .field("pattern", &pattern.as_str())
                .finish_non_exhaustive(),
        }
    }
}

/// A managed external process. Fixed for the whole supervised lifetime.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output: OutputMode,
}

impl ProcessDescriptor {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            output: OutputMode::Ignore,
        }
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }
}

/// Lifecycle state of one managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Scanning,
    Idle,
    Exited,
    Restarting,
}

/// Inputs that drive [`ProcessState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned,
    SpawnFailed,
    OutputAttached { scanning: bool },
    Exited,
    RestartScheduled,
    DelayElapsed,
}

impl ProcessState {
    /// Apply `event`. Events that make no sense in the current state leave
    /// it unchanged.
    pub fn on(self, event: ProcessEvent) -> ProcessState {
        use ProcessEvent as E;
        use ProcessState as S;

        match (self, event) {
            (S::Starting, E::Spawned) => S::Running,
            (S::Starting, E::SpawnFailed) => S::Exited,
            (S::Running, E::OutputAttached { scanning: true }) => S::Scanning,
            (S::Running, E::OutputAttached { scanning: false }) => S::Idle,
            (S::Running | S::Scanning | S::Idle, E::Exited) => S::Exited,
            (S::Exited, E::RestartScheduled) => S::Restarting,
            (S::Restarting, E::DelayElapsed) => S::Starting,
            (state, _) => state,
        }
    }
}

/// Lifecycle notifications, mostly useful to tests and status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Spawned {
        name: String,
        attempt: u64,
        pid: Option<u32>,
    },
    SpawnFailed {
        name: String,
        attempt: u64,
        error: String,
    },
    Matched {
        name: String,
        host: String,
    },
    Exited {
        name: String,
        attempt: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Keeps managed processes running forever
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    restart_delay: Duration,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_DELAY)
    }
}

impl ProcessSupervisor {
    pub fn new(restart_delay: Duration) -> Self {
        Self {
            restart_delay,
            events: None,
        }
    }

    /// Report lifecycle events on `tx`
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    /// Supervise `descriptor` on its own task.
    ///
    /// Aborting the returned handle kills the current child.
    pub fn spawn(&self, descriptor: ProcessDescriptor) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.supervise(descriptor).await })
    }

    /// Launch, wait, sleep, repeat. Never returns.
    pub async fn supervise(&self, descriptor: ProcessDescriptor) {
        let name = descriptor.name.as_str();
        let mut state = ProcessState::Starting;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            match self.launch(&descriptor, attempt, &mut state).await {
                Ok(status) => {
                    let (code, signal) = exit_parts(&status);
                    info!(process = %name, attempt, ?code, ?signal, "[EXIT] {} exited with {}", name, status);
                    self.emit(SupervisorEvent::Exited {
                        name: name.to_string(),
                        attempt,
                        code,
                        signal,
                    });
                }
                Err(e) => {
                    error!(process = %name, attempt, error = %e, "Process launch failed");
                    self.emit(SupervisorEvent::SpawnFailed {
                        name: name.to_string(),
                        attempt,
                        error: e.to_string(),
                    });
                }
            }

            state = transition(name, state, ProcessEvent::Exited);
            state = transition(name, state, ProcessEvent::RestartScheduled);
            info!(process = %name, delay_ms = self.restart_delay.as_millis() as u64, "[RESTART] Restarting {}...", name);

            tokio::time::sleep(self.restart_delay).await;
            state = transition(name, state, ProcessEvent::DelayElapsed);
        }
    }

    /// Run one lifetime of `descriptor` and return its exit status.
    pub async fn launch(
        &self,
        descriptor: &ProcessDescriptor,
        attempt: u64,
        state: &mut ProcessState,
    ) -> Result<ExitStatus, SupervisorError> {
        let name = descriptor.name.as_str();
        let mut child = match self.spawn_child(descriptor) {
            Ok(child) => child,
            Err(e) => {
                *state = transition(name, *state, ProcessEvent::SpawnFailed);
                return Err(e);
            }
        };

        *state = transition(name, *state, ProcessEvent::Spawned);
        let pid = child.id();
        info!(process = %name, attempt, ?pid, args = ?descriptor.args, "Process started");
        self.emit(SupervisorEvent::Spawned {
            name: name.to_string(),
            attempt,
            pid,
        });

        *state = transition(
            name,
            *state,
            ProcessEvent::OutputAttached {
                scanning: descriptor.output.is_scan(),
            },
        );

        if let OutputMode::Scan { pattern, on_match } = &descriptor.output {
            // Drain both streams before reaping so no chunk is handled after the exit
            self.scan_output(name, &mut child, pattern, on_match).await;
        }

        child.wait().await.map_err(|source| SupervisorError::Wait {
            name: name.to_string(),
            source,
        })
    }

    fn spawn_child(&self, descriptor: &ProcessDescriptor) -> Result<Child, SupervisorError> {
        let mut command = Command::new(&descriptor.program);
        command
            .args(&descriptor.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match descriptor.output {
            OutputMode::Ignore => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
            OutputMode::Inherit => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputMode::Scan { .. } => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        command.spawn().map_err(|source| SupervisorError::Spawn {
            name: descriptor.name.clone(),
            program: descriptor.program.display().to_string(),
            source,
        })
    }

    /// Scan stdout and stderr chunk by chunk until both close.
    async fn scan_output(
        &self,
        name: &str,
        child: &mut Child,
        pattern: &Regex,
        on_match: &MatchHandler,
    ) {
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut err_buf = vec![0u8; READ_BUFFER_SIZE];

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                    Ok(0) => stdout = None,
                    Ok(n) => self.handle_chunk(name, &out_buf[..n], pattern, on_match),
                    Err(e) => {
                        debug!(process = %name, error = %e, "stdout read failed");
                        stdout = None;
                    }
                },
                read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                    Ok(0) => stderr = None,
                    Ok(n) => self.handle_chunk(name, &err_buf[..n], pattern, on_match),
                    Err(e) => {
                        debug!(process = %name, error = %e, "stderr read failed");
                        stderr = None;
                    }
                },
            }
        }
    }

    fn handle_chunk(&self, name: &str, chunk: &[u8], pattern: &Regex, on_match: &MatchHandler) {
        let text = String::from_utf8_lossy(chunk);
        match extract_last_host(pattern, &text) {
            Some(Ok(host)) => {
                debug!(process = %name, host = %host, "Matched tunnel host");
                self.emit(SupervisorEvent::Matched {
                    name: name.to_string(),
                    host: host.clone(),
                });
                on_match(host);
            }
            Some(Err(e)) => {
                warn!(process = %name, error = %e, "Ignoring malformed match");
            }
            None => {}
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

fn transition(name: &str, from: ProcessState, event: ProcessEvent) -> ProcessState {
    let to = from.on(event);
    if to != from {
        debug!(process = %name, ?from, ?to, ?event, "Process state changed");
    }
    to
}

#[cfg(unix)]
fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}
