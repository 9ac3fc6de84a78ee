//! Process management layer
//!
//! Two shapes of child process are needed:
//!
//! - a long-lived process whose lifetime is supervised ([`ChildProcessManager`],
//!   used for `cmake -E server`)
//! - one-shot commands whose output is streamed line by line into an
//!   [`OutputConsumer`] and which can be cancelled ([`run_command`])

use crate::io::process_tree;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Time a cancelled command gets to exit after SIGINT before it is killed
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(3);

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Interrupt the process tree, the process is expected to exit on its own
    Graceful,
    /// Kill immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    Stopped,
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

// ============================================================================
// Output consumers
// ============================================================================

/// Line-oriented sink for process output
pub trait OutputConsumer: Send + Sync {
    fn output(&self, line: &str);
    fn error(&self, line: &str);
}

type LineHandler = Box<dyn Fn(String) + Send + Sync>;

// ============================================================================
// Supervised process
// ============================================================================

/// Manages a long-lived child process
pub struct ChildProcessManager {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    environment: BTreeMap<String, String>,

    state: Arc<Mutex<ProcessState>>,

    stdout_handler: Option<LineHandler>,
    stderr_handler: Option<LineHandler>,
    output_tasks: Vec<JoinHandle<()>>,
    wait_task: Option<JoinHandle<()>>,

    exit_tx: watch::Sender<Option<ProcessExit>>,
}

impl ChildProcessManager {
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            command,
            args,
            working_directory: working_dir,
            environment: BTreeMap::new(),
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdout_handler: None,
            stderr_handler: None,
            output_tasks: Vec::new(),
            wait_task: None,
            exit_tx,
        }
    }

    /// Extra environment for the child, layered over the current process's
    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn on_stdout_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stdout_handler = Some(Box::new(handler));
    }

    pub fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }

    pub fn get_state(&self) -> ProcessState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(ProcessState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    /// Receiver that yields `Some(exit)` once the process has exited
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_tx.subscribe()
    }

    fn set_state(&self, new_state: ProcessState) {
        if let Ok(mut state) = self.state.lock() {
            *state = new_state;
        }
    }

    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .envs(&self.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn().map_err(|source| ProcessError::Spawn {
            program: self.command.clone(),
            source,
        })?;

        let Some(pid) = child.id() else {
            return Err(ProcessError::Io(io::Error::other("Failed to get process ID")));
        };
        info!("Process started with PID: {}", pid);
        self.set_state(ProcessState::Running { pid });

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        // Both pipes are always drained so the child never blocks on a full pipe
        self.output_tasks
            .push(spawn_line_pump(stdout, self.stdout_handler.take(), "stdout"));
        self.output_tasks
            .push(spawn_line_pump(stderr, self.stderr_handler.take(), "stderr"));

        self.spawn_wait_task(child, pid);
        Ok(())
    }

    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let state = Arc::clone(&self.state);
        let exit_tx = self.exit_tx.clone();

        self.wait_task = Some(tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => {
                    info!("Process PID {} exited with status: {}", pid, status);
                    ProcessExit {
                        code: status.code(),
                    }
                }
                Err(e) => {
                    error!("Error waiting for child process {}: {}", pid, e);
                    ProcessExit { code: None }
                }
            };
            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }
            let _ = exit_tx.send(Some(exit));
            trace!("ChildProcessManager: wait task finished for PID {}", pid);
        }));
    }

    /// Wait until the process has exited and return how it ended
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut rx = self.exit_receiver();
        rx.wait_for(|exit| exit.is_some()).await.ok().and_then(|e| *e)
    }

    pub async fn stop(&mut self, mode: StopMode) -> Result<(), ProcessError> {
        let Some(pid) = self.get_state().pid() else {
            return Err(ProcessError::NotStarted);
        };

        match mode {
            StopMode::Graceful => {
                info!("Interrupting process tree of PID {}", pid);
                process_tree::terminate_tree(pid).await;
            }
            StopMode::Force => {
                info!("Force killing process tree of PID {}", pid);
                process_tree::kill_tree(pid).await;
            }
        }
        Ok(())
    }

    /// Synchronous force kill for `Drop` implementations
    pub fn kill_sync(&mut self) {
        let Some(pid) = self.get_state().pid() else {
            return;
        };

        info!("Synchronously force killing process with PID: {}", pid);
        process_tree::kill_pid_sync(pid);

        for task in self.output_tasks.drain(..) {
            task.abort();
        }
        self.set_state(ProcessState::Stopped);
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

fn spawn_line_pump<R>(pipe: R, handler: Option<LineHandler>, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end_matches('\r').to_string();
                    match &handler {
                        Some(handler) => handler(line),
                        None => trace!("ChildProcessManager: {} drained: {}", stream, line),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read from {}: {}", stream, e);
                    break;
                }
            }
        }
        trace!("ChildProcessManager: {} monitoring finished", stream);
    })
}

// ============================================================================
// One-shot commands
// ============================================================================

/// Options for [`run_command`]
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub cwd: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
}

/// Result of a one-shot command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl CommandOutcome {
    /// Exit code as reported to callers, `-1` for abnormal termination
    pub fn retc(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.cancelled
    }
}

/// Run a command to completion, streaming each output line to `consumer`.
///
/// When `cancel` fires, the process tree gets SIGINT (descendants first),
/// then a hard kill if it is still alive after [`CANCEL_GRACE_PERIOD`].
pub async fn run_command(
    program: &str,
    args: &[String],
    options: &CommandOptions,
    consumer: Option<Arc<dyn OutputConsumer>>,
    cancel: CancellationToken,
) -> Result<CommandOutcome, ProcessError> {
    debug!("Running {} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&options.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or(ProcessError::StdoutNotAvailable)?;
    let stderr = child
        .stderr
        .take()
        .ok_or(ProcessError::StderrNotAvailable)?;

    let out_consumer = consumer.clone();
    let stdout_task = spawn_line_pump(
        stdout,
        out_consumer.map(|c| Box::new(move |line: String| c.output(&line)) as LineHandler),
        "stdout",
    );
    let stderr_task = spawn_line_pump(
        stderr,
        consumer.map(|c| Box::new(move |line: String| c.error(&line)) as LineHandler),
        "stderr",
    );

    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            cancelled = true;
            if let Some(pid) = pid {
                info!("Cancelling {} (PID {})", program, pid);
                process_tree::terminate_tree(pid).await;
            }
            match tokio::time::timeout(CANCEL_GRACE_PERIOD, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("{} did not exit after interrupt, killing", program);
                    if let Some(pid) = pid {
                        process_tree::kill_tree(pid).await;
                    }
                    child.kill().await?;
                    child.wait().await?
                }
            }
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    debug!("{} finished with {}", program, status);
    Ok(CommandOutcome {
        exit_code: status.code(),
        cancelled,
    })
}
