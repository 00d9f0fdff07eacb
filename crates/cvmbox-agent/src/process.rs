//! Supervision of one long-running OS subprocess
//!
//! A [`ManagedProcess`] starts a command with stdout and stderr sharing one
//! pipe, streams every output line into the tracing log, keeps the first and
//! last [`ProcessConfig::buffer_size`] bytes for error reports, and supports
//! restart plus identity-verified kill.

use crate::error::{AgentError, Result};
use std::collections::VecDeque;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Callback invoked for every output line of a supervised process
pub type LineObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Tunables for a [`ManagedProcess`]
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Bytes kept from both the start and the end of the output
    pub buffer_size: usize,
    /// Pause between `/proc/<pid>/cmdline` checks while killing
    pub kill_poll_interval: Duration,
    /// How long to wait for a signalled process before escalating to SIGKILL
    pub kill_timeout: Duration,
    /// How long to keep reading output after the process exited
    pub drain_timeout: Duration,
    /// procfs mount point
    pub proc_root: PathBuf,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            kill_poll_interval: Duration::from_millis(10),
            kill_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(1),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Identifies one generation of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    /// Incremented on every start
    pub generation: u64,
    pub pid: u32,
}

/// Keeps the first `limit` and the last `limit` bytes written to it
#[derive(Debug, Clone)]
pub struct HeadTailBuffer {
    limit: usize,
    head: Vec<u8>,
    tail: VecDeque<u8>,
    total: u64,
}

impl HeadTailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            head: Vec::with_capacity(limit),
            tail: VecDeque::with_capacity(limit),
            total: 0,
        }
    }

    /// Total bytes ever written
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes currently retained, never more than twice the limit
    pub fn retained(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn push(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;

        let room = self.limit - self.head.len();
        if room > 0 {
            let take = room.min(data.len());
            self.head.extend_from_slice(&data[..take]);
            data = &data[take..];
        }

        if data.len() >= self.limit {
            self.tail.clear();
            self.tail.extend(&data[data.len() - self.limit..]);
            return;
        }

        self.tail.extend(data);
        let excess = self.tail.len().saturating_sub(self.limit);
        self.tail.drain(..excess);
    }

    /// Prefix, an omission marker when bytes were dropped, then the suffix
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.retained() + 48);
        out.extend_from_slice(&self.head);
        let kept = 2 * self.limit as u64;
        if self.total > kept {
            out.extend_from_slice(
                format!("\n... omitting {} bytes ...\n", self.total - kept).as_bytes(),
            );
        }
        out.extend(self.tail.iter());
        out
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl io::Write for HeadTailBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Log level a daemon line was emitted at, from its `level=` field
pub fn line_level(line: &str) -> tracing::Level {
    if line.contains("level=fatal") || line.contains("level=error") {
        tracing::Level::ERROR
    } else if line.contains("level=warning") {
        tracing::Level::WARN
    } else if line.contains("level=debug") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    }
}

fn log_line(process: &str, line: &str) {
    match line_level(line) {
        tracing::Level::ERROR => tracing::error!(process, "{line}"),
        tracing::Level::WARN => tracing::warn!(process, "{line}"),
        tracing::Level::DEBUG => tracing::debug!(process, "{line}"),
        _ => tracing::info!(process, "{line}"),
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Succeeded,
    KilledByUser,
    Failed { status: String, output: String },
}

struct Generation {
    identity: ProcessIdentity,
    cancel: CancellationToken,
    user_killed: Arc<AtomicBool>,
    outcome: watch::Receiver<Option<Outcome>>,
}

struct State {
    command: String,
    args: Vec<String>,
    generation: u64,
    current: Option<Generation>,
}

/// A supervised subprocess with restart and identity-verified kill
pub struct ManagedProcess {
    name: String,
    config: ProcessConfig,
    observers: StdMutex<Vec<LineObserver>>,
    state: Mutex<State>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ManagedProcess {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_config(name, command, args, ProcessConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        config: ProcessConfig,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            observers: StdMutex::new(Vec::new()),
            state: Mutex::new(State {
                command: command.into(),
                args,
                generation: 0,
                current: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback that sees every output line of later starts
    pub fn add_line_observer(&self, observer: LineObserver) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Identity of the current generation, if started
    pub async fn identity(&self) -> Option<ProcessIdentity> {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map(|g| g.identity)
    }

    /// Launch the configured command
    pub async fn start(&self) -> Result<ProcessIdentity> {
        let mut state = self.state.lock().await;
        if let Some(current) = &state.current {
            if current.outcome.borrow().is_none() {
                return Err(AgentError::AlreadyRunning {
                    name: self.name.clone(),
                });
            }
        }
        self.spawn(&mut state)
    }

    fn spawn(&self, state: &mut State) -> Result<ProcessIdentity> {
        let (read_end, write_end) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| AgentError::io(&state.command, io::Error::from(e)))?;
        let stderr_end: OwnedFd = write_end
            .try_clone()
            .map_err(|e| AgentError::io(&state.command, e))?;

        let mut command = tokio::process::Command::new(&state.command);
        command
            .args(&state.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end))
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| AgentError::io(&state.command, e))?;
        // Closes the parent's copies of the write end so the reader sees EOF
        drop(command);

        let pid = child.id().ok_or_else(|| {
            AgentError::Internal(format!("process '{}' exited before reporting a pid", self.name))
        })?;
        let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(read_end)
            .map_err(|e| AgentError::io(&state.command, e))?;

        state.generation += 1;
        let identity = ProcessIdentity {
            generation: state.generation,
            pid,
        };
        let cancel = CancellationToken::new();
        let user_killed = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let buffer = Arc::new(StdMutex::new(HeadTailBuffer::new(self.config.buffer_size)));

        let observers = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let reader = tokio::spawn(read_output(
            self.name.clone(),
            receiver,
            Arc::clone(&buffer),
            observers,
        ));

        tokio::spawn(wait_for_exit(Waiter {
            name: self.name.clone(),
            command: state.command.clone(),
            child,
            reader,
            buffer,
            cancel: cancel.clone(),
            user_killed: Arc::clone(&user_killed),
            drain_timeout: self.config.drain_timeout,
            outcome: outcome_tx,
        }));

        tracing::info!(
            process = %self.name,
            command = %state.command,
            pid,
            generation = identity.generation,
            "Started process"
        );

        state.current = Some(Generation {
            identity,
            cancel,
            user_killed,
            outcome: outcome_rx,
        });
        Ok(identity)
    }

    async fn generation(
        &self,
        identity: ProcessIdentity,
    ) -> Result<(watch::Receiver<Option<Outcome>>, CancellationToken, Arc<AtomicBool>, String)> {
        let state = self.state.lock().await;
        let current = state.current.as_ref().ok_or_else(|| AgentError::NotStarted {
            name: self.name.clone(),
        })?;
        if current.identity != identity {
            return Err(AgentError::StaleProcess {
                name: self.name.clone(),
                stale: identity.generation,
                current: current.identity.generation,
            });
        }
        Ok((
            current.outcome.clone(),
            current.cancel.clone(),
            Arc::clone(&current.user_killed),
            state.command.clone(),
        ))
    }

    /// Block until the process identified by `identity` exits
    pub async fn wait(&self, identity: ProcessIdentity) -> Result<()> {
        let (outcome, _, _, command) = self.generation(identity).await?;
        self.outcome(outcome, &command).await
    }

    async fn outcome(
        &self,
        mut outcome: watch::Receiver<Option<Outcome>>,
        command: &str,
    ) -> Result<()> {
        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map(|o| o.clone())
            .map_err(|_| {
                AgentError::Internal(format!("process '{}' lost its exit status", self.name))
            })?;

        match result {
            Some(Outcome::Succeeded) => Ok(()),
            Some(Outcome::KilledByUser) => Err(AgentError::KilledByUser),
            Some(Outcome::Failed { status, output }) => Err(AgentError::ProcessFailed {
                command: command.to_string(),
                status,
                output,
            }),
            None => Err(AgentError::Internal(format!(
                "process '{}' has no exit status",
                self.name
            ))),
        }
    }

    /// Terminate the process and wait until the kernel no longer runs it
    pub async fn kill_and_wait(&self, identity: ProcessIdentity) -> Result<()> {
        let (outcome, cancel, user_killed, command) = self.generation(identity).await?;

        if outcome.borrow().is_some() {
            return Ok(());
        }

        if user_killed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!(process = %self.name, pid = identity.pid, "Killing process");
            let pid = nix::unistd::Pid::from_raw(identity.pid as i32);
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                tracing::debug!(process = %self.name, error = %e, "SIGTERM failed");
            }

            let exited = tokio::time::timeout(
                self.config.kill_timeout,
                self.poll_until_gone(identity.pid, &command),
            )
            .await
            .is_ok();
            if !exited {
                tracing::warn!(
                    process = %self.name,
                    pid = identity.pid,
                    timeout = ?self.config.kill_timeout,
                    "Process ignored SIGTERM, sending SIGKILL"
                );
            }
            cancel.cancel();
            self.poll_until_gone(identity.pid, &command).await;
        }

        match self.outcome(outcome, &command).await {
            Err(AgentError::Internal(reason)) => Err(AgentError::Internal(reason)),
            // Exited on its own while being signalled
            Err(AgentError::ProcessFailed { status, .. }) => {
                tracing::debug!(process = %self.name, %status, "Process exited before kill");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn poll_until_gone(&self, pid: u32, command: &str) {
        let cmdline = self.config.proc_root.join(pid.to_string()).join("cmdline");
        loop {
            if !cmdline_names(&cmdline, command).await {
                return;
            }
            tokio::time::sleep(self.config.kill_poll_interval).await;
        }
    }

    /// Kill the current generation, then start `command` as the next one under the same name
    pub async fn restart(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Result<ProcessIdentity> {
        if let Some(identity) = self.identity().await {
            self.kill_and_wait(identity).await?;
        }

        let mut state = self.state.lock().await;
        state.command = command.into();
        state.args = args;
        tracing::info!(process = %self.name, command = %state.command, "Restarting process");
        self.spawn(&mut state)
    }
}

/// Whether `/proc/<pid>/cmdline` still names `command`
async fn cmdline_names(cmdline: &Path, command: &str) -> bool {
    let Ok(raw) = tokio::fs::read(cmdline).await else {
        return false;
    };
    let argv0 = raw.split(|b| *b == 0).next().unwrap_or_default();
    let argv0 = String::from_utf8_lossy(argv0);
    let expected = Path::new(command).file_name();
    !argv0.is_empty() && Path::new(argv0.as_ref()).file_name() == expected
}

async fn read_output(
    name: String,
    receiver: tokio::net::unix::pipe::Receiver,
    buffer: Arc<StdMutex<HeadTailBuffer>>,
    observers: Vec<LineObserver>,
) {
    let mut reader = BufReader::new(receiver);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                buffer.lock().unwrap_or_else(|e| e.into_inner()).push(&raw);
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\n', '\r']);
                log_line(&name, line);
                for observer in &observers {
                    observer(line);
                }
            }
            Err(e) => {
                tracing::warn!(process = %name, error = %e, "Error reading process output");
                break;
            }
        }
    }
}

struct Waiter {
    name: String,
    command: String,
    child: tokio::process::Child,
    reader: tokio::task::JoinHandle<()>,
    buffer: Arc<StdMutex<HeadTailBuffer>>,
    cancel: CancellationToken,
    user_killed: Arc<AtomicBool>,
    drain_timeout: Duration,
    outcome: watch::Sender<Option<Outcome>>,
}

async fn wait_for_exit(mut waiter: Waiter) {
    let status = tokio::select! {
        status = waiter.child.wait() => status,
        _ = waiter.cancel.cancelled() => {
            if let Err(e) = waiter.child.start_kill() {
                tracing::debug!(process = %waiter.name, error = %e, "SIGKILL failed");
            }
            waiter.child.wait().await
        }
    };

    // Children of the process may keep the pipe open
    if tokio::time::timeout(waiter.drain_timeout, &mut waiter.reader)
        .await
        .is_err()
    {
        waiter.reader.abort();
    }

    let output = waiter
        .buffer
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .to_string_lossy();

    let outcome = if waiter.user_killed.load(Ordering::SeqCst) {
        Outcome::KilledByUser
    } else {
        match status {
            Ok(status) if status.success() => Outcome::Succeeded,
            Ok(status) => Outcome::Failed {
                status: status.to_string(),
                output,
            },
            Err(e) => Outcome::Failed {
                status: format!("wait failed: {e}"),
                output,
            },
        }
    };

    match &outcome {
        Outcome::Failed { status, .. } => tracing::warn!(
            process = %waiter.name,
            command = %waiter.command,
            %status,
            "Process exited"
        ),
        _ => tracing::info!(process = %waiter.name, outcome = ?outcome, "Process exited"),
    }

    waiter.cancel.cancel();
    let _ = waiter.outcome.send(Some(outcome));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_buffer_keeps_everything_below_twice_limit() {
        let mut buffer = HeadTailBuffer::new(4);
        buffer.write_all(b"abcdefgh").unwrap();
        assert_eq!(buffer.contents(), b"abcdefgh");
    }

    #[test]
    fn test_buffer_marks_omitted_bytes() {
        let mut buffer = HeadTailBuffer::new(4);
        buffer.write_all(b"0123456789").unwrap();
        assert_eq!(buffer.retained(), 8);
        assert_eq!(buffer.to_string_lossy(), "0123\n... omitting 2 bytes ...\n6789");
    }

    #[test]
    fn test_buffer_is_independent_of_chunking() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let mut whole = HeadTailBuffer::new(1024);
        whole.push(&data);

        for chunk in [1, 7, 333, 1024, 4096] {
            let mut chunked = HeadTailBuffer::new(1024);
            for piece in data.chunks(chunk) {
                chunked.push(piece);
            }
            assert_eq!(chunked.contents(), whole.contents(), "chunk size {chunk}");
            assert!(chunked.retained() <= 2048);
        }

        let mut expected = data[..1024].to_vec();
        expected.extend_from_slice(b"\n... omitting 2952 bytes ...\n");
        expected.extend_from_slice(&data[data.len() - 1024..]);
        assert_eq!(whole.contents(), expected);
    }

    #[test]
    fn test_line_level() {
        assert_eq!(
            line_level("time=x level=warning msg=\"slow\""),
            tracing::Level::WARN
        );
        assert_eq!(line_level("level=fatal msg=boom"), tracing::Level::ERROR);
        assert_eq!(line_level("level=debug"), tracing::Level::DEBUG);
        assert_eq!(line_level("plain output"), tracing::Level::INFO);
    }

    #[tokio::test]
    async fn test_successful_exit() {
        let process = ManagedProcess::new("echo", "sh", sh("echo hello"));
        let identity = process.start().await.unwrap();
        process.wait(identity).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_exit_carries_combined_output() {
        let process = ManagedProcess::new("failing", "sh", sh("echo out; echo err >&2; exit 3"));
        let identity = process.start().await.unwrap();
        let err = process.wait(identity).await.unwrap_err();
        match err {
            AgentError::ProcessFailed { output, status, .. } => {
                assert!(output.contains("out"));
                assert!(output.contains("err"));
                assert!(status.contains('3'));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_observers_see_every_line() {
        let process = ManagedProcess::new("chatty", "sh", sh("echo one; echo two >&2"));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        process.add_line_observer(Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        }));

        let identity = process.start().await.unwrap();
        process.wait(identity).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_kill_and_wait_reports_killed_by_user() {
        let process = ManagedProcess::new("sleeper", "sleep", vec!["30".to_string()]);
        let identity = process.start().await.unwrap();

        process.kill_and_wait(identity).await.unwrap();

        let err = process.wait(identity).await.unwrap_err();
        assert!(matches!(err, AgentError::KilledByUser));
        let cmdline = std::fs::read(format!("/proc/{}/cmdline", identity.pid)).unwrap_or_default();
        assert!(!String::from_utf8_lossy(&cmdline).starts_with("sleep"));
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let process = ManagedProcess::new("sleeper", "sleep", vec!["30".to_string()]);
        let identity = process.start().await.unwrap();
        assert!(matches!(
            process.start().await,
            Err(AgentError::AlreadyRunning { .. })
        ));
        process.kill_and_wait(identity).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_invalidates_old_identity() {
        let process = ManagedProcess::new("daemon", "sleep", vec!["30".to_string()]);
        let first = process.start().await.unwrap();

        let second = process
            .restart("sleep", vec!["31".to_string()])
            .await
            .unwrap();
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(process.name(), "daemon");

        assert!(matches!(
            process.wait(first).await,
            Err(AgentError::StaleProcess { stale: 1, current: 2, .. })
        ));
        assert!(matches!(
            process.kill_and_wait(first).await,
            Err(AgentError::StaleProcess { .. })
        ));

        process.kill_and_wait(second).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_before_start() {
        let process = ManagedProcess::new("idle", "true", Vec::new());
        let identity = ProcessIdentity {
            generation: 1,
            pid: 1,
        };
        assert!(matches!(
            process.wait(identity).await,
            Err(AgentError::NotStarted { .. })
        ));
    }
}
