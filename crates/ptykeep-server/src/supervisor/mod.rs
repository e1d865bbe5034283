//! Process/PTY supervisor.
//!
//! Owns every live process started for a session, keyed by the session id.
//! Each process gets two workers: a capture worker that copies raw PTY reads
//! into a bounded [`OutputBuffer`], and an exit worker that blocks on the
//! child and records its exit. The registry map has its own lock; each
//! process has independent locks for output, input and exit state, so one
//! busy session never stalls queries against another.

pub mod output;
pub mod pty;
pub mod shell;

pub use output::{OutputBuffer, OutputSlice};
pub use pty::PtyHandle;

use chrono::{DateTime, Duration, Utc};
use portable_pty::Child;
use ptykeep_core::{Clock, KeepError, KeepResult};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default number of output chunks retained per process.
pub const DEFAULT_MAX_OUTPUT_CHUNKS: usize = 2000;

/// How long the exit worker waits for the capture worker to drain.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// How long a hangup gets to end the process before SIGKILL follows.
const HANGUP_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// How long the exit must take to be recorded after SIGKILL.
const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

/// Size of a single PTY read.
const READ_CHUNK: usize = 8192;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_output_chunks: usize,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_output_chunks: DEFAULT_MAX_OUTPUT_CHUNKS,
            cols: 80,
            rows: 24,
        }
    }
}

/// Point-in-time view of a supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub id: String,
    pub command: String,
    pub workdir: PathBuf,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub exit_code: Option<i32>,
    /// Milliseconds since start (while running) or until exit.
    pub duration_ms: i64,
    /// Total chunks captured since start.
    pub output_chunks: u64,
    /// Bytes currently retained in the output buffer.
    pub output_bytes: usize,
}

impl ProcessStatus {
    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms)
    }
}

#[derive(Debug, Default)]
struct ExitState {
    exited_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
}

/// One supervised process and its bookkeeping.
struct ProcessSession {
    id: String,
    command: String,
    workdir: PathBuf,
    started_at: DateTime<Utc>,
    pty: PtyHandle,
    output: Mutex<OutputBuffer>,
    exit: Mutex<ExitState>,
    exited: Condvar,
}

impl ProcessSession {
    fn is_running(&self) -> bool {
        self.exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .exited_at
            .is_none()
    }

    fn append(&self, chunk: Vec<u8>) {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk);
    }

    fn finish(&self, at: DateTime<Utc>, code: i32) {
        {
            let mut exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
            exit.exited_at = Some(at);
            exit.exit_code = Some(code);
        }
        self.exited.notify_all();
        self.pty.close();
    }

    /// Block until the exit is recorded or `timeout` elapses.
    fn wait_exit(&self, timeout: std::time::Duration) -> bool {
        let exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
        let (exit, _) = self
            .exited
            .wait_timeout_while(exit, timeout, |state| state.exited_at.is_none())
            .unwrap_or_else(|e| e.into_inner());
        exit.exited_at.is_some()
    }

    /// Hang up the process, escalating to SIGKILL if it outlives
    /// [`HANGUP_GRACE`]. Errors if the exit is still unrecorded after that.
    fn stop(&self) -> KeepResult<()> {
        if let Err(e) = self.pty.kill() {
            debug!(session_id = %self.id, error = %e, "hangup failed");
        }
        if self.wait_exit(HANGUP_GRACE) {
            return Ok(());
        }
        warn!(session_id = %self.id, "process ignored hangup, sending SIGKILL");
        self.pty.force_kill()?;
        if self.wait_exit(KILL_GRACE) {
            return Ok(());
        }
        Err(KeepError::Internal(format!(
            "process {} still running after SIGKILL",
            self.id
        )))
    }

    fn status(&self, now: DateTime<Utc>) -> ProcessStatus {
        let (exited_at, exit_code) = {
            let exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
            (exit.exited_at, exit.exit_code)
        };
        let (output_chunks, output_bytes) = {
            let output = self.output.lock().unwrap_or_else(|e| e.into_inner());
            (output.total(), output.bytes())
        };
        let end = exited_at.unwrap_or(now);
        ProcessStatus {
            id: self.id.clone(),
            command: self.command.clone(),
            workdir: self.workdir.clone(),
            pid: self.pty.pid(),
            started_at: self.started_at,
            exited_at,
            running: exited_at.is_none(),
            exit_code,
            duration_ms: (end - self.started_at).num_milliseconds().max(0),
            output_chunks,
            output_bytes,
        }
    }
}

/// Claim on an id between the Conflict check and registration. Released
/// on drop.
struct Reservation<'a> {
    starting: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Registry of supervised PTY processes.
pub struct Supervisor {
    processes: RwLock<HashMap<String, Arc<ProcessSession>>>,
    /// Ids whose `start` is in flight.
    starting: Mutex<HashSet<String>>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            clock,
            config,
        }
    }

    fn lookup(&self, id: &str) -> KeepResult<Arc<ProcessSession>> {
        self.processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| KeepError::not_found("process", id))
    }

    fn contains(&self, id: &str) -> bool {
        self.processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    fn reserve(&self, id: &str) -> KeepResult<Reservation<'_>> {
        let mut starting = self.starting.lock().unwrap_or_else(|e| e.into_inner());
        if self.contains(id) || !starting.insert(id.to_string()) {
            return Err(KeepError::Conflict(format!("process {id} already exists")));
        }
        Ok(Reservation {
            starting: &self.starting,
            id: id.to_string(),
        })
    }

    /// Start `command` for session `id` in `workdir`.
    ///
    /// Fails with Conflict while `id` has an entry, running or exited; an
    /// exited entry must be evicted with [`reset`](Self::reset) or
    /// [`cleanup`](Self::cleanup) first.
    pub fn start(&self, id: &str, command: &str, workdir: &Path) -> KeepResult<ProcessStatus> {
        if id.trim().is_empty() {
            return Err(KeepError::invalid("process id is required"));
        }
        if command.trim().is_empty() {
            return Err(KeepError::invalid("command is required"));
        }
        if !workdir.is_dir() {
            return Err(KeepError::invalid(format!(
                "workdir is not a directory: {}",
                workdir.display()
            )));
        }
        let _reservation = self.reserve(id)?;

        let shell = shell::resolve_shell();
        let env = shell::sanitize_env(std::env::vars());
        let spawned = PtyHandle::spawn(
            &shell,
            command,
            workdir,
            &env,
            self.config.cols,
            self.config.rows,
        )?;

        let session = Arc::new(ProcessSession {
            id: id.to_string(),
            command: command.to_string(),
            workdir: workdir.to_path_buf(),
            started_at: self.clock.now(),
            pty: spawned.handle,
            output: Mutex::new(OutputBuffer::new(self.config.max_output_chunks)),
            exit: Mutex::new(ExitState::default()),
            exited: Condvar::new(),
        });

        if let Err(e) = self.launch_workers(&session, spawned.reader, spawned.child) {
            let _ = session.pty.force_kill();
            session.pty.close();
            return Err(e);
        }

        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), session.clone());

        info!(session_id = %id, shell = %shell.display(), "process started");
        Ok(session.status(self.clock.now()))
    }

    fn launch_workers(
        &self,
        session: &Arc<ProcessSession>,
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn Child + Send + Sync>,
    ) -> KeepResult<()> {
        let (drained_tx, drained_rx) = mpsc::channel::<()>();

        let capture = session.clone();
        std::thread::Builder::new()
            .name(format!("pty-read-{}", short_id(&session.id)))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => capture.append(buf[..n].to_vec()),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // EIO once the slave side is gone is the normal
                            // end of stream on Linux.
                            debug!(session_id = %capture.id, error = %e, "PTY capture stopped");
                            break;
                        }
                    }
                }
                let _ = drained_tx.send(());
            })?;

        let waiter = session.clone();
        let clock = self.clock.clone();
        std::thread::Builder::new()
            .name(format!("pty-wait-{}", short_id(&session.id)))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        warn!(session_id = %waiter.id, error = %e, "wait on child failed");
                        -1
                    }
                };
                if drained_rx.recv_timeout(DRAIN_TIMEOUT).is_err() {
                    debug!(session_id = %waiter.id, "capture worker still reading after exit");
                }
                waiter.finish(clock.now(), code);
                info!(session_id = %waiter.id, exit_code = code, "process exited");
            })?;

        Ok(())
    }

    /// Captured output from `offset`, at most `limit` chunks (0 = all).
    pub fn get_output(&self, id: &str, offset: u64, limit: usize) -> KeepResult<OutputSlice> {
        let session = self.lookup(id)?;
        let output = session.output.lock().unwrap_or_else(|e| e.into_inner());
        Ok(output.slice(offset, limit))
    }

    /// Forward input bytes to the process.
    pub fn write(&self, id: &str, data: &[u8]) -> KeepResult<()> {
        let session = self.lookup(id)?;
        if !session.is_running() {
            return Err(KeepError::Conflict(format!("process {id} is not running")));
        }
        session.pty.write(data)
    }

    /// Change the PTY window size.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> KeepResult<()> {
        if cols == 0 || rows == 0 {
            return Err(KeepError::invalid(format!(
                "terminal size must be positive, got {cols}x{rows}"
            )));
        }
        let session = self.lookup(id)?;
        if !session.is_running() {
            return Err(KeepError::Conflict(format!("process {id} is not running")));
        }
        session.pty.resize(cols, rows)
    }

    /// Stop the process and wait for its exit to be recorded, so the next
    /// status reports it not running.
    pub fn kill(&self, id: &str) -> KeepResult<()> {
        let session = self.lookup(id)?;
        if !session.is_running() {
            return Err(KeepError::Conflict(format!("process {id} already exited")));
        }
        session.stop()?;
        info!(session_id = %id, "process killed");
        Ok(())
    }

    /// Block until the process exits or `timeout` elapses, then report.
    pub fn wait(&self, id: &str, timeout: std::time::Duration) -> KeepResult<ProcessStatus> {
        let session = self.lookup(id)?;
        session.wait_exit(timeout);
        Ok(session.status(self.clock.now()))
    }

    pub fn status(&self, id: &str) -> KeepResult<ProcessStatus> {
        let session = self.lookup(id)?;
        Ok(session.status(self.clock.now()))
    }

    /// Snapshots of every tracked process, oldest first.
    pub fn list(&self) -> Vec<ProcessStatus> {
        let now = self.clock.now();
        let mut all: Vec<ProcessStatus> = self
            .processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.status(now))
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Whether `id` has a running process.
    pub fn is_running(&self, id: &str) -> bool {
        self.lookup(id).map(|s| s.is_running()).unwrap_or(false)
    }

    /// Forget processes that exited more than `max_age` ago.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now() - max_age;
        let mut processes = self.processes.write().unwrap_or_else(|e| e.into_inner());
        let before = processes.len();
        processes.retain(|_, session| {
            let exit = session.exit.lock().unwrap_or_else(|e| e.into_inner());
            !matches!(exit.exited_at, Some(at) if at < cutoff)
        });
        let removed = before - processes.len();
        if removed > 0 {
            debug!(removed, "cleaned up exited processes");
        }
        removed
    }

    /// Evict `id`, stopping its process first if it is still running. A
    /// process that cannot be stopped stays registered.
    pub fn reset(&self, id: &str) -> KeepResult<()> {
        let session = self.lookup(id)?;
        if session.is_running() {
            session.stop()?;
        }
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        info!(session_id = %id, "process reset");
        Ok(())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .processes
            .read()
            .map(|p| p.len())
            .unwrap_or_default();
        f.debug_struct("Supervisor")
            .field("processes", &count)
            .field("config", &self.config)
            .finish()
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
