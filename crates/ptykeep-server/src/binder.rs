//! Sequences the lifecycle manager and the supervisor.
//!
//! The two components never share a lock. The binder orders calls between
//! them and compensates when the second step fails, so a session record is
//! never left running without a process behind it.

use crate::lifecycle::{
    AccessMode, CreatedSession, JsonMap, LifecycleManager, NewSession, Session, SessionFilter,
    SessionLaunch, SessionSource, SessionState,
};
use crate::supervisor::{shell, OutputSlice, ProcessStatus, Supervisor};
use chrono::Duration;
use ptykeep_core::{ErrorKind, KeepError, KeepResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Launch defaults used when a request leaves fields out.
#[derive(Debug, Clone, Default)]
pub struct BinderConfig {
    /// Workdir for requests without one. Falls back to home, then `/`.
    pub default_workdir: Option<PathBuf>,
    /// Tool name → command line.
    pub tools: BTreeMap<String, String>,
}

/// Everything needed to spawn a session.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub owner: String,
    pub source: SessionSource,
    pub tool: String,
    pub command: Option<String>,
    pub workdir: Option<String>,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub conversation_key: Option<String>,
    pub access_mode: AccessMode,
    pub password: Option<String>,
    pub pinned: bool,
    pub metadata: JsonMap,
}

/// A freshly spawned session. `secret` is only ever returned here.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnedSession {
    pub session: Session,
    pub secret: Option<String>,
    pub process: ProcessStatus,
}

/// A session record with its live process, if the supervisor has one.
#[derive(Debug, Clone, Serialize)]
pub struct BoundSession {
    pub session: Session,
    pub process: Option<ProcessStatus>,
}

/// What [`SessionBinder::reconcile`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Live processes killed because their record is closed or gone.
    pub killed: usize,
    /// Process entries evicted from the supervisor.
    pub evicted: usize,
    /// Running records detached because no process backs them.
    pub detached: usize,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Joins a [`LifecycleManager`] and a [`Supervisor`].
pub struct SessionBinder {
    lifecycle: Arc<LifecycleManager>,
    supervisor: Arc<Supervisor>,
    config: BinderConfig,
}

impl SessionBinder {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        supervisor: Arc<Supervisor>,
        config: BinderConfig,
    ) -> Self {
        Self {
            lifecycle,
            supervisor,
            config,
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Command line for `tool` when the caller gives none.
    pub fn default_command(&self, tool: &str) -> String {
        if let Some(command) = self.config.tools.get(tool) {
            return command.clone();
        }
        if tool == "shell" {
            return format!("exec {} -il", shell::resolve_shell().display());
        }
        tool.to_string()
    }

    /// Workdir for requests without one.
    pub fn default_workdir(&self) -> PathBuf {
        self.config
            .default_workdir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Create the record, then start its process. If the process cannot be
    /// started the record is terminated with reason `spawn_failed`.
    pub fn spawn(&self, req: SpawnRequest) -> KeepResult<SpawnedSession> {
        let command = non_empty(req.command).unwrap_or_else(|| self.default_command(&req.tool));
        let workdir = non_empty(req.workdir)
            .unwrap_or_else(|| self.default_workdir().to_string_lossy().into_owned());

        let CreatedSession { session, secret } = self.lifecycle.create_session(NewSession {
            owner: req.owner,
            source: req.source,
            channel: req.channel.unwrap_or_default(),
            conversation_key: req.conversation_key.unwrap_or_default(),
            title: req.title.unwrap_or_default(),
            tool: req.tool,
            command: command.clone(),
            workdir: workdir.clone(),
            state: None,
            pinned: req.pinned,
            access_mode: req.access_mode,
            password: req.password,
            metadata: req.metadata,
        })?;

        let process = match self.supervisor.start(&session.id, &command, Path::new(&workdir)) {
            Ok(process) => process,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "process start failed, terminating record");
                if let Err(te) = self.lifecycle.terminate_session(&session.id, Some("spawn_failed")) {
                    warn!(session_id = %session.id, error = %te, "could not terminate orphaned record");
                }
                return Err(e);
            }
        };

        info!(session_id = %session.id, command = %command, "session spawned");
        Ok(SpawnedSession {
            session,
            secret,
            process,
        })
    }

    /// Records (optionally one owner's) paired with their live processes.
    pub fn list(&self, owner: Option<&str>) -> KeepResult<Vec<BoundSession>> {
        let filter = SessionFilter {
            owner: owner.map(str::to_string),
            ..SessionFilter::default()
        };
        Ok(self
            .lifecycle
            .list_sessions(&filter)?
            .into_iter()
            .map(|session| self.bind(session))
            .collect())
    }

    /// One record with its live process.
    pub fn get(&self, id: &str) -> KeepResult<BoundSession> {
        Ok(self.bind(self.lifecycle.get_session(id)?))
    }

    fn bind(&self, session: Session) -> BoundSession {
        let process = self.supervisor.status(&session.id).ok();
        BoundSession { session, process }
    }

    /// Stop the live process for `id`, leaving the record alone. A missing
    /// or already exited process is not an error.
    pub fn stop(&self, id: &str) -> KeepResult<()> {
        match self.supervisor.kill(id) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::Conflict) => {
                debug!(session_id = %id, "no live process to kill");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the process, then mark the record terminated. The record is
    /// left untouched if the process cannot be stopped.
    pub fn terminate(&self, id: &str, reason: Option<&str>) -> KeepResult<Session> {
        self.lifecycle.get_session(id)?;
        self.stop(id)?;
        self.lifecycle.terminate_session(id, reason)
    }

    /// Poll captured output.
    pub fn output(&self, id: &str, offset: u64, limit: usize) -> KeepResult<OutputSlice> {
        let slice = self.supervisor.get_output(id, offset, limit)?;
        self.refresh(id);
        Ok(slice)
    }

    /// Send input to the process.
    pub fn write(&self, id: &str, data: &[u8]) -> KeepResult<()> {
        self.supervisor.write(id, data)?;
        self.refresh(id);
        Ok(())
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> KeepResult<()> {
        self.supervisor.resize(id, cols, rows)?;
        self.refresh(id);
        Ok(())
    }

    fn refresh(&self, id: &str) {
        if let Err(e) = self.lifecycle.touch_session(id, None) {
            debug!(session_id = %id, error = %e, "activity not recorded");
        }
    }

    /// Mark the session running again for an interactive client.
    pub fn attach(&self, id: &str) -> KeepResult<BoundSession> {
        let session = self.lifecycle.touch_session(id, Some(SessionState::Running))?;
        Ok(self.bind(session))
    }

    /// Mark the session detached. The process keeps running.
    pub fn detach(&self, id: &str) -> KeepResult<Session> {
        self.lifecycle.detach_session(id)
    }

    /// Start a fresh process for an existing record with its stored launch
    /// settings. Conflict while a process is still running.
    pub fn relaunch(&self, id: &str) -> KeepResult<BoundSession> {
        let session = self.lifecycle.get_session(id)?;
        if session.is_archived() {
            return Err(KeepError::Conflict(format!("session {id} is archived")));
        }
        if self.supervisor.is_running(id) {
            return Err(KeepError::Conflict(format!("session {id} has a live process")));
        }
        match self.supervisor.reset(id) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let command = if session.command.trim().is_empty() {
            self.default_command(&session.tool)
        } else {
            session.command.clone()
        };
        let workdir = if session.workdir.trim().is_empty() {
            self.default_workdir().to_string_lossy().into_owned()
        } else {
            session.workdir.clone()
        };
        let process = self.supervisor.start(id, &command, Path::new(&workdir))?;

        let launch = SessionLaunch {
            tool: session.tool,
            title: session.title,
            command,
            workdir,
        };
        match self.lifecycle.update_session_launch(id, launch) {
            Ok(session) => Ok(BoundSession {
                session,
                process: Some(process),
            }),
            Err(e) => {
                warn!(session_id = %id, error = %e, "relaunch not recorded, stopping process");
                let _ = self.supervisor.reset(id);
                Err(e)
            }
        }
    }

    /// Bring the supervisor and the records back in line: stop processes
    /// whose record is closed or missing, and detach running records that
    /// have no live process.
    pub fn reconcile(&self) -> KeepResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for process in self.supervisor.list() {
            let open = match self.lifecycle.get_session(&process.id) {
                Ok(session) => session.is_open(),
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => return Err(e),
            };
            if open {
                continue;
            }
            match self.supervisor.reset(&process.id) {
                Ok(()) => {
                    if process.running {
                        report.killed += 1;
                    }
                    report.evicted += 1;
                }
                Err(e) => warn!(session_id = %process.id, error = %e, "reconcile could not stop process"),
            }
        }

        let running = SessionFilter {
            state: Some(SessionState::Running),
            ..SessionFilter::default()
        };
        for session in self.lifecycle.list_sessions(&running)? {
            if self.supervisor.is_running(&session.id) {
                continue;
            }
            match self.lifecycle.detach_session(&session.id) {
                Ok(_) => report.detached += 1,
                Err(e) => debug!(session_id = %session.id, error = %e, "reconcile detach skipped"),
            }
        }

        if report != ReconcileReport::default() {
            info!(
                killed = report.killed,
                evicted = report.evicted,
                detached = report.detached,
                "reconciled sessions"
            );
        }
        Ok(report)
    }

    /// Forget processes that exited more than `max_age` ago.
    pub fn reap_exited(&self, max_age: Duration) -> usize {
        self.supervisor.cleanup(max_age)
    }
}

impl std::fmt::Debug for SessionBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBinder")
            .field("supervisor", &self.supervisor)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{EventKind, LifecycleConfig, SqliteStore};
    use crate::supervisor::SupervisorConfig;
    use ptykeep_core::{Clock, SystemClock};
    use std::time::{Duration as StdDuration, Instant};

    fn binder_with(config: BinderConfig) -> SessionBinder {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lifecycle = Arc::new(LifecycleManager::new(
            store,
            clock.clone(),
            LifecycleConfig::default(),
        ));
        let supervisor = Arc::new(Supervisor::new(SupervisorConfig::default(), clock));
        SessionBinder::new(lifecycle, supervisor, config)
    }

    fn binder() -> SessionBinder {
        binder_with(BinderConfig::default())
    }

    fn request(command: &str) -> SpawnRequest {
        SpawnRequest {
            owner: "alice".into(),
            tool: "shell".into(),
            command: Some(command.into()),
            workdir: Some(std::env::temp_dir().to_string_lossy().into_owned()),
            ..SpawnRequest::default()
        }
    }

    fn wait_for_output(binder: &SessionBinder, id: &str, needle: &str) -> String {
        let deadline = Instant::now() + StdDuration::from_secs(10);
        loop {
            let slice = binder.output(id, 0, 0).unwrap();
            let text = String::from_utf8_lossy(&slice.concat()).to_string();
            if text.contains(needle) || Instant::now() > deadline {
                return text;
            }
            std::thread::sleep(StdDuration::from_millis(50));
        }
    }

    #[test]
    fn spawn_starts_process_under_session_id() {
        let binder = binder();
        let spawned = binder.spawn(request("echo bound")).unwrap();
        let id = &spawned.session.id;
        assert_eq!(spawned.process.id, *id);
        assert_eq!(spawned.session.command, "echo bound");
        assert!(spawned.secret.is_none());

        let text = wait_for_output(&binder, id, "bound");
        assert!(text.contains("bound"), "got {text:?}");
        let status = binder
            .supervisor()
            .wait(id, StdDuration::from_secs(10))
            .unwrap();
        assert_eq!(status.exit_code, Some(0));
    }

    #[test]
    fn spawn_failure_terminates_the_record() {
        let binder = binder();
        let err = binder
            .spawn(SpawnRequest {
                workdir: Some("/definitely/not/a/dir".into()),
                ..request("true")
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let all = binder.list(Some("alice")).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session.state, SessionState::Terminated);
        assert!(all[0].process.is_none());

        let events = binder
            .lifecycle()
            .list_events(&all[0].session.id, Some(1))
            .unwrap();
        assert_eq!(events[0].kind, EventKind::Terminated);
        assert_eq!(events[0].payload["reason"], "spawn_failed");
    }

    #[test]
    fn guarded_spawn_returns_secret_once() {
        let binder = binder();
        let spawned = binder
            .spawn(SpawnRequest {
                access_mode: AccessMode::Permanent,
                ..request("sleep 30")
            })
            .unwrap();
        let secret = spawned.secret.unwrap();
        let id = spawned.session.id;
        binder.lifecycle().verify_session_access(&id, &secret).unwrap();
        binder.terminate(&id, None).unwrap();
    }

    #[test]
    fn command_and_workdir_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut tools = BTreeMap::new();
        tools.insert("py".to_string(), "python3 -q".to_string());
        let binder = binder_with(BinderConfig {
            default_workdir: Some(dir.path().to_path_buf()),
            tools,
        });

        assert_eq!(binder.default_command("py"), "python3 -q");
        assert_eq!(binder.default_command("htop"), "htop");
        let shell = binder.default_command("shell");
        assert!(shell.starts_with("exec ") && shell.ends_with(" -il"), "{shell}");

        let spawned = binder
            .spawn(SpawnRequest {
                workdir: None,
                ..request("true")
            })
            .unwrap();
        assert_eq!(spawned.session.workdir, dir.path().to_string_lossy());
    }

    #[test]
    fn terminate_kills_process_and_marks_record() {
        let binder = binder();
        let id = binder.spawn(request("sleep 30")).unwrap().session.id;
        assert!(binder.supervisor().is_running(&id));

        let session = binder.terminate(&id, Some("user")).unwrap();
        assert_eq!(session.state, SessionState::Terminated);
        assert!(!binder.supervisor().status(&id).unwrap().running);

        // Already terminated, process already gone.
        binder.terminate(&id, None).unwrap();
        assert_eq!(
            binder.terminate("missing", None).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn stop_leaves_record_alone() {
        let binder = binder();
        let id = binder.spawn(request("sleep 30")).unwrap().session.id;

        binder.stop(&id).unwrap();
        assert!(!binder.supervisor().status(&id).unwrap().running);
        assert_eq!(
            binder.lifecycle().get_session(&id).unwrap().state,
            SessionState::Running
        );

        // Nothing left to stop.
        binder.stop(&id).unwrap();
        binder.stop("missing").unwrap();
    }

    #[test]
    fn input_refreshes_activity() {
        let binder = binder();
        let spawned = binder.spawn(request("cat")).unwrap();
        let id = spawned.session.id;

        std::thread::sleep(StdDuration::from_millis(20));
        binder.write(&id, b"marco\n").unwrap();
        let text = wait_for_output(&binder, &id, "marco");
        assert!(text.contains("marco"), "got {text:?}");
        binder.resize(&id, 120, 40).unwrap();

        let session = binder.lifecycle().get_session(&id).unwrap();
        assert!(session.last_active_at > spawned.session.last_active_at);
        binder.terminate(&id, None).unwrap();
    }

    #[test]
    fn attach_and_detach() {
        let binder = binder();
        let id = binder.spawn(request("sleep 30")).unwrap().session.id;

        let detached = binder.detach(&id).unwrap();
        assert_eq!(detached.state, SessionState::Detached);
        assert!(binder.supervisor().is_running(&id));

        let attached = binder.attach(&id).unwrap();
        assert_eq!(attached.session.state, SessionState::Running);
        assert!(attached.process.unwrap().running);
        binder.terminate(&id, None).unwrap();
    }

    #[test]
    fn relaunch_requires_no_live_process() {
        let binder = binder();
        let id = binder.spawn(request("sleep 30")).unwrap().session.id;
        assert_eq!(binder.relaunch(&id).unwrap_err().kind(), ErrorKind::Conflict);

        binder.terminate(&id, None).unwrap();
        let relaunched = binder.relaunch(&id).unwrap();
        assert_eq!(relaunched.session.state, SessionState::Running);
        assert!(relaunched.process.unwrap().running);
        assert!(binder.supervisor().is_running(&id));
        binder.terminate(&id, None).unwrap();
    }

    #[test]
    fn reconcile_aligns_records_and_processes() {
        let binder = binder();

        // A record with no process behind it.
        let orphan_record = binder
            .lifecycle()
            .create_session(NewSession {
                owner: "alice".into(),
                tool: "shell".into(),
                ..NewSession::default()
            })
            .unwrap()
            .session
            .id;

        // A process whose record was closed behind the binder's back.
        let orphan_process = binder.spawn(request("sleep 30")).unwrap().session.id;
        binder
            .lifecycle()
            .terminate_session(&orphan_process, None)
            .unwrap();

        let report = binder.reconcile().unwrap();
        assert_eq!(report.killed, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.detached, 1);
        assert_eq!(
            binder.lifecycle().get_session(&orphan_record).unwrap().state,
            SessionState::Detached
        );
        assert!(binder.supervisor().status(&orphan_process).is_err());

        assert_eq!(binder.reconcile().unwrap(), ReconcileReport::default());
    }

    #[test]
    fn reap_exited_forgets_old_processes() {
        let binder = binder();
        let id = binder.spawn(request("true")).unwrap().session.id;
        binder
            .supervisor()
            .wait(&id, StdDuration::from_secs(10))
            .unwrap();
        std::thread::sleep(StdDuration::from_millis(20));
        assert_eq!(binder.reap_exited(Duration::zero()), 1);
        assert!(binder.supervisor().status(&id).is_err());
    }
}
