//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal, runs `<shell> -c <command>` on its slave side and
//! hands back the pieces the supervisor's workers need: a reader for the
//! capture worker, the child for the exit worker, and a [`PtyHandle`] for
//! input, resize and signalling.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ptykeep_core::{KeepError, KeepResult};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Input, resize and kill access to a spawned PTY process.
pub struct PtyHandle {
    /// Master side, kept for resize. `None` once closed.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Input stream. `None` once closed.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

/// Everything produced by [`PtyHandle::spawn`].
pub struct SpawnedPty {
    pub handle: PtyHandle,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl PtyHandle {
    /// Spawn `shell -c command` in `workdir` on a new PTY of the given size.
    ///
    /// `env` replaces the inherited environment entirely.
    pub fn spawn(
        shell: &Path,
        command: &str,
        workdir: &Path,
        env: &BTreeMap<String, String>,
        cols: u16,
        rows: u16,
    ) -> KeepResult<SpawnedPty> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| KeepError::Internal(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-c");
        cmd.arg(command);
        cmd.cwd(workdir);
        cmd.env_clear();
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| KeepError::Internal(format!("failed to spawn command: {e}")))?;

        // Only the child keeps the slave open; EOF on the master then
        // follows the child's exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| KeepError::Internal(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| KeepError::Internal(format!("failed to take PTY writer: {e}")))?;

        let pid = child.process_id();
        info!(shell = %shell.display(), pid = ?pid, cols, rows, "PTY spawned");

        Ok(SpawnedPty {
            handle: PtyHandle {
                master: Mutex::new(Some(pair.master)),
                writer: Mutex::new(Some(writer)),
                killer: Mutex::new(child.clone_killer()),
                pid,
            },
            reader,
            child,
        })
    }

    /// Forward bytes to the process's input.
    pub fn write(&self, data: &[u8]) -> KeepResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = writer
            .as_mut()
            .ok_or_else(|| KeepError::Conflict("PTY is closed".into()))?;
        writer
            .write_all(data)
            .map_err(|e| KeepError::Internal(format!("PTY write failed: {e}")))?;
        writer
            .flush()
            .map_err(|e| KeepError::Internal(format!("PTY flush failed: {e}")))?;
        Ok(())
    }

    /// Resize the PTY window.
    pub fn resize(&self, cols: u16, rows: u16) -> KeepResult<()> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        let master = master
            .as_ref()
            .ok_or_else(|| KeepError::Conflict("PTY is closed".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| KeepError::Internal(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Hang up the process (SIGHUP on unix).
    pub fn kill(&self) -> KeepResult<()> {
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        killer
            .kill()
            .map_err(|e| KeepError::Internal(format!("kill failed: {e}")))
    }

    /// SIGKILL the child's process group, then the child itself.
    ///
    /// The child runs as a session leader, so its pid is also its group id
    /// and the group holds everything it started on the PTY.
    #[cfg(unix)]
    pub fn force_kill(&self) -> KeepResult<()> {
        let pid = self
            .pid
            .ok_or_else(|| KeepError::Internal("process id unknown".into()))?;
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| KeepError::Internal(format!("pid out of range: {pid}")))?;
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
        if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
            let err = std::io::Error::last_os_error();
            // Already reaped.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(KeepError::Internal(format!("SIGKILL failed: {err}")));
            }
        }
        debug!(pid, "sent SIGKILL");
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn force_kill(&self) -> KeepResult<()> {
        self.kill()
    }

    /// Release the master side and the input stream.
    pub fn close(&self) {
        self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.master.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle").field("pid", &self.pid).finish()
    }
}
