//! `ptykeep run`: spawn a session and attach the local terminal.
//!
//! Enters raw mode and shuttles bytes between the terminal and the
//! session's PTY until the process exits, Ctrl+] is pressed, or the record
//! is closed by another command (`ptykeep terminate`, a GC sweep). Terminal
//! resize events are forwarded. The process is stopped on the way out and
//! the record terminated unless something else already closed it.

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use ptykeep_core::ErrorKind;
use ptykeep_server::lifecycle::Session;
use ptykeep_server::{SessionBinder, SpawnRequest};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::terminal as term;

/// How often captured output is polled.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(25);

/// How often the stored record is checked for a close made elsewhere.
const RECORD_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Why the attach loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    ProcessExited,
    UserExit,
    ClosedElsewhere,
}

impl Ending {
    fn reason(self) -> &'static str {
        match self {
            Ending::ProcessExited => "process_exited",
            Ending::UserExit => "user_exit",
            Ending::ClosedElsewhere => "closed_elsewhere",
        }
    }
}

/// `true` while the stored record still wants its process. A record that
/// is gone counts as closed.
fn record_is_open(binder: &SessionBinder, id: &str) -> Result<bool> {
    match binder.lifecycle().get_session(id) {
        Ok(session) => Ok(session.is_open()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Stop the process and settle the record once the attach loop ends.
///
/// The record is terminated with the ending's reason unless it was already
/// closed elsewhere, in which case only the process is stopped. `None` when
/// the record no longer exists.
fn close_out(binder: &SessionBinder, id: &str, ending: Ending) -> Result<Option<Session>> {
    if ending != Ending::ClosedElsewhere {
        match binder.terminate(id, Some(ending.reason())) {
            Ok(session) => return Ok(Some(session)),
            // Archived or removed between the last check and now.
            Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::NotFound) => {
                debug!(session_id = %id, error = %e, "record closed before terminate");
            }
            Err(e) => return Err(e.into()),
        }
    }
    binder.stop(id)?;
    match binder.lifecycle().get_session(id) {
        Ok(session) => Ok(Some(session)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// What to attach to.
pub enum Target {
    New(SpawnRequest),
    /// Relaunch a stored record.
    Existing(String),
}

pub async fn run(binder: Arc<SessionBinder>, target: Target) -> Result<()> {
    let id = match target {
        Target::New(req) => {
            let spawned = binder.spawn(req).context("failed to spawn session")?;
            if let Some(secret) = &spawned.secret {
                eprintln!("ptykeep: session secret (shown once): {secret}");
            }
            spawned.session.id
        }
        Target::Existing(id) => {
            binder
                .relaunch(&id)
                .with_context(|| format!("failed to relaunch session {id}"))?;
            id
        }
    };
    info!(session_id = %id, "attached");
    eprintln!("ptykeep: session {id}, press Ctrl+] to end it\r");

    let (cols, rows) = term::get_terminal_size();
    if let Err(e) = binder.resize(&id, cols, rows) {
        debug!(error = %e, "initial resize skipped");
    }

    let guard = term::RawModeGuard::enter()?;

    let (tx_input, mut rx_input) = mpsc::channel::<Vec<u8>>(64);
    let (tx_resize, mut rx_resize) = mpsc::channel::<(u16, u16)>(8);
    let (tx_quit, mut rx_quit) = mpsc::channel::<()>(1);
    let stop = Arc::new(AtomicBool::new(false));

    let input_stop = stop.clone();
    let input_handle = tokio::task::spawn_blocking(move || {
        while !input_stop.load(Ordering::Relaxed) {
            match event::poll(std::time::Duration::from_millis(100)) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    warn!("crossterm event error: {e}");
                    break;
                }
            }
            match event::read() {
                Ok(Event::Key(key_event)) => {
                    // Ctrl+] ends the session.
                    if key_event.modifiers.contains(KeyModifiers::CONTROL)
                        && key_event.code == KeyCode::Char(']')
                    {
                        let _ = tx_quit.blocking_send(());
                        break;
                    }
                    if let Some(bytes) = key_event_to_bytes(&key_event) {
                        if tx_input.blocking_send(bytes).is_err() {
                            break;
                        }
                    }
                }
                Ok(Event::Paste(text)) => {
                    if tx_input.blocking_send(text.into_bytes()).is_err() {
                        break;
                    }
                }
                Ok(Event::Resize(new_cols, new_rows)) => {
                    let _ = tx_resize.blocking_send((new_cols, new_rows));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("crossterm event error: {e}");
                    break;
                }
            }
        }
    });

    let mut stdout = std::io::stdout();
    let mut offset = 0u64;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut record_check = tokio::time::interval(RECORD_CHECK_INTERVAL);
    let ending = loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Poll the supervisor directly; activity is recorded on input.
                let running = binder.supervisor().is_running(&id);
                let slice = binder.supervisor().get_output(&id, offset, 0)?;
                for chunk in &slice.chunks {
                    stdout.write_all(chunk)?;
                }
                stdout.flush()?;
                offset = slice.next_offset();
                if !running {
                    break Ending::ProcessExited;
                }
            }
            _ = record_check.tick() => {
                if !record_is_open(&binder, &id)? {
                    info!(session_id = %id, "record closed elsewhere");
                    break Ending::ClosedElsewhere;
                }
            }
            Some(bytes) = rx_input.recv() => {
                if let Err(e) = binder.write(&id, &bytes) {
                    debug!(error = %e, "input dropped");
                }
            }
            Some((c, r)) = rx_resize.recv() => {
                if let Err(e) = binder.resize(&id, c, r) {
                    debug!(error = %e, "resize dropped");
                }
            }
            _ = rx_quit.recv() => {
                info!(session_id = %id, "detach requested");
                break Ending::UserExit;
            }
        }
    };

    stop.store(true, Ordering::Relaxed);
    let _ = input_handle.await;
    drop(guard);

    let Some(session) = close_out(&binder, &id, ending)? else {
        eprintln!("\r\nptykeep: session {id} was removed");
        return Ok(());
    };
    let exit = binder
        .supervisor()
        .status(&id)
        .ok()
        .and_then(|s| s.exit_code);
    match exit {
        Some(code) => eprintln!(
            "\r\nptykeep: session {} {} (exit code {code})",
            session.id, session.state
        ),
        None => eprintln!("\r\nptykeep: session {} {}", session.id, session.state),
    }
    Ok(())
}

/// Convert a crossterm key event to raw bytes suitable for a PTY.
fn key_event_to_bytes(event: &KeyEvent) -> Option<Vec<u8>> {
    let bytes = match event.code {
        KeyCode::Char(c) => {
            if event.modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_alphabetic() {
                // Ctrl+A = 0x01 ... Ctrl+Z = 0x1a
                return Some(vec![(c.to_ascii_lowercase() as u8) - b'a' + 1]);
            }
            let mut buf = [0u8; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        }
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::F(n) => {
            let seq: &[u8] = match n {
                1 => b"\x1bOP",
                2 => b"\x1bOQ",
                3 => b"\x1bOR",
                4 => b"\x1bOS",
                5 => b"\x1b[15~",
                6 => b"\x1b[17~",
                7 => b"\x1b[18~",
                8 => b"\x1b[19~",
                9 => b"\x1b[20~",
                10 => b"\x1b[21~",
                11 => b"\x1b[23~",
                12 => b"\x1b[24~",
                _ => return None,
            };
            seq.to_vec()
        }
        _ => return None,
    };
    if event.modifiers.contains(KeyModifiers::ALT) {
        let mut prefixed = vec![0x1b];
        prefixed.extend(bytes);
        return Some(prefixed);
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptykeep_server::lifecycle::SessionState;
    use ptykeep_server::{KeepConfig, Overrides};
    use std::time::{Duration, Instant};

    fn binder() -> SessionBinder {
        KeepConfig::resolve(
            Default::default(),
            &Overrides {
                store_path: Some(":memory:".into()),
                workdir: Some(std::env::temp_dir().to_string_lossy().into_owned()),
                ..Overrides::default()
            },
        )
        .build()
        .unwrap()
    }

    fn spawn(binder: &SessionBinder, command: &str) -> String {
        binder
            .spawn(SpawnRequest {
                owner: "alice".into(),
                tool: "shell".into(),
                command: Some(command.into()),
                ..SpawnRequest::default()
            })
            .unwrap()
            .session
            .id
    }

    fn wait_until_stopped(binder: &SessionBinder, id: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while binder.supervisor().is_running(id) {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        true
    }

    #[test]
    fn record_terminated_elsewhere_is_noticed_and_process_stopped() {
        let binder = binder();
        let id = spawn(&binder, "sleep 30");
        assert!(record_is_open(&binder, &id).unwrap());

        // What `ptykeep terminate` does from another process.
        binder.lifecycle().terminate_session(&id, Some("user")).unwrap();
        assert!(!record_is_open(&binder, &id).unwrap());
        assert!(binder.supervisor().is_running(&id));

        let session = close_out(&binder, &id, Ending::ClosedElsewhere)
            .unwrap()
            .unwrap();
        assert_eq!(session.state, SessionState::Terminated);
        assert!(wait_until_stopped(&binder, &id));

        let events = binder.lifecycle().list_events(&id, Some(1)).unwrap();
        assert_eq!(events[0].payload["reason"], "user");
    }

    #[test]
    fn archived_record_keeps_its_state() {
        let binder = binder();
        let id = spawn(&binder, "sleep 30");
        binder.lifecycle().terminate_session(&id, None).unwrap();
        binder.lifecycle().archive_terminated_sessions(None).unwrap();
        assert!(!record_is_open(&binder, &id).unwrap());

        // Even a user exit must not fail on a record closed in the meantime.
        let session = close_out(&binder, &id, Ending::UserExit).unwrap().unwrap();
        assert_eq!(session.state, SessionState::Archived);
        assert!(wait_until_stopped(&binder, &id));
    }

    #[test]
    fn missing_record_counts_as_closed() {
        let binder = binder();
        assert!(!record_is_open(&binder, "nope").unwrap());
        assert!(close_out(&binder, "nope", Ending::ClosedElsewhere)
            .unwrap()
            .is_none());
    }

    #[test]
    fn user_exit_terminates_with_reason() {
        let binder = binder();
        let id = spawn(&binder, "sleep 30");
        let session = close_out(&binder, &id, Ending::UserExit).unwrap().unwrap();
        assert_eq!(session.state, SessionState::Terminated);
        assert!(wait_until_stopped(&binder, &id));
        let events = binder.lifecycle().list_events(&id, Some(1)).unwrap();
        assert_eq!(events[0].payload["reason"], "user_exit");
    }

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn plain_characters_are_utf8() {
        assert_eq!(
            key_event_to_bytes(&key(KeyCode::Char('a'), KeyModifiers::NONE)),
            Some(b"a".to_vec())
        );
        assert_eq!(
            key_event_to_bytes(&key(KeyCode::Char('é'), KeyModifiers::SHIFT)),
            Some("é".as_bytes().to_vec())
        );
    }

    #[test]
    fn control_letters_map_to_c0() {
        assert_eq!(
            key_event_to_bytes(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(vec![0x03])
        );
        assert_eq!(
            key_event_to_bytes(&key(KeyCode::Char('D'), KeyModifiers::CONTROL)),
            Some(vec![0x04])
        );
    }

    #[test]
    fn alt_prefixes_escape() {
        assert_eq!(
            key_event_to_bytes(&key(KeyCode::Char('b'), KeyModifiers::ALT)),
            Some(vec![0x1b, b'b'])
        );
    }

    #[test]
    fn navigation_keys() {
        assert_eq!(
            key_event_to_bytes(&key(KeyCode::Up, KeyModifiers::NONE)),
            Some(b"\x1b[A".to_vec())
        );
        assert_eq!(
            key_event_to_bytes(&key(KeyCode::F(5), KeyModifiers::NONE)),
            Some(b"\x1b[15~".to_vec())
        );
        assert_eq!(key_event_to_bytes(&key(KeyCode::F(20), KeyModifiers::NONE)), None);
        assert_eq!(
            key_event_to_bytes(&key(KeyCode::Enter, KeyModifiers::NONE)),
            Some(vec![b'\r'])
        );
    }
}
