//! Session lifecycle and access control.
//!
//! The manager is the source of truth for session records: it advances the
//! state machine, keeps the event timeline, guards sessions with passwords,
//! one-time codes and attach tokens, and runs the GC sweep (see `gc.rs`).
//! It never touches processes.

use super::access::{AccessPolicy, OtpTable};
use super::gc::GcPolicy;
use super::model::{
    payload, AccessMode, AttachToken, CreatedSession, Event, EventKind, IssuedAttachToken,
    IssuedOtp, JsonMap, NewSession, Session, SessionConfigUpdate, SessionFilter, SessionLaunch,
    SessionState,
};
use super::store::{BulkTransition, SessionStore};
use chrono::{DateTime, Duration, Utc};
use ptykeep_core::{
    generate_id, generate_otp, generate_password, generate_token, hash_secret, secrets_match,
    Clock, KeepError, KeepResult,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Events returned by `list_events` when no limit is given.
pub const DEFAULT_EVENT_LIMIT: usize = 50;

/// Upper bound on events returned by `list_events`.
pub const MAX_EVENT_LIMIT: usize = 500;

/// Hash scope for attach tokens. Tokens are looked up by digest alone, so
/// they cannot be scoped to a session id like passwords are.
const ATTACH_TOKEN_SCOPE: &str = "attach-token";

/// Read-modify-write cycles tried before a contended update gives up.
const MAX_SAVE_ATTEMPTS: usize = 8;

/// Tunables for the lifecycle manager.
#[derive(Debug, Clone, Default)]
pub struct LifecycleConfig {
    pub gc: GcPolicy,
    pub access: AccessPolicy,
}

/// Owns every session record, event, attach token and outstanding OTP.
pub struct LifecycleManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    pub(super) otps: OtpTable,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .field("outstanding_otps", &self.otps.len())
            .finish()
    }
}

/// Whether a caller may move a session from `from` to `to`.
fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Running, Detached)
            | (Detached, Running)
            | (Running, Terminated)
            | (Detached, Terminated)
            | (Terminated, Archived)
    )
}

fn require(field: &str, value: &str) -> KeepResult<()> {
    if value.trim().is_empty() {
        return Err(KeepError::invalid(format!("{field} is required")));
    }
    Ok(())
}

fn denied() -> KeepError {
    KeepError::PermissionDenied("access denied".into())
}

impl LifecycleManager {
    /// Create a manager over `store`.
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, config: LifecycleConfig) -> Self {
        Self {
            store,
            clock,
            config,
            otps: OtpTable::new(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(super) fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    /// Current time at the store's millisecond resolution.
    pub(super) fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    fn load(&self, id: &str) -> KeepResult<Session> {
        self.store
            .get_session(id)?
            .ok_or_else(|| KeepError::not_found("session", id))
    }

    /// Load `id`, apply `edit` and write the record back, rerunning the
    /// whole cycle on a fresh read whenever another write landed in
    /// between. `edit` returns `false` to leave the record untouched.
    /// Yields the final record and whether it was written.
    fn modify<F>(&self, id: &str, mut edit: F) -> KeepResult<(Session, bool)>
    where
        F: FnMut(&mut Session) -> KeepResult<bool>,
    {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let mut session = self.load(id)?;
            if !edit(&mut session)? {
                return Ok((session, false));
            }
            if self.store.update_session(&session)? {
                session.revision += 1;
                return Ok((session, true));
            }
            debug!(session_id = %id, "session written concurrently, retrying");
        }
        Err(KeepError::Conflict(format!(
            "session {id} is being modified concurrently"
        )))
    }

    fn record(&self, id: &str, kind: EventKind, body: JsonMap, at: DateTime<Utc>) -> KeepResult<Event> {
        Ok(self.store.append_event(id, &kind, &body, at)?)
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Persist a new session. A guarded session without a password gets a
    /// generated one, returned in [`CreatedSession::secret`] only.
    pub fn create_session(&self, input: NewSession) -> KeepResult<CreatedSession> {
        require("owner", &input.owner)?;
        require("tool", &input.tool)?;
        let state = input.state.unwrap_or(SessionState::Running);
        if state == SessionState::Archived {
            return Err(KeepError::invalid("a session cannot be created archived"));
        }

        let now = self.now();
        let id = generate_id();
        let secret = match input.access_mode {
            AccessMode::None => None,
            _ => Some(
                input
                    .password
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| generate_password(self.config.access.password_len())),
            ),
        };
        let lifetime = self.config.gc.max_lifetime;

        let mut session = Session {
            access_secret_hash: secret.as_deref().map(|s| hash_secret(&id, s)),
            id,
            owner: input.owner,
            source: input.source,
            channel: input.channel,
            conversation_key: input.conversation_key,
            title: if input.title.is_empty() {
                input.tool.clone()
            } else {
                input.title
            },
            tool: input.tool,
            command: input.command,
            workdir: input.workdir,
            state: SessionState::Running,
            pinned: input.pinned,
            last_active_at: now,
            detached_at: None,
            terminated_at: None,
            expires_at: (lifetime > Duration::zero()).then(|| now + lifetime),
            created_at: now,
            updated_at: now,
            access_mode: input.access_mode,
            access_once_used_at: None,
            metadata: input.metadata,
            revision: 0,
        };
        if state != SessionState::Running {
            session.enter_state(state, now);
        }

        self.store.insert_session(&session)?;
        self.record(
            &session.id,
            EventKind::Created,
            payload([
                ("source", session.source.as_str().into()),
                ("tool", session.tool.clone().into()),
                ("state", session.state.as_str().into()),
                ("access_mode", session.access_mode.as_str().into()),
            ]),
            now,
        )?;
        info!(
            session_id = %session.id,
            owner = %session.owner,
            tool = %session.tool,
            access = %session.access_mode,
            "session created"
        );
        Ok(CreatedSession { session, secret })
    }

    /// Look up one session.
    pub fn get_session(&self, id: &str) -> KeepResult<Session> {
        self.load(id)
    }

    /// Sessions matching `filter`, most recently active first.
    pub fn list_sessions(&self, filter: &SessionFilter) -> KeepResult<Vec<Session>> {
        Ok(self.store.list_sessions(filter)?)
    }

    /// Remove a session together with its events and tokens.
    pub fn delete_session(&self, id: &str) -> KeepResult<()> {
        if !self.store.delete_session(id)? {
            return Err(KeepError::not_found("session", id));
        }
        self.otps.clear(id);
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Refresh activity, optionally moving to `state`.
    pub fn touch_session(&self, id: &str, state: Option<SessionState>) -> KeepResult<Session> {
        let now = self.now();
        let mut moved = None;
        let (session, _) = self.modify(id, |session| {
            if session.is_archived() {
                return Err(KeepError::Conflict(format!("session {id} is archived")));
            }
            let from = session.state;
            moved = None;
            if let Some(to) = state.filter(|s| *s != from) {
                if !transition_allowed(from, to) {
                    return Err(KeepError::Conflict(format!(
                        "session {id} cannot move from {from} to {to}"
                    )));
                }
                session.enter_state(to, now);
                moved = Some((from, to));
            }
            session.last_active_at = now;
            session.updated_at = now;
            Ok(true)
        })?;

        if let Some((from, to)) = moved {
            let kind = match to {
                SessionState::Running => EventKind::Reattached,
                SessionState::Detached => EventKind::Detached,
                SessionState::Terminated => EventKind::Terminated,
                SessionState::Archived => EventKind::Archived,
            };
            self.record(id, kind, payload([("reason", "touch".into())]), now)?;
            if to == SessionState::Terminated {
                self.otps.clear(id);
            }
            info!(session_id = %id, from = %from, to = %to, "session touched");
        }
        Ok(session)
    }

    /// Mark a running session detached. A detached session is returned
    /// unchanged.
    pub fn detach_session(&self, id: &str) -> KeepResult<Session> {
        let now = self.now();
        let (session, written) = self.modify(id, |session| match session.state {
            SessionState::Detached => Ok(false),
            SessionState::Running => {
                session.enter_state(SessionState::Detached, now);
                Ok(true)
            }
            other => Err(KeepError::Conflict(format!(
                "session {id} is {other}, cannot detach"
            ))),
        })?;
        if !written {
            return Ok(session);
        }
        self.record(
            id,
            EventKind::Detached,
            payload([("reason", "requested".into())]),
            now,
        )?;
        info!(session_id = %id, "session detached");
        Ok(session)
    }

    /// Mark a session terminated and drop its outstanding OTP. A terminated
    /// session is returned unchanged.
    pub fn terminate_session(&self, id: &str, reason: Option<&str>) -> KeepResult<Session> {
        let now = self.now();
        let (session, written) = self.modify(id, |session| match session.state {
            SessionState::Terminated => Ok(false),
            SessionState::Archived => Err(KeepError::Conflict(format!(
                "session {id} is archived, cannot terminate"
            ))),
            _ => {
                session.enter_state(SessionState::Terminated, now);
                Ok(true)
            }
        })?;
        if !written {
            return Ok(session);
        }
        let reason = reason.filter(|r| !r.is_empty()).unwrap_or("requested");
        self.otps.clear(id);
        self.record(id, EventKind::Terminated, payload([("reason", reason.into())]), now)?;
        info!(session_id = %id, reason, "session terminated");
        Ok(session)
    }

    /// Record a fresh launch: replace the non-empty launch fields and force
    /// the session back to running.
    pub fn update_session_launch(&self, id: &str, launch: SessionLaunch) -> KeepResult<Session> {
        let now = self.now();
        let mut from = SessionState::Running;
        let (session, _) = self.modify(id, |session| {
            if session.is_archived() {
                return Err(KeepError::Conflict(format!("session {id} is archived")));
            }
            for (field, value) in [
                (&mut session.tool, &launch.tool),
                (&mut session.title, &launch.title),
                (&mut session.command, &launch.command),
                (&mut session.workdir, &launch.workdir),
            ] {
                if !value.is_empty() {
                    field.clone_from(value);
                }
            }
            from = session.state;
            session.enter_state(SessionState::Running, now);
            session.last_active_at = now;
            Ok(true)
        })?;
        self.record(
            id,
            EventKind::Relaunched,
            payload([
                ("from", from.as_str().into()),
                ("tool", session.tool.clone().into()),
                ("command", session.command.clone().into()),
                ("workdir", session.workdir.clone().into()),
            ]),
            now,
        )?;
        info!(session_id = %id, from = %from, "session relaunched");
        Ok(session)
    }

    /// Edit title, pinning and placement. State is left alone.
    pub fn update_session_config(&self, id: &str, update: SessionConfigUpdate) -> KeepResult<Session> {
        if update.is_empty() {
            return self.load(id);
        }
        let mut changed = JsonMap::new();
        if let Some(title) = &update.title {
            changed.insert("title".into(), title.clone().into());
        }
        if let Some(pinned) = update.pinned {
            changed.insert("pinned".into(), pinned.into());
        }
        if let Some(channel) = &update.channel {
            changed.insert("channel".into(), channel.clone().into());
        }
        if let Some(key) = &update.conversation_key {
            changed.insert("conversation_key".into(), key.clone().into());
        }
        let now = self.now();
        let (session, _) = self.modify(id, |session| {
            if let Some(title) = &update.title {
                session.title.clone_from(title);
            }
            if let Some(pinned) = update.pinned {
                session.pinned = pinned;
            }
            if let Some(channel) = &update.channel {
                session.channel.clone_from(channel);
            }
            if let Some(key) = &update.conversation_key {
                session.conversation_key.clone_from(key);
            }
            session.updated_at = now;
            Ok(true)
        })?;
        self.record(id, EventKind::ConfigUpdated, changed, now)?;
        debug!(session_id = %id, "session config updated");
        Ok(session)
    }

    /// Merge `patch` into the metadata map. A null value removes its key.
    pub fn update_session_metadata(&self, id: &str, patch: JsonMap) -> KeepResult<Session> {
        if patch.is_empty() {
            return self.load(id);
        }
        let keys: Vec<Value> = patch.keys().cloned().map(Value::String).collect();
        let now = self.now();
        let (session, _) = self.modify(id, |session| {
            for (key, value) in &patch {
                if value.is_null() {
                    session.metadata.remove(key);
                } else {
                    session.metadata.insert(key.clone(), value.clone());
                }
            }
            session.updated_at = now;
            Ok(true)
        })?;
        self.record(
            id,
            EventKind::MetadataUpdated,
            payload([("keys", Value::Array(keys))]),
            now,
        )?;
        debug!(session_id = %id, "session metadata updated");
        Ok(session)
    }

    /// Archive every terminated session now, optionally only `owner`'s.
    pub fn archive_terminated_sessions(&self, owner: Option<&str>) -> KeepResult<usize> {
        let transition = BulkTransition::ArchiveAllTerminated {
            owner: owner.map(str::to_string),
        };
        let ids = self.store.bulk_transition(&transition, self.now())?;
        if !ids.is_empty() {
            info!(count = ids.len(), owner = owner.unwrap_or("*"), "archived terminated sessions");
        }
        Ok(ids.len())
    }

    // -----------------------------------------------------------------------
    // Access control
    // -----------------------------------------------------------------------

    /// Set the access policy. Returns the plaintext secret exactly once
    /// (`None` for [`AccessMode::None`]).
    pub fn configure_session_access(
        &self,
        id: &str,
        mode: AccessMode,
        password: Option<&str>,
    ) -> KeepResult<Option<String>> {
        let supplied = password.filter(|p| !p.is_empty());
        let secret = match mode {
            AccessMode::None => None,
            _ => Some(
                supplied
                    .map(str::to_string)
                    .unwrap_or_else(|| generate_password(self.config.access.password_len())),
            ),
        };
        let secret_hash = secret.as_deref().map(|s| hash_secret(id, s));
        let now = self.now();
        self.modify(id, |session| {
            if session.is_archived() {
                return Err(KeepError::Conflict(format!("session {id} is archived")));
            }
            session.access_mode = mode;
            session.access_secret_hash.clone_from(&secret_hash);
            session.access_once_used_at = None;
            session.updated_at = now;
            Ok(true)
        })?;
        self.otps.clear(id);
        self.record(
            id,
            EventKind::AccessUpdated,
            payload([
                ("mode", mode.as_str().into()),
                ("generated", (secret.is_some() && supplied.is_none()).into()),
            ]),
            now,
        )?;
        info!(session_id = %id, mode = %mode, "session access updated");
        Ok(secret)
    }

    /// Issue a six-digit code, replacing any outstanding one.
    pub fn generate_session_otp(&self, id: &str, ttl: Option<Duration>) -> KeepResult<IssuedOtp> {
        let session = self.load(id)?;
        if session.access_mode == AccessMode::None {
            return Err(KeepError::invalid(format!(
                "session {id} has no access policy"
            )));
        }
        if !session.is_open() {
            return Err(KeepError::Conflict(format!(
                "session {id} is {}",
                session.state
            )));
        }
        let now = self.now();
        let ttl = self.config.access.otp_ttl(ttl);
        let expires_at = now + ttl;
        let code = generate_otp();
        self.otps.issue(id, &code, expires_at);
        self.record(
            id,
            EventKind::OtpIssued,
            payload([
                ("expires_at", expires_at.to_rfc3339().into()),
                ("ttl_secs", ttl.num_seconds().into()),
            ]),
            now,
        )?;
        info!(session_id = %id, ttl_secs = ttl.num_seconds(), "otp issued");
        Ok(IssuedOtp { code, expires_at })
    }

    /// Check `password` against the session secret, then against the
    /// outstanding OTP. Every mismatch is the same `PermissionDenied`.
    pub fn verify_session_access(&self, id: &str, password: &str) -> KeepResult<Session> {
        if password.is_empty() {
            return Err(KeepError::invalid("password is required"));
        }
        let session = self.load(id)?;
        if session.is_archived() {
            return Err(denied());
        }
        let now = self.now();
        let candidate = hash_secret(id, password);
        let secret_matches = session
            .access_secret_hash
            .as_deref()
            .is_some_and(|stored| secrets_match(stored, &candidate));

        let method = match session.access_mode {
            AccessMode::Permanent if secret_matches => {
                self.store.touch_session(id, now)?;
                Some("password")
            }
            AccessMode::OneTime if secret_matches => {
                if self.store.consume_one_time_secret(id, &candidate, now)? {
                    // The session is unguarded from here on.
                    self.otps.clear(id);
                    Some("one_time")
                } else {
                    None
                }
            }
            _ => None,
        };
        let method = match method {
            Some(m) => m,
            None if self.otps.redeem(id, password, now) => {
                self.store.touch_session(id, now)?;
                "otp"
            }
            None => {
                debug!(session_id = %id, "access verification failed");
                return Err(denied());
            }
        };

        self.record(
            id,
            EventKind::AccessVerified,
            payload([("method", method.into())]),
            now,
        )?;
        info!(session_id = %id, method, "session access verified");
        self.load(id)
    }

    /// Issue a single-use attach token for an open session.
    pub fn create_attach_token(
        &self,
        session_id: &str,
        owner: Option<&str>,
        ttl: Option<Duration>,
    ) -> KeepResult<IssuedAttachToken> {
        let session = self.load(session_id)?;
        if !session.is_open() {
            return Err(KeepError::Conflict(format!(
                "session {session_id} is {}",
                session.state
            )));
        }
        let now = self.now();
        let expires_at = now + self.config.access.token_ttl(ttl);
        let token = generate_token();
        let owner = owner.filter(|o| !o.is_empty()).map(str::to_string);
        self.store.insert_attach_token(&AttachToken {
            token_hash: hash_secret(ATTACH_TOKEN_SCOPE, &token),
            session_id: session_id.to_string(),
            owner: owner.clone(),
            expires_at,
            used_at: None,
            created_at: now,
        })?;
        self.record(
            session_id,
            EventKind::AttachTokenIssued,
            payload([
                ("expires_at", expires_at.to_rfc3339().into()),
                ("owner", owner.map(Value::String).unwrap_or(Value::Null)),
            ]),
            now,
        )?;
        info!(session_id = %session_id, "attach token issued");
        Ok(IssuedAttachToken {
            token,
            session_id: session_id.to_string(),
            expires_at,
        })
    }

    /// Redeem an attach token, returning the session it grants.
    pub fn consume_attach_token(&self, token: &str, owner: Option<&str>) -> KeepResult<Session> {
        if token.is_empty() {
            return Err(KeepError::invalid("token is required"));
        }
        let token_hash = hash_secret(ATTACH_TOKEN_SCOPE, token);
        let record = self
            .store
            .get_attach_token(&token_hash)?
            .ok_or_else(|| KeepError::NotFound("attach token".into()))?;
        let now = self.now();

        if record.used_at.is_some() {
            return Err(KeepError::PermissionDenied("attach token already used".into()));
        }
        if record.expires_at <= now {
            return Err(KeepError::Expired("attach token".into()));
        }
        if let Some(bound) = record.owner.as_deref() {
            if owner != Some(bound) {
                return Err(KeepError::PermissionDenied("attach token owner mismatch".into()));
            }
        }
        let session = self.load(&record.session_id)?;
        if session.is_archived() {
            return Err(KeepError::Conflict(format!(
                "session {} is archived",
                session.id
            )));
        }
        if !self.store.mark_attach_token_used(&token_hash, now)? {
            return Err(KeepError::PermissionDenied("attach token already used".into()));
        }
        self.store.touch_session(&session.id, now)?;
        self.record(
            &session.id,
            EventKind::AttachTokenConsumed,
            payload([(
                "owner",
                owner.map(|o| Value::String(o.into())).unwrap_or(Value::Null),
            )]),
            now,
        )?;
        info!(session_id = %session.id, "attach token consumed");
        self.load(&session.id)
    }

    /// Whether `id` has an unexpired one-time code outstanding.
    pub fn has_outstanding_otp(&self, id: &str) -> bool {
        self.otps.prune(self.now());
        self.otps.contains(id)
    }

    // -----------------------------------------------------------------------
    // Timeline
    // -----------------------------------------------------------------------

    /// Record an event on the session's timeline.
    pub fn append_event(&self, id: &str, kind: EventKind, body: JsonMap) -> KeepResult<Event> {
        self.load(id)?;
        self.record(id, kind, body, self.now())
    }

    /// Most recent events first; `None` or 0 means [`DEFAULT_EVENT_LIMIT`],
    /// anything above [`MAX_EVENT_LIMIT`] is capped.
    pub fn list_events(&self, id: &str, limit: Option<usize>) -> KeepResult<Vec<Event>> {
        self.load(id)?;
        let limit = match limit {
            Some(n) if n > 0 => n.min(MAX_EVENT_LIMIT),
            _ => DEFAULT_EVENT_LIMIT,
        };
        Ok(self.store.list_events(id, limit)?)
    }
}
