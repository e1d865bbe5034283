//! Durable session records, timeline events and attach tokens.

use chrono::{DateTime, Utc};
use ptykeep_core::KeepError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// JSON object used for metadata and event payloads.
pub type JsonMap = Map<String, Value>;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = KeepError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(KeepError::invalid(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Detached,
    Terminated,
    Archived,
}

string_enum!(SessionState {
    Running => "running",
    Detached => "detached",
    Terminated => "terminated",
    Archived => "archived",
});

/// Where a session was requested from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Webui,
    Channel,
    #[default]
    Agent,
}

string_enum!(SessionSource {
    Webui => "webui",
    Channel => "channel",
    Agent => "agent",
});

/// Password policy guarding a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    None,
    OneTime,
    Permanent,
}

string_enum!(AccessMode {
    None => "none",
    OneTime => "one_time",
    Permanent => "permanent",
});

/// The durable session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner: String,
    pub source: SessionSource,
    pub channel: String,
    pub conversation_key: String,
    pub tool: String,
    pub title: String,
    pub command: String,
    pub workdir: String,
    pub state: SessionState,
    /// Exempt from the detached-TTL pass (not from the lifetime cap).
    pub pinned: bool,
    pub last_active_at: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub access_mode: AccessMode,
    /// Digest of the access secret. Never serialized.
    #[serde(skip_serializing, default)]
    pub access_secret_hash: Option<String>,
    pub access_once_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: JsonMap,
    /// Bumped by every stored write to the record.
    #[serde(default)]
    pub revision: i64,
}

impl Session {
    pub fn is_archived(&self) -> bool {
        self.state == SessionState::Archived
    }

    /// Whether the session can still be attached to or relaunched.
    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Detached)
    }

    /// Move to `state` at `now`, stamping the lifecycle markers.
    ///
    /// Leaving for `running` clears the detached/terminated markers; later
    /// states keep every earlier marker set.
    pub(crate) fn enter_state(&mut self, state: SessionState, now: DateTime<Utc>) {
        match state {
            SessionState::Running => {
                self.detached_at = None;
                self.terminated_at = None;
            }
            SessionState::Detached => {
                self.detached_at = Some(now);
                self.terminated_at = None;
            }
            SessionState::Terminated => {
                self.detached_at.get_or_insert(now);
                self.terminated_at = Some(now);
            }
            SessionState::Archived => {
                self.detached_at.get_or_insert(now);
                self.terminated_at.get_or_insert(now);
            }
        }
        self.state = state;
        self.updated_at = now;
    }
}

/// Input for creating a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub owner: String,
    pub source: SessionSource,
    pub channel: String,
    pub conversation_key: String,
    pub tool: String,
    pub title: String,
    pub command: String,
    pub workdir: String,
    /// Initial state; `running` when unset.
    pub state: Option<SessionState>,
    pub pinned: bool,
    pub access_mode: AccessMode,
    /// Explicit password; one is generated when the mode needs it.
    pub password: Option<String>,
    pub metadata: JsonMap,
}

/// A freshly created session plus its plaintext secret, if any.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: Session,
    /// Shown once; only its digest is stored.
    pub secret: Option<String>,
}

/// Launch parameters replaced on relaunch/reattach.
#[derive(Debug, Clone, Default)]
pub struct SessionLaunch {
    pub tool: String,
    pub title: String,
    pub command: String,
    pub workdir: String,
}

/// Non-lifecycle fields that can be edited in place.
#[derive(Debug, Clone, Default)]
pub struct SessionConfigUpdate {
    pub title: Option<String>,
    pub pinned: Option<bool>,
    pub channel: Option<String>,
    pub conversation_key: Option<String>,
}

impl SessionConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.pinned.is_none()
            && self.channel.is_none()
            && self.conversation_key.is_none()
    }
}

/// Query filter for listing sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub owner: Option<String>,
    pub state: Option<SessionState>,
    pub source: Option<SessionSource>,
    pub channel: Option<String>,
    pub conversation_key: Option<String>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::default()
        }
    }
}

/// Kind of a timeline event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Created,
    Detached,
    Reattached,
    Relaunched,
    Terminated,
    Archived,
    AccessUpdated,
    AccessVerified,
    OtpIssued,
    AttachTokenIssued,
    AttachTokenConsumed,
    ConfigUpdated,
    MetadataUpdated,
    /// Application-defined kind recorded through `append_event`.
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Created => "created",
            EventKind::Detached => "detached",
            EventKind::Reattached => "reattached",
            EventKind::Relaunched => "relaunched",
            EventKind::Terminated => "terminated",
            EventKind::Archived => "archived",
            EventKind::AccessUpdated => "access_updated",
            EventKind::AccessVerified => "access_verified",
            EventKind::OtpIssued => "otp_issued",
            EventKind::AttachTokenIssued => "attach_token_issued",
            EventKind::AttachTokenConsumed => "attach_token_consumed",
            EventKind::ConfigUpdated => "config_updated",
            EventKind::MetadataUpdated => "metadata_updated",
            EventKind::Other(kind) => kind,
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "created" => EventKind::Created,
            "detached" => EventKind::Detached,
            "reattached" => EventKind::Reattached,
            "relaunched" => EventKind::Relaunched,
            "terminated" => EventKind::Terminated,
            "archived" => EventKind::Archived,
            "access_updated" => EventKind::AccessUpdated,
            "access_verified" => EventKind::AccessVerified,
            "otp_issued" => EventKind::OtpIssued,
            "attach_token_issued" => EventKind::AttachTokenIssued,
            "attach_token_consumed" => EventKind::AttachTokenConsumed,
            "config_updated" => EventKind::ConfigUpdated,
            "metadata_updated" => EventKind::MetadataUpdated,
            _ => EventKind::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub session_id: String,
    pub kind: EventKind,
    pub payload: JsonMap,
    pub created_at: DateTime<Utc>,
}

/// A stored attach token. The plaintext is never kept.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachToken {
    pub token_hash: String,
    pub session_id: String,
    pub owner: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A newly issued attach token, plaintext shown once.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedAttachToken {
    pub token: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A newly issued one-time code, plaintext shown once.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedOtp {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Builds a JSON payload from key/value pairs.
pub(crate) fn payload<const N: usize>(pairs: [(&str, Value); N]) -> JsonMap {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> Session {
        let now = Utc::now();
        Session {
            id: "s1".into(),
            owner: "alice".into(),
            source: SessionSource::Agent,
            channel: String::new(),
            conversation_key: String::new(),
            tool: "shell".into(),
            title: "shell".into(),
            command: "bash".into(),
            workdir: "/tmp".into(),
            state: SessionState::Running,
            pinned: false,
            last_active_at: now,
            detached_at: None,
            terminated_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
            access_mode: AccessMode::Permanent,
            access_secret_hash: Some("deadbeef".into()),
            access_once_used_at: None,
            metadata: JsonMap::new(),
            revision: 0,
        }
    }

    #[test]
    fn enums_round_trip_through_strings() {
        for state in [
            SessionState::Running,
            SessionState::Detached,
            SessionState::Terminated,
            SessionState::Archived,
        ] {
            assert_eq!(state.as_str().parse::<SessionState>().unwrap(), state);
        }
        assert_eq!("one_time".parse::<AccessMode>().unwrap(), AccessMode::OneTime);
        assert!("sometimes".parse::<AccessMode>().is_err());
        assert_eq!("webui".parse::<SessionSource>().unwrap(), SessionSource::Webui);
    }

    #[test]
    fn event_kind_keeps_custom_names() {
        assert_eq!(EventKind::from("otp_issued".to_string()), EventKind::OtpIssued);
        let custom = EventKind::from("note".to_string());
        assert_eq!(custom, EventKind::Other("note".into()));
        assert_eq!(custom.as_str(), "note");
    }

    #[test]
    fn secret_hash_is_never_serialized() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(!json.contains("deadbeef"));
        assert!(!json.contains("access_secret_hash"));
    }

    #[test]
    fn terminating_stamps_every_earlier_marker() {
        let mut s = sample();
        let later = s.created_at + Duration::minutes(1);
        s.enter_state(SessionState::Terminated, later);
        assert_eq!(s.detached_at, Some(later));
        assert_eq!(s.terminated_at, Some(later));
        assert_eq!(s.updated_at, later);

        s.enter_state(SessionState::Running, later);
        assert!(s.detached_at.is_none());
        assert!(s.terminated_at.is_none());
    }
}
