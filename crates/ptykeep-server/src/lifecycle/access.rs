//! Access policy limits and the in-memory one-time code table.

use chrono::{DateTime, Duration, Utc};
use ptykeep_core::secret::MIN_PASSWORD_LEN;
use ptykeep_core::{hash_secret, secrets_match};
use std::collections::HashMap;
use std::sync::Mutex;

/// Limits applied to generated secrets, OTPs and attach tokens.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    pub otp_default_ttl: Duration,
    pub otp_min_ttl: Duration,
    pub otp_max_ttl: Duration,
    pub token_default_ttl: Duration,
    pub token_min_ttl: Duration,
    pub token_max_ttl: Duration,
    /// Length of generated session passwords (never below 12).
    pub password_len: usize,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            otp_default_ttl: Duration::seconds(180),
            otp_min_ttl: Duration::seconds(30),
            otp_max_ttl: Duration::seconds(3600),
            token_default_ttl: Duration::minutes(5),
            token_min_ttl: Duration::seconds(30),
            token_max_ttl: Duration::hours(1),
            password_len: 16,
        }
    }
}

impl AccessPolicy {
    pub fn otp_ttl(&self, requested: Option<Duration>) -> Duration {
        clamp_ttl(
            requested,
            self.otp_default_ttl,
            self.otp_min_ttl,
            self.otp_max_ttl,
        )
    }

    pub fn token_ttl(&self, requested: Option<Duration>) -> Duration {
        clamp_ttl(
            requested,
            self.token_default_ttl,
            self.token_min_ttl,
            self.token_max_ttl,
        )
    }

    pub fn password_len(&self) -> usize {
        self.password_len.max(MIN_PASSWORD_LEN)
    }
}

/// `None` or a non-positive request takes the default; the result is then
/// bounded to `[min, max]`.
fn clamp_ttl(requested: Option<Duration>, default: Duration, min: Duration, max: Duration) -> Duration {
    let ttl = match requested {
        Some(ttl) if ttl > Duration::zero() => ttl,
        _ => default,
    };
    let max = max.max(min);
    ttl.clamp(min, max)
}

#[derive(Debug, Clone)]
struct OtpEntry {
    hash: String,
    expires_at: DateTime<Utc>,
}

/// Outstanding one-time codes, at most one per session. Never persisted.
#[derive(Debug, Default)]
pub struct OtpTable {
    entries: Mutex<HashMap<String, OtpEntry>>,
}

impl OtpTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OtpEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `code` for `session_id`, replacing any earlier one.
    pub fn issue(&self, session_id: &str, code: &str, expires_at: DateTime<Utc>) {
        let entry = OtpEntry {
            hash: hash_secret(session_id, code),
            expires_at,
        };
        self.lock().insert(session_id.to_string(), entry);
    }

    /// Consume the code if it matches and has not expired. An expired entry
    /// is dropped either way; a mismatching live one is kept.
    pub fn redeem(&self, session_id: &str, candidate: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get(session_id) else {
            return false;
        };
        if entry.expires_at <= now {
            entries.remove(session_id);
            return false;
        }
        if !secrets_match(&entry.hash, &hash_secret(session_id, candidate)) {
            return false;
        }
        entries.remove(session_id);
        true
    }

    pub fn clear(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    pub fn clear_many<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> usize {
        let mut entries = self.lock();
        ids.into_iter()
            .filter(|id| entries.remove(id.as_str()).is_some())
            .count()
    }

    /// Drop every expired entry.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
