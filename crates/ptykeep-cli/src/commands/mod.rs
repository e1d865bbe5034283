//! CLI subcommand implementations.

pub mod access;
pub mod run;
pub mod serve;
pub mod sessions;

use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use serde::Serialize;

/// Owner recorded for sessions created from this terminal.
pub fn default_owner() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Seconds from the command line as a TTL request.
pub fn ttl_from_secs(secs: Option<i64>) -> Option<Duration> {
    secs.map(Duration::seconds)
}

pub fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Truncate `s` to `width` chars, marking the cut.
pub fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let kept: String = s.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_marks_the_cut() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a long command line", 10), "a long ...");
    }

    #[test]
    fn ttl_is_seconds() {
        assert_eq!(ttl_from_secs(Some(90)), Some(Duration::seconds(90)));
        assert_eq!(ttl_from_secs(None), None);
    }
}
