//! Shell resolution and child environment for supervised processes.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Absolute paths probed first, in preference order.
const KNOWN_SHELLS: &[&str] = &[
    "/bin/bash",
    "/usr/bin/bash",
    "/usr/local/bin/bash",
    "/bin/zsh",
    "/usr/bin/zsh",
    "/usr/local/bin/zsh",
    "/bin/sh",
    "/usr/bin/sh",
];

/// Names looked up on `PATH` when none of the known paths exist.
const SHELL_NAMES: &[&str] = &["bash", "zsh", "sh"];

/// Terminal type forced on children when the host has none (or `dumb`).
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Find an interactive shell for running `-c <command>`.
pub fn resolve_shell() -> PathBuf {
    resolve_shell_from(KNOWN_SHELLS, std::env::var_os("PATH"))
}

fn resolve_shell_from(candidates: &[&str], path_var: Option<OsString>) -> PathBuf {
    if let Some(found) = candidates
        .iter()
        .map(Path::new)
        .find(|p| is_executable(p))
    {
        return found.to_path_buf();
    }

    if let Some(path_var) = path_var {
        for name in SHELL_NAMES {
            if let Some(found) = std::env::split_paths(&path_var)
                .map(|dir| dir.join(name))
                .find(|p| is_executable(p))
            {
                return found;
            }
        }
    }

    PathBuf::from("sh")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Build the child environment from `base`.
///
/// Full-screen tools refuse to draw on a `dumb` terminal, so `TERM` is
/// forced to [`DEFAULT_TERM`] when missing or `dumb`, and `COLORTERM` is
/// set when absent.
pub fn sanitize_env<I>(base: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = base.into_iter().collect();

    match env.get("TERM").map(String::as_str) {
        None | Some("") | Some("dumb") => {
            env.insert("TERM".to_string(), DEFAULT_TERM.to_string());
        }
        Some(_) => {}
    }
    env.entry("COLORTERM".to_string())
        .or_insert_with(|| "truecolor".to_string());

    env
}
