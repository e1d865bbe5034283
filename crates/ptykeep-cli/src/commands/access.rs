//! Access-control commands: access, verify, token, redeem.

use super::{format_time, print_json, ttl_from_secs};
use anyhow::{Context, Result};
use dialoguer::Password;
use ptykeep_server::lifecycle::AccessMode;
use ptykeep_server::SessionBinder;

/// Set the access mode and print the new secret once.
pub fn run_configure(
    binder: &SessionBinder,
    id: &str,
    mode: AccessMode,
    password: Option<&str>,
    json: bool,
) -> Result<()> {
    let secret = binder
        .lifecycle()
        .configure_session_access(id, mode, password)?;
    if json {
        return print_json(&serde_json::json!({ "id": id, "mode": mode, "secret": secret }));
    }
    println!("{id} access set to {mode}");
    if let Some(secret) = secret {
        println!("secret: {secret}");
    }
    Ok(())
}

/// Verify a password, prompting on the terminal when none is given.
pub fn run_verify(
    binder: &SessionBinder,
    id: &str,
    password: Option<String>,
    json: bool,
) -> Result<()> {
    let password = match password {
        Some(p) => p,
        None => Password::new()
            .with_prompt(format!("Password for {id}"))
            .allow_empty_password(true)
            .interact()
            .context("failed to read password")?,
    };
    let session = binder.lifecycle().verify_session_access(id, &password)?;
    if json {
        return print_json(&session);
    }
    println!("access granted: {} ({})", session.id, session.state);
    Ok(())
}

pub fn run_token(
    binder: &SessionBinder,
    id: &str,
    owner: Option<&str>,
    ttl: Option<i64>,
    json: bool,
) -> Result<()> {
    let issued = binder
        .lifecycle()
        .create_attach_token(id, owner, ttl_from_secs(ttl))?;
    if json {
        return print_json(&issued);
    }
    println!("{}", issued.token);
    eprintln!("valid until {}", format_time(issued.expires_at));
    Ok(())
}

pub fn run_redeem(
    binder: &SessionBinder,
    token: &str,
    owner: Option<&str>,
    json: bool,
) -> Result<()> {
    let session = binder.lifecycle().consume_attach_token(token, owner)?;
    if json {
        return print_json(&session);
    }
    println!("{} {}", session.id, session.state);
    Ok(())
}
