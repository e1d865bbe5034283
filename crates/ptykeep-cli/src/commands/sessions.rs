//! Session record commands: create, list, show, events, archive, detach,
//! terminate, pin.

use super::{format_time, print_json, truncate};
use anyhow::Result;
use ptykeep_server::lifecycle::{
    AccessMode, NewSession, Session, SessionConfigUpdate, SessionFilter, SessionState,
};
use ptykeep_server::{BoundSession, SessionBinder};
use serde::Serialize;

pub struct CreateArgs {
    pub tool: String,
    pub owner: String,
    pub title: Option<String>,
    pub command: Option<String>,
    pub access: AccessMode,
    pub password: Option<String>,
    pub pin: bool,
}

#[derive(Serialize)]
struct Created<'a> {
    session: &'a Session,
    secret: Option<&'a str>,
}

/// Register a detached record; `ptykeep run --session` launches it later.
pub fn run_create(binder: &SessionBinder, args: CreateArgs, json: bool) -> Result<()> {
    let command = args
        .command
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| binder.default_command(&args.tool));
    let workdir = binder.default_workdir().to_string_lossy().into_owned();

    let created = binder.lifecycle().create_session(NewSession {
        owner: args.owner,
        tool: args.tool,
        title: args.title.unwrap_or_default(),
        command,
        workdir,
        state: Some(SessionState::Detached),
        pinned: args.pin,
        access_mode: args.access,
        password: args.password,
        ..NewSession::default()
    })?;

    if json {
        return print_json(&Created {
            session: &created.session,
            secret: created.secret.as_deref(),
        });
    }
    println!("{}", created.session.id);
    if let Some(secret) = &created.secret {
        println!("secret: {secret}");
        eprintln!("(shown once; it cannot be retrieved again)");
    }
    Ok(())
}

pub fn run_list(
    binder: &SessionBinder,
    owner: Option<String>,
    state: Option<SessionState>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let filter = SessionFilter {
        owner,
        state,
        limit,
        ..SessionFilter::default()
    };
    let sessions = binder.lifecycle().list_sessions(&filter)?;
    if json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!(
        "{:<34} {:<12} {:<11} {:<10} {:<20} {}",
        "ID", "OWNER", "STATE", "ACCESS", "LAST ACTIVE", "COMMAND"
    );
    for s in &sessions {
        let state = if s.pinned {
            format!("{}*", s.state)
        } else {
            s.state.to_string()
        };
        println!(
            "{:<34} {:<12} {:<11} {:<10} {:<20} {}",
            s.id,
            truncate(&s.owner, 12),
            state,
            s.access_mode,
            format_time(s.last_active_at),
            truncate(&s.command, 40)
        );
    }
    println!("\n{} session(s).", sessions.len());
    Ok(())
}

pub fn run_show(binder: &SessionBinder, id: &str, json: bool) -> Result<()> {
    let bound = binder.get(id)?;
    if json {
        return print_json(&bound);
    }
    print_session(&bound);
    Ok(())
}

fn print_session(bound: &BoundSession) {
    let s = &bound.session;
    println!("id:           {}", s.id);
    println!("owner:        {} ({})", s.owner, s.source);
    println!("tool:         {}", s.tool);
    println!("title:        {}", s.title);
    println!("command:      {}", s.command);
    println!("workdir:      {}", s.workdir);
    println!("state:        {}{}", s.state, if s.pinned { " (pinned)" } else { "" });
    println!("access:       {}", s.access_mode);
    println!("created:      {}", format_time(s.created_at));
    println!("last active:  {}", format_time(s.last_active_at));
    if let Some(at) = s.detached_at {
        println!("detached:     {}", format_time(at));
    }
    if let Some(at) = s.terminated_at {
        println!("terminated:   {}", format_time(at));
    }
    if let Some(at) = s.expires_at {
        println!("expires:      {}", format_time(at));
    }
    if !s.channel.is_empty() || !s.conversation_key.is_empty() {
        println!("channel:      {} {}", s.channel, s.conversation_key);
    }
    if !s.metadata.is_empty() {
        println!(
            "metadata:     {}",
            serde_json::Value::Object(s.metadata.clone())
        );
    }
    match &bound.process {
        Some(p) if p.running => println!("process:      running (pid {:?})", p.pid),
        Some(p) => println!("process:      exited ({:?})", p.exit_code),
        None => println!("process:      none"),
    }
}

pub fn run_events(binder: &SessionBinder, id: &str, limit: Option<usize>, json: bool) -> Result<()> {
    let events = binder.lifecycle().list_events(id, limit)?;
    if json {
        return print_json(&events);
    }
    for e in &events {
        let payload = if e.payload.is_empty() {
            String::new()
        } else {
            serde_json::Value::Object(e.payload.clone()).to_string()
        };
        println!("{:>6}  {}  {:<22} {}", e.id, format_time(e.created_at), e.kind, payload);
    }
    Ok(())
}

pub fn run_archive(binder: &SessionBinder, owner: Option<&str>, json: bool) -> Result<()> {
    let count = binder.lifecycle().archive_terminated_sessions(owner)?;
    if json {
        return print_json(&serde_json::json!({ "archived": count }));
    }
    println!("archived {count} session(s)");
    Ok(())
}

pub fn run_detach(binder: &SessionBinder, id: &str, json: bool) -> Result<()> {
    let session = binder.detach(id)?;
    report_state(&session, json)
}

/// Mark the record terminated. This process hosts no PTYs; a `ptykeep run`
/// attached to the session sees the change and stops its process.
pub fn run_terminate(
    binder: &SessionBinder,
    id: &str,
    reason: Option<&str>,
    json: bool,
) -> Result<()> {
    let session = binder.terminate(id, reason)?;
    report_state(&session, json)
}

pub fn run_pin(binder: &SessionBinder, id: &str, pinned: bool, json: bool) -> Result<()> {
    let session = binder.lifecycle().update_session_config(
        id,
        SessionConfigUpdate {
            pinned: Some(pinned),
            ..SessionConfigUpdate::default()
        },
    )?;
    if json {
        return print_json(&session);
    }
    println!(
        "{} {}",
        session.id,
        if session.pinned { "pinned" } else { "unpinned" }
    );
    Ok(())
}

fn report_state(session: &Session, json: bool) -> Result<()> {
    if json {
        return print_json(session);
    }
    println!("{} {}", session.id, session.state);
    Ok(())
}
