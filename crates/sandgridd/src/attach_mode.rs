//! run-attached — join an observer session, then become the task.
//!
//! The foreman puts this in front of every task command. The session id,
//! secret and observer socket arrive in the environment; once the observer
//! has moved this process into the session, the task command replaces it
//! with `exec`, keeping the pid and therefore the session membership.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use anyhow::Context;
use sandgrid_observer::{ObserverClient, SECRET_ENV, SESSION_ENV, SOCKET_ENV};

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} is not set"))
}

pub async fn run_attached(command: &[OsString]) -> anyhow::Result<()> {
    let (program, args) = command.split_first().context("no command to run")?;
    let socket = PathBuf::from(required(SOCKET_ENV)?);
    let session_id = required(SESSION_ENV)?;
    let secret = required(SECRET_ENV)?;

    let mut client = ObserverClient::connect(&socket)
        .await?
        .with_session(session_id, secret);
    client.attach(None).await?;
    drop(client);

    let err = std::process::Command::new(program)
        .args(args)
        .env_remove(SOCKET_ENV)
        .env_remove(SESSION_ENV)
        .env_remove(SECRET_ENV)
        .exec();
    Err(anyhow::Error::new(err).context(format!("exec {}", program.to_string_lossy())))
}
