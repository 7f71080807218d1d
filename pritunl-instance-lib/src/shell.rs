//! Argv-only subprocess execution helpers shared by the firewall, bridge,
//! and process-supervisor collaborators.
//!
//! Every invocation takes an explicit binary and argument list, never a
//! shell string, and logs the command line at debug level before running it.

use std::process::{ExitStatus, Stdio};

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("{0} exited with {1}: {2}")]
    NonZeroExit(String, ExitStatus, String),
}

/// Runs `program argv...` to completion, returning captured stdout on
/// success and an error carrying stderr on non-zero exit.
pub async fn run(program: &str, argv: &[String]) -> Result<String, Error> {
    tracing::debug!(program, ?argv, "running command");
    let output = Command::new(program)
        .args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Spawn(program.to_string(), e))?;

    if !output.status.success() {
        return Err(Error::NonZeroExit(program.to_string(), output.status, String::from_utf8_lossy(&output.stderr).into_owned()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs `program argv...`, discarding output, only distinguishing success
/// from failure. Used for idempotent state-changing calls (`ip link set
/// up`) where the caller only cares whether the kernel accepted it.
pub async fn run_status(program: &str, argv: &[String]) -> bool {
    tracing::debug!(program, ?argv, "running command");
    match Command::new(program).args(argv).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null()).status().await {
        Ok(status) => status.success(),
        Err(err) => {
            tracing::error!(program, error = %err, "failed to spawn command");
            false
        }
    }
}

thread_local! {
    // The firewall/bridge/route-table collaborators run on plain worker
    // threads and only shell out occasionally, so each thread keeps a
    // single lazily-built current-thread runtime around rather than
    // standing up a fresh one per call.
    static RUNTIME: std::cell::RefCell<Option<tokio::runtime::Runtime>> = const { std::cell::RefCell::new(None) };
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(tokio::runtime::Builder::new_current_thread().enable_all().build().expect("failed to build shell runtime"));
        }
        slot.as_ref().unwrap().block_on(fut)
    })
}

/// Synchronous wrapper over [`run`] for callers on plain worker threads
/// (the firewall and bridge collaborators) that have no tokio runtime of
/// their own.
pub fn run_sync(program: &str, argv: &[String]) -> Result<String, Error> {
    block_on(run(program, argv))
}

/// Synchronous wrapper over [`run_status`].
pub fn run_status_sync(program: &str, argv: &[String]) -> bool {
    block_on(run_status(program, argv))
}
