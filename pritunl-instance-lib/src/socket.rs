//! Unix domain socket transport for the daemon/ctl control protocol.
//!
//! A single request/response per connection, written as one
//! write-then-shutdown(Write) so the peer's read loop sees EOF right after
//! the payload, then read to completion for the reply.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::thread;

use crate::command::{Command, Response};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("control socket not found at {0}")]
    NotFound(std::path::PathBuf),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub const DEFAULT_PATH: &str = "/var/run/pritunl-instance.sock";
pub const ENV_VAR: &str = "PRITUNL_INSTANCE_SOCKET_PATH";

fn check_path(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    Ok(())
}

/// Client side: opens a fresh connection, sends `command`, and blocks for
/// the single reply.
pub fn send_command(path: &Path, command: &Command) -> Result<Response, Error> {
    check_path(path)?;
    let mut stream = UnixStream::connect(path)?;

    let payload = serde_json::to_vec(command)?;
    stream.write_all(&payload)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    let response = serde_json::from_slice(&buf)?;
    Ok(response)
}

/// Server side: reads exactly one JSON-encoded [`Command`] off `stream`.
pub fn read_command(stream: &mut UnixStream) -> Result<Command, Error> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Server side: writes `response` and shuts the write half down so the
/// client's `read_to_end` returns.
pub fn write_response(stream: &mut UnixStream, response: &Response) -> Result<(), Error> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.shutdown(std::net::Shutdown::Write)?;
    Ok(())
}

/// Spawns a thread forwarding a listener's incoming connections onto a
/// channel, so the daemon's main select loop can treat new connections like
/// any other event source rather than blocking on `accept` itself.
pub fn incoming_channel(listener: UnixListener) -> crossbeam_channel::Receiver<UnixStream> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            if tx.send(stream).is_err() {
                return;
            }
        }
    });
    rx
}
