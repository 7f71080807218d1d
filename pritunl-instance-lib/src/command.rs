//! Wire types exchanged between the daemon and `pritunl-instance-ctl` over
//! the control socket: a serde-friendly enum pair with `Display`/`FromStr`
//! for human-readable round-tripping in logs and tests.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::server::ServerId;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Status { server_id: Option<ServerId> },
    Stop { server_id: ServerId },
    ForceStop { server_id: ServerId },
}

impl Command {
    pub fn status_all() -> Self {
        Command::Status { server_id: None }
    }

    pub fn status_one(server_id: ServerId) -> Self {
        Command::Status { server_id: Some(server_id) }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Status { server_id: None } => write!(f, "status"),
            Command::Status { server_id: Some(id) } => write!(f, "status {id}"),
            Command::Stop { server_id } => write!(f, "stop {server_id}"),
            Command::ForceStop { server_id } => write!(f, "force-stop {server_id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized command: {0}")]
pub struct ParseCommandError(String);

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match parts.next() {
            Some("status") => {
                let server_id = parts.next().and_then(|s| s.parse().ok()).map(ServerId);
                Ok(Command::Status { server_id })
            }
            Some("stop") => {
                let id = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| ParseCommandError(s.to_string()))?;
                Ok(Command::Stop { server_id: ServerId(id) })
            }
            Some("force-stop") => {
                let id = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| ParseCommandError(s.to_string()))?;
                Ok(Command::ForceStop { server_id: ServerId(id) })
            }
            _ => Err(ParseCommandError(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub server_id: ServerId,
    pub instance_id: String,
    pub state: String,
    pub interface: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Status(Vec<InstanceStatus>),
    Ok,
    Error(String),
}
