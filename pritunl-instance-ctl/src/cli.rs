use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pritunl_instance_lib::command::Command as LibCommand;
use pritunl_instance_lib::server::ServerId;
use pritunl_instance_lib::socket;

/// Control interface for the pritunl-instance supervisor daemon
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Control socket path
    #[arg(short, long, env = socket::ENV_VAR, default_value = socket::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Format output as json
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Report running instances, all of them or just one server
    #[command()]
    Status {
        /// Limit the report to this server
        server_id: Option<u64>,
    },

    /// Request a graceful stop of a running instance
    #[command()]
    Stop { server_id: u64 },

    /// Kill a running instance immediately
    #[command()]
    ForceStop { server_id: u64 },
}

impl From<Command> for LibCommand {
    fn from(val: Command) -> Self {
        match val {
            Command::Status { server_id } => LibCommand::Status { server_id: server_id.map(ServerId) },
            Command::Stop { server_id } => LibCommand::Stop { server_id: ServerId(server_id) },
            Command::ForceStop { server_id } => LibCommand::ForceStop { server_id: ServerId(server_id) },
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
