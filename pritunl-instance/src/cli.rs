use clap::Parser;
use std::path::PathBuf;

use pritunl_instance_lib::{config, socket};

/// pritunl-instance supervisor daemon
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Daemon bootstrap configuration file
    #[arg(short, long, env = config::ENV_VAR, default_value = config::DEFAULT_PATH)]
    pub config_path: PathBuf,

    /// Control socket path for pritunl-instance-ctl
    #[arg(short, long, env = socket::ENV_VAR, default_value = socket::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Run against in-memory datastore/bus fakes instead of real collaborators,
    /// for local development without a live MongoDB/pub-sub deployment
    #[arg(long)]
    pub standalone: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
