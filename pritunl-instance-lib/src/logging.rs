//! Structured logging setup for the daemon binary.
//!
//! A reloadable file-output layer alongside the default stderr layer, so an
//! operator can point the daemon at a new log file without restarting it,
//! plus an env-var override for the log path ahead of the platform default.

use std::path::PathBuf;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, reload};

pub type FileFmtLayer = tracing_subscriber::fmt::Layer<tracing_subscriber::Registry, tracing_subscriber::fmt::format::DefaultFields, tracing_subscriber::fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const LOG_PATH_ENV: &str = "PRITUNL_INSTANCE_LOG_PATH";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open log file: {0}")]
    IO(#[from] std::io::Error),
    #[error("failed to install global subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Resolves the log file path: an explicit env var override, else the
/// platform-conventional location under `/var/log` on Linux or the
/// process's working directory elsewhere (a daemon running as a
/// privileged system service is the expected deployment; a writable
/// fallback keeps local runs and tests working).
pub fn log_path() -> PathBuf {
    if let Ok(path) = std::env::var(LOG_PATH_ENV) {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/pritunl-instance/pritunl-instance.log")
    }
    #[cfg(not(target_os = "linux"))]
    {
        PathBuf::from("pritunl-instance.log")
    }
}

fn make_file_fmt_layer(path: &std::path::Path) -> std::io::Result<FileFmtLayer> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(BoxMakeWriter::new(file)))
}

/// Installs the global subscriber: an env-filtered stderr layer plus a
/// reloadable file layer. Returns the reload handle (to repoint the file
/// layer at a new path later) and the path actually opened.
pub fn init() -> Result<(LogReloadHandle, String), Error> {
    use tracing_subscriber::prelude::*;

    let path = log_path();
    let file_layer = make_file_fmt_layer(&path)?;
    let (reloadable, handle) = reload::Layer::new(file_layer);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(reloadable)
        .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
        .with(env_filter)
        .try_init()?;

    Ok((handle, path.display().to_string()))
}
