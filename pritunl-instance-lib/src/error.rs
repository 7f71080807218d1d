//! Error kinds the core distinguishes.
//!
//! `ClaimMissed` is deliberately not a variant here: a missed claim is not an
//! error, it is a normal outcome of the compare-and-set admission primitive
//! (see [`crate::store::ClaimOutcome`]).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("resource allocation failed: {0}")]
    ResourceExhausted(#[from] crate::registry::Error),
    #[error("bridge lookup failed: {0}")]
    BridgeLookupFailed(#[from] crate::bridge::Error),
    #[error("firewall rule rejected after retries: {0}")]
    FilterRuleFailed(#[from] crate::firewall::Error),
    #[error("failed to spawn openvpn process: {0}")]
    ProcessSpawnFailed(#[from] crate::process::Error),
    /// Unconstructed: a crash is observed as the output channel closing, and
    /// carried onward as [`crate::orchestrator::StopReason::Crashed`] rather
    /// than a `Result` error, since it ends the run without aborting it.
    #[error("openvpn process exited unexpectedly")]
    ProcessCrashed,
    /// Unconstructed: an eviction is observed as [`crate::heartbeat::Event::Evicted`]
    /// and carried onward as [`crate::orchestrator::StopReason::Evicted`] for the
    /// same reason.
    #[error("instance evicted from datastore")]
    HeartbeatEvicted,
    #[error("config render failed: {0}")]
    ConfigRender(#[from] crate::config_render::Error),
    #[error("datastore error: {0}")]
    Store(#[from] crate::store::Error),
    #[error("failed to enable IP forwarding: {0}")]
    IpForwarding(#[from] crate::shell::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}
