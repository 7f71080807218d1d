//! Spawns and supervises the OpenVPN child process.
//!
//! Runs on a plain OS thread (not the tokio runtime used for one-shot tool
//! invocations): the supervised process's lifetime spans the whole instance
//! run and its stdout is read line-by-line into a [`crossbeam_channel`] the
//! orchestrator's event loop selects on, a thread-plus-channel worker shape
//! rather than an async task.
//!
//! Grounded in `instance.py`'s `openvpn_start`, `openvpn_watch`, and
//! `stop_process`.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn openvpn: {0}")]
    Spawn(std::io::Error),
    #[error("failed to capture openvpn stdout")]
    NoStdout,
}

/// A line the supervised process wrote to stdout. The channel disconnecting
/// (an `Err` from `recv`) is the signal that the process's stdout closed,
/// which on a well-behaved process means it exited.
pub enum Output {
    Line(String),
}

pub struct SupervisedProcess {
    child: Child,
    pub output: crossbeam_channel::Receiver<Output>,
}

const FORCE_KILL_ATTEMPTS: u32 = 10;
const FORCE_KILL_INTERVAL: Duration = Duration::from_millis(10);

impl SupervisedProcess {
    /// Spawns `openvpn --config <config_path>` with stdout piped and read on
    /// a background thread.
    pub fn spawn(openvpn_binary: &str, config_path: &std::path::Path) -> Result<Self, Error> {
        let mut child = Command::new(openvpn_binary)
            .arg("--config")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(Error::Spawn)?;

        let stdout = child.stdout.take().ok_or(Error::NoStdout)?;
        let (tx, rx) = crossbeam_channel::unbounded();

        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(Output::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });

        Ok(SupervisedProcess { child, output: rx })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Polls for exit without blocking.
    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Sends SIGTERM and gives the process a chance to shut down cleanly.
    /// The caller is expected to poll `try_wait` afterward and escalate to
    /// [`Self::force_kill`] if it doesn't exit within its own timeout.
    #[cfg(unix)]
    pub fn stop(&self) {
        send_signal(self.child.id(), "TERM");
    }

    #[cfg(not(unix))]
    pub fn stop(&mut self) {
        let _ = self.child.kill();
    }

    /// Sends SIGKILL repeatedly: a process can be mid-fork or briefly
    /// uninterruptible when the first signal arrives, so one shot is not
    /// reliable enough for a teardown path that must not hang.
    #[cfg(unix)]
    pub fn force_kill(&mut self) {
        for _ in 0..FORCE_KILL_ATTEMPTS {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return;
            }
            send_signal(self.child.id(), "KILL");
            thread::sleep(FORCE_KILL_INTERVAL);
        }
        let _ = self.child.kill();
    }

    #[cfg(not(unix))]
    pub fn force_kill(&mut self) {
        let _ = self.child.kill();
    }
}

/// A secondary child process an instance may hold alongside its OpenVPN
/// process (the original's `auth_log_process`). Generic handle with no
/// concrete producer in this crate; teardown interrupts it if present.
pub struct AuxProcess {
    child: Child,
}

impl AuxProcess {
    pub fn attach(child: Child) -> Self {
        AuxProcess { child }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    #[cfg(unix)]
    pub fn interrupt(&self) {
        send_signal(self.child.id(), "INT");
    }

    #[cfg(not(unix))]
    pub fn interrupt(&mut self) {
        let _ = self.child.kill();
    }

    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: &str) {
    let _ = Command::new("kill").arg(format!("-{signal}")).arg(pid.to_string()).stdout(Stdio::null()).stderr(Stdio::null()).status();
}
