//! Idempotent add / check / remove of IPv4 and IPv6 packet-filter rules with
//! retry and periodic self-repair.

pub mod rules;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::server::ServerId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel rejected rule after {0} attempts: {1:?}")]
    InsertFailed(u32, Vec<String>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

/// A single packet-filter rule, as the bare argv that follows the tool name
/// (`iptables`/`ip6tables`), e.g. `["INPUT", "-i", "tun0", "-j", "ACCEPT"]`.
/// Every rule this crate generates carries a `pritunl_<server_id>` comment
/// token, appended by [`rules::RuleSet::finish`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Rule {
    pub family: IpFamily,
    pub argv: Vec<String>,
}

impl Rule {
    pub fn new(family: IpFamily, argv: Vec<String>) -> Self {
        Rule { family, argv }
    }
}

/// Collaborator performing the actual kernel calls. Production code backs
/// this with argv-only subprocess invocations of `iptables`/`ip6tables`
/// (see [`crate::shell`]); tests back it with an in-memory fake.
pub trait KernelFilter: Send + Sync {
    /// Returns `true` if an exact-match rule is currently installed.
    fn check(&self, family: IpFamily, argv: &[String]) -> bool;
    /// Attempts a single insert-at-top. Non-zero exit is a retryable failure.
    fn insert(&self, family: IpFamily, argv: &[String]) -> bool;
    /// Best-effort delete; failures are swallowed by the caller.
    fn delete(&self, family: IpFamily, argv: &[String]) -> bool;
    /// Whether `--wait` should be appended (host advertises a wait-lock-aware tool).
    fn supports_wait(&self) -> bool {
        false
    }
}

/// Shells out to `iptables`/`ip6tables`, following `instance.py`'s
/// `exists_iptables_rule`/`set_iptables_rule`/`remove_iptables_rule` argv
/// shapes exactly (`-C`/`-I`/`-D` plus the bare rule argv).
pub struct IptablesFilter {
    wait: bool,
}

impl IptablesFilter {
    pub fn new(wait: bool) -> Self {
        IptablesFilter { wait }
    }

    fn tool(family: IpFamily) -> &'static str {
        match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    fn argv(&self, mode: &str, argv: &[String]) -> Vec<String> {
        let mut full = vec![mode.to_string()];
        full.extend(argv.iter().cloned());
        if self.wait && mode == "-I" {
            full.push("--wait".to_string());
        }
        full
    }
}

impl KernelFilter for IptablesFilter {
    fn check(&self, family: IpFamily, argv: &[String]) -> bool {
        crate::shell::run_status_sync(Self::tool(family), &self.argv("-C", argv))
    }

    fn insert(&self, family: IpFamily, argv: &[String]) -> bool {
        crate::shell::run_status_sync(Self::tool(family), &self.argv("-I", argv))
    }

    fn delete(&self, family: IpFamily, argv: &[String]) -> bool {
        crate::shell::run_status_sync(Self::tool(family), &self.argv("-D", argv))
    }

    fn supports_wait(&self) -> bool {
        self.wait
    }
}

const INSERT_RETRIES: u32 = 3;
const INSERT_RETRY_DELAY: Duration = Duration::from_secs(1);

struct Lists {
    v4: Option<Vec<Rule>>,
    v6: Option<Vec<Rule>>,
}

pub struct FirewallManager {
    server_id: ServerId,
    kernel: Arc<dyn KernelFilter>,
    lists: Mutex<Lists>,
    tun_nat_installed: Mutex<bool>,
}

impl FirewallManager {
    pub fn new(server_id: ServerId, kernel: Arc<dyn KernelFilter>) -> Self {
        FirewallManager {
            server_id,
            kernel,
            lists: Mutex::new(Lists {
                v4: Some(Vec::new()),
                v6: Some(Vec::new()),
            }),
            tun_nat_installed: Mutex::new(false),
        }
    }

    fn insert_with_retry(&self, rule: &Rule) -> Result<(), Error> {
        for attempt in 1..=INSERT_RETRIES {
            if self.kernel.insert(rule.family, &rule.argv) {
                return Ok(());
            }
            if attempt < INSERT_RETRIES {
                tracing::error!(server_id = %self.server_id, argv = ?rule.argv, attempt, "failed to insert firewall rule, retrying");
                thread::sleep(INSERT_RETRY_DELAY);
            }
        }
        Err(Error::InsertFailed(INSERT_RETRIES, rule.argv.clone()))
    }

    /// For each rule, installs via insert-at-top only if an exact-match check
    /// reports absent; appends to the tracking list regardless.
    pub fn append(&self, new_rules: &[Rule]) -> Result<(), Error> {
        let mut lists = self.lists.lock().expect("firewall lists poisoned");
        for rule in new_rules {
            let list = match rule.family {
                IpFamily::V4 => &mut lists.v4,
                IpFamily::V6 => &mut lists.v6,
            };
            let Some(list) = list else {
                // teardown in progress; refuse further mutation
                continue;
            };
            if !self.kernel.check(rule.family, &rule.argv) {
                self.insert_with_retry(rule)?;
            }
            list.push(rule.clone());
        }
        Ok(())
    }

    /// Removes from the tracking list (best effort) and invokes delete on the
    /// kernel (best effort).
    pub fn delete(&self, removed: &[Rule]) {
        let mut lists = self.lists.lock().expect("firewall lists poisoned");
        for rule in removed {
            let list = match rule.family {
                IpFamily::V4 => &mut lists.v4,
                IpFamily::V6 => &mut lists.v6,
            };
            let Some(list) = list else {
                continue;
            };
            if let Some(pos) = list.iter().position(|r| r == rule) {
                list.remove(pos);
            }
            let _ = self.kernel.delete(rule.family, &rule.argv);
        }
    }

    /// Iterates the tracking list and reinserts any rule whose check reports
    /// absent. Must not run during teardown: both lists are `None` by then
    /// and this becomes a no-op.
    pub fn reassert(&self, log_missing: bool) -> Result<(), Error> {
        let lists = self.lists.lock().expect("firewall lists poisoned");
        for (list, opt) in [(IpFamily::V4, &lists.v4), (IpFamily::V6, &lists.v6)] {
            let Some(tracked) = opt else { continue };
            for rule in tracked {
                if !self.kernel.check(rule.family, &rule.argv) {
                    if log_missing {
                        tracing::error!(server_id = %self.server_id, family = ?list, argv = ?rule.argv, "unexpected loss of firewall rule, adding again");
                    }
                    self.insert_with_retry(rule)?;
                }
            }
        }
        Ok(())
    }

    /// Deletes every tracked rule and sets both lists to the teardown
    /// sentinel so further `append`/`delete` become no-ops.
    pub fn clear(&self) {
        let mut lists = self.lists.lock().expect("firewall lists poisoned");
        for rule in lists.v4.take().into_iter().flatten() {
            let _ = self.kernel.delete(rule.family, &rule.argv);
        }
        for rule in lists.v6.take().into_iter().flatten() {
            let _ = self.kernel.delete(rule.family, &rule.argv);
        }
    }

    /// One-shot idempotent install of a `POSTROUTING -t nat -o <tun> -j
    /// MASQUERADE` rule, at `InstanceCom`'s request when the VPN uses
    /// client-side masquerade.
    pub fn enable_tun_nat(&self, interface: &str, ipv6: bool) -> Result<(), Error> {
        let mut installed = self.tun_nat_installed.lock().expect("tun_nat flag poisoned");
        if *installed {
            return Ok(());
        }
        let argv = vec![
            "POSTROUTING".to_string(),
            "-t".to_string(),
            "nat".to_string(),
            "-o".to_string(),
            interface.to_string(),
            "-j".to_string(),
            "MASQUERADE".to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            format!("pritunl_{}", self.server_id),
        ];
        let rule4 = Rule::new(IpFamily::V4, argv.clone());
        self.append(&[rule4])?;
        if ipv6 {
            let rule6 = Rule::new(IpFamily::V6, argv);
            self.append(&[rule6])?;
        }
        *installed = true;
        Ok(())
    }

    pub fn tracked_rule_count(&self) -> usize {
        let lists = self.lists.lock().expect("firewall lists poisoned");
        lists.v4.as_ref().map(Vec::len).unwrap_or(0) + lists.v6.as_ref().map(Vec::len).unwrap_or(0)
    }
}
