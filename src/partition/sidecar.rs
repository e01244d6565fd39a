//! Networking sidecars.
//!
//! Each service gets a sidecar container sharing its network namespace. The
//! sidecar enforces the service's outbound connection rules with `tc`:
//!
//! ```text
//!                 root htb 1:
//!                      │
//!        filter 1:0 basic ──► 1:1 or 1:2  (active slot)
//!            ┌─────────┴─────────┐
//!        class 1:1           class 1:2
//!            │                   │
//!       qdisc A (2:)        qdisc B (3:)
//!            │                   │
//!    class 2:N ─ netem       class 3:N ─ netem
//!    (one per restricted peer IP, u32 match ip dst)
//! ```
//!
//! Updates rebuild the inactive qdisc and then replace the root filter, so
//! the switch from the old rule set to the new one is a single `tc` call.
//! Child qdisc majors are even under A and odd under B so the two trees never
//! share a handle.

use crate::error::{Error, Result};
use crate::ids::{PartitionId, ServiceGuid};
use crate::partition::connection::{ConnectionState, DelayDistribution};
use crate::runtime::ContainerRuntime;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::{debug, info};

const ROOT_QDISC: &str = "1:";
const ROOT_FILTER: &str = "1:0";
const FULL_RATE: &str = "100%";
const FILTER_PRIORITY: &str = "1";
/// Highest major already used by the fixed part of the tree.
const LAST_FIXED_QDISC_MAJOR: u32 = 3;

/// Outbound rule toward one peer partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRule {
    /// Addresses of the partition's services.
    pub ips: BTreeSet<Ipv4Addr>,
    /// Connection toward those addresses.
    pub connection: ConnectionState,
}

/// Complete rule set of one sidecar, keyed by peer partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarRules {
    /// Rules per peer partition.
    pub peers: BTreeMap<PartitionId, PeerRule>,
}

impl SidecarRules {
    /// Peer addresses whose traffic must be shaped or dropped.
    #[must_use]
    pub fn restricted(&self) -> BTreeMap<Ipv4Addr, ConnectionState> {
        self.peers
            .values()
            .filter(|rule| !rule.connection.is_unrestricted())
            .flat_map(|rule| rule.ips.iter().map(|ip| (*ip, rule.connection)))
            .collect()
    }

    /// Connection toward `ip`; addresses outside every peer partition are
    /// unrestricted.
    #[must_use]
    pub fn connection_to(&self, ip: Ipv4Addr) -> ConnectionState {
        self.peers
            .values()
            .find(|rule| rule.ips.contains(&ip))
            .map_or_else(ConnectionState::allowed, |rule| rule.connection)
    }
}

/// One of the two double-buffered qdiscs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdiscSlot {
    /// Qdisc `2:` under class `1:1`.
    A,
    /// Qdisc `3:` under class `1:2`.
    B,
}

impl QdiscSlot {
    fn handle(self) -> &'static str {
        match self {
            Self::A => "2:",
            Self::B => "3:",
        }
    }

    fn class(self) -> &'static str {
        match self {
            Self::A => "1:1",
            Self::B => "1:2",
        }
    }

    fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Next child qdisc major after `previous`: even under A, odd under B.
    fn next_child_major(self, previous: u32) -> u32 {
        let next = previous + 1;
        let want_even = self == Self::A;
        if (next % 2 == 0) == want_even { next } else { next + 1 }
    }
}

// =============================================================================
// Command Generation
// =============================================================================

fn words(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn add_qdisc(iface: &str, parent: &str, handle: &str, kind: &str) -> Vec<String> {
    words(&["tc", "qdisc", "add", "dev", iface, "parent", parent, "handle", handle, kind])
}

fn remove_qdisc(iface: &str, slot: QdiscSlot) -> Vec<String> {
    words(&[
        "tc", "qdisc", "del", "dev", iface, "parent", slot.class(), "handle", slot.handle(), "htb",
    ])
}

fn add_class(iface: &str, parent: &str, class: &str) -> Vec<String> {
    words(&[
        "tc", "class", "add", "dev", iface, "parent", parent, "classid", class, "htb", "rate",
        FULL_RATE,
    ])
}

fn root_filter(iface: &str, verb: &str, slot: QdiscSlot) -> Vec<String> {
    words(&[
        "tc", "filter", verb, "dev", iface, "parent", ROOT_QDISC, "handle", ROOT_FILTER, "basic",
        "flowid", slot.class(),
    ])
}

fn ip_filter(iface: &str, parent: &str, class: &str, ip: Ipv4Addr) -> Vec<String> {
    let ip = ip.to_string();
    words(&[
        "tc", "filter", "add", "dev", iface, "parent", parent, "protocol", "ip", "prio",
        FILTER_PRIORITY, "u32", "flowid", class, "match", "ip", "dst", &ip,
    ])
}

fn netem(iface: &str, parent: &str, handle: &str, state: &ConnectionState) -> Vec<String> {
    let mut cmd = add_qdisc(iface, parent, handle, "netem");
    if let ConnectionState::Shaped {
        packet_delay: Some(delay),
        ..
    } = state
    {
        match delay {
            DelayDistribution::Uniform { delay_ms } => {
                cmd.extend(["delay".to_string(), format!("{delay_ms}ms")]);
            }
            DelayDistribution::Normal {
                mean_ms,
                std_dev_ms,
                correlation,
            } => {
                cmd.extend([
                    "delay".to_string(),
                    format!("{mean_ms}ms"),
                    format!("{std_dev_ms}ms"),
                    format!("{correlation}%"),
                    "distribution".to_string(),
                    "normal".to_string(),
                ]);
            }
        }
    }
    cmd.extend([
        "loss".to_string(),
        format!("{}%", state.packet_loss_percentage()),
    ]);
    cmd
}

/// Commands building the fixed tree with slot A active.
#[must_use]
pub fn init_commands(iface: &str) -> Vec<Vec<String>> {
    vec![
        words(&["tc", "qdisc", "add", "dev", iface, "root", "handle", ROOT_QDISC, "htb"]),
        add_class(iface, ROOT_QDISC, QdiscSlot::A.class()),
        add_class(iface, ROOT_QDISC, QdiscSlot::B.class()),
        root_filter(iface, "add", QdiscSlot::A),
        add_qdisc(iface, QdiscSlot::A.class(), QdiscSlot::A.handle(), "htb"),
        add_qdisc(iface, QdiscSlot::B.class(), QdiscSlot::B.handle(), "htb"),
    ]
}

/// Commands emptying both slots; slot A is considered active afterwards.
#[must_use]
pub fn reinit_commands(iface: &str) -> Vec<Vec<String>> {
    vec![
        remove_qdisc(iface, QdiscSlot::A),
        remove_qdisc(iface, QdiscSlot::B),
        add_qdisc(iface, QdiscSlot::A.class(), QdiscSlot::A.handle(), "htb"),
        add_qdisc(iface, QdiscSlot::B.class(), QdiscSlot::B.handle(), "htb"),
    ]
}

/// Commands rebuilding `background` with `restricted` and making it active.
#[must_use]
pub fn update_commands(
    iface: &str,
    background: QdiscSlot,
    restricted: &BTreeMap<Ipv4Addr, ConnectionState>,
) -> Vec<Vec<String>> {
    let parent = background.handle();
    let mut commands = vec![
        remove_qdisc(iface, background),
        add_qdisc(iface, background.class(), parent, "htb"),
    ];
    let mut major = LAST_FIXED_QDISC_MAJOR;
    for (minor, (ip, state)) in (1u32..).zip(restricted) {
        let class = format!("{parent}{minor:x}");
        major = background.next_child_major(major);
        let handle = format!("{major:x}:");
        commands.push(add_class(iface, parent, &class));
        commands.push(ip_filter(iface, parent, &class, *ip));
        commands.push(netem(iface, &class, &handle, state));
    }
    commands.push(root_filter(iface, "replace", background));
    commands
}

/// Joins commands into one `sh -c` script; the first failure stops it.
#[must_use]
pub fn script(commands: &[Vec<String>]) -> String {
    commands
        .iter()
        .map(|c| c.join(" "))
        .collect::<Vec<_>>()
        .join(" && ")
}

// =============================================================================
// Sidecar
// =============================================================================

#[derive(Debug, Default)]
struct SidecarState {
    active: Option<QdiscSlot>,
    enforced: BTreeMap<Ipv4Addr, ConnectionState>,
    applied: Option<SidecarRules>,
}

/// Handle to one service's networking sidecar.
///
/// Calls on one sidecar are serialized; different sidecars are independent.
#[derive(Debug)]
pub struct NetworkingSidecar {
    service_guid: ServiceGuid,
    container_id: String,
    interface: String,
    state: Mutex<SidecarState>,
}

impl NetworkingSidecar {
    /// Wraps a running sidecar container.
    #[must_use]
    pub fn new(service_guid: ServiceGuid, container_id: String, interface: String) -> Self {
        Self {
            service_guid,
            container_id,
            interface,
            state: Mutex::new(SidecarState::default()),
        }
    }

    /// GUID of the owning service.
    #[must_use]
    pub fn service_guid(&self) -> &ServiceGuid {
        &self.service_guid
    }

    /// Sidecar container ID.
    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Installs the fixed `tc` tree. Does nothing if already installed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandFailed`] if `tc` fails.
    pub async fn initialize(&self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.active.is_some() {
            return Ok(());
        }
        self.run(runtime, "tc init", script(&init_commands(&self.interface)))
            .await?;
        state.active = Some(QdiscSlot::A);
        state.enforced.clear();
        Ok(())
    }

    /// Drops whatever tree exists (e.g. after an engine restart, when the
    /// active slot is unknown) and installs a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandFailed`] if the fresh install fails.
    pub async fn reset(&self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let mut state = self.state.lock().await;
        let cmd = format!(
            "tc qdisc del dev {} root 2>/dev/null; {}",
            self.interface,
            script(&init_commands(&self.interface))
        );
        self.run(runtime, "tc reset", cmd).await?;
        *state = SidecarState {
            active: Some(QdiscSlot::A),
            ..SidecarState::default()
        };
        Ok(())
    }

    /// Enforces `rules`. Returns whether any `tc` command ran.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the sidecar was never initialized
    /// - [`Error::CommandFailed`] if `tc` fails; the previous rules stay in
    ///   force
    pub async fn apply(&self, runtime: &dyn ContainerRuntime, rules: &SidecarRules) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(active) = state.active else {
            return Err(Error::InvalidState {
                object: format!("sidecar of {}", self.service_guid),
                state: "uninitialized".to_string(),
                expected: "initialized".to_string(),
            });
        };

        let restricted = rules.restricted();
        if restricted == state.enforced {
            state.applied = Some(rules.clone());
            debug!(guid = %self.service_guid, "sidecar rules unchanged");
            return Ok(false);
        }

        if restricted.is_empty() {
            self.run(runtime, "tc reinit", script(&reinit_commands(&self.interface)))
                .await?;
            state.active = Some(QdiscSlot::A);
        } else {
            let background = active.other();
            let commands = update_commands(&self.interface, background, &restricted);
            self.run(runtime, "tc update", script(&commands)).await?;
            state.active = Some(background);
        }
        info!(
            guid = %self.service_guid,
            restricted_peers = restricted.len(),
            "applied sidecar rules"
        );
        state.enforced = restricted;
        state.applied = Some(rules.clone());
        Ok(true)
    }

    /// The last successfully applied rules.
    pub async fn applied_rules(&self) -> Option<SidecarRules> {
        self.state.lock().await.applied.clone()
    }

    async fn run(&self, runtime: &dyn ContainerRuntime, what: &str, script: String) -> Result<()> {
        debug!(guid = %self.service_guid, command = %script, "running {what} in sidecar");
        let result = runtime
            .exec(
                &self.container_id,
                &["sh".to_string(), "-c".to_string(), script],
            )
            .await?;
        if !result.is_success() {
            return Err(Error::CommandFailed {
                exit_code: result.exit_code,
                output: result.output,
            });
        }
        Ok(())
    }
}
