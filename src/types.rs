//! Data structures shared by the runtime adapter, the bridge and the
//! registry backends.
//!
//! [`Container`] is a runtime-neutral snapshot of what the container
//! engine reports about one container.  [`ServiceRecord`] is what gets
//! announced to the registry, and [`RegistrationEntry`] is the local
//! bookkeeping of what this host has announced.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of the truncated container ID used in logs and identities.
pub const SHORT_ID_LEN: usize = 12;

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exposed container port and, when published, its host binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub exposed_port: u16,
    pub protocol: Protocol,
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

impl PortMapping {
    /// Parses Docker's `"80/tcp"` port key. A missing protocol means TCP.
    pub fn parse_key(key: &str) -> Option<(u16, Protocol)> {
        let (port, proto) = match key.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (key, "tcp"),
        };
        let protocol = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return None,
        };
        port.parse().ok().map(|p| (p, protocol))
    }
}

/// Snapshot of a container as reported by the runtime.
#[derive(Debug, Clone, Default)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    /// Network name -> container IP on that network.
    pub networks: BTreeMap<String, String>,
    pub network_mode: Option<String>,
}

impl Container {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// First non-empty IP the container holds on any attached network.
    pub fn internal_ip(&self) -> Option<&str> {
        self.networks
            .values()
            .map(String::as_str)
            .find(|ip| !ip.is_empty())
    }

    pub fn uses_host_network(&self) -> bool {
        self.network_mode.as_deref() == Some("host")
    }
}

/// Truncates a container ID to its display form.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Identity of a registered service.
///
/// Generated identities follow `<host>:<short id>:<port>[:udp]`, which is
/// what dangling cleanup uses to attribute a remote entry to this host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate(hostname: &str, container_id: &str, port: u16, protocol: Protocol) -> Self {
        let mut id = format!("{}:{}:{}", hostname, short_id(container_id), port);
        if protocol == Protocol::Udp {
            id.push_str(":udp");
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits a generated identity into `(host, short container id)`.
    ///
    /// Returns `None` for identities that do not follow the generated
    /// layout, such as explicit `SERVICE_ID` overrides.
    pub fn origin(&self) -> Option<(&str, &str)> {
        let mut parts = self.0.split(':');
        let host = parts.next()?;
        let container = parts.next()?;
        let port = parts.next()?;
        match parts.next() {
            None | Some("udp") => {}
            Some(_) => return None,
        }
        if parts.next().is_some()
            || host.is_empty()
            || container.len() != SHORT_ID_LEN
            || port.parse::<u16>().is_err()
        {
            return None;
        }
        Some((host, container))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A service derived from one container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub protocol: Protocol,
    pub tags: Vec<String>,
    pub attrs: BTreeMap<String, String>,
    pub container_id: String,
    /// Seconds until the registry expires the entry without a refresh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Registration state of a locally tracked service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Pending,
    Registered,
    Failed,
}

/// What this host believes it has told the registry about one service.
#[derive(Debug, Clone)]
pub struct RegistrationEntry {
    pub record: ServiceRecord,
    pub state: RegistrationState,
    /// Time of the last successful write to the registry.
    pub last_registered: Option<DateTime<Utc>>,
}

impl RegistrationEntry {
    pub fn pending(record: ServiceRecord) -> Self {
        Self {
            record,
            state: RegistrationState::Pending,
            last_registered: None,
        }
    }

    pub fn registered(record: ServiceRecord) -> Self {
        Self {
            record,
            state: RegistrationState::Registered,
            last_registered: Some(Utc::now()),
        }
    }

    pub fn id(&self) -> &ServiceId {
        &self.record.id
    }

    #[cfg(test)]
    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }

    pub fn is_failed(&self) -> bool {
        self.state == RegistrationState::Failed
    }
}

/// Container lifecycle actions the daemon reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Unpause,
    Die,
    Kill,
    Other(String),
}

impl EventAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "start" => EventAction::Start,
            "unpause" => EventAction::Unpause,
            "die" => EventAction::Die,
            "kill" => EventAction::Kill,
            other => EventAction::Other(other.to_string()),
        }
    }
}

/// A lifecycle event emitted by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub container_id: String,
    pub action: EventAction,
}
