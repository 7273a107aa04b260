//! Container metadata and the records derived from it.
//!
//! A [`ContainerDetail`] is the runtime-agnostic view of an inspected
//! container. The controller turns it into one [`AddressRecord`] per
//! hostname and a [`ServiceRecord`] per exposed port that maps to a
//! well-known service.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

use log::debug;

use crate::services::{Protocol, ServiceTable};

/// Lifecycle status carried by a container event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Start,
    Unpause,
    Die,
    Kill,
    Pause,
    Other(String),
}

impl Status {
    pub fn parse(action: &str) -> Self {
        match action {
            "start" => Status::Start,
            "unpause" => Status::Unpause,
            "die" => Status::Die,
            "kill" => Status::Kill,
            "pause" => Status::Pause,
            other => Status::Other(other.to_string()),
        }
    }

    /// Events after which the container must not be advertised.
    pub fn is_withdrawal(&self) -> bool {
        matches!(self, Status::Die | Status::Kill | Status::Pause)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Start => f.write_str("start"),
            Status::Unpause => f.write_str("unpause"),
            Status::Die => f.write_str("die"),
            Status::Kill => f.write_str("kill"),
            Status::Pause => f.write_str("pause"),
            Status::Other(s) => f.write_str(s),
        }
    }
}

/// A lifecycle notification for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub status: Status,
    /// Unix time in seconds, when the runtime reported one.
    pub observed_at: Option<i64>,
}

impl ContainerEvent {
    pub fn new(container_id: impl Into<String>, status: Status) -> Self {
        Self {
            container_id: container_id.into(),
            status,
            observed_at: None,
        }
    }
}

/// Everything the controller needs to know about a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetail {
    pub id: String,
    /// Name without the leading `/`.
    pub name: String,
    pub ip_addresses: Vec<IpAddr>,
    /// Port map keys such as `80/tcp`.
    pub ports: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerDetail {
    /// Derives DNS-SD service types from the exposed ports.
    ///
    /// Ports that do not parse, or that have no well-known service for
    /// their protocol, are skipped.
    pub fn services(&self, table: &ServiceTable) -> BTreeMap<String, u16> {
        let mut services = BTreeMap::new();
        for key in &self.ports {
            let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let Ok(port) = port.parse::<u16>() else {
                debug!("Could not get port number from {:?}", key);
                continue;
            };
            let Ok(proto) = proto.parse::<Protocol>() else {
                continue;
            };
            if let Some(service) = table.lookup(port, proto) {
                services.insert(format!("_{}._{}", service, proto), port);
            }
        }
        services
    }

    /// One address record per hostname, each carrying every IP.
    pub fn address_records(&self, hostnames: &[String]) -> Vec<AddressRecord> {
        hostnames
            .iter()
            .map(|hostname| AddressRecord {
                hostname: hostname.clone(),
                addresses: self.ip_addresses.clone(),
            })
            .collect()
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(key, _)| *key == name)
                .map(|(_, value)| value)
        })
    }
}

/// Address record: one hostname carrying all of the container's IPs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

/// DNS-SD service record published for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Instance label, the container name.
    pub instance: String,
    /// Service type such as `_http._tcp`.
    pub service_type: String,
    pub port: u16,
}

impl ServiceRecord {
    pub fn from_services(
        instance: &str,
        services: &BTreeMap<String, u16>,
    ) -> Vec<ServiceRecord> {
        services
            .iter()
            .map(|(service_type, port)| ServiceRecord {
                instance: instance.to_string(),
                service_type: service_type.clone(),
                port: *port,
            })
            .collect()
    }
}
