//! Well-known service names, keyed by port and transport protocol.
//!
//! The table is read from an `/etc/services`-style file. When the file is
//! missing a small built-in table is used so common web and database ports
//! are still advertised.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};

/// Transport protocols that DNS-SD service types can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

const BUILTIN: &[(&str, u16, Protocol)] = &[
    ("ftp", 21, Protocol::Tcp),
    ("ssh", 22, Protocol::Tcp),
    ("smtp", 25, Protocol::Tcp),
    ("domain", 53, Protocol::Tcp),
    ("domain", 53, Protocol::Udp),
    ("http", 80, Protocol::Tcp),
    ("pop3", 110, Protocol::Tcp),
    ("imap2", 143, Protocol::Tcp),
    ("ldap", 389, Protocol::Tcp),
    ("https", 443, Protocol::Tcp),
    ("submission", 587, Protocol::Tcp),
    ("imaps", 993, Protocol::Tcp),
    ("mysql", 3306, Protocol::Tcp),
    ("postgresql", 5432, Protocol::Tcp),
    ("amqp", 5672, Protocol::Tcp),
    ("redis", 6379, Protocol::Tcp),
    ("http-alt", 8080, Protocol::Tcp),
];

#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    by_port: HashMap<(u16, Protocol), String>,
}

impl ServiceTable {
    pub fn builtin() -> Self {
        let by_port = BUILTIN
            .iter()
            .map(|(name, port, proto)| ((*port, *proto), (*name).to_string()))
            .collect();
        Self { by_port }
    }

    /// Loads `path`, falling back to [`ServiceTable::builtin`] if it cannot be read.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let table = Self::parse(&contents);
                debug!("Loaded {} services from {}", table.len(), path.display());
                table
            }
            Err(e) => {
                warn!(
                    "Cannot read services file {}: {}. Using built-in table.",
                    path.display(),
                    e
                );
                Self::builtin()
            }
        }
    }

    /// Parses `name port/proto [aliases...] [# comment]` lines.
    ///
    /// The first entry for a port/protocol pair wins, matching how the C
    /// library answers `getservbyport`.
    pub fn parse(contents: &str) -> Self {
        let mut by_port = HashMap::new();
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = port_proto.split_once('/') else {
                continue;
            };
            let (Ok(port), Ok(proto)) = (port.parse::<u16>(), proto.parse::<Protocol>()) else {
                continue;
            };
            by_port
                .entry((port, proto))
                .or_insert_with(|| name.to_string());
        }
        Self { by_port }
    }

    pub fn lookup(&self, port: u16, proto: Protocol) -> Option<&str> {
        self.by_port.get(&(port, proto)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }
}
