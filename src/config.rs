use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::hostname::{parse_policies, Lookup};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Ordered hostname lookup policies, e.g. `env:VIRTUAL_HOST`.
    pub hostname_lookup: Vec<String>,
    pub services_file: PathBuf,
    pub mdns_bind: SocketAddr,
    /// TTL in seconds of published records.
    pub ttl: u32,
    /// Forget a container's handle once a `die` event has withdrawn it.
    pub evict_withdrawn: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname_lookup: vec!["env:VIRTUAL_HOST".into(), "containerName".into()],
            services_file: "/etc/services".into(),
            mdns_bind: SocketAddr::from(([0, 0, 0, 0], 5353)),
            ttl: 120,
            evict_withdrawn: true,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("dockmdns.toml"))
                .merge(Json::file("dockmdns.json"))
                .merge(Env::prefixed("DOCKMDNS_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Reject typos in policies before any container is handled.
        config.hostname_policies()?;
        Ok(config)
    }

    pub fn hostname_policies(&self) -> anyhow::Result<Vec<Lookup>> {
        parse_policies(&self.hostname_lookup)
            .map_err(|e| anyhow::anyhow!("Invalid hostname_lookup: {}", e))
    }
}
