//! Hostname resolution for containers.
//!
//! Hostnames come from an ordered list of lookup policies. Each result is
//! rewritten into the `.local` domain, since that is the only domain mDNS
//! answers for.

use std::str::FromStr;

use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};

use crate::container::ContainerDetail;
use crate::error::HostnameError;

#[async_trait]
pub trait HostnameResolver: Send + Sync + 'static {
    /// Hostnames for `container`, in policy order, without duplicates.
    async fn hostnames(&self, container: &ContainerDetail) -> Result<Vec<String>, HostnameError>;
}

/// One way of finding hostnames for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// `env:NAME` reads a comma and/or space separated list from an env var.
    Env(String),
    /// `label:NAME` reads the same format from a container label.
    Label(String),
    /// `containerName`.
    ContainerName,
    /// `reverse` looks up PTR records for the container's addresses.
    Reverse,
}

impl FromStr for Lookup {
    type Err = HostnameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HostnameError::InvalidPolicy(s.to_string());
        match s.split_once(':') {
            Some(("env", name)) if !name.is_empty() => Ok(Lookup::Env(name.to_string())),
            Some(("label", name)) if !name.is_empty() => Ok(Lookup::Label(name.to_string())),
            Some(_) => Err(invalid()),
            None => match s {
                "containerName" => Ok(Lookup::ContainerName),
                "reverse" => Ok(Lookup::Reverse),
                _ => Err(invalid()),
            },
        }
    }
}

pub fn parse_policies<S: AsRef<str>>(policies: &[S]) -> Result<Vec<Lookup>, HostnameError> {
    policies.iter().map(|p| p.as_ref().parse()).collect()
}

/// Resolves hostnames with a fixed list of [`Lookup`] policies.
pub struct PolicyResolver {
    policies: Vec<Lookup>,
    resolver: Option<TokioAsyncResolver>,
}

impl PolicyResolver {
    /// The system resolver is only loaded when a `reverse` policy is present.
    pub fn new(policies: Vec<Lookup>) -> Result<Self, HostnameError> {
        let resolver = if policies.contains(&Lookup::Reverse) {
            let resolver = TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| HostnameError::Lookup(format!("loading resolv.conf: {}", e)))?;
            Some(resolver)
        } else {
            None
        };
        Ok(Self { policies, resolver })
    }

    async fn reverse(&self, container: &ContainerDetail) -> Result<Vec<String>, HostnameError> {
        let Some(resolver) = &self.resolver else {
            return Ok(Vec::new());
        };
        let mut names = Vec::new();
        for ip in &container.ip_addresses {
            match resolver.reverse_lookup(*ip).await {
                Ok(lookup) => names.extend(lookup.iter().map(|ptr| ptr.to_string())),
                Err(e) if is_missing_records(&e) => {
                    debug!("No PTR records for {} of {}", ip, container.name)
                }
                Err(e) => return Err(HostnameError::Lookup(format!("{}: {}", ip, e))),
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl HostnameResolver for PolicyResolver {
    async fn hostnames(&self, container: &ContainerDetail) -> Result<Vec<String>, HostnameError> {
        let mut raw = Vec::new();
        for policy in &self.policies {
            match policy {
                Lookup::Env(name) => raw.extend(split_list(container.env_value(name))),
                Lookup::Label(name) => {
                    raw.extend(split_list(container.labels.get(name).map(String::as_str)))
                }
                Lookup::ContainerName => raw.push(container.name.clone()),
                Lookup::Reverse => raw.extend(self.reverse(container).await?),
            }
        }

        let mut hostnames: Vec<String> = Vec::with_capacity(raw.len());
        for name in raw {
            match rewrite_hostname(&name) {
                Some(hostname) if !hostnames.contains(&hostname) => hostnames.push(hostname),
                Some(_) => {}
                None => warn!("Ignoring unusable hostname {:?} for {}", name, container.name),
            }
        }
        Ok(hostnames)
    }
}

/// An address without PTR records is not a lookup failure.
fn is_missing_records(error: &ResolveError) -> bool {
    matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(|c| c == ',' || c == ' ')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Maps an arbitrary name into a single label under `.local`.
///
/// `www.example.com` becomes `www-example-com.local`, `web.local` stays.
pub fn rewrite_hostname(name: &str) -> Option<String> {
    let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
    let name = name.strip_suffix(".local").unwrap_or(&name);

    let label: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        return None;
    }
    Some(format!("{}.local", label))
}
