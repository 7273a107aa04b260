//! In-process multicast DNS advertiser.
//!
//! Each container gets an [`EntryGroup`]. Staged records live in the group
//! until commit, which swaps them into the shared [`RecordTable`] under a
//! single write lock. The [`responder`] answers multicast queries from that
//! table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::error::ProtoResult;
use hickory_proto::rr::rdata::{A, AAAA, PTR, SRV, TXT};
use hickory_proto::rr::{LowerName, Name, RData, Record, RecordType};
use log::{debug, warn};
use tokio::sync::RwLock;

use crate::advert::{AdvertisementHandle, Advertiser};
use crate::container::ServiceRecord;
use crate::error::AdvertiserError;

pub mod responder;

pub use responder::Responder;

const SERVICES_ENUMERATION: &str = "_services._dns-sd._udp.local.";

/// Published records of every committed entry group.
#[derive(Default)]
pub struct RecordTable {
    groups: RwLock<HashMap<u64, Vec<Record>>>,
    online: AtomicBool,
}

impl RecordTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Records matching `name` and `query_type` across all groups.
    pub async fn answers(&self, name: &LowerName, query_type: RecordType) -> Vec<Record> {
        let groups = self.groups.read().await;
        groups
            .values()
            .flatten()
            .filter(|record| {
                query_type == RecordType::ANY || record.record_type() == query_type
            })
            .filter(|record| LowerName::new(record.name()) == *name)
            .cloned()
            .collect()
    }

    async fn published(&self, group: u64) -> usize {
        self.groups.read().await.get(&group).map_or(0, Vec::len)
    }

    async fn replace(&self, group: u64, records: Vec<Record>) {
        let mut groups = self.groups.write().await;
        if records.is_empty() {
            groups.remove(&group);
        } else {
            groups.insert(group, records);
        }
    }
}

/// Creates entry groups backed by a shared [`RecordTable`].
pub struct MdnsAdvertiser {
    table: Arc<RecordTable>,
    ttl: u32,
    next_group: AtomicU64,
}

impl MdnsAdvertiser {
    pub fn new(table: Arc<RecordTable>, ttl: u32) -> Self {
        Self {
            table,
            ttl,
            next_group: AtomicU64::new(0),
        }
    }
}

impl Advertiser for MdnsAdvertiser {
    type Handle = EntryGroup;

    fn new_handle(&self, container_id: &str) -> Result<EntryGroup, AdvertiserError> {
        if !self.table.is_online() {
            return Err(AdvertiserError::Unavailable);
        }
        Ok(EntryGroup {
            id: self.next_group.fetch_add(1, Ordering::Relaxed),
            container_id: container_id.to_string(),
            table: Arc::clone(&self.table),
            ttl: self.ttl,
            staged: Vec::new(),
        })
    }
}

pub struct EntryGroup {
    id: u64,
    container_id: String,
    table: Arc<RecordTable>,
    ttl: u32,
    staged: Vec<Record>,
}

impl EntryGroup {
    fn ensure_online(&self, error: impl FnOnce() -> AdvertiserError) -> Result<(), AdvertiserError> {
        if self.table.is_online() {
            Ok(())
        } else {
            Err(error())
        }
    }

    fn address_records(&self, hostname: &str, addresses: &[IpAddr]) -> ProtoResult<Vec<Record>> {
        let host = Name::from_ascii(fqdn(hostname))?;
        let mut records = Vec::with_capacity(addresses.len() * 2);
        for ip in addresses {
            let rdata = match ip {
                IpAddr::V4(v4) => RData::A(A(*v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
            };
            records.push(Record::from_rdata(host.clone(), self.ttl, rdata));
            records.push(Record::from_rdata(
                Name::from_ascii(reverse_name(ip))?,
                self.ttl,
                RData::PTR(PTR(host.clone())),
            ));
        }
        Ok(records)
    }

    fn service_records(&self, service: &ServiceRecord, hostname: &str) -> ProtoResult<Vec<Record>> {
        let service_type = Name::from_ascii(format!("{}.local.", service.service_type))?;
        let instance = Name::from_labels([service.instance.as_str()])?.append_name(&service_type)?;
        let target = Name::from_ascii(fqdn(hostname))?;
        Ok(vec![
            Record::from_rdata(
                Name::from_ascii(SERVICES_ENUMERATION)?,
                self.ttl,
                RData::PTR(PTR(service_type.clone())),
            ),
            Record::from_rdata(service_type, self.ttl, RData::PTR(PTR(instance.clone()))),
            Record::from_rdata(
                instance.clone(),
                self.ttl,
                RData::SRV(SRV::new(0, 0, service.port, target)),
            ),
            Record::from_rdata(instance, self.ttl, RData::TXT(TXT::new(Vec::new()))),
        ])
    }
}

#[async_trait]
impl AdvertisementHandle for EntryGroup {
    async fn is_empty(&self) -> Result<bool, AdvertiserError> {
        self.ensure_online(|| AdvertiserError::Query("responder is not running".into()))?;
        Ok(self.staged.is_empty() && self.table.published(self.id).await == 0)
    }

    async fn reset(&mut self) -> Result<(), AdvertiserError> {
        self.ensure_online(|| AdvertiserError::Mutation("responder is not running".into()))?;
        self.staged.clear();
        self.table.replace(self.id, Vec::new()).await;
        debug!("Withdrew records for container {}", self.container_id);
        Ok(())
    }

    fn stage_address(&mut self, hostname: &str, addresses: &[IpAddr]) {
        match self.address_records(hostname, addresses) {
            Ok(records) => {
                debug!("Staging {} -> {:?} for {}", hostname, addresses, self.container_id);
                self.staged.extend(records);
            }
            Err(e) => warn!("Skipping address record for {:?}: {}", hostname, e),
        }
    }

    fn stage_service(&mut self, service: &ServiceRecord, hostname: &str) {
        match self.service_records(service, hostname) {
            Ok(records) => {
                debug!(
                    "Staging service {}.{} port {} on {} for {}",
                    service.instance, service.service_type, service.port, hostname, self.container_id
                );
                self.staged.extend(records);
            }
            Err(e) => warn!("Skipping service record {}: {}", service.service_type, e),
        }
    }

    async fn commit(&mut self) -> Result<(), AdvertiserError> {
        self.ensure_online(|| AdvertiserError::Mutation("responder is not running".into()))?;
        let records = std::mem::take(&mut self.staged);
        self.table.replace(self.id, records).await;
        Ok(())
    }
}

fn fqdn(hostname: &str) -> String {
    if hostname.ends_with('.') {
        hostname.to_string()
    } else {
        format!("{}.", hostname)
    }
}

fn reverse_name(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", d, c, b, a)
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(73);
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
            }
            name.push_str("ip6.arpa.");
            name
        }
    }
}
