//! Seam between the controller and the advertiser backend.
//!
//! An [`AdvertisementHandle`] is the set of records published on behalf of
//! one container. Records are staged in memory and become visible on the
//! network only when [`AdvertisementHandle::commit`] succeeds.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::container::ServiceRecord;
use crate::error::AdvertiserError;

#[async_trait]
pub trait AdvertisementHandle: Send + 'static {
    /// Whether the handle neither publishes nor stages any record. Records
    /// left staged by a failed commit make the handle non-empty, so the
    /// next reset drops them.
    async fn is_empty(&self) -> Result<bool, AdvertiserError>;

    /// Withdraws everything published under this handle and drops any
    /// staged records.
    async fn reset(&mut self) -> Result<(), AdvertiserError>;

    fn stage_address(&mut self, hostname: &str, addresses: &[IpAddr]);

    fn stage_service(&mut self, service: &ServiceRecord, hostname: &str);

    /// Publishes the staged records in one step, replacing whatever was
    /// published before. The staging set is empty afterwards.
    async fn commit(&mut self) -> Result<(), AdvertiserError>;
}

/// Creates advertisement handles.
pub trait Advertiser: Send + Sync + 'static {
    type Handle: AdvertisementHandle;

    fn new_handle(&self, container_id: &str) -> Result<Self::Handle, AdvertiserError>;
}
