//! Per-container advertisement handles behind exclusive locks.
//!
//! Every container id maps to one handle. A handler obtains it through
//! [`Registry::acquire`], which waits while another handler for the same
//! container holds it and never waits on other containers. The returned
//! [`HandleGuard`] releases the lock when dropped, so early returns and
//! errors cannot leak it.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use tokio::sync::{Mutex as HandleLock, OwnedMutexGuard};

use crate::advert::Advertiser;
use crate::error::AdvertiserError;

type Entry<H> = Arc<HandleLock<H>>;

pub struct Registry<A: Advertiser> {
    advertiser: A,
    entries: Mutex<HashMap<String, Entry<A::Handle>>>,
}

impl<A: Advertiser> Registry<A> {
    pub fn new(advertiser: A) -> Self {
        Self {
            advertiser,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the lock for `container_id`, creating an empty handle on
    /// first use. Nothing is registered if creation fails.
    pub fn entry(&self, container_id: &str) -> Result<Entry<A::Handle>, AdvertiserError> {
        let mut entries = self.entries();
        if let Some(entry) = entries.get(container_id) {
            return Ok(Arc::clone(entry));
        }
        let handle = self.advertiser.new_handle(container_id)?;
        let entry = Arc::new(HandleLock::new(handle));
        entries.insert(container_id.to_string(), Arc::clone(&entry));
        debug!("Registered advertisement handle for {}", container_id);
        Ok(entry)
    }

    /// Locks the handle for `container_id`, waiting for any handler that
    /// currently holds it.
    pub async fn acquire(
        &self,
        container_id: &str,
    ) -> Result<HandleGuard<A::Handle>, AdvertiserError> {
        let entry = self.entry(container_id)?;
        Ok(HandleGuard::new(container_id, entry.lock_owned().await))
    }

    /// Drops the registry entry held by `guard` unless another handler is
    /// already queued on it. Returns whether the entry was removed.
    ///
    /// The caller must only evict handles that are withdrawn.
    pub fn evict(&self, guard: HandleGuard<A::Handle>) -> bool {
        let mut entries = self.entries();
        let lock = OwnedMutexGuard::mutex(&guard.inner);
        let Some(entry) = entries.get(&guard.container_id) else {
            return false;
        };
        // One reference in the map, one in the guard; any other is a waiter.
        if !Arc::ptr_eq(entry, lock) || Arc::strong_count(lock) > 2 {
            return false;
        }
        entries.remove(&guard.container_id);
        debug!("Evicted advertisement handle for {}", guard.container_id);
        true
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[cfg(test)]
    pub fn contains(&self, container_id: &str) -> bool {
        self.entries().contains_key(container_id)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry<A::Handle>>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive access to one container's handle. Dropping it releases the lock.
pub struct HandleGuard<H> {
    container_id: String,
    inner: OwnedMutexGuard<H>,
}

impl<H> HandleGuard<H> {
    pub(crate) fn new(container_id: &str, inner: OwnedMutexGuard<H>) -> Self {
        Self {
            container_id: container_id.to_string(),
            inner,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

impl<H> Deref for HandleGuard<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.inner
    }
}

impl<H> DerefMut for HandleGuard<H> {
    fn deref_mut(&mut self) -> &mut H {
        &mut self.inner
    }
}
