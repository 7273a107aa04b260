//! Container lifecycle → advertisement synchronisation.
//!
//! Every event runs the same steps against the container's advertisement
//! handle, while holding that container's registry lock:
//!
//! 1. withdraw whatever is published (skipped when already empty),
//! 2. stop there for `die`, `kill` and `pause`,
//! 3. otherwise inspect the container, resolve its hostnames, stage one
//!    address record per hostname plus its services, and commit.
//!
//! Withdrawal always comes before population, so a failure part-way
//! leaves the container unadvertised rather than half-advertised.
//!
//! At startup the running containers are replayed as `start` events and
//! the live subscription begins at a timestamp taken *before* listing
//! them. An event racing the listing may be handled twice, which is
//! harmless because every handler starts from a reset.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::Poll;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use futures_util::future::{self, Either};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;

use crate::advert::{AdvertisementHandle, Advertiser};
use crate::container::{ContainerEvent, ServiceRecord, Status};
use crate::error::HandleError;
use crate::hostname::HostnameResolver;
use crate::registry::{HandleGuard, Registry};
use crate::runtime::ContainerRuntime;
use crate::services::ServiceTable;

/// What handling one event left published for the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Withdrawn,
    /// Running, but without an IP address there is nothing to publish.
    NoAddress,
    Advertised { hostnames: usize, services: usize },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Withdrawn => f.write_str("withdrawn"),
            Outcome::NoAddress => f.write_str("no IP address, nothing advertised"),
            Outcome::Advertised {
                hostnames,
                services,
            } => write!(f, "advertised {} hostnames and {} services", hostnames, services),
        }
    }
}

pub struct Controller<R, A: Advertiser, H> {
    runtime: R,
    registry: Registry<A>,
    hostnames: H,
    services: ServiceTable,
    evict_withdrawn: bool,
}

impl<R, A, H> Controller<R, A, H>
where
    R: ContainerRuntime,
    A: Advertiser,
    H: HostnameResolver,
{
    pub fn new(runtime: R, advertiser: A, hostnames: H, services: ServiceTable) -> Self {
        Self {
            runtime,
            registry: Registry::new(advertiser),
            hostnames,
            services,
            evict_withdrawn: true,
        }
    }

    pub fn evict_withdrawn(mut self, evict: bool) -> Self {
        self.evict_withdrawn = evict;
        self
    }

    /// Brings the advertisement for `container_id` in line with `status`.
    pub async fn handle_event(
        &self,
        container_id: &str,
        status: &Status,
    ) -> Result<Outcome, HandleError> {
        let guard = self
            .registry
            .acquire(container_id)
            .await
            .map_err(HandleError::Acquire)?;
        self.handle_locked(guard, status).await
    }

    async fn handle_locked(
        &self,
        mut handle: HandleGuard<A::Handle>,
        status: &Status,
    ) -> Result<Outcome, HandleError> {
        let container_id = handle.container_id().to_string();

        let mut withdrawn = handle.is_empty().await.map_err(HandleError::IsEmpty)?;
        if !withdrawn {
            match handle.reset().await {
                Ok(()) => withdrawn = true,
                Err(e) => warn!("{}: {}", container_id, HandleError::Reset(e)),
            }
        }

        if status.is_withdrawal() {
            if *status == Status::Die && self.evict_withdrawn && withdrawn {
                self.registry.evict(handle);
            }
            return Ok(Outcome::Withdrawn);
        }

        let container = self
            .runtime
            .inspect_container(&container_id)
            .await
            .map_err(HandleError::Inspect)?;
        if container.ip_addresses.is_empty() {
            return Ok(Outcome::NoAddress);
        }

        let hostnames = self
            .hostnames
            .hostnames(&container)
            .await
            .map_err(HandleError::Hostnames)?;
        for record in container.address_records(&hostnames) {
            handle.stage_address(&record.hostname, &record.addresses);
        }

        // Services are only published under the first hostname.
        let mut services = Vec::new();
        if let Some(hostname) = hostnames.first() {
            services = ServiceRecord::from_services(
                &container.name,
                &container.services(&self.services),
            );
            for service in &services {
                handle.stage_service(service, hostname);
            }
        }

        handle.commit().await.map_err(HandleError::Commit)?;
        Ok(Outcome::Advertised {
            hostnames: hostnames.len(),
            services: services.len(),
        })
    }

    /// Replays every running container as a `start` event.
    pub async fn reconcile(&self) {
        let ids = match self.runtime.list_containers().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("getting container list: {}", e);
                return;
            }
        };
        info!("Found {} running containers", ids.len());

        future::join_all(ids.iter().map(|id| async move {
            let result = self.handle_event(id, &Status::Start).await;
            report(id, &Status::Start, result);
        }))
        .await;
        info!("Tracking {} containers", self.registry.len());
    }

    /// Reconciles, then follows live events until `shutdown` resolves.
    ///
    /// Returns an error only when the event stream fails or ends.
    pub async fn run<S>(self: Arc<Self>, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()>,
    {
        let started = unix_now();
        self.reconcile().await;

        let mut events = self.runtime.events(started);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);
        info!("Listening for container events since {}", started);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    return Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Event handler task failed: {}", e);
                    }
                }
                msg = events.next() => match msg {
                    Some(Ok(event)) => self.dispatch(event, &mut tasks).await,
                    Some(Err(e)) => return Err(anyhow!("reading container events: {}", e)),
                    None => return Err(anyhow!("container event stream ended")),
                },
            }
        }
    }

    /// Starts handling `event` on its own task.
    async fn dispatch(self: &Arc<Self>, event: ContainerEvent, tasks: &mut JoinSet<()>) {
        debug!(
            "Dispatching {} for {} (reported at {:?})",
            event.status,
            short_id(&event.container_id),
            event.observed_at
        );
        let entry = match self.registry.entry(&event.container_id) {
            Ok(entry) => entry,
            Err(e) => {
                report(&event.container_id, &event.status, Err(HandleError::Acquire(e)));
                return;
            }
        };

        // Polled once here so the handler joins the container's wait queue
        // before the next event is read; same-container events keep their order.
        let mut lock = Box::pin(entry.lock_owned());
        let polled = futures_util::poll!(lock.as_mut());
        let lock = match polled {
            Poll::Ready(guard) => Either::Left(future::ready(guard)),
            Poll::Pending => Either::Right(lock),
        };

        let controller = Arc::clone(self);
        tasks.spawn(async move {
            let guard = HandleGuard::new(&event.container_id, lock.await);
            let result = controller.handle_locked(guard, &event.status).await;
            report(&event.container_id, &event.status, result);
        });
    }
}

fn report(container_id: &str, status: &Status, result: Result<Outcome, HandleError>) {
    match result {
        Ok(outcome) => info!("Container {} {}: {}", short_id(container_id), status, outcome),
        Err(e) => error!(
            "handling container {} ({}): {}",
            short_id(container_id),
            status,
            e
        ),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests;
