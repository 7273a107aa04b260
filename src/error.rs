//! Error kinds raised while handling a single container event.
//!
//! None of these abort the process: the controller logs them and moves on
//! to the next event. Only a failure of the live event stream is fatal, and
//! that surfaces as an [`anyhow::Error`] from the controller loop.

use thiserror::Error;

/// Failures talking to the advertiser backend.
#[derive(Debug, Error)]
pub enum AdvertiserError {
    /// Reading advertiser state (e.g. the emptiness of a group) failed.
    #[error("advertiser query failed: {0}")]
    Query(String),
    /// Publishing or withdrawing records failed.
    #[error("advertiser mutation failed: {0}")]
    Mutation(String),
    /// The advertiser backend is not running.
    #[error("advertiser is unavailable")]
    Unavailable,
}

/// Failures talking to the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error("container response is missing `{0}`")]
    MissingField(&'static str),
    #[error("event stream failed: {0}")]
    EventStream(String),
}

/// Failures resolving hostnames for a container.
#[derive(Debug, Error)]
pub enum HostnameError {
    #[error("hostname lookup failed: {0}")]
    Lookup(String),
    #[error("invalid hostname lookup policy `{0}`")]
    InvalidPolicy(String),
}

/// Why handling of one container event stopped early.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("cannot get advertisement handle for container: {0}")]
    Acquire(#[source] AdvertiserError),
    #[error("checking whether advertisement handle is empty: {0}")]
    IsEmpty(#[source] AdvertiserError),
    #[error("resetting advertisement handle: {0}")]
    Reset(#[source] AdvertiserError),
    #[error("inspecting container: {0}")]
    Inspect(#[source] RuntimeError),
    #[error("getting hostnames: {0}")]
    Hostnames(#[source] HostnameError),
    #[error("committing advertisement handle: {0}")]
    Commit(#[source] AdvertiserError),
}
