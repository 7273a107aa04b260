//! dockmdns daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

mod advert;
mod config;
mod container;
mod controller;
mod error;
mod hostname;
mod mdns;
mod registry;
mod runtime;
mod services;

use config::Config;
use controller::Controller;
use hostname::PolicyResolver;
use mdns::{MdnsAdvertiser, RecordTable, Responder};
use runtime::DockerRuntime;
use services::ServiceTable;

/// Signals that stop the daemon. The process exits with the signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Interrupt,
    Terminate,
}

impl Shutdown {
    fn exit_code(self) -> i32 {
        match self {
            Shutdown::Interrupt => 2,
            Shutdown::Terminate => 15,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting dockmdns with config: {:?}", cfg);

    let services = ServiceTable::load(&cfg.services_file);
    let hostnames = PolicyResolver::new(cfg.hostname_policies()?)?;
    let runtime = DockerRuntime::connect()?;

    // mDNS responder and the record table it serves
    let table = RecordTable::new();
    let responder = Responder::bind(cfg.mdns_bind, Arc::clone(&table))?;
    let responder_handle = tokio::spawn(async move {
        if let Err(e) = responder.run().await {
            error!("mDNS responder failed: {}", e);
        }
    });

    let controller = Arc::new(
        Controller::new(
            runtime,
            MdnsAdvertiser::new(table, cfg.ttl),
            hostnames,
            services,
        )
        .evict_withdrawn(cfg.evict_withdrawn),
    );

    // The loop only ends on its own when the event stream fails.
    let controller_handle = tokio::spawn(controller.run(std::future::pending()));

    tokio::select! {
        signal = wait_for_signal() => {
            let signal = signal?;
            info!("Shutting down on {:?}", signal);
            // Published records are left to expire; nothing is withdrawn on exit.
            responder_handle.abort();
            std::process::exit(signal.exit_code());
        }
        joined = controller_handle => {
            responder_handle.abort();
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.context("container event loop failed")),
                Err(e) => Err(anyhow::anyhow!("container event loop panicked: {}", e)),
            }
        }
    }
}

/// Waits for SIGTERM or Ctrl+C.
#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<Shutdown> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => Ok(Shutdown::Terminate),
        result = signal::ctrl_c() => {
            result?;
            Ok(Shutdown::Interrupt)
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<Shutdown> {
    signal::ctrl_c().await?;
    Ok(Shutdown::Interrupt)
}
