//! Promfetch
//!
//! Serves the merged Prometheus metrics of every instance of a Consul service.

mod api;
mod config;
mod health;
mod logging;

use anyhow::{Context, Result}; // alias std::result::Result with dynamic error type
use futures::channel::oneshot;
use futures::future::{self, Either};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use promfetch_core::error::log_error;
use promfetch_core::{BackendFactory, ConsulRouteSource, Counters, MetricsFetcher, Scraper};

use crate::config::Config;
use crate::health::Health;

/// How long to keep answering requests after a shutdown signal.
const DRAIN_PERIOD: Duration = Duration::from_secs(5);

/// The program's main entry point.
fn main() -> Result<()> {
    let (config, debug) = Config::load()?;
    logging::init(&config.logging, debug)?;

    let (send_shutdown, recv_shutdown) = oneshot::channel::<()>();

    // When we receive a SIGINT (or SIGTERM) signal, begin exiting.
    let signal_once = Cell::new(Some(send_shutdown));
    ctrlc::set_handler(move || {
        // The first time we receive the signal, shutdown gracefully
        if let Some(sender) = signal_once.take() {
            sender.send(()).ok();
        }
        // The second time we receive the signal, shutdown immediately
        else {
            std::process::exit(1);
        }
    })?;

    // Start the main event loop
    let result = async_std::task::block_on(run(config, recv_shutdown));
    if let Err(err) = &result {
        log_error(err);
    }
    result
}

/// The main thread's event loop
async fn run(config: Config, shutdown: oneshot::Receiver<()>) -> Result<()> {
    let counters = Arc::new(Counters::new());
    let backends = BackendFactory::new(&config.backend()).context("creating scrape client")?;
    let routes = ConsulRouteSource::new(config.consul.clone()).context("creating consul client")?;
    let fetcher = MetricsFetcher::new(
        Scraper::new(backends),
        Arc::new(routes),
        config.external_exporters,
        counters.clone(),
    );
    log::info!(
        "{} external exporter(s) configured, consul at {}://{}",
        fetcher.external_exporters().len(),
        config.consul.scheme,
        config.consul.address
    );

    let health = Health::new();
    let api = api::server(api::State {
        fetcher,
        counters,
        base_url: config.base_url,
    });
    let health_check = health::server(health.clone());

    let api_addr = format!("0.0.0.0:{}", config.port);
    let health_addr = format!("0.0.0.0:{}", config.health_check_port);
    log::info!("listening on {}, health check on {}", api_addr, health_addr);
    let listeners = future::try_join(api.listen(api_addr), health_check.listen(health_addr));

    // Serve until the process is killed, or a listener fails
    futures::pin_mut!(listeners);
    match future::select(listeners, shutdown).await {
        Either::Left((result, _)) => {
            result.context("serving http")?;
        }
        Either::Right((_, listeners)) => {
            // Serve while degraded until the drain period ends
            health.degrade();
            log::info!("shutting down, draining for {:?}", DRAIN_PERIOD);
            if let Ok(result) = async_std::future::timeout(DRAIN_PERIOD, listeners).await {
                result.context("serving http")?;
            }
            log::info!("server gracefully shutdown");
        }
    }
    Ok(())
}
