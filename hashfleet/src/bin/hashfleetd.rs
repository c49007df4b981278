//! Fleet controller daemon.
//!
//! Reads the fleet definition from `HASHFLEET_FLEET` (JSON) and tuning from
//! the `HASHFLEET_*` environment, then polls, evaluates and dispatches
//! until interrupted.

use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use hashfleet::adapter::avalon::{self, AvalonAdapter};
use hashfleet::adapter::bitaxe::{self, BitaxeAdapter};
use hashfleet::adapter::nmminer::{self, NmMinerAdapter, PacketCache, UdpListener};
use hashfleet::adapter::AdapterSet;
use hashfleet::api;
use hashfleet::config::{ControllerConfig, FleetConfig};
use hashfleet::controller::Controller;
use hashfleet::device::{DeviceFamily, DeviceId};
use hashfleet::notify::LogNotifier;
use hashfleet::persistence::MemoryPersistence;
use hashfleet::price::{PriceSignal, SlotTable, agile};
use hashfleet::telemetry::TelemetryStore;
use hashfleet::tracing::{self, prelude::*};

const DEFAULT_FLEET: &str = "fleet.json";

/// Octopus Agile when a tariff is configured, otherwise no prices (the
/// fleet holds its band).
fn price_signal() -> Result<Arc<dyn PriceSignal>> {
    let Ok(tariff) = env::var("HASHFLEET_AGILE_TARIFF") else {
        warn!("HASHFLEET_AGILE_TARIFF unset, running without a price feed");
        return Ok(Arc::new(SlotTable::default()));
    };
    let product = env::var("HASHFLEET_AGILE_PRODUCT")
        .context("HASHFLEET_AGILE_PRODUCT is required with HASHFLEET_AGILE_TARIFF")?;
    let base_url =
        env::var("HASHFLEET_AGILE_URL").unwrap_or_else(|_| agile::DEFAULT_BASE_URL.to_owned());
    info!(%product, %tariff, "Using Agile price feed");
    Ok(Arc::new(agile::AgileClient::new(&base_url, &product, &tariff)?))
}

/// Broadcast-family devices keyed by the address their packets come from.
fn udp_sources(fleet: &FleetConfig) -> HashMap<IpAddr, DeviceId> {
    fleet
        .devices
        .iter()
        .filter(|d| d.family == DeviceFamily::NmMiner)
        .filter_map(|d| match d.address.parse() {
            Ok(ip) => Some((ip, d.id.clone())),
            Err(_) => {
                warn!(device = %d.id, address = %d.address, "Not an IP address, ignoring broadcasts");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = ControllerConfig::from_env()?;
    let fleet_path = env::var_os("HASHFLEET_FLEET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FLEET));
    let fleet = FleetConfig::load(&fleet_path)
        .with_context(|| format!("loading fleet from {}", fleet_path.display()))?;
    info!(path = %fleet_path.display(), devices = fleet.devices.len(), "Fleet loaded");

    let cancellation = CancellationToken::new();
    let store = Arc::new(TelemetryStore::new(config.offline_after, config.stale_after()));

    let cache = PacketCache::default();
    let listener = UdpListener::bind(
        SocketAddr::from(([0, 0, 0, 0], config.udp_telemetry_port)),
        cache.clone(),
    )
    .await
    .context("binding UDP status listener")?
    .with_store(Arc::clone(&store), udp_sources(&fleet));

    let mut nm_miner = NmMinerAdapter::new(cache).with_max_age(config.stale_after());
    if let Some(addr) = config.udp_broadcast_addr {
        nm_miner = nm_miner.with_config_target(addr, nmminer::CONFIG_PORT);
    }

    let adapters = AdapterSet::new()
        .with(Arc::new(AvalonAdapter::new(avalon::DEFAULT_TIMEOUT)))
        .with(Arc::new(BitaxeAdapter::new(bitaxe::DEFAULT_TIMEOUT)?))
        .with(Arc::new(nm_miner));

    let controller = Arc::new(
        Controller::new(
            config.clone(),
            adapters,
            store,
            price_signal()?,
            Arc::new(MemoryPersistence::new(fleet)),
            Arc::new(LogNotifier),
        )
        .await?,
    );

    let udp_task = tokio::spawn(listener.run(cancellation.clone()));
    let api_task = tokio::spawn(api::serve(
        config.api_addr,
        Arc::clone(&controller),
        cancellation.clone(),
    ));
    let run_task = {
        let controller = Arc::clone(&controller);
        let cancellation = cancellation.clone();
        tokio::spawn(async move { controller.run(cancellation).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Shutting down");
    cancellation.cancel();

    let (udp, api, run) = tokio::join!(udp_task, api_task, run_task);
    udp?;
    run?;
    api??;
    Ok(())
}
