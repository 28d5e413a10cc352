use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const RECORDS_PERSISTED: &str = "sluice_records_persisted";
pub const BATCHES_COMMITTED: &str = "sluice_batches_committed";
pub const UNITS_SEALED: &str = "sluice_units_sealed";
pub const UNITS_PRUNED: &str = "sluice_units_pruned";

/// Installs the global prometheus recorder and serves it over http on `addr`.
pub fn install(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow!("install prometheus exporter on {} failed. {}", addr, e))?;

    info!("metrics prometheus http exporter listen on http://{}", addr);
    Ok(())
}
