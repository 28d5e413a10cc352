#[macro_use]
extern crate log;

use std::convert::TryFrom;
use std::time::Duration;

use sluice::core::config::IngestConfig;
use sluice::core::properties::Properties;
use sluice::metrics;
use sluice::runtime::logger::init_log;
use sluice::utils;

use crate::app::App;

pub mod app;

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let config_path = utils::parse_arg("config")?;
    let properties = Properties::load(config_path.as_str())?;
    let source = properties.name().to_string();
    let config = IngestConfig::try_from(properties)?;

    init_log(config.log_level.as_str(), config.log_file.as_deref())?;
    info!("sluice {} bootstrap with {}", utils::VERSION, source);

    match config.metrics_address {
        Some(addr) => metrics::install(addr)?,
        None => info!("metrics exporter disabled"),
    }

    let app = App::start(config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(wait_for_shutdown(&app));

    app.shutdown()
}

/// Returns on Ctrl-C, or once every coordinator has ended by itself.
async fn wait_for_shutdown(app: &App) {
    let mut watch = tokio::time::interval(WATCH_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("shutdown signal received"),
                    Err(e) => error!("can't listen for the shutdown signal. {}", e),
                }
                return;
            }
            _ = watch.tick() => {
                if app.is_finished() {
                    warn!("all coordinators ended");
                    return;
                }
            }
        }
    }
}
