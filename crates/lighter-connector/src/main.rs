//! Lighter connector runner.
//!
//! Connects, streams the configured books and logs order events until
//! Ctrl-C.

use anyhow::Result;
use clap::Parser;
use lighter_connector::{ConnectorConfig, OrderEvent, PerpetualConnector, SpotConnector};
use tracing::{info, warn};

/// Lighter exchange connector
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via LIGHTER_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any WS connection
    lighter_ws::init_crypto();

    let args = Args::parse();
    lighter_connector::init_logging()?;

    info!("Starting Lighter connector v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args
        .config
        .or_else(|| std::env::var("LIGHTER_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());
    info!(config_path = %config_path, "Loading configuration");

    let config = ConnectorConfig::load(&config_path)?;
    info!(
        network = %config.network,
        account_index = config.account_index,
        derivative = config.derivative,
        "Configuration loaded"
    );

    if config.derivative {
        let connector = PerpetualConnector::connect(config)?;
        run(&connector).await
    } else {
        let connector = SpotConnector::connect(config)?;
        run(&connector).await
    }
}

async fn run(connector: &SpotConnector) -> Result<()> {
    let mut events = connector.subscribe_orders().await?;
    if let Err(e) = connector.start().await {
        connector.shutdown().await;
        return Err(e.into());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(OrderEvent::Transition { order, from }) => info!(
                    client_order_id = %order.client_order_id,
                    from = %from,
                    to = %order.state,
                    "Order transition"
                ),
                Some(OrderEvent::Fill { client_order_id, fill }) => info!(
                    %client_order_id,
                    trade_id = fill.trade_id,
                    price = %fill.price,
                    amount = %fill.amount,
                    "Order fill"
                ),
                Some(OrderEvent::Reconciling { order }) => warn!(
                    client_order_id = %order.client_order_id,
                    state = %order.state,
                    "Order reconciling"
                ),
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Signal handler failed");
                }
                break;
            }
        }
    }

    connector.shutdown().await;
    match lighter_telemetry::Metrics::render() {
        Ok(text) => info!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to render metrics"),
    }
    Ok(())
}
