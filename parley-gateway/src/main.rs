use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use parley_bus::{BusSender, RedisBus};
use parley_core::{logging, Config};
use parley_gateway::{registry::RoomRegistry, router, run_answer_loop, GatewayState};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration (optional file path as the first argument)
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Parley gateway starting...");
    info!("Listen address: {}", config.gateway_address());

    // 3. Connect the message bus (fatal if unreachable)
    let bus = RedisBus::connect(config.bus_url()).await?;
    let offers: Arc<dyn BusSender> = Arc::new(bus.sender(&config.bus.to_relay_topic));
    let answers = bus.receiver(&config.bus.to_gateway_topic);

    // 4. Room registry + answer routing
    let registry = Arc::new(RoomRegistry::new());
    tokio::spawn(run_answer_loop(Arc::clone(&registry), answers));

    // 5. Serve (fatal if the listener cannot bind)
    let address = config.gateway_address();
    let state = GatewayState {
        registry,
        offers,
        config: Arc::new(config),
    };
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Gateway listening on {address}");
    axum::serve(listener, router(state)).await?;

    Ok(())
}
