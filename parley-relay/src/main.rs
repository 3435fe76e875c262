use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use parley_bus::{BusSender, RedisBus};
use parley_core::{logging, Config};
use parley_relay::{RelayDispatcher, RtcFactory};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration (optional file path as the first argument)
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Parley relay starting...");

    // 3. Connect the message bus (fatal if unreachable)
    let bus = RedisBus::connect(config.bus_url()).await?;
    let answers: Arc<dyn BusSender> = Arc::new(bus.sender(&config.bus.to_gateway_topic));
    let offers = bus.receiver(&config.bus.to_relay_topic);

    // 4. Dispatch offers to room workers until the bus closes
    let factory = Arc::new(RtcFactory::new(config.relay.clone()));
    let idle_timeout = Duration::from_secs(config.relay.idle_room_timeout_seconds);
    let dispatcher = RelayDispatcher::new(factory, answers, idle_timeout);
    dispatcher.run(offers).await;

    info!("Parley relay stopped");
    Ok(())
}
