use std::sync::Arc;

use tracing::{info, warn};

use mlcoord::config::Config;
use mlcoord::messaging::serve;
use mlcoord::node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let (service, channel) = node::connect(&config).await?;

  if let Some(coordinator) = service.coordinator() {
    warn!("Worker {} is also the coordinator; the REST API is only served by mlcoord_api", config.node_id);
    coordinator.rehydrate().await?;
    coordinator.watch_membership();
  }

  info!("Worker {} ready", config.node_id);
  serve(channel, config.node_id.clone(), Arc::new(service), config.max_in_flight).await
}
