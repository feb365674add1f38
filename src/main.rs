use std::sync::Arc;

use tracing::{error, info};

use mlcoord::config::Config;
use mlcoord::messaging::serve;
use mlcoord::node;
use mlcoord::routes::node_routes;
use mlcoord::transport::MessageHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let (service, channel) = node::connect(&config).await?;

  let Some(coordinator) = service.coordinator() else {
    anyhow::bail!(
      "{} is not the coordinating node ({}); start mlcoord_worker instead",
      config.node_id,
      config.coordinator_node_id
    );
  };
  let coordinator = coordinator.clone();

  // Listen first: a restart may redeploy models onto this node too.
  let handler: Arc<dyn MessageHandler> = Arc::new(service.clone());
  let node_id = config.node_id.clone();
  let max_in_flight = config.max_in_flight;
  tokio::spawn(async move {
    if let Err(e) = serve(channel, node_id, handler, max_in_flight).await {
      error!("Cluster listener stopped: {:?}", e);
    }
  });

  let restored = coordinator.rehydrate().await?;
  info!("Rehydrated {} active task(s)", restored);
  coordinator.watch_membership();

  let Some(api) = node_routes(service) else {
    anyhow::bail!("coordinator routes unavailable");
  };
  info!("API listening on port {}", config.server_port);
  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
