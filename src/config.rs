use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::codec::WireVersion;
use crate::models::NodeId;

/// Process wiring read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
  pub node_id: NodeId,
  pub cluster_name: String,
  pub cluster_nodes: Vec<NodeId>,
  pub coordinator_node_id: NodeId,
  pub rabbitmq_url: String,
  pub database_url: Option<String>,
  pub server_port: u16,
  pub model_dir: PathBuf,
  pub settings_path: Option<PathBuf>,
  /// Oldest protocol version any peer in the cluster still speaks.
  pub peer_wire_version: WireVersion,
  /// Cluster requests this node handles at once.
  pub max_in_flight: u16,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let node_id = NodeId(lookup("NODE_ID").context("NODE_ID is required")?);
    let cluster_nodes: Vec<NodeId> = lookup("CLUSTER_NODES")
      .map(|nodes| {
        nodes
          .split(',')
          .map(str::trim)
          .filter(|n| !n.is_empty())
          .map(NodeId::from)
          .collect()
      })
      .unwrap_or_else(|| vec![node_id.clone()]);
    let coordinator_node_id = lookup("COORDINATOR_NODE_ID")
      .map(NodeId)
      .unwrap_or_else(|| node_id.clone());

    Ok(Self {
      cluster_name: lookup("CLUSTER_NAME").unwrap_or_else(|| "ml-cluster".into()),
      rabbitmq_url: lookup("RABBITMQ_URL").context("RABBITMQ_URL is required")?,
      database_url: lookup("DATABASE_URL"),
      server_port: lookup("SERVER_PORT")
        .map(|port| port.parse().context("SERVER_PORT must be a port number"))
        .transpose()?
        .unwrap_or(8080),
      model_dir: lookup("MODEL_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("models")),
      settings_path: lookup("SETTINGS_PATH").map(PathBuf::from),
      peer_wire_version: lookup("PEER_WIRE_VERSION")
        .map(|v| v.parse::<u32>().context("PEER_WIRE_VERSION must be a number"))
        .transpose()?
        .map(|v| WireVersion(v).clamp(WireVersion::MINIMUM, WireVersion::CURRENT))
        .unwrap_or(WireVersion::CURRENT),
      max_in_flight: lookup("MAX_IN_FLIGHT")
        .map(|n| n.parse::<u16>().context("MAX_IN_FLIGHT must be a number"))
        .transpose()?
        .unwrap_or(16)
        .max(1),
      node_id,
      cluster_nodes,
      coordinator_node_id,
    })
  }
}

/// Operational knobs. Every operation reads one immutable snapshot of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub node_timeout_ms: u64,
  pub deploy_deadline_ms: u64,
  pub execute_deadline_ms: u64,
  pub worker_pool_size: usize,
  pub worker_queue_capacity: usize,
  pub max_running_load_tasks: usize,
  pub forward_retries: usize,
  pub forward_retry_delay_ms: u64,
  pub allow_custom_deployment_plan: bool,
  /// Push loaded models onto nodes that join or come back.
  pub auto_redeploy: bool,
  pub auto_redeploy_max_retries: u32,
  pub membership_check_interval_ms: u64,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      node_timeout_ms: 10_000,
      deploy_deadline_ms: 300_000,
      execute_deadline_ms: 60_000,
      worker_pool_size: 4,
      worker_queue_capacity: 64,
      max_running_load_tasks: 10,
      forward_retries: 5,
      forward_retry_delay_ms: 100,
      allow_custom_deployment_plan: true,
      auto_redeploy: true,
      auto_redeploy_max_retries: 3,
      membership_check_interval_ms: 5_000,
    }
  }
}

impl Settings {
  pub fn from_file(path: &std::path::Path) -> Result<Self> {
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("reading settings from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing settings in {}", path.display()))
  }

  pub fn node_timeout(&self) -> Duration {
    Duration::from_millis(self.node_timeout_ms)
  }

  pub fn deploy_deadline(&self) -> Duration {
    Duration::from_millis(self.deploy_deadline_ms)
  }

  pub fn execute_deadline(&self) -> Duration {
    Duration::from_millis(self.execute_deadline_ms)
  }

  pub fn membership_check_interval(&self) -> Duration {
    Duration::from_millis(self.membership_check_interval_ms.max(1))
  }
}

/// Partial update accepted over the API; unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
  pub node_timeout_ms: Option<u64>,
  pub deploy_deadline_ms: Option<u64>,
  pub execute_deadline_ms: Option<u64>,
  pub max_running_load_tasks: Option<usize>,
  pub forward_retries: Option<usize>,
  pub allow_custom_deployment_plan: Option<bool>,
  pub auto_redeploy: Option<bool>,
  pub auto_redeploy_max_retries: Option<u32>,
}

impl SettingsPatch {
  fn apply(self, settings: &mut Settings) {
    if let Some(v) = self.node_timeout_ms {
      settings.node_timeout_ms = v;
    }
    if let Some(v) = self.deploy_deadline_ms {
      settings.deploy_deadline_ms = v;
    }
    if let Some(v) = self.execute_deadline_ms {
      settings.execute_deadline_ms = v;
    }
    if let Some(v) = self.max_running_load_tasks {
      settings.max_running_load_tasks = v;
    }
    if let Some(v) = self.forward_retries {
      settings.forward_retries = v;
    }
    if let Some(v) = self.allow_custom_deployment_plan {
      settings.allow_custom_deployment_plan = v;
    }
    if let Some(v) = self.auto_redeploy {
      settings.auto_redeploy = v;
    }
    if let Some(v) = self.auto_redeploy_max_retries {
      settings.auto_redeploy_max_retries = v;
    }
  }
}

/// Shared handle to the current settings snapshot.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
  tx: Arc<watch::Sender<Arc<Settings>>>,
}

impl SettingsHandle {
  pub fn new(settings: Settings) -> Self {
    let (tx, _) = watch::channel(Arc::new(settings));
    Self { tx: Arc::new(tx) }
  }

  pub fn snapshot(&self) -> Arc<Settings> {
    self.tx.borrow().clone()
  }

  /// Builds the next snapshot from the current one and swaps it in whole.
  pub fn update(&self, patch: SettingsPatch) -> Arc<Settings> {
    let mut next = (*self.snapshot()).clone();
    patch.apply(&mut next);
    let next = Arc::new(next);
    self.tx.send_replace(next.clone());
    tracing::info!("Settings updated: {:?}", next);
    next
  }
}

impl Default for SettingsHandle {
  fn default() -> Self {
    Self::new(Settings::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn config_reads_cluster_nodes() {
    let vars: HashMap<&str, &str> = HashMap::from([
      ("NODE_ID", "node-a"),
      ("RABBITMQ_URL", "amqp://localhost:5672"),
      ("CLUSTER_NODES", "node-a, node-b,,node-c"),
      ("SERVER_PORT", "9200"),
    ]);
    let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

    assert_eq!(config.cluster_nodes, vec![NodeId::from("node-a"), NodeId::from("node-b"), NodeId::from("node-c")]);
    assert_eq!(config.server_port, 9200);
    assert_eq!(config.coordinator_node_id, NodeId::from("node-a"));
    assert!(config.database_url.is_none());
    assert_eq!(config.peer_wire_version, WireVersion::CURRENT);
    assert_eq!(config.max_in_flight, 16);
  }

  #[test]
  fn max_in_flight_is_at_least_one() {
    let vars: HashMap<&str, &str> = HashMap::from([
      ("NODE_ID", "node-a"),
      ("RABBITMQ_URL", "amqp://localhost:5672"),
      ("MAX_IN_FLIGHT", "0"),
    ]);
    let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
    assert_eq!(config.max_in_flight, 1);

    let vars: HashMap<&str, &str> = HashMap::from([
      ("NODE_ID", "node-a"),
      ("RABBITMQ_URL", "amqp://localhost:5672"),
      ("MAX_IN_FLIGHT", "lots"),
    ]);
    assert!(Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).is_err());
  }

  #[test]
  fn peer_wire_version_is_clamped() {
    let vars: HashMap<&str, &str> = HashMap::from([
      ("NODE_ID", "node-a"),
      ("RABBITMQ_URL", "amqp://localhost:5672"),
      ("PEER_WIRE_VERSION", "0"),
    ]);
    let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
    assert_eq!(config.peer_wire_version, WireVersion::MINIMUM);
  }

  #[test]
  fn config_requires_node_id() {
    let err = Config::from_lookup(|_| None).unwrap_err();
    assert!(err.to_string().contains("NODE_ID"));
  }

  #[test]
  fn old_snapshots_survive_updates() {
    let handle = SettingsHandle::default();
    let before = handle.snapshot();

    handle.update(SettingsPatch { node_timeout_ms: Some(5), ..Default::default() });

    assert_eq!(before.node_timeout_ms, 10_000);
    assert_eq!(handle.snapshot().node_timeout_ms, 5);
    assert_eq!(handle.snapshot().deploy_deadline_ms, before.deploy_deadline_ms);
  }

  #[test]
  fn settings_fill_missing_fields_from_defaults() {
    let settings: Settings = serde_json::from_str(r#"{"worker_pool_size": 2}"#).unwrap();
    assert_eq!(settings.worker_pool_size, 2);
    assert_eq!(settings.forward_retries, Settings::default().forward_retries);
  }
}
