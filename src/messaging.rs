use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{Semaphore, oneshot};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec::{self, Envelope, WireVersion};
use crate::error::NodeError;
use crate::models::NodeId;
use crate::protocol::{ClusterMessage, ClusterReply};
use crate::transport::{MessageHandler, Transport};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Doubling delays starting at `first_delay_ms`.
pub fn backoff(first_delay_ms: u64, retries: usize) -> impl Iterator<Item = Duration> {
  ExponentialBackoff::from_millis(2)
    .factor((first_delay_ms / 2).max(1))
    .max_delay(Duration::from_secs(10))
    .take(retries)
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(backoff(DELAY, MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await
    .with_context(|| format!("connecting to {}", rabbitmq_url))?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub fn node_queue(node_id: &NodeId) -> String {
  format!("mlcoord.node.{}", node_id)
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8], properties: BasicProperties) -> Result<()> {
  Retry::spawn(backoff(DELAY, MAX_RETRIES), || async {
    channel
      .basic_publish("", queue, BasicPublishOptions::default(), payload, properties.clone())
      .await
  })
    .await?;
  Ok(())
}

type PendingReplies = Arc<DashMap<String, oneshot::Sender<Vec<u8>>>>;

/// A registered wait for one reply. Dropping it, whether the reply came or
/// the caller's timeout fired, removes the correlation id.
struct PendingReply {
  pending: PendingReplies,
  correlation_id: String,
}

impl PendingReply {
  fn register(pending: &PendingReplies) -> (Self, oneshot::Receiver<Vec<u8>>) {
    let correlation_id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    pending.insert(correlation_id.clone(), tx);
    (Self { pending: pending.clone(), correlation_id }, rx)
  }
}

impl Drop for PendingReply {
  fn drop(&mut self) {
    self.pending.remove(&self.correlation_id);
  }
}

/// Request/reply over AMQP: requests go to the target node's queue, replies
/// come back on a private queue and are matched by correlation id.
pub struct AmqpTransport {
  channel: Channel,
  reply_queue: String,
  pending: PendingReplies,
  peer_version: WireVersion,
}

impl AmqpTransport {
  pub async fn connect(channel: Channel, peer_version: WireVersion) -> Result<Arc<Self>> {
    let queue = channel
      .queue_declare(
        "",
        QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() },
        FieldTable::default(),
      )
      .await
      .context("declaring reply queue")?;
    let reply_queue = queue.name().as_str().to_string();

    let mut consumer = channel
      .basic_consume(
        &reply_queue,
        "mlcoord-replies",
        BasicConsumeOptions { no_ack: true, ..Default::default() },
        FieldTable::default(),
      )
      .await
      .context("consuming reply queue")?;

    let pending: PendingReplies = Arc::new(DashMap::new());
    let waiting = pending.clone();
    tokio::spawn(async move {
      while let Some(delivery) = consumer.next().await {
        match delivery {
          Ok(delivery) => {
            let Some(correlation_id) = delivery.properties.correlation_id().as_ref() else {
              warn!("Reply without correlation id dropped");
              continue;
            };
            match waiting.remove(correlation_id.as_str()) {
              Some((_, tx)) => {
                if tx.send(delivery.data).is_err() {
                  warn!("Reply for {} arrived after its caller gave up", correlation_id.as_str());
                }
              }
              None => warn!("Late reply for {} dropped", correlation_id.as_str()),
            }
          }
          Err(e) => error!("Reply consumer error: {:?}", e),
        }
      }
    });

    info!("AMQP transport listening for replies on {}", reply_queue);
    Ok(Arc::new(Self { channel, reply_queue, pending, peer_version }))
  }
}

impl Transport for AmqpTransport {
  fn send(&self, node_id: &NodeId, message: ClusterMessage) -> BoxFuture<'_, Result<ClusterReply, NodeError>> {
    let queue = node_queue(node_id);
    async move {
      let payload = codec::encode(&message, self.peer_version).map_err(|e| NodeError::protocol(e.to_string()))?;
      let (waiting, rx) = PendingReply::register(&self.pending);

      let properties = BasicProperties::default()
        .with_reply_to(self.reply_queue.clone().into())
        .with_correlation_id(waiting.correlation_id.clone().into());
      if let Err(e) = publish_message(&self.channel, &queue, &payload, properties).await {
        return Err(NodeError::transport(format!("publishing to {}: {}", queue, e)));
      }

      let bytes = rx
        .await
        .map_err(|_| NodeError::transport("reply channel closed"))?;
      let envelope: Envelope<ClusterReply> =
        codec::decode(&bytes).map_err(|e| NodeError::protocol(e.to_string()))?;
      Ok(envelope.body)
    }
    .boxed()
  }
}

/// Consumes this node's queue and answers every request through `handler`.
/// At most `max_in_flight` requests are handled at once; the broker holds the
/// rest unacknowledged.
pub async fn serve(
  channel: Channel,
  node_id: NodeId,
  handler: Arc<dyn MessageHandler>,
  max_in_flight: u16,
) -> Result<()> {
  let queue = node_queue(&node_id);
  let max_in_flight = max_in_flight.max(1);
  channel
    .queue_declare(&queue, QueueDeclareOptions::default(), FieldTable::default())
    .await
    .with_context(|| format!("declaring {}", queue))?;
  channel
    .basic_qos(max_in_flight, BasicQosOptions::default())
    .await
    .with_context(|| format!("setting prefetch on {}", queue))?;
  let semaphore = Arc::new(Semaphore::new(max_in_flight as usize));
  let mut consumer = channel
    .basic_consume(&queue, node_id.0.as_str(), BasicConsumeOptions::default(), FieldTable::default())
    .await
    .with_context(|| format!("consuming {}", queue))?;
  info!("Node {} serving {} ({} in flight)", node_id, queue, max_in_flight);

  while let Some(delivery) = consumer.next().await {
    let delivery = match delivery {
      Ok(delivery) => delivery,
      Err(e) => {
        error!("Consumer error: {:?}", e);
        continue;
      }
    };
    let permit = semaphore.clone().acquire_owned().await.context("request limiter closed")?;
    let channel = channel.clone();
    let handler = handler.clone();
    tokio::spawn(async move {
      let _permit = permit;
      let (reply, version) = match codec::decode::<ClusterMessage>(&delivery.data) {
        Ok(envelope) => (handler.on_message(envelope.body).await, envelope.version),
        Err(e) => {
          error!("Failed to decode request: {}", e);
          (ClusterReply::Error(NodeError::protocol(e.to_string())), WireVersion::MINIMUM)
        }
      };

      let reply_to = delivery.properties.reply_to().as_ref().map(|q| q.as_str().to_string());
      let correlation_id = delivery.properties.correlation_id().clone();
      if let Some(reply_to) = reply_to {
        match codec::encode(&reply, version) {
          Ok(payload) => {
            let mut properties = BasicProperties::default();
            if let Some(correlation_id) = correlation_id {
              properties = properties.with_correlation_id(correlation_id);
            }
            if let Err(e) = publish_message(&channel, &reply_to, &payload, properties).await {
              error!("Failed to publish reply to {}: {:?}", reply_to, e);
            }
          }
          Err(e) => error!("Failed to encode reply: {}", e),
        }
      }
      if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!("Failed to ack request: {:?}", e);
      }
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_doubles_from_first_delay() {
    let delays: Vec<Duration> = backoff(100, 4).collect();
    assert_eq!(
      delays,
      vec![
        Duration::from_millis(100),
        Duration::from_millis(200),
        Duration::from_millis(400),
        Duration::from_millis(800),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn abandoned_wait_forgets_its_correlation_id() {
    let pending: PendingReplies = Arc::new(DashMap::new());
    let wait = async {
      let (waiting, rx) = PendingReply::register(&pending);
      let reply = rx.await;
      drop(waiting);
      reply
    };

    let outcome = tokio::time::timeout(Duration::from_secs(1), wait).await;
    assert!(outcome.is_err());
    assert!(pending.is_empty());
  }

  #[tokio::test]
  async fn answered_wait_forgets_its_correlation_id() {
    let pending: PendingReplies = Arc::new(DashMap::new());
    let (waiting, rx) = PendingReply::register(&pending);
    assert_eq!(pending.len(), 1);

    let (_, tx) = pending.remove(&waiting.correlation_id).unwrap();
    tx.send(b"pong".to_vec()).unwrap();
    assert_eq!(rx.await.unwrap(), b"pong".to_vec());
    drop(waiting);
    assert!(pending.is_empty());
  }

  #[test]
  fn node_queues_are_per_node() {
    assert_eq!(node_queue(&NodeId::from("a")), "mlcoord.node.a");
  }
}
