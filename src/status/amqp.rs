use super::{StatusChannel, StatusChannelError, StatusEvent, StatusHandler};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// AMQP delivery mode marking a message as persistent.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Status channel backed by a durable AMQP queue (e.g. RabbitMQ).
pub struct AmqpStatusChannel {
    // Held so the connection lives as long as the channel.
    _connection: Connection,
    channel: Channel,
    queue: String,
}

impl AmqpStatusChannel {
    /// Connect to `url` and declare `queue` as durable.
    pub async fn connect(url: &str, queue: &str) -> Result<Self, StatusChannelError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue, "Connected to status channel");
        Ok(Self {
            _connection: connection,
            channel,
            queue: queue.to_string(),
        })
    }
}

#[async_trait]
impl StatusChannel for AmqpStatusChannel {
    async fn publish(&self, event: &StatusEvent) -> Result<(), StatusChannelError> {
        let body = event.wire_text();
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type("text/plain".into())
            .with_timestamp(event.timestamp.unix_timestamp().max(0) as u64);

        // The returned confirm is dropped: publishing never waits on the broker.
        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await?;
        tracing::debug!(message = %body, queue = %self.queue, "Status published");
        Ok(())
    }

    async fn subscribe(
        &self,
        handler: StatusHandler,
    ) -> Result<JoinHandle<()>, StatusChannelError> {
        let consumer_tag = format!("reelindex-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        tracing::error!(error = %err, "Status consumer failed");
                        break;
                    }
                };
                let timestamp = (*delivery.properties.timestamp())
                    .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs as i64).ok())
                    .unwrap_or_else(OffsetDateTime::now_utc);
                let text = String::from_utf8_lossy(&delivery.data);
                match StatusEvent::parse(&text, timestamp) {
                    Ok(event) => handler(event),
                    Err(err) => tracing::warn!(error = %err, "Ignoring malformed status message"),
                }
            }
        }))
    }
}
