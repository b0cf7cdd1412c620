//! AMQP Fan-Out Publisher
//!
//! The broker side of the CDC pipeline: a durable fan-out exchange
//! that any number of consumer queues can bind to. Message bodies are
//! the JSON [`Event`] envelope; the publish timestamp rides in the
//! AMQP message properties so consumers do not trust producer clocks.

use super::{Event, EventSink};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Publishes events to a fan-out exchange.
pub struct AmqpPublisher {
    // The channel dies with the connection, so the connection lives here.
    _connection: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpPublisher {
    /// Connects to the broker and declares the durable fan-out
    /// exchange. Fails fast so the caller can decide whether to run
    /// degraded without CDC.
    pub async fn connect(url: &str, exchange: &str) -> anyhow::Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(exchange, "connected to event broker");
        Ok(Self {
            _connection: connection,
            channel,
            exchange: exchange.to_string(),
        })
    }
}

#[async_trait]
impl EventSink for AmqpPublisher {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        let body = serde_json::to_vec(event)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        self.channel
            .basic_publish(
                &self.exchange,
                "", // fan-out ignores the routing key
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2) // persistent
                    .with_timestamp(timestamp),
            )
            .await?
            .await?;

        Ok(())
    }
}
