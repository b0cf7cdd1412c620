//! CDC file-logger consumer.
//!
//! Binds one durable queue to the fan-out exchange and appends one
//! human-readable line per mutation to a log file. Messages are acked
//! only after the line is written, so a crash redelivers instead of
//! losing; duplicate lines are the accepted cost.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use meshkv::config::Config;
use meshkv::events::{Event, EventKind};
use std::fs::OpenOptions;
use std::io::Write;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_target(false)
        .init();

    let connection = Connection::connect(&config.rabbitmq.url, ConnectionProperties::default())
        .await
        .context("connecting to the event broker")?;
    let channel = connection.create_channel().await?;

    channel
        .exchange_declare(
            &config.cdc.exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(
            &config.cdc.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &config.cdc.queue,
            &config.cdc.exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let mut consumer = channel
        .basic_consume(
            &config.cdc.queue,
            &config.cdc.consumer_tag,
            BasicConsumeOptions::default(), // manual ack
            FieldTable::default(),
        )
        .await?;

    if let Some(dir) = std::path::Path::new(&config.cdc.log_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.cdc.log_path)
        .with_context(|| format!("opening CDC log at {}", config.cdc.log_path))?;

    info!(
        exchange = %config.cdc.exchange,
        queue = %config.cdc.queue,
        "waiting for CDC events, ctrl-c to exit"
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            delivery = consumer.next() => {
                let Some(delivery) = delivery else {
                    warn!("consumer stream closed by the broker");
                    break;
                };
                let delivery = delivery?;

                let event: Event = match serde_json::from_slice(&delivery.data) {
                    Ok(event) => event,
                    Err(e) => {
                        // Malformed bodies are acked away, they will
                        // never parse better on redelivery.
                        warn!(error = %e, "undecodable event body, discarding");
                        delivery.ack(BasicAckOptions::default()).await?;
                        continue;
                    }
                };

                let stamp = (*delivery.properties.timestamp())
                    .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
                    .unwrap_or_else(Utc::now);

                match write_line(&mut log_file, &event, stamp) {
                    Ok(()) => delivery.ack(BasicAckOptions::default()).await?,
                    // No ack: the broker redelivers once we recover.
                    Err(e) => error!(error = %e, "CDC log write failed"),
                }
            }
        }
    }

    // Stop intake, flush, then leave.
    channel
        .basic_cancel(&config.cdc.consumer_tag, BasicCancelOptions::default())
        .await
        .ok();
    log_file.sync_all()?;
    info!("CDC consumer stopped");
    Ok(())
}

fn write_line(file: &mut std::fs::File, event: &Event, stamp: DateTime<Utc>) -> Result<()> {
    let line = format_line(event, stamp);
    file.write_all(line.as_bytes())?;
    print!("{line}");
    Ok(())
}

fn format_line(event: &Event, stamp: DateTime<Utc>) -> String {
    let time = stamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    match event.kind {
        EventKind::Set => {
            let value_len = event.value.as_deref().unwrap_or("").len();
            format!(
                "[{time}] [CDC_SYNC] SET key='{}' value_len={value_len} >> Persisted\n",
                event.key
            )
        }
        EventKind::Del => {
            format!("[{time}] [CDC_SYNC] DEL key='{}' >> Deleted\n", event.key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn set_line_carries_value_length() {
        let line = format_line(&Event::set("user:1", "alice"), stamp());
        assert_eq!(
            line,
            "[2025-06-01T12:30:00Z] [CDC_SYNC] SET key='user:1' value_len=5 >> Persisted\n"
        );
    }

    #[test]
    fn del_line_marks_deletion() {
        let line = format_line(&Event::del("user:1"), stamp());
        assert_eq!(
            line,
            "[2025-06-01T12:30:00Z] [CDC_SYNC] DEL key='user:1' >> Deleted\n"
        );
    }

    #[test]
    fn set_without_value_counts_zero() {
        let event = Event {
            kind: EventKind::Set,
            key: "k".into(),
            value: None,
        };
        assert!(format_line(&event, stamp()).contains("value_len=0"));
    }
}
