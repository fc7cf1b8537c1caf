//! Pure, idempotent broker topology declarations: exchanges, queues,
//! bindings, and the retry/DLX wiring for each logical destination.
//!
//! Every declaration uses identical flags on every call, so running this
//! twice against the same channel is a no-op from the broker's point of
//! view (declare-with-equal-arguments succeeds silently).

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{Channel, ExchangeKind};

use crate::error::DeclareError;

pub const RETRY_QUEUE_TTL_MS: i64 = 30_000;
pub const RETRY_SUFFIX: &str = "retry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    Queue,
    Event,
}

/// Computes the main queue name for a destination: `N` for job-queue
/// mode, `N.<subscriber_service>` for pub/sub mode.
pub fn main_queue_name(destination: &str, mode: DestinationMode, subscriber_service: Option<&str>) -> String {
    match mode {
        DestinationMode::Queue => destination.to_string(),
        DestinationMode::Event => {
            let service = subscriber_service.unwrap_or_default();
            format!("{destination}.{service}")
        }
    }
}

pub fn retry_queue_name(main_queue: &str) -> String {
    format!("{main_queue}.{RETRY_SUFFIX}")
}

pub fn retry_exchange_name(destination: &str) -> String {
    format!("{destination}.{RETRY_SUFFIX}")
}

/// Declares the full topology for `destination` and returns the main
/// queue name a consumer should `basic_consume` from.
pub async fn declare(
    channel: &Channel,
    destination: &str,
    mode: DestinationMode,
    subscriber_service: Option<&str>,
) -> Result<String, DeclareError> {
    declare_main_exchange(channel, destination).await?;

    let queue_name = main_queue_name(destination, mode, subscriber_service);
    declare_durable_queue(channel, &queue_name).await?;

    bind(channel, &queue_name, destination, destination).await?;
    bind(channel, &queue_name, destination, &queue_name).await?;

    declare_retry_wiring(channel, destination, &queue_name).await?;

    Ok(queue_name)
}

/// Declares just the main exchange, used by `queue_send`/`publish` which
/// never register a consumer.
pub async fn declare_main_exchange(channel: &Channel, destination: &str) -> Result<(), DeclareError> {
    channel
        .exchange_declare(
            destination,
            ExchangeKind::Direct,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .map_err(|source| DeclareError::Exchange { name: destination.to_string(), source })
}

async fn declare_durable_queue(channel: &Channel, name: &str) -> Result<(), DeclareError> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .map_err(|source| DeclareError::Queue { name: name.to_string(), source })?;
    Ok(())
}

async fn bind(channel: &Channel, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DeclareError> {
    channel
        .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
        .await
        .map_err(|source| DeclareError::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            source,
        })
}

async fn declare_retry_wiring(channel: &Channel, destination: &str, main_queue: &str) -> Result<(), DeclareError> {
    let retry_exchange = retry_exchange_name(destination);
    channel
        .exchange_declare(
            &retry_exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .map_err(|source| DeclareError::Exchange { name: retry_exchange.clone(), source })?;

    let retry_queue = retry_queue_name(main_queue);
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(LongString::from(destination.to_string())),
    );
    args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(RETRY_QUEUE_TTL_MS));

    channel
        .queue_declare(
            &retry_queue,
            QueueDeclareOptions { durable: true, ..Default::default() },
            args,
        )
        .await
        .map_err(|source| DeclareError::Queue { name: retry_queue.clone(), source })?;

    bind(channel, &retry_queue, &retry_exchange, main_queue).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_mode_names_are_destination_local() {
        assert_eq!(main_queue_name("send_email", DestinationMode::Queue, None), "send_email");
        assert_eq!(retry_queue_name("send_email"), "send_email.retry");
        assert_eq!(retry_exchange_name("send_email"), "send_email.retry");
    }

    #[test]
    fn event_mode_names_are_per_subscriber() {
        let q = main_queue_name("order_created", DestinationMode::Event, Some("billing"));
        assert_eq!(q, "order_created.billing");
        assert_eq!(retry_queue_name(&q), "order_created.billing.retry");
        assert_eq!(retry_exchange_name("order_created"), "order_created.retry");
    }
}
