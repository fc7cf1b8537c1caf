//! Per-consumer channel lifecycle. On channel-close, waits for a live
//! connection and re-invokes the full `consume` procedure (re-declare
//! topology, re-`basic_consume`, re-spawn the delivery loop).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionHandle, ConnectionManager, ConnectionState};
use super::topology::{self, DestinationMode};
use messageman_metrics::{Exporter, ServiceNameLabels};

const RECOVER_WAIT: Duration = Duration::from_secs(5);

/// Boolean consumer contract: `true` = success/ack, `false` = retry.
pub type ConsumerCallback = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ConsumerDescriptor {
    pub service: String,
    pub name: String,
    pub mode: DestinationMode,
    pub callback: ConsumerCallback,
}

impl ConsumerDescriptor {
    /// Key consumer descriptors are uniquely registered under; re-registering
    /// under the same key is idempotent.
    pub fn key(&self) -> (String, String, &'static str) {
        let mode = match self.mode {
            DestinationMode::Queue => "queue",
            DestinationMode::Event => "event",
        };
        (self.service.clone(), self.name.clone(), mode)
    }
}

/// Opens a channel for `descriptor` on `conn_name` and starts the
/// supervisor task that keeps exactly one live channel (and delivery
/// loop) for that consumer alive for the process lifetime.
pub fn supervise(
    connection_manager: Arc<ConnectionManager>,
    conn_name: String,
    descriptor: ConsumerDescriptor,
    exporter: Arc<dyn Exporter>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let handle = match connection_manager.connection(&conn_name).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::error!(error = %e, conn = %conn_name, "initial dial failed for consumer registration");
                    return;
                }
            };

            match open_and_consume(&handle, &descriptor, exporter.clone()).await {
                Ok(close_signal) => {
                    exporter.inc_consumer(ServiceNameLabels { service: &descriptor.service, name: &descriptor.name });
                    tracing::info!(service = %descriptor.service, name = %descriptor.name, "consumer registered");

                    tokio::select! {
                        _ = close_signal.notified() => {}
                        _ = shutdown.cancelled() => {
                            tracing::info!(service = %descriptor.service, name = %descriptor.name, "consumer shutting down");
                            return;
                        }
                    }

                    exporter.dec_consumer(ServiceNameLabels { service: &descriptor.service, name: &descriptor.name });
                    tracing::error!(service = %descriptor.service, name = %descriptor.name, "channel closed, recovering");
                }
                Err(e) => {
                    tracing::error!(error = %e, service = %descriptor.service, name = %descriptor.name, "failed to declare topology / start consume");
                }
            }

            if !recover(&connection_manager, &conn_name, &shutdown).await {
                return;
            }
        }
    });
}

/// Waits until the parent connection is open again (or shutdown fires),
/// sleeping [`RECOVER_WAIT`] between checks. Returns `false` on shutdown.
async fn recover(connection_manager: &Arc<ConnectionManager>, conn_name: &str, shutdown: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(RECOVER_WAIT) => {}
            _ = shutdown.cancelled() => return false,
        }
        match connection_manager.connection(conn_name).await {
            Ok(handle) if handle.state().await == ConnectionState::Open => return true,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(error = %e, conn = %conn_name, "failed to recreate channel");
            }
        }
    }
}

/// Declares topology, starts `basic_consume`, and spawns the delivery
/// loop. Returns a `Notify` that fires when the channel closes.
async fn open_and_consume(
    handle: &ConnectionHandle,
    descriptor: &ConsumerDescriptor,
    exporter: Arc<dyn Exporter>,
) -> Result<Arc<Notify>, crate::error::ConsumeError> {
    let channel = handle.create_channel().await?;

    let subscriber_service = match descriptor.mode {
        DestinationMode::Queue => None,
        DestinationMode::Event => Some(descriptor.service.as_str()),
    };
    let queue_name = topology::declare(&channel, &descriptor.name, descriptor.mode, subscriber_service).await?;

    let consumer = channel
        .basic_consume(
            &queue_name,
            "",
            BasicConsumeOptions { no_ack: false, ..Default::default() },
            FieldTable::default(),
        )
        .await
        .map_err(crate::error::ConsumeError::Register)?;

    let close_notify = Arc::new(Notify::new());
    {
        let close_notify = close_notify.clone();
        channel.on_error(move |_err| {
            close_notify.notify_waiters();
        });
    }

    spawn_delivery_loop(channel, consumer, queue_name, descriptor.clone(), exporter);

    Ok(close_notify)
}

fn spawn_delivery_loop(
    channel: Channel,
    mut consumer: lapin::Consumer,
    queue_name: String,
    descriptor: ConsumerDescriptor,
    exporter: Arc<dyn Exporter>,
) {
    let retry_exchange = topology::retry_exchange_name(&descriptor.name);

    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(error = %e, "error receiving delivery");
                    continue;
                }
            };

            let start = Instant::now();
            let success = invoke_callback(&descriptor.callback, &delivery.data);

            if !success {
                if let Err(e) = channel
                    .basic_publish(
                        &retry_exchange,
                        &queue_name,
                        BasicPublishOptions::default(),
                        &delivery.data,
                        BasicProperties::default().with_delivery_mode(2),
                    )
                    .await
                {
                    tracing::error!(error = %e, "failed to publish to retry exchange");
                }
                let labels = ServiceNameLabels { service: &descriptor.service, name: &descriptor.name };
                match descriptor.mode {
                    DestinationMode::Queue => exporter.inc_receive_error(labels),
                    DestinationMode::Event => exporter.inc_handle_error(labels),
                }
            }

            // Either the callback succeeded or the retry copy is already
            // accepted by the broker: the original is always ACKed so it is
            // never redelivered alongside its retry-queue twin.
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                tracing::error!(error = %e, "failed to ack delivery");
            }

            let labels = ServiceNameLabels { service: &descriptor.service, name: &descriptor.name };
            let elapsed = start.elapsed().as_secs_f64();
            match descriptor.mode {
                DestinationMode::Queue => exporter.observe_receive_seconds(labels, elapsed),
                DestinationMode::Event => exporter.observe_handle_seconds(labels, elapsed),
            }
        }
        tracing::info!(service = %descriptor.service, name = %descriptor.name, "delivery stream ended");
    });
}

fn invoke_callback(callback: &ConsumerCallback, body: &[u8]) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| callback(body))) {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(?panic, "consumer callback panicked, treating as retry");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_callback_converts_panic_to_false() {
        let callback: ConsumerCallback = Arc::new(|_body: &[u8]| -> bool { panic!("boom") });
        assert!(!invoke_callback(&callback, b"x"));
    }

    #[test]
    fn invoke_callback_passes_through_result() {
        let callback: ConsumerCallback = Arc::new(|body: &[u8]| body == b"ok");
        assert!(invoke_callback(&callback, b"ok"));
        assert!(!invoke_callback(&callback, b"no"));
    }

    #[test]
    fn descriptor_key_distinguishes_queue_and_event_modes() {
        let cb: ConsumerCallback = Arc::new(|_: &[u8]| true);
        let queue = ConsumerDescriptor { service: "svc".into(), name: "n".into(), mode: DestinationMode::Queue, callback: cb.clone() };
        let event = ConsumerDescriptor { service: "svc".into(), name: "n".into(), mode: DestinationMode::Event, callback: cb };
        assert_ne!(queue.key(), event.key());
    }
}
