//! Public 5-op broker contract ("Messager"): connectivity check,
//! queue-send, queue-consume, publish, subscribe. Owns the connection
//! manager and the per-consumer channel supervisors.

pub mod channel;
pub mod connection;
pub mod topology;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

pub use channel::{ConsumerCallback, ConsumerDescriptor};
pub use connection::ConnectionManager;
pub use topology::DestinationMode;

use crate::error::{ConsumeError, PublishError};
use messageman_metrics::{Exporter, ServiceNameLabels};

/// The broker-adapter's public surface, parameterized over the connection
/// name each call runs under (the publisher/subscriber's service name).
pub struct Broker {
    connections: Arc<ConnectionManager>,
    exporter: Arc<dyn Exporter>,
    shutdown: CancellationToken,
    supervised: Mutex<HashSet<(String, String, &'static str)>>,
}

impl Broker {
    pub fn new(amqp_url: String, exporter: Arc<dyn Exporter>) -> Self {
        Self {
            connections: Arc::new(ConnectionManager::new(amqp_url, exporter.clone())),
            exporter,
            shutdown: CancellationToken::new(),
            supervised: Mutex::new(HashSet::new()),
        }
    }

    /// Best-effort dial-then-close probe. Never panics; `false` on any failure.
    pub async fn ensure_can_connect(&self) -> bool {
        self.connections.probe().await
    }

    /// Subscribe to per-connection-name recover notifications. Used by the
    /// Registrar to re-register consumers after a broker reconnect.
    pub fn subscribe_recover(&self) -> broadcast::Receiver<String> {
        self.connections.subscribe_recover()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connections.shutdown();
    }

    /// Sends `message` to the job queue `name` on behalf of `service`.
    pub async fn queue_send(&self, service: &str, name: &str, message: &[u8]) -> Result<(), PublishError> {
        self.send_to_exchange(service, DestinationMode::Queue, name, name, message).await
    }

    /// Publishes `message` to the pub/sub event `event` on behalf of `service`.
    pub async fn publish(&self, service: &str, event: &str, message: &[u8]) -> Result<(), PublishError> {
        self.send_to_exchange(service, DestinationMode::Event, event, event, message).await
    }

    async fn send_to_exchange(
        &self,
        service: &str,
        mode: DestinationMode,
        destination: &str,
        routing_key: &str,
        message: &[u8],
    ) -> Result<(), PublishError> {
        let start = Instant::now();
        let result = self.send_to_exchange_inner(service, destination, routing_key, message).await;
        let labels = ServiceNameLabels { service, name: destination };
        match mode {
            DestinationMode::Queue => {
                if result.is_err() {
                    self.exporter.inc_send_error(labels.clone());
                }
                self.exporter.observe_send_seconds(labels, start.elapsed().as_secs_f64());
            }
            DestinationMode::Event => {
                if result.is_err() {
                    self.exporter.inc_publish_error(labels.clone());
                }
                self.exporter.observe_publish_seconds(labels, start.elapsed().as_secs_f64());
            }
        }
        result
    }

    async fn send_to_exchange_inner(
        &self,
        service: &str,
        destination: &str,
        routing_key: &str,
        message: &[u8],
    ) -> Result<(), PublishError> {
        let handle = self.connections.connection(service).await.map_err(PublishError::from)?;
        let channel = handle.create_channel().await.map_err(PublishError::from)?;
        topology::declare_main_exchange(&channel, destination).await.map_err(PublishError::from)?;

        channel
            .basic_publish(
                destination,
                routing_key,
                BasicPublishOptions::default(),
                message,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(PublishError::Broker)?;

        if let Err(e) = channel.close(200, "publish done").await {
            tracing::warn!(error = %e, "failed to close transient publish channel");
        }
        Ok(())
    }

    /// Registers a job-queue consumer. Idempotent: re-registering the same
    /// `(service, name, Queue)` key is a no-op against the already-running
    /// consumer rather than opening a second one.
    pub async fn queue_consume(&self, service: &str, name: &str, callback: ConsumerCallback) -> Result<(), ConsumeError> {
        self.register_consumer(service, name, DestinationMode::Queue, callback).await
    }

    /// Registers a pub/sub subscriber for `event` scoped to `service`.
    pub async fn subscribe(&self, service: &str, event: &str, callback: ConsumerCallback) -> Result<(), ConsumeError> {
        self.register_consumer(service, event, DestinationMode::Event, callback).await
    }

    async fn register_consumer(
        &self,
        service: &str,
        name: &str,
        mode: DestinationMode,
        callback: ConsumerCallback,
    ) -> Result<(), ConsumeError> {
        // Fail fast on the initial dial so the caller (Registrar startup)
        // sees a surfaced error; the supervisor takes over reconnects after
        // this point.
        let _ = self.connections.connection(service).await.map_err(ConsumeError::from)?;

        let descriptor = ConsumerDescriptor { service: service.to_string(), name: name.to_string(), mode, callback };
        let key = descriptor.key();
        {
            let mut supervised = self.supervised.lock().await;
            if !supervised.insert(key) {
                // Already has a live supervisor for this (service, name, mode);
                // channel.rs's own recover() loop re-establishes it after a
                // disconnect, so a repeat call (e.g. from the recover broadcast)
                // is a no-op rather than a second live channel.
                return Ok(());
            }
        }

        channel::supervise(
            Arc::clone(&self.connections),
            service.to_string(),
            descriptor,
            self.exporter.clone(),
            self.shutdown.clone(),
        );
        Ok(())
    }
}
