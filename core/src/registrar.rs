//! Binds each configured endpoint (REST or gRPC) to a consumer callback on
//! the Broker; re-registers on the recover signal.
//!
//! The gRPC dispatch mechanics (dialing, the generated stub, the unary
//! call) live outside this crate per the out-of-scope list in the design —
//! `Registrar` depends only on the narrow [`GrpcDispatcher`] trait, which
//! `messageman-server` implements against its `tonic`-generated client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;

use crate::broker::{Broker, DestinationMode};
use crate::config::{Config, EndpointConfig, EndpointKind};
use crate::wrapper::Wrapper;

const ENDPOINT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound gRPC dispatch, implemented by the ingress server against its
/// generated client stubs. Returns `true` iff the call completed with an
/// `Ok` status.
#[async_trait]
pub trait GrpcDispatcher: Send + Sync {
    async fn dispatch(&self, service: &str, url: &str, headers: &HashMap<String, Vec<u8>>, body: &[u8]) -> bool;
}

#[derive(Clone, Copy)]
struct NoGrpcDispatcher;

#[async_trait]
impl GrpcDispatcher for NoGrpcDispatcher {
    async fn dispatch(&self, service: &str, _url: &str, _headers: &HashMap<String, Vec<u8>>, _body: &[u8]) -> bool {
        tracing::error!(service, "no gRPC dispatcher configured; treating endpoint as failed");
        false
    }
}

#[derive(Clone)]
struct RegisteredEndpoint {
    destination: String,
    mode: DestinationMode,
    consumer_service: String,
    endpoint: EndpointConfig,
}

pub struct Registrar {
    broker: Arc<Broker>,
    wrapper: Arc<dyn Wrapper>,
    http: Client,
    grpc: Arc<dyn GrpcDispatcher>,
    proxy_headers: Vec<String>,
    registered: Mutex<Vec<RegisteredEndpoint>>,
}

impl Registrar {
    pub fn new(broker: Arc<Broker>, wrapper: Arc<dyn Wrapper>, grpc: Arc<dyn GrpcDispatcher>, proxy_headers: Vec<String>) -> Self {
        Self {
            broker,
            wrapper,
            http: Client::builder().timeout(ENDPOINT_CALL_TIMEOUT).build().expect("valid http client config"),
            grpc,
            proxy_headers,
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn without_grpc(broker: Arc<Broker>, wrapper: Arc<dyn Wrapper>, proxy_headers: Vec<String>) -> Self {
        Self::new(broker, wrapper, Arc::new(NoGrpcDispatcher), proxy_headers)
    }

    /// Waits for `ensure_can_connect`, then registers every queue worker
    /// and event subscriber from `config`, and spawns the recover listener.
    /// `skip_wait` is set in sidecar mode, where `main` has already waited
    /// on the co-located service's readiness URL.
    pub async fn start(self: &Arc<Self>, config: &Config, skip_wait: bool) {
        if !skip_wait {
            crate::waitfor::wait_for_true(|| {
                let broker = self.broker.clone();
                async move { broker.ensure_can_connect().await }
            })
            .await;
        }

        for queue in &config.queues {
            self.register(queue.name.clone(), DestinationMode::Queue, queue.worker.name.clone(), queue.worker.clone())
                .await;
        }
        for event in &config.events {
            for subscriber in &event.subscribers {
                self.register(event.name.clone(), DestinationMode::Event, subscriber.name.clone(), subscriber.clone())
                    .await;
            }
        }

        self.spawn_recover_listener();
    }

    async fn register(
        self: &Arc<Self>,
        destination: String,
        mode: DestinationMode,
        consumer_service: String,
        endpoint: EndpointConfig,
    ) {
        let registrar = Arc::clone(self);
        let entry = RegisteredEndpoint { destination: destination.clone(), mode, consumer_service: consumer_service.clone(), endpoint: endpoint.clone() };

        let callback: crate::broker::ConsumerCallback = {
            let registrar = Arc::clone(&registrar);
            let endpoint = endpoint.clone();
            Arc::new(move |body: &[u8]| {
                let registrar = Arc::clone(&registrar);
                let endpoint = endpoint.clone();
                let body = body.to_vec();
                tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current().block_on(async move { registrar.dispatch(&endpoint, &body).await })
                })
            })
        };

        let result = match mode {
            DestinationMode::Queue => self.broker.queue_consume(&consumer_service, &destination, callback).await,
            DestinationMode::Event => self.broker.subscribe(&consumer_service, &destination, callback).await,
        };

        match result {
            Ok(()) => {
                self.registered.lock().await.push(entry);
                tracing::info!(destination = %destination, service = %consumer_service, "endpoint registered");
            }
            Err(e) => {
                tracing::error!(error = %e, destination = %destination, service = %consumer_service, "failed to register endpoint");
            }
        }
    }

    async fn dispatch(&self, endpoint: &EndpointConfig, message: &[u8]) -> bool {
        let (body, headers) = match self.wrapper.unwrap(message) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to unwrap envelope, treating as retry");
                return false;
            }
        };

        match endpoint.kind {
            EndpointKind::Rest => self.dispatch_rest(endpoint, &body, &headers).await,
            EndpointKind::Grpc => self.grpc.dispatch(&endpoint.name, &endpoint.url, &headers, &body).await,
        }
    }

    async fn dispatch_rest(&self, endpoint: &EndpointConfig, body: &[u8], headers: &HashMap<String, Vec<u8>>) -> bool {
        let url = format!("{}{}", endpoint.url, endpoint.path);
        let mut request = self.http.post(&url).header("Content-Type", "application/json").body(body.to_vec());
        for name in &self.proxy_headers {
            if let Some(value) = headers.get(name.as_str()) {
                request = request.header(name.as_str(), value.clone());
            }
        }
        match request.send().await {
            Ok(response) => response.status().as_u16() < 300,
            Err(e) => {
                tracing::error!(error = %e, url, "endpoint call failed");
                false
            }
        }
    }

    fn spawn_recover_listener(self: &Arc<Self>) {
        let registrar = Arc::clone(self);
        let mut recover_rx = self.broker.subscribe_recover();
        tokio::spawn(async move {
            loop {
                match recover_rx.recv().await {
                    Ok(conn_name) => registrar.reregister_for_connection(&conn_name).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        tracing::warn!("recover listener lagged, resyncing all consumers");
                        registrar.reregister_all().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn reregister_for_connection(self: &Arc<Self>, conn_name: &str) {
        let snapshot: Vec<RegisteredEndpoint> = self.registered.lock().await.clone();
        for entry in snapshot {
            if entry.consumer_service == conn_name {
                self.register(entry.destination, entry.mode, entry.consumer_service, entry.endpoint).await;
            }
        }
    }

    async fn reregister_all(self: &Arc<Self>) {
        let snapshot: Vec<RegisteredEndpoint> = self.registered.lock().await.clone();
        for entry in snapshot {
            self.register(entry.destination, entry.mode, entry.consumer_service, entry.endpoint).await;
        }
    }
}

/// Allow-list filters inbound request headers down to the ones configured
/// for propagation into the envelope.
pub fn filter_proxy_headers<'a>(
    allow_list: &[String],
    headers: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> HashMap<String, Vec<u8>> {
    let allowed: std::collections::HashSet<&str> = allow_list.iter().map(|s| s.as_str()).collect();
    headers
        .into_iter()
        .filter(|(name, _)| allowed.contains(name))
        .map(|(name, value)| (name.to_string(), value.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_proxy_headers_drops_unlisted_names() {
        let allow = vec!["x-tenant-id".to_string()];
        let headers = vec![("x-tenant-id", b"A".as_slice()), ("x-other", b"B".as_slice())];
        let out = filter_proxy_headers(&allow, headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("x-tenant-id").unwrap(), b"A");
    }
}
