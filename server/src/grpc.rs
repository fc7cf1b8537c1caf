//! gRPC ingress (`IngressService`) and the egress dispatcher that forwards
//! deliveries to subscriber/worker endpoints registered with `type: grpc`
//! (`DeliveryService` client, deduped per service).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use messageman_core::registrar::{filter_proxy_headers, GrpcDispatcher};
use messageman_core::{Broker, Wrapper};
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use crate::pb::v1::delivery_service_client::DeliveryServiceClient;
use crate::pb::v1::ingress_service_server::IngressService;
use crate::pb::v1::{DeliverRequest, Empty, PublishRequest, QueueRequest};

const GRPC_METADATA_SERVICE_NAME: &str = "x-service-name";
const DELIVERY_CALL_DEADLINE: Duration = Duration::from_secs(60);

pub struct IngressGrpcService {
    pub broker: Arc<Broker>,
    pub wrapper: Arc<dyn Wrapper>,
    pub main_api: Option<String>,
    pub proxy_headers: Vec<String>,
}

impl IngressGrpcService {
    fn attribute_service(&self, request: &Request<impl Sized>) -> String {
        if let Some(main_api) = &self.main_api {
            return main_api.clone();
        }
        request
            .metadata()
            .get(GRPC_METADATA_SERVICE_NAME)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    fn envelope_headers(&self, request: &Request<impl Sized>) -> HashMap<String, Vec<u8>> {
        let pairs: Vec<(&str, &[u8])> = request
            .metadata()
            .iter()
            .filter_map(|kv| match kv {
                tonic::metadata::KeyAndValueRef::Ascii(k, v) => Some((k.as_str(), v.as_bytes())),
                tonic::metadata::KeyAndValueRef::Binary(_, _) => None,
            })
            .collect();
        filter_proxy_headers(&self.proxy_headers, pairs)
    }

    fn wrap(&self, headers: &HashMap<String, Vec<u8>>, body: &[u8]) -> Result<Vec<u8>, Status> {
        self.wrapper.wrap(body, headers).map_err(|e| Status::internal(format!("failed to wrap message: {e}")))
    }
}

#[tonic::async_trait]
impl IngressService for IngressGrpcService {
    async fn queue(&self, request: Request<QueueRequest>) -> Result<Response<Empty>, Status> {
        let service = self.attribute_service(&request);
        let headers = self.envelope_headers(&request);
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("The \"name\" field is required."));
        }
        if req.message.is_empty() {
            return Err(Status::invalid_argument("The \"message\" field is required."));
        }
        let wrapped = self.wrap(&headers, &req.message)?;
        self.broker
            .queue_send(&service, &req.name, &wrapped)
            .await
            .map_err(|e| Status::unknown(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    async fn publish(&self, request: Request<PublishRequest>) -> Result<Response<Empty>, Status> {
        let service = self.attribute_service(&request);
        let headers = self.envelope_headers(&request);
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("The \"name\" field is required."));
        }
        if req.message.is_empty() {
            return Err(Status::invalid_argument("The \"message\" field is required."));
        }
        let wrapped = self.wrap(&headers, &req.message)?;
        self.broker
            .publish(&service, &req.name, &wrapped)
            .await
            .map_err(|e| Status::unknown(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }
}

/// Dials each subscriber/worker's gRPC endpoint at most once, keyed by
/// service name, and reuses the handle across recoveries.
pub struct TonicGrpcDispatcher {
    clients: Mutex<HashMap<String, DeliveryServiceClient<Channel>>>,
}

impl TonicGrpcDispatcher {
    pub fn new() -> Self {
        Self { clients: Mutex::new(HashMap::new()) }
    }

    async fn client_for(&self, service: &str, url: &str) -> Option<DeliveryServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(service) {
            return Some(client.clone());
        }
        match Channel::from_shared(url.to_string()).ok()?.connect().await {
            Ok(channel) => {
                let client = DeliveryServiceClient::new(channel);
                clients.insert(service.to_string(), client.clone());
                Some(client)
            }
            Err(e) => {
                tracing::error!(error = %e, service, url, "failed to dial gRPC worker/subscriber endpoint");
                None
            }
        }
    }
}

impl Default for TonicGrpcDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GrpcDispatcher for TonicGrpcDispatcher {
    async fn dispatch(&self, service: &str, url: &str, headers: &HashMap<String, Vec<u8>>, body: &[u8]) -> bool {
        let Some(mut client) = self.client_for(service, url).await else {
            return false;
        };

        let mut request = Request::new(DeliverRequest { body: body.to_vec(), headers: headers.clone() });
        request.set_timeout(DELIVERY_CALL_DEADLINE);
        for (name, value) in headers {
            let value_str = String::from_utf8_lossy(value);
            if let (Ok(key), Ok(val)) = (
                tonic::metadata::MetadataKey::from_bytes(name.as_bytes()),
                tonic::metadata::MetadataValue::try_from(value_str.as_ref()),
            ) {
                request.metadata_mut().insert(key, val);
            }
        }

        match client.deliver(request).await {
            Ok(_) => true,
            Err(status) => {
                tracing::error!(service, code = ?status.code(), message = status.message(), "gRPC delivery failed");
                false
            }
        }
    }
}
