use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use messageman_core::config::Config;
use messageman_core::{Broker, JsonWrapper, Registrar};
use messageman_metrics::create_exporter;
use tonic::transport::Server as GrpcServer;
use tower::ServiceBuilder;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod grpc;
mod pb;
mod rest;

use cli::Args;
use grpc::{IngressGrpcService, TonicGrpcDispatcher};
use pb::v1::ingress_service_server::IngressServiceServer;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config_file);
    init_tracing(&config.logging.level, config.logging.humanize);

    tracing::info!(mode = ?config.mode, "starting messageman");

    if config.events.is_empty() && config.queues.is_empty() {
        tracing::warn!("no registered queues or events found, check your configuration file");
    }

    let exporter: Arc<dyn messageman_metrics::Exporter> = create_exporter(config.metric.enabled, &config.metric.exporter).into();
    let broker = Arc::new(Broker::new(config.rabbit_mq.url.clone(), exporter.clone()));
    let wrapper = Arc::new(JsonWrapper);
    let grpc_dispatcher = Arc::new(TonicGrpcDispatcher::new());

    if config.is_sidecar() {
        if let Some(main_api) = &args.main_api {
            let readiness = config
                .queues
                .iter()
                .map(|q| &q.worker.readiness.path)
                .chain(config.events.iter().flat_map(|e| e.subscribers.iter().map(|s| &s.readiness.path)))
                .find(|p| !p.is_empty());
            if let Some(path) = readiness {
                let client = reqwest::Client::new();
                messageman_core::waitfor::wait_for_api(&client, &format!("{main_api}{path}")).await;
            }
        }
    }

    let registrar = Arc::new(Registrar::new(broker.clone(), wrapper.clone(), grpc_dispatcher, config.proxy.headers.clone()));
    registrar.start(&config, config.is_sidecar()).await;

    let rest_state = rest::AppState {
        broker: broker.clone(),
        wrapper: wrapper.clone(),
        exporter: exporter.clone(),
        main_api: args.main_api.clone(),
        proxy_headers: config.proxy.headers.clone(),
    };

    let rest_app = rest::router(rest_state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)),
    );

    let rest_addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let grpc_addr: SocketAddr = format!("0.0.0.0:{}", config.grpc_port).parse()?;

    let ingress_grpc = IngressGrpcService {
        broker: broker.clone(),
        wrapper: wrapper.clone(),
        main_api: args.main_api.clone(),
        proxy_headers: config.proxy.headers.clone(),
    };

    tracing::info!(%rest_addr, "REST ingress listening");
    tracing::info!(%grpc_addr, "gRPC ingress listening");

    let rest_listener = tokio::net::TcpListener::bind(rest_addr).await?;
    let rest_fut = axum::serve(rest_listener, rest_app);
    let grpc_fut = GrpcServer::builder().add_service(IngressServiceServer::new(ingress_grpc)).serve(grpc_addr);

    tokio::select! {
        result = rest_fut => {
            if let Err(e) = result {
                tracing::error!(error = %e, "REST server exited");
                std::process::exit(1);
            }
        }
        result = grpc_fut => {
            if let Err(e) = result {
                tracing::error!(error = %e, "gRPC server exited");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            broker.shutdown();
        }
    }

    Ok(())
}

fn init_tracing(level: &str, humanize: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if humanize {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}
