#![doc = include_str!("../README.md")]

mod server;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::Stream;
use server::config::{CliArgs, CoordinatorKind, ServerConfig};
use server::registrar::bind_worker_ids;
use server::sanity::ClusterSanityChecker;
use server::service::handler::IdService;
use server::telemetry::init_telemetry;
use snowfleet_coord::{CoordinationRegistry, Coordinator, MemoryTree, PeerRecord};
use snowfleet_tonic_client::GrpcConnector;
use snowfleet_tonic_core::proto::{FILE_DESCRIPTOR_SET, snowflake_server::SnowflakeServer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::transport::server::Connected;
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;
use tracing::{error, info, warn};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let coordinator = connect_coordinator(&config).await?;
    let coordination = Arc::new(
        CoordinationRegistry::connect(coordinator, config.coordination_timeout)
            .await
            .context("coordination service unreachable")?,
    );
    coordination.ensure_root_path(&config.root_path).await?;

    let connector = Arc::new(GrpcConnector::default());
    ClusterSanityChecker::new(
        &coordination,
        connector,
        &config.root_path,
        config.datacenter_id,
    )
    .check_peers()
    .await
    .context("fleet sanity check failed")?;

    let record = PeerRecord::new(config.advertise_addrs.clone())
        .with_secondary_endpoints(config.secondary_addrs.clone());
    let workers = bind_worker_ids(
        Arc::clone(&coordination),
        &config.root_path,
        &config.worker_ids,
        config.datacenter_id,
        config.epoch,
        &record,
    )
    .await?;
    let service = IdService::new(Arc::new(workers));

    let tcp = match TcpListener::bind(&config.server_addr).await {
        Ok(tcp) => tcp,
        Err(e) => {
            // Nobody is going to serve the slots we just claimed.
            if let Err(release_err) = service.shutdown().await {
                warn!(error = %release_err, "failed to release worker slots");
            }
            return Err(e).with_context(|| format!("cannot listen on {}", config.server_addr));
        }
    };
    info!(addr = %config.server_addr, "listening");

    let incoming = TcpListenerStream::new(tcp);
    let result = run_server_with_incoming(incoming, service).await;

    if let Err(e) = coordination.close().await {
        warn!(error = %e, "failed to close coordination session");
    }
    result
}

async fn connect_coordinator(config: &ServerConfig) -> anyhow::Result<Arc<dyn Coordinator>> {
    match config.coordinator {
        CoordinatorKind::Memory => {
            warn!("using the in-process coordinator; other nodes cannot see this one");
            Ok(Arc::new(MemoryTree::new().connect()))
        }
        #[cfg(feature = "etcd")]
        CoordinatorKind::Etcd => {
            let etcd = snowfleet_coord::EtcdCoordinator::connect(snowfleet_coord::EtcdConfig {
                endpoints: config.coordination_endpoints.clone(),
                session_ttl: config.session_ttl,
                connect_timeout: config.coordination_timeout,
            })
            .await
            .context("cannot connect to etcd")?;
            Ok(Arc::new(etcd))
        }
        #[cfg(not(feature = "etcd"))]
        CoordinatorKind::Etcd => {
            anyhow::bail!("etcd support is not compiled in; rebuild with `--features etcd`")
        }
    }
}

async fn run_server_with_incoming<I, IO, IE>(incoming: I, service: IdService) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<SnowflakeServer<IdService>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    Server::builder()
        .add_service(health_service)
        .add_service(reflection)
        .add_service(SnowflakeServer::new(service.clone()))
        .serve_with_incoming_shutdown(incoming, shutdown_signal(service, health_reporter))
        .await?;

    info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        info!(
            "Starting ID service on {} with full config: {:#?}",
            config.server_addr, config
        );
    } else {
        info!(
            addr = %config.server_addr,
            datacenter_id = config.datacenter_id,
            worker_ids = ?config.worker_ids,
            "Starting ID service"
        );
    }
}

async fn shutdown_signal(service: IdService, health_reporter: HealthReporter) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }

    info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<SnowflakeServer<IdService>>()
        .await;

    // 2. Hand the slots over to the standbys
    if let Err(e) = service.shutdown().await {
        error!(error = %e, "Error during service shutdown");
    }
}
