// =============================================================================
// Matrixon Sync Gateway - Main Entry Point
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Entry point of the sync gateway binary: loads the configuration, sets up
//   tracing, builds the services and serves the HTTP API until Ctrl+C or
//   SIGTERM.
//
// Runtime Requirements:
//   • --config <path> or MATRIXON_GATEWAY_CONFIG pointing to the config file
//   • Sufficient file descriptors (one upstream long-poll per session)
//
// =============================================================================

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, MatchedPath},
    http::{
        header::{self, HeaderName},
        Method, Request,
    },
};
use matrixon_gateway::{
    api,
    clap::{self, Commands},
    upstream::HttpConnector,
    Config, Services,
};
use std::time::Instant;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};
use uuid::Uuid;

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() {
    let args = clap::parse();

    let Some(config_path) = args.config.clone() else {
        eprintln!("No configuration file specified!");
        eprintln!("Use --config <path> or set the MATRIXON_GATEWAY_CONFIG environment variable");
        std::process::exit(1);
    };

    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    if let Some(log_level) = args.log_level {
        config.log = log_level;
    }

    match args.command.unwrap_or(Commands::Start {
        address: None,
        port: None,
    }) {
        Commands::CheckConfig => {
            println!("✅ Configuration at {} is valid", config_path.display());
        }
        Commands::Start { address, port } => {
            if let Some(address) = address {
                config.address = address;
            }
            if let Some(port) = port {
                config.port = port;
            }
            init_tracing(&config);
            info!("📁 Using configuration file: {}", config_path.display());
            start_server(config).await;
        }
    }
}

fn init_tracing(config: &Config) {
    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(&config.log) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::new("warn")
        }
    };

    let subscriber = registry.with(filter_layer).with(fmt_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {e}");
    }
}

async fn start_server(config: Config) {
    let start = Instant::now();
    info!("🚀 Starting Matrixon Sync Gateway {}", clap::version());
    config.warn_suspicious();

    // One upstream long-poll per session adds up quickly; the soft limit is
    // usually 1024.
    #[cfg(unix)]
    if let Err(e) = maximize_fd_limit() {
        warn!("⚠️ Could not raise the file descriptor limit: {}", e);
    }

    let connector = match HttpConnector::new(&config) {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            error!("❌ Failed to build the upstream client: {}", e);
            std::process::exit(1);
        }
    };

    let services = Services::build(config, connector);
    let maintenance = services.spawn_maintenance();
    info!("✅ Gateway initialized in {:?}", start.elapsed());

    let outcome = run_server(services).await;
    maintenance.abort();

    match outcome {
        Ok(()) => info!("✅ Gateway shutdown completed successfully"),
        Err(e) => {
            error!("❌ Gateway crashed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_server(services: Arc<Services>) -> io::Result<()> {
    let config = Arc::clone(&services.config);
    let addr = SocketAddr::from((config.address, config.port));

    let x_requested_with = HeaderName::from_static("x-requested-with");

    let middlewares = ServiceBuilder::new()
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let path = if let Some(path) = request.extensions().get::<MatchedPath>() {
                    path.as_str()
                } else {
                    request.uri().path()
                };

                let request_id = Uuid::new_v4();
                tracing::info_span!("http_request", %path, %request_id)
            }),
        )
        .layer(axum::middleware::from_fn(api::unrecognized_method))
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::ORIGIN,
                    x_requested_with,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::AUTHORIZATION,
                ])
                .max_age(Duration::from_secs(86400)),
        )
        .layer(DefaultBodyLimit::max(config.max_request_size as usize));

    let app = api::routes(services).layer(middlewares);

    let listener = TcpListener::bind(addr).await?;
    info!("🚀 Matrixon Sync Gateway listening on: {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("❌ Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("❌ Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
}

#[cfg(unix)]
#[tracing::instrument(err)]
fn maximize_fd_limit() -> std::result::Result<(), nix::errno::Errno> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let res = Resource::RLIMIT_NOFILE;

    let (soft_limit, hard_limit) = getrlimit(res)?;

    debug!("Current nofile soft limit: {soft_limit}");

    setrlimit(res, hard_limit, hard_limit)?;

    debug!("Increased nofile soft limit to {hard_limit}");

    Ok(())
}
