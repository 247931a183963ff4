use crate::config::{Config, NamespaceFilter};
use crate::oci_registry::HttpRegistry;
use crate::state::ControllerContext;
use crate::webserver::AppState;
use anyhow::Context;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};

mod config;
mod controller;
mod credentials;
mod evaluator;
mod image_reference;
mod oci_registry;
mod policy;
mod secret_string;
mod state;
mod tags;
#[cfg(test)]
mod test_support;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match env::var("CONFIG_PATH") {
        Ok(path) => config::load_config(&path)?,
        Err(_) => Config::default(),
    };

    let level = config.log_level.as_deref().unwrap_or("info");
    let parsed_level = level.parse::<Level>();
    tracing_subscriber::fmt()
        .with_max_level(*parsed_level.as_ref().unwrap_or(&Level::INFO))
        .init();
    if parsed_level.is_err() {
        warn!("Invalid log level {}, falling back to info", level);
    }
    info!("Starting kube-image-updater {}", env!("CARGO_PKG_VERSION"));

    let kube_client = controller::create_client(config.kubeconfig.as_deref()).await?;
    let http_client = oci_registry::create_client(&config)?;
    let namespace_filter = NamespaceFilter::new(&config.updater.allowed_namespaces)?;
    let registry = HttpRegistry::new(http_client, &config.registries);

    if config
        .webserver
        .api_key
        .as_ref()
        .is_none_or(|key| key.is_empty())
    {
        warn!("No webserver.apiKey configured, the update endpoint only accepts requests without a key");
    }

    let token = CancellationToken::new();
    let config = Arc::new(config);

    let updater = if config.updater.enabled {
        let ctx = ControllerContext {
            kube_client: kube_client.clone(),
            config: config.clone(),
            registry,
            namespace_filter,
        };
        Some(tokio::spawn(controller::run(ctx, token.clone())))
    } else {
        info!("Image updater disabled, only serving the API");
        None
    };

    let app = webserver::create_app(AppState {
        kube_client,
        api_key: config.webserver.api_key.clone(),
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await?;

    if let Some(updater) = updater {
        updater.await.context("Image updater task failed")?;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
    token.cancel();
}
