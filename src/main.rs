use std::{net::SocketAddr, sync::Arc};

use previewd::docker_client::DockerClient;
use previewd::events::{BroadcastPublisher, EventPublisher, Events, FanoutPublisher};
use previewd::executor::{BuildExecutor, ExecutorSettings};
use previewd::ports::LocalPortAllocator;
use previewd::process::TokioProcessRunner;
use previewd::slack_client::{SlackNotifier, SlackWebhookClient};
use previewd::source::GitSource;
use previewd::store::MemoryStore;
use previewd::{AppState, Config, PreviewService};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with env filter, defaulting to debug levels if RUST_LOG is unset.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("debug,axum=info,reqwest=info,hyper_util=info,bollard=info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    let config = Config::load()?;
    let tokens = config.token_owners()?;
    if tokens.is_empty() {
        tracing::warn!("No API tokens configured, user routes will reject every request");
    }

    let store = Arc::new(match &config.store_path {
        Some(path) => MemoryStore::open(path).await?,
        None => MemoryStore::new(),
    });

    let broadcast = Arc::new(BroadcastPublisher::new(EVENT_CAPACITY));
    let mut publishers: Vec<Arc<dyn EventPublisher>> =
        vec![broadcast.clone() as Arc<dyn EventPublisher>];
    if let Some(url) = &config.slack_webhook_url {
        publishers.push(Arc::new(SlackNotifier::new(SlackWebhookClient::new(url)?)));
        tracing::info!("Slack notifications enabled");
    }
    let events = Events::new(Arc::new(FanoutPublisher::new(publishers)));

    let docker_client = DockerClient::new()?;
    let runner = Arc::new(TokioProcessRunner);
    let executor = BuildExecutor::new(
        store.clone(),
        Arc::new(LocalPortAllocator::new(store.clone())),
        runner.clone(),
        Arc::new(docker_client.clone()),
        ExecutorSettings {
            port_range: config.port_range(),
            container_port: config.container_port,
            public_host: config.public_host.clone(),
            docker_bin: config.docker_bin.clone(),
            dockerfile: config.dockerfile.clone(),
        },
    );
    let source = GitSource::new(
        runner,
        &config.git_bin,
        &config.git_url_template,
        &config.workspace_dir,
    );
    let service = PreviewService::new(
        store,
        Arc::new(source),
        executor,
        Arc::new(docker_client.clone()),
        events,
    );

    let addr: SocketAddr = config.bind_addr.parse()?;
    let state = AppState {
        service,
        publisher: broadcast,
        docker_client: Some(docker_client),
        tokens: Arc::new(tokens),
        config: Arc::new(config),
    };

    let app = previewd::api::router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
