use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use merge_queue::config::Config;
use merge_queue::engine::{self, Engine, HookClient};
use merge_queue::github::OctocrabClient;
use merge_queue::persistence::{JsonFileStore, StateStore};
use merge_queue::server::{AppState, build_router};
use merge_queue::worker::{self, RECHECK_DELAY};

/// How often collaborator and team lists are re-read.
const PERMISSION_REFRESH: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "merge_queue=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = Config::resolve_path(std::env::args().nth(1));
    let config = Arc::new(
        Config::load(&path).with_context(|| format!("loading configuration from {}", path.display()))?,
    );
    info!(path = %path.display(), repos = config.repos.len(), "Configuration loaded");

    let mut github = BTreeMap::new();
    let mut shared: Option<OctocrabClient> = None;
    for (label, repo) in &config.repos {
        let client = match &shared {
            Some(client) => client.for_repo(repo.id()),
            None => OctocrabClient::from_token(config.github.access_token.clone(), repo.id())
                .context("creating GitHub client")?,
        };
        shared.get_or_insert_with(|| client.clone());
        github.insert(label.clone(), Arc::new(client));
    }

    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&config.state_dir));
    let hooks = HookClient::new(reqwest::Client::new());
    let (engine, channels) = Engine::new(Arc::clone(&config), store, hooks, github);

    engine.sync().await;

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(worker::mergeability::run(
        Arc::clone(&engine),
        channels.mergeability,
        RECHECK_DELAY,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(engine::run_internal(
        Arc::clone(&engine),
        channels.internal,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(run_scheduler(
        Arc::clone(&engine),
        config.queue_interval(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(refresh_permissions(Arc::clone(&engine), shutdown.clone())));

    let app = build_router(AppState::new(Arc::clone(&engine)));
    let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port)
        .parse()
        .context("parsing listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl-C");
            }
            info!("Shutting down");
            signal.cancel();
        })
        .await
        .context("serving HTTP")?;

    shutdown.cancel();
    engine.timeouts().cancel_all();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task panicked");
        }
    }
    Ok(())
}

/// Ticks every `interval`, and as soon as the engine reports a change.
async fn run_scheduler(
    engine: Arc<Engine<OctocrabClient>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let changed = engine.changed();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = changed.notified() => {}
        }
        engine.tick().await;
    }
    info!("Scheduler stopped");
}

async fn refresh_permissions(engine: Arc<Engine<OctocrabClient>>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PERMISSION_REFRESH);
    // Startup synchronization already refreshed once.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => engine.refresh_permissions().await,
        }
    }
}
