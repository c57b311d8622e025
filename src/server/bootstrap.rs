use crate::analytics::{AnalyticsStore, NoopAnalyticsStore, PgAnalyticsStore};
use crate::config::GatewayConfig;
use crate::limiter::{MemoryWindowStore, RedisWindowStore, WindowStore};
use crate::rules::{RuleConfig, RuleSet};
use crate::server;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → connect stores → preload rules → serve →
/// drain → flush analytics.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load(&args.config_path)?;

    // Phase 1: the shared window store. A Redis that goes away later only
    // degrades admission to fail-open; failing to reach it at startup is
    // treated as misconfiguration.
    let store = build_window_store(&config).await?;

    // Phase 2: analytics destination. The pool connects lazily, so a down
    // database shows up as dropped batches, never as a startup failure.
    let analytics: Arc<dyn AnalyticsStore> = if config.analytics.enabled {
        Arc::new(PgAnalyticsStore::connect_lazy(
            &config.analytics.database_url,
            config.analytics.max_connections,
        )?)
    } else {
        tracing::info!("analytics: disabled, events will not be persisted");
        Arc::new(NoopAnalyticsStore)
    };

    let state = server::GatewayState::new(config, store, analytics)?;

    // Phase 3: optional rule preload. Rules are otherwise in-memory only;
    // the admin collaborator pushes the live set through PUT /rules.
    if let Some(ref file) = state.config.rules.file.clone() {
        let count = preload_rules(&state, file)?;
        tracing::info!("rules: preloaded from file, path={}, count={}", file, count);
    }

    // Phase 4: wire the analytics sink to the event broker.
    start_sink_pump(&state);

    // Phase 5: admin + proxy servers.
    start_admin_server(&state, &args);

    tracing::info!("server: starting gateway, listen={}", args.listen);

    let shutdown = Arc::new(Notify::new());
    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 6: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    // Everything in flight has finished; flush what the sink still holds.
    let deadline = state.config.analytics.shutdown_timeout;
    if let Err(e) = state.sink.close(deadline).await {
        tracing::error!("analytics: close failed: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn build_window_store(config: &GatewayConfig) -> Result<Arc<dyn WindowStore>> {
    match config.store.backend.as_str() {
        "memory" => {
            tracing::info!("store: using in-process memory backend (single instance)");
            let store = Arc::new(MemoryWindowStore::new());
            store.start_gc();
            Ok(store)
        }
        _ => {
            let store = RedisWindowStore::connect(
                &config.store.url,
                config.store.key_prefix.clone(),
                config.store.timeout,
            )
            .await
            .with_context(|| format!("store: connect failed, url={}", config.store.url))?;

            if let Err(e) = store.ping().await {
                tracing::warn!("store: ping failed, admission will fail open: {}", e);
            } else {
                tracing::info!("store: connected, url={}", config.store.url);
            }
            Ok(Arc::new(store))
        }
    }
}

fn preload_rules(state: &server::GatewayState, path: &str) -> Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("rules: cannot read {path}"))?;
    let configs: Vec<RuleConfig> =
        serde_json::from_str(&content).with_context(|| format!("rules: cannot parse {path}"))?;
    let set = RuleSet::compile(&configs).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(state.set_rule_set(set))
}

/// Subscribe the analytics sink to the broker. The subscription queue is the
/// first backpressure point, the sink's own channel the second; neither ever
/// blocks a publisher.
fn start_sink_pump(state: &server::GatewayState) {
    let (mut events, subscription) = state.broker.subscribe();
    let sink = state.sink.clone();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            sink.log(event);
        }
        drop(subscription);
    });
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
