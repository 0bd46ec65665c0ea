//! casf-verifier: zero-trust verification gateway daemon.
//!
//! Wires the decision pipeline over its real collaborators (Postgres audit
//! trail, Redis anti-replay and rate-limit stores, the external policy
//! engine) and serves the HTTP surface until SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use casf_verifier::audit::{AuditStore, PostgresAuditStore};
use casf_verifier::config::Config;
use casf_verifier::kv::RedisHandle;
use casf_verifier::metrics::new_shared_registry;
use casf_verifier::opa::{OpaClient, PolicyEngine};
use casf_verifier::ratelimit::RedisRateLimiter;
use casf_verifier::replay::{RedisReplayStore, ReplayStore};
use casf_verifier::server::{router, AppState};
use casf_verifier::{Verifier, VerifierConfig};

/// casf-verifier - verification gateway for agent tool invocations
#[derive(Parser, Debug)]
#[command(name = "casf-verifier")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to serve the gateway on
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Disable the Prometheus metrics endpoint
    #[arg(long)]
    no_metrics: bool,
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(true);

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;

    let metrics = new_shared_registry().context("failed to initialize metrics registry")?;

    let audit: Arc<dyn AuditStore> = Arc::new(
        PostgresAuditStore::connect(&config.pg_dsn)
            .context("failed to initialize audit store")?,
    );
    info!("audit store initialized, schema applied");

    let redis = Arc::new(RedisHandle::new(&config.redis_url).context("invalid REDIS_URL")?);
    let replay: Arc<dyn ReplayStore> = Arc::new(RedisReplayStore::new(
        Arc::clone(&redis),
        config.anti_replay_ttl.as_secs(),
    ));
    let limiter = Arc::new(RedisRateLimiter::new(Arc::clone(&redis)));
    let policy: Arc<dyn PolicyEngine> =
        Arc::new(OpaClient::new(&config.opa_url).context("failed to build policy client")?);

    let verifier = Verifier::new(
        Arc::clone(&replay),
        limiter,
        Arc::clone(&policy),
        Arc::clone(&audit),
        Arc::clone(&metrics),
        VerifierConfig::from(&config),
    );

    let state = Arc::new(AppState {
        verifier,
        metrics,
        audit,
        replay,
        policy,
    });

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    info!(
        addr = %args.bind,
        anti_replay = config.anti_replay_enabled,
        metrics_enabled = !args.no_metrics,
        "casf-verifier started"
    );

    axum::serve(listener, router(state, !args.no_metrics))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("casf-verifier shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("received SIGINT");
        }
    }
}
