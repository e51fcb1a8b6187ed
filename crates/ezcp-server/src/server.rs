use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::{
    gateway::{GatewayClient, GatewayConfig, DEFAULT_GATEWAY_URL},
    handlers::{download, durable_token, health, issue_token, new_address, upload},
    metrics::{track_requests, MetricsSink, RouteCounters},
    store::{BlobStore, Store, StoreHealth},
    transfer::{sweep_unused, Transfers, UploadLimits},
    validator::{PaymentPolicy, DEFAULT_MINIMUM_AMOUNT},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Blob root; defaults to `<data_dir>/storage`.
    pub storage_dir: Option<PathBuf>,
    pub gateway_url: String,
    /// Wallet id at the payment gateway ($EZCP_WALLET).
    pub wallet: Option<String>,
    /// Bearer token for the payment gateway ($EZCP_GATEWAY_TOKEN).
    pub gateway_token: Option<String>,
    pub gateway_timeout: Duration,
    /// Minimum accepted payment, in display units.
    pub minimum_amount: f64,
    pub sweep_interval: Duration,
    /// Unused ephemeral tokens older than this are swept.
    pub token_max_age: Duration,
    pub upload_limits: UploadLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = UploadLimits::default();
        Self {
            host: std::env::var("EZCP_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env_or("EZCP_PORT", 8000),
            data_dir: std::env::var("EZCP_DATA_DIR").ok().map(PathBuf::from),
            storage_dir: std::env::var("EZCP_STORAGE_DIR").ok().map(PathBuf::from),
            gateway_url: std::env::var("EZCP_GATEWAY_URL")
                .unwrap_or_else(|_| DEFAULT_GATEWAY_URL.into()),
            wallet: std::env::var("EZCP_WALLET").ok(),
            gateway_token: std::env::var("EZCP_GATEWAY_TOKEN").ok(),
            gateway_timeout: Duration::from_secs(env_or("EZCP_GATEWAY_TIMEOUT_SECS", 10)),
            minimum_amount: env_or("EZCP_MINIMUM_AMOUNT", DEFAULT_MINIMUM_AMOUNT),
            sweep_interval: Duration::from_secs(env_or("EZCP_SWEEP_INTERVAL_SECS", 300)),
            token_max_age: Duration::from_secs(env_or("EZCP_TOKEN_MAX_AGE_SECS", 86_400)),
            upload_limits: UploadLimits {
                ephemeral: env_or("EZCP_MAX_EPHEMERAL_BYTES", limits.ephemeral),
                durable: env_or("EZCP_MAX_DURABLE_BYTES", limits.durable),
            },
        }
    }
}

/// Parse `$name`, falling back to `default` when unset or malformed.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Resolve the directory holding `ezcp.db` and `storage/`, creating it if
/// needed: `data_dir` when configured, else the platform data dir
/// (`~/.local/share/ezcp/` and the like).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "ezcp")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Open the token store and blob storage named by `cfg`.
pub async fn open_storage(cfg: &ServerConfig) -> Result<(Store, BlobStore)> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    let storage_dir = cfg
        .storage_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("storage"));
    info!(
        data_dir = %data_dir.display(),
        storage_dir = %storage_dir.display(),
        "using data directory"
    );

    let store = Store::open(&data_dir.join("ezcp.db")).context("open store")?;
    let blobs = BlobStore::open(&storage_dir)
        .await
        .context("open blob storage")?;
    Ok((store, blobs))
}

fn gateway_config(cfg: &ServerConfig) -> Result<GatewayConfig> {
    let wallet = cfg
        .wallet
        .clone()
        .context("EZCP_WALLET is required to verify payments")?;
    let access_token = cfg
        .gateway_token
        .clone()
        .context("EZCP_GATEWAY_TOKEN is required to verify payments")?;
    Ok(GatewayConfig {
        base_url: cfg.gateway_url.clone(),
        wallet,
        access_token: Zeroizing::new(access_token),
        timeout: cfg.gateway_timeout,
    })
}

pub fn build_router(state: AppState) -> Router {
    let metrics = Arc::clone(&state.metrics);
    Router::new()
        .route("/health", get(health))
        .route("/token", post(issue_token))
        .route("/token/{tx}", post(durable_token))
        .route("/upload/{token}", post(upload))
        .route("/download/{token}", get(download))
        .route("/bitcoin", post(new_address))
        .route_layer(middleware::from_fn_with_state(metrics, track_requests))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let (store, blobs) = open_storage(&cfg).await?;

    let gateway =
        GatewayClient::new(gateway_config(&cfg)?).context("build payment gateway client")?;
    let policy = PaymentPolicy::new(gateway.wallet(), cfg.minimum_amount);
    info!(
        wallet = %gateway.wallet(),
        minimum_amount = cfg.minimum_amount,
        "payment policy configured"
    );

    let metrics: Arc<dyn MetricsSink> = Arc::new(RouteCounters::new());
    let transfers = Transfers::new(
        store,
        blobs,
        gateway,
        policy,
        cfg.upload_limits,
        Arc::clone(&metrics),
    );

    let health = transfers.health().clone();
    let sweeper = transfers
        .clone()
        .spawn_sweep(cfg.sweep_interval, cfg.token_max_age);

    let app = build_router(AppState {
        transfers,
        metrics: Arc::clone(&metrics),
    });

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "ezcp server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(health.clone()))
        .await
        .context("server error")?;

    sweeper.abort();
    metrics.report();
    if let Some(reason) = health.failure() {
        anyhow::bail!("stopped after token store failure: {reason}");
    }
    info!("ezcp server stopped");
    Ok(())
}

/// Run the unused-token sweep once. Returns the number of removed tokens.
pub async fn purge(cfg: &ServerConfig) -> Result<usize> {
    let (store, blobs) = open_storage(cfg).await?;
    let removed = sweep_unused(&store, &blobs, cfg.token_max_age)
        .await
        .context("sweep unused tokens")?;
    info!(removed = removed.len(), "purge complete");
    Ok(removed.len())
}

/// Resolves on ctrl-c or once the token store has failed for good.
async fn shutdown_signal(health: StoreHealth) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = health.failed() => {}
    }
}
