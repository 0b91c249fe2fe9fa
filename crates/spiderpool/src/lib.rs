//! Shared daemon plumbing for the spiderpool-agent and
//! spiderpool-controller binaries: environment configuration, tracing
//! setup, the health endpoint, and signal handling.

use axum::routing::get;
use axum::Router;
use futures_util::FutureExt;
use spiderpool_core::config::FileConfig;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Settings read from the process environment.
///
/// Every variable has a default; malformed values are fatal at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub commit_version: String,
    pub commit_time: String,
    pub app_version: String,

    pub log_level: String,
    pub enable_metric: bool,
    pub enable_debug_metric: bool,

    pub health_port: u16,
    pub metric_http_port: u16,
    pub webhook_port: u16,
    pub gops_listen_port: Option<u16>,

    pub ippool_max_allocated_ips: usize,
    pub wait_subnet_pool_time_secs: u64,
    pub wait_subnet_pool_max_retries: u32,

    pub gc_interval_secs: u64,
    pub gc_grace_period_secs: u64,

    /// Env overrides for the config-file feature toggles
    pub enable_stateful_set: Option<bool>,
    pub enable_spider_subnet: Option<bool>,
}

impl EnvConfig {
    pub fn from_env() -> miette::Result<Self> {
        Ok(Self {
            commit_version: env_string("GIT_COMMIT_VERSION", ""),
            commit_time: env_string("GIT_COMMIT_TIME", ""),
            app_version: env_string("VERSION", ""),

            log_level: env_string("SPIDERPOOL_LOG_LEVEL", "info"),
            enable_metric: env_parse("SPIDERPOOL_ENABLED_METRIC", false)?,
            enable_debug_metric: env_parse("SPIDERPOOL_ENABLED_DEBUG_METRIC", false)?,

            health_port: env_parse("SPIDERPOOL_HEALTH_PORT", 5710)?,
            metric_http_port: env_parse("SPIDERPOOL_METRIC_HTTP_PORT", 5711)?,
            webhook_port: env_parse("SPIDERPOOL_WEBHOOK_PORT", 5722)?,
            gops_listen_port: Some(env_parse("SPIDERPOOL_GOPS_LISTEN_PORT", 5712)?),

            ippool_max_allocated_ips: env_parse("SPIDERPOOL_IPPOOL_MAX_ALLOCATED_IPS", 5000)?,
            wait_subnet_pool_time_secs: env_parse(
                "SPIDERPOOL_WAIT_SUBNET_POOL_TIME_IN_SECOND",
                2,
            )?,
            wait_subnet_pool_max_retries: env_parse(
                "SPIDERPOOL_WAIT_SUBNET_POOL_MAX_RETRIES",
                25,
            )?,

            gc_interval_secs: env_parse("SPIDERPOOL_GC_INTERVAL_IN_SECOND", 600)?,
            gc_grace_period_secs: env_parse("SPIDERPOOL_GC_GRACE_PERIOD_IN_SECOND", 30)?,

            enable_stateful_set: env_opt_parse("SPIDERPOOL_ENABLED_STATEFULSET")?,
            enable_spider_subnet: env_opt_parse("SPIDERPOOL_ENABLED_SPIDERSUBNET")?,
        })
    }

    /// Log the informational build tags when present
    pub fn log_version(&self) {
        if !self.commit_version.is_empty() {
            info!("CommitVersion: {}", self.commit_version);
        }
        if !self.commit_time.is_empty() {
            info!("CommitTime: {}", self.commit_time);
        }
        if !self.app_version.is_empty() {
            info!("AppVersion: {}", self.app_version);
        }
        if let Some(port) = self.gops_listen_port {
            // accepted for compatibility; profiling export is not wired up
            info!("gops listen port {} is configured but inert", port);
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> miette::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            miette::miette!("environment variable {} has an invalid value '{}': {}", name, raw, e)
        }),
        _ => Ok(default),
    }
}

fn env_opt_parse<T: std::str::FromStr>(name: &str) -> miette::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| {
                miette::miette!(
                    "environment variable {} has an invalid value '{}': {}",
                    name,
                    raw,
                    e
                )
            }),
        _ => Ok(None),
    }
}

/// Load the mounted YAML config file, applying env feature overrides
pub fn load_file_config(path: &Path, env: &EnvConfig) -> miette::Result<FileConfig> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| miette::miette!("failed to read config file {}: {}", path.display(), e))?;
    let mut cfg = FileConfig::from_yaml(&data)
        .map_err(|e| miette::miette!("failed to parse config file {}: {}", path.display(), e))?;

    if let Some(v) = env.enable_stateful_set {
        cfg.enable_stateful_set = v;
    }
    if let Some(v) = env.enable_spider_subnet {
        cfg.enable_spider_subnet = v;
    }
    Ok(cfg)
}

/// Initialize tracing from `SPIDERPOOL_LOG_LEVEL`, letting `RUST_LOG`
/// override when set
pub fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

/// Run the daemon future, logging any panic before surfacing it as a
/// fatal error instead of tearing the process down silently.
pub async fn run_daemon_guarded<F>(name: &str, daemon: F) -> miette::Result<()>
where
    F: std::future::Future<Output = miette::Result<()>>,
{
    match AssertUnwindSafe(daemon).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic);
            error!("Panic details: {}", message);
            Err(miette::miette!("{} daemon panicked: {}", name, message))
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Wait for either SIGINT (ctrl-c) or SIGTERM, returning which one fired.
pub async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

/// Readiness flag flipped once daemon wiring completes
pub type StartupProbe = Arc<AtomicBool>;

pub fn new_startup_probe() -> StartupProbe {
    Arc::new(AtomicBool::new(false))
}

/// Serve `/healthz`, `/livez`, and `/readyz` on the health port
pub async fn run_health_server(
    port: u16,
    probe: StartupProbe,
    token: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(healthz))
        .route(
            "/readyz",
            get(move || {
                let probe = Arc::clone(&probe);
                async move {
                    if probe.load(Ordering::SeqCst) {
                        (axum::http::StatusCode::OK, "ok")
                    } else {
                        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "starting")
                    }
                }
            }),
        );

    let listener = TcpListener::bind(addr).await?;
    info!("Health server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn healthz() -> &'static str {
    "ok"
}
