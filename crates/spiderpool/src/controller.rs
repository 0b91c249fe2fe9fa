use clap::{Parser, Subcommand};
use spiderpool::{
    init_tracing, load_file_config, new_startup_probe, run_daemon_guarded, run_health_server,
    shutdown_signal, EnvConfig,
};
use spiderpool_controller::webhook::{IPPoolWebhook, SubnetWebhook};
use spiderpool_controller::{
    GcConfig, IpGc, LeaderConfig, LeaderElector, TlsMode, WebhookConfig, WebhookServer,
    WebhookState,
};
use spiderpool_metrics::{names, AsyncGauge, GaugePublisher};
use spiderpool_store::{RetryConfig, Store};
use spiderpool_subnet::{SubnetManager, SubnetReconciler, SubnetReconcilerConfig};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "spiderpool-controller",
    about = "Spiderpool cluster controller"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon
    Daemon {
        /// Path to the mounted config file
        #[arg(long, default_value = "/tmp/spiderpool/config-map/conf.yml")]
        config_path: PathBuf,
        /// Path to the resource store database
        #[arg(long, default_value = "/var/lib/spiderpool/state.redb")]
        store_path: PathBuf,
        /// Path to a PEM-encoded TLS certificate for the webhook server
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<PathBuf>,
        /// Path to a PEM-encoded TLS private key for the webhook server
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<PathBuf>,
        /// Directory for auto-generated webhook certificates
        #[arg(long, default_value = "/tmp/spiderpool/webhook-tls")]
        tls_dir: PathBuf,
    },
    /// Signal a running controller to clean up and exit
    Shutdown,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let env = EnvConfig::from_env()?;
    init_tracing(&env.log_level);

    match cli.command {
        Commands::Daemon {
            config_path,
            store_path,
            tls_cert,
            tls_key,
            tls_dir,
        } => {
            let tls = match (tls_cert, tls_key) {
                (Some(cert_path), Some(key_path)) => TlsMode::Provided {
                    cert_path,
                    key_path,
                },
                _ => TlsMode::AutoGenerate {
                    data_dir: tls_dir,
                    san_entries: vec!["localhost".to_string(), "127.0.0.1".to_string()],
                },
            };
            run_daemon_guarded(
                "spiderpool-controller",
                daemon(env, &config_path, &store_path, tls),
            )
            .await
        }
        Commands::Shutdown => {
            info!("Shutdown spiderpool-controller...");
            Ok(())
        }
    }
}

async fn daemon(
    env: EnvConfig,
    config_path: &std::path::Path,
    store_path: &std::path::Path,
    tls: TlsMode,
) -> miette::Result<()> {
    info!("Starting spiderpool-controller");
    env.log_version();

    let file_cfg = load_file_config(config_path, &env)?;
    info!("Loaded config: {:?}", file_cfg);

    if env.enable_metric {
        spiderpool_metrics::init_metrics(([0, 0, 0, 0], env.metric_http_port).into())?;
    } else {
        spiderpool_metrics::init_metrics_disabled();
    }

    if let Some(parent) = store_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| miette::miette!("failed to create store directory: {}", e))?;
    }
    let store = Store::open(store_path)
        .map_err(|e| miette::miette!("failed to open resource store: {}", e))?;

    let token = CancellationToken::new();

    // 1. Leader election: non-leaders keep serving webhooks but skip the
    //    garbage collector and subnet reconciliation
    let leader = LeaderElector::new(&store, LeaderConfig::default());
    let leader_token = token.clone();
    let leader_runner = Arc::clone(&leader);
    let leader_handle = tokio::spawn(async move { leader_runner.run(leader_token).await });

    // 2. Admission webhooks
    let webhook_state = Arc::new(WebhookState {
        ippool: IPPoolWebhook::new(&store, file_cfg.enable_spider_subnet),
        subnet: SubnetWebhook::new(&store),
    });
    let webhook_config = WebhookConfig {
        listen_addr: ([0, 0, 0, 0], env.webhook_port).into(),
        tls,
    };
    let webhook_server = WebhookServer::new(webhook_config, webhook_state);
    let webhook_token = token.clone();
    let webhook_handle = tokio::spawn(async move {
        if let Err(err) = webhook_server.run(webhook_token).await {
            error!("Webhook server error: {}", err);
        }
    });

    // 3. IP garbage collector (leader-gated internally)
    let gc = IpGc::new(
        Arc::clone(&store),
        Arc::clone(&leader),
        GcConfig {
            gc_interval: Duration::from_secs(env.gc_interval_secs),
            grace_period: Duration::from_secs(env.gc_grace_period_secs),
            ..Default::default()
        },
    );
    let gc_token = token.clone();
    let gc_handle = tokio::spawn(async move {
        if let Err(err) = gc.run(gc_token).await {
            error!("IP garbage collector error: {}", err);
        }
    });

    // 4. Subnet reconciler, running only while this replica leads
    let subnet_pool_gauge = AsyncGauge::new(names::SUBNET_IPPOOL_COUNTS);
    let mut reconciler_handle = None;
    if file_cfg.enable_spider_subnet {
        let mgr = SubnetManager::new(&store, RetryConfig::default());
        let reconciler = SubnetReconciler::new(
            Arc::clone(&store),
            mgr,
            Arc::clone(&subnet_pool_gauge),
            SubnetReconcilerConfig::default(),
        );
        let reconciler_token = token.clone();
        let reconciler_leader = Arc::clone(&leader);
        reconciler_handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reconciler_token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                if !reconciler_leader.is_elected() {
                    continue;
                }
                // runs until leadership is lost or shutdown
                tokio::select! {
                    _ = reconciler_token.cancelled() => return,
                    result = reconciler.run(reconciler_leader.leader_token()) => {
                        if let Err(err) = result {
                            error!("Subnet reconciler error: {}", err);
                        }
                    }
                }
            }
        }));
    } else {
        info!("Feature SpiderSubnet is disabled");
    }

    let publisher = GaugePublisher::new(vec![subnet_pool_gauge], Duration::from_secs(10));
    let publisher_token = token.clone();
    let publisher_handle = tokio::spawn(publisher.run(publisher_token));

    let probe = new_startup_probe();
    let health_token = token.clone();
    let health_probe = probe.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(err) = run_health_server(env.health_port, health_probe, health_token).await {
            error!("Health server error: {}", err);
        }
    });

    probe.store(true, Ordering::SeqCst);
    info!("spiderpool-controller startup complete");

    let sig = shutdown_signal().await;
    info!("Received {}, shutting down gracefully...", sig);
    token.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = tokio::join!(
            leader_handle,
            webhook_handle,
            gc_handle,
            health_handle,
            publisher_handle,
        );
        if let Some(handle) = reconciler_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
