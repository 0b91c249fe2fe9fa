use clap::{Parser, Subcommand};
use spiderpool::{
    init_tracing, load_file_config, new_startup_probe, run_daemon_guarded, run_health_server,
    shutdown_signal, EnvConfig,
};
use spiderpool_core::config::ClusterDefaultPool;
use spiderpool_ipam::{Ipam, IpamConfig, IpamMetrics, IpamServer};
use spiderpool_metrics::GaugePublisher;
use spiderpool_store::{RetryConfig, Store};
use spiderpool_subnet::SubnetManager;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "spiderpool-agent", about = "Spiderpool per-node IPAM agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent daemon
    Daemon {
        /// Path to the mounted config file
        #[arg(long, default_value = "/tmp/spiderpool/config-map/conf.yml")]
        config_path: PathBuf,
        /// Path to the resource store database
        #[arg(long, default_value = "/var/lib/spiderpool/state.redb")]
        store_path: PathBuf,
        /// Name of the node this agent runs on
        #[arg(long, env = "SPIDERPOOL_NODE_NAME")]
        node_name: String,
    },
    /// Signal a running agent to clean up and exit
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
            node_name,
        } => {
            run_daemon_guarded(
                "spiderpool-agent",
                daemon(env, &config_path, &store_path, node_name),
            )
            .await
        }
        Commands::Shutdown => {
            info!("Shutdown spiderpool-agent...");
            Ok(())
        }
    }
}

async fn daemon(
    env: EnvConfig,
    config_path: &std::path::Path,
    store_path: &std::path::Path,
    node_name: String,
) -> miette::Result<()> {
    info!("Starting spiderpool-agent on node '{}'", node_name);
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

    let ipam_cfg = IpamConfig {
        node_name,
        enable_ipv4: file_cfg.enable_ipv4,
        enable_ipv6: file_cfg.enable_ipv6,
        enable_stateful_set: file_cfg.enable_stateful_set,
        enable_spider_subnet: file_cfg.enable_spider_subnet,
        cluster_default: ClusterDefaultPool::from_file_config(&file_cfg),
        max_allocated_ips: env.ippool_max_allocated_ips,
        operation_retries: env.wait_subnet_pool_max_retries,
        operation_gap: Duration::from_secs(env.wait_subnet_pool_time_secs),
        ..Default::default()
    };

    let retry = RetryConfig {
        max_retries: ipam_cfg.max_conflict_retries,
        retry_unit: ipam_cfg.conflict_retry_unit,
    };
    let subnet_mgr = if file_cfg.enable_spider_subnet {
        Some(SubnetManager::new(&store, retry))
    } else {
        info!("Feature SpiderSubnet is disabled");
        None
    };

    let token = CancellationToken::new();
    let metrics = IpamMetrics::new();

    let publisher = GaugePublisher::new(metrics.gauges(), Duration::from_secs(10));
    let publisher_token = token.clone();
    let publisher_handle = tokio::spawn(publisher.run(publisher_token));

    info!("Begin to initialize IPAM");
    let ipam = Ipam::new(ipam_cfg, &store, subnet_mgr, metrics);

    let socket_server = IpamServer::new(ipam, &file_cfg.ipam_unix_socket_path);
    let socket_token = token.clone();
    let socket_handle = tokio::spawn(async move {
        if let Err(err) = socket_server.run(socket_token).await {
            error!("IPAM socket server error: {}", err);
        }
    });

    let probe = new_startup_probe();
    let health_token = token.clone();
    let health_probe = probe.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(err) = run_health_server(env.health_port, health_probe, health_token).await {
            error!("Health server error: {}", err);
        }
    });

    probe.store(true, Ordering::SeqCst);
    info!("spiderpool-agent startup complete");

    let sig = shutdown_signal().await;
    info!("Received {}, shutting down gracefully...", sig);
    token.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = tokio::join!(socket_handle, health_handle, publisher_handle);
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
