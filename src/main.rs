//! StratoMQ broker binary
//!
//! Exit codes: 0 normal, 1 configuration error, 2 bind error, 3 store
//! initialization error, 130 on SIGINT. SIGTERM drains gracefully,
//! SIGHUP re-applies the reloadable configuration subset (log level).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{reload, EnvFilter};

use stratomq::broker::{Broker, BrokerConfig, Stores};
use stratomq::cluster::ClusterCoordinator;
use stratomq::config::Config;
use stratomq::store::{ArchiveStore, FjallBackend, MemoryBackend};

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_STORE: u8 = 3;
const EXIT_SIGINT: u8 = 130;

/// Clustered MQTT v3.1.1/v5.0 broker
#[derive(Parser, Debug)]
#[command(name = "stratomq", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<std::net::SocketAddr>,

    /// Node id for clustering (overrides the config file)
    #[arg(long)]
    node_id: Option<String>,

    /// Log level: error, warn, info, debug, trace
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => match Config::from_env() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(node_id) = &args.node_id {
        let cluster = config.cluster.get_or_insert_with(Default::default);
        cluster.node_id = Some(node_id.clone());
    }

    let level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let (filter_layer, filter_handle) = reload::Layer::new(build_filter(&level));
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().with_target(false).compact())
            .init();
    }

    if let Some(path) = &args.config {
        info!("loaded configuration from {}", path.display());
    }

    // Select and open the stores.
    let stores = match config.storage.backend.as_str() {
        "memory" => {
            info!("storage: memory (volatile)");
            let backend = Arc::new(MemoryBackend::new());
            Stores {
                retained: backend.clone(),
                sessions: backend.clone(),
                queues: backend.clone(),
                archive: config
                    .storage
                    .archive
                    .then(|| backend.clone() as Arc<dyn ArchiveStore>),
            }
        }
        _ => {
            info!("storage: fjall at {}", config.storage.path.display());
            let backend = match FjallBackend::open(&config.storage.path) {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    eprintln!("store initialization error: {e}");
                    return ExitCode::from(EXIT_STORE);
                }
            };
            Stores {
                retained: backend.clone(),
                sessions: backend.clone(),
                queues: backend.clone(),
                archive: config
                    .storage
                    .archive
                    .then(|| backend.clone() as Arc<dyn ArchiveStore>),
            }
        }
    };

    let cluster_config = config.cluster.clone().filter(|c| c.enabled);
    let node_id = cluster_config
        .as_ref()
        .map(|c| c.node_id())
        .unwrap_or_else(|| "standalone".to_string());

    let broker_config = BrokerConfig::from_config(&config);
    info!("starting StratoMQ");
    info!("  node id: {node_id}");
    info!("  bind: {}", broker_config.bind_addr);
    if let Some(addr) = broker_config.tls_bind_addr {
        info!("  tls: {addr}");
    }
    if let Some(addr) = broker_config.ws_bind_addr {
        info!("  websocket: {addr} (path {})", broker_config.ws_path);
    }
    if let Some(addr) = broker_config.wss_bind_addr {
        info!("  secure websocket: {addr}");
    }
    info!("  max connections: {}", broker_config.max_connections);
    info!("  max packet size: {} bytes", broker_config.max_packet_size);
    info!("  max qos: {:?}", broker_config.max_qos);

    let broker = match Broker::with_stores(broker_config, &node_id, stores).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("store initialization error: {e}");
            return ExitCode::from(EXIT_STORE);
        }
    };

    // Join the cluster when configured.
    if let Some(cluster_config) = cluster_config {
        info!(
            "  cluster: gossip {}, peer {}",
            cluster_config.gossip_addr, cluster_config.peer_addr
        );
        if !cluster_config.seeds.is_empty() {
            info!("  seeds: {}", cluster_config.seeds.join(", "));
        }
        let coordinator = match ClusterCoordinator::new(
            cluster_config,
            broker.router().clone(),
            broker.subscriptions().clone(),
            broker.bus().clone(),
        )
        .await
        {
            Ok(coordinator) => coordinator,
            Err(e) => {
                eprintln!("bind error: {e}");
                return ExitCode::from(EXIT_BIND);
            }
        };
        if let Err(e) = coordinator.start().await {
            eprintln!("bind error: {e}");
            return ExitCode::from(EXIT_BIND);
        }
        broker.set_cluster(coordinator);
    } else {
        info!("  cluster: disabled");
    }

    // Signal handling: SIGINT exits 130, SIGTERM drains, SIGHUP reloads
    // the log level from the config file.
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            eprintln!("signal setup failed: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            eprintln!("signal setup failed: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let run_broker = broker.clone();
    let mut server = tokio::spawn(async move { run_broker.run().await });

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("SIGINT handler failed: {e}");
                }
                info!("interrupted");
                broker.shutdown().await;
                return ExitCode::from(EXIT_SIGINT);
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, draining");
                broker.shutdown().await;
                return ExitCode::SUCCESS;
            }
            _ = sighup.recv() => {
                reload_config(&args, &filter_handle);
            }
            joined = &mut server => {
                match joined {
                    Ok(Ok(())) => return ExitCode::SUCCESS,
                    Ok(Err(e)) => {
                        error!("server error: {e}");
                        return ExitCode::from(EXIT_BIND);
                    }
                    Err(e) => {
                        error!("server task failed: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            }
        }
    }
}

fn build_filter(level: &str) -> EnvFilter {
    let level = match level {
        "error" | "warn" | "info" | "debug" | "trace" => level,
        other => {
            eprintln!("unknown log level '{other}', using info");
            "info"
        }
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// SIGHUP: re-read the config file and apply the reloadable subset.
fn reload_config<S>(args: &Args, filter_handle: &reload::Handle<EnvFilter, S>)
where
    S: tracing::Subscriber,
{
    let Some(path) = &args.config else {
        warn!("SIGHUP ignored: no config file to reload");
        return;
    };
    match Config::load(path) {
        Ok(new_config) => {
            let level = args
                .log_level
                .clone()
                .unwrap_or_else(|| new_config.log.level.clone());
            if filter_handle.reload(build_filter(&level)).is_ok() {
                info!("configuration reloaded (log level '{level}')");
            }
        }
        Err(e) => warn!("SIGHUP reload failed, keeping old configuration: {e}"),
    }
}
