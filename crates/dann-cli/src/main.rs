//! # DANN server
//!
//! Headless node binary for the DANN distributed vector index.
//!
//! ```bash
//! dann-server --node-id node-1 --address 127.0.0.1 --port 7000 \
//!     --grpc-port 7001 --dimension 128 --index-type IVF \
//!     --seed-nodes 10.0.0.1:7001,10.0.0.2:7001
//! ```
//!
//! Exit codes: 0 normal shutdown, 1 start-up failure, 2 bad arguments.

use dann_cluster::{
    logging, membership::ClusterView, BalanceStrategy, BulkLoader, ConsistencyConfig,
    ConsistencyManager, DannConfig, LoaderConfig, MetricsRegistry, NodeManager, QueryRouter,
    RouterConfig, RpcClientPool, RpcServer,
};
use dann_core::IndexType;
use dann_index::{IvfConfig, LocalVectorIndex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Flags accepted on the command line; unset fields fall back to the
/// config file and environment.
#[derive(Debug, Default)]
struct CliOptions {
    config_path: Option<String>,
    node_id: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    grpc_port: Option<u16>,
    dimension: Option<usize>,
    index_type: Option<String>,
    seed_nodes: Option<Vec<String>>,
    help: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("run with --help for usage");
            std::process::exit(2);
        }
    };

    if options.help {
        print_help();
        return;
    }

    if let Err(e) = run(options) {
        error!(error = %e, "start-up failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => options.help = true,
            "--config" => options.config_path = Some(take_value(&mut iter, arg)?),
            "--node-id" => options.node_id = Some(take_value(&mut iter, arg)?),
            "--address" => options.address = Some(take_value(&mut iter, arg)?),
            "--port" => {
                options.port = Some(parse_number(&take_value(&mut iter, arg)?, arg)?);
            }
            "--grpc-port" => {
                options.grpc_port = Some(parse_number(&take_value(&mut iter, arg)?, arg)?);
            }
            "--dimension" => {
                options.dimension = Some(parse_number(&take_value(&mut iter, arg)?, arg)?);
            }
            "--index-type" => {
                let value = take_value(&mut iter, arg)?;
                value.parse::<IndexType>().map_err(|e| format!("--index-type: {e}"))?;
                options.index_type = Some(value);
            }
            "--seed-nodes" => {
                let raw = take_value(&mut iter, arg)?;
                options.seed_nodes = Some(
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                );
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(options)
}

fn take_value<'a>(
    iter: &mut impl Iterator<Item = &'a String>,
    flag: &str,
) -> Result<String, String> {
    iter.next()
        .map(|s| s.to_string())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{flag}: invalid value {value:?}"))
}

fn print_help() {
    println!("dann-server {}", env!("CARGO_PKG_VERSION"));
    println!("Distributed approximate nearest-neighbor index node\n");
    println!("USAGE:");
    println!("    dann-server [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --config <PATH>        TOML configuration file");
    println!("    --node-id <ID>         Node identifier");
    println!("    --address <ADDR>       Bind address");
    println!("    --port <PORT>          Cluster port");
    println!("    --grpc-port <PORT>     RPC listener port");
    println!("    --dimension <N>        Vector dimension");
    println!("    --index-type <TYPE>    Flat, IVF or HNSW");
    println!("    --seed-nodes <LIST>    Comma-separated host:port seeds");
    println!("    --help, -h             Show this help message\n");
    println!("Environment overrides: DANN_NODE_ID, DANN_NODE_ADDRESS,");
    println!("DANN_NODE_PORT, DANN_INDEX_DIMENSION, DANN_INDEX_TYPE, DANN_LOG.");
}

/// Resolves configuration (flags > environment > file > defaults), wires
/// the node together and serves until interrupted.
fn run(options: CliOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = DannConfig::load(options.config_path.as_deref())?;
    if let Some(v) = options.node_id {
        config.node.id = v;
    }
    if let Some(v) = options.address {
        config.node.address = v;
    }
    if let Some(v) = options.port {
        config.node.port = v;
    }
    if let Some(v) = options.grpc_port {
        config.node.grpc_port = v;
    }
    if let Some(v) = options.dimension {
        config.index.dimension = v;
    }
    if let Some(v) = options.index_type {
        config.index.index_type = v;
    }
    if let Some(v) = options.seed_nodes {
        config.node.seed_nodes = v;
    }

    logging::init();

    let index_type: IndexType = config
        .index
        .index_type
        .parse()
        .map_err(|e: String| format!("--index-type: {e}"))?;
    let strategy: BalanceStrategy = config.network.load_balance_strategy.parse()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut ivf = IvfConfig::new(config.index.dimension)
            .with_shard_count(config.index.shard_count)
            .with_nprobe(config.index.nprobe);
        if config.index.nlist > 0 {
            ivf = ivf.with_nlist(config.index.nlist);
        }
        let storage_path = std::path::Path::new(&config.index.storage_path);
        let index = if storage_path.exists() {
            info!(path = %storage_path.display(), "restoring saved index");
            Arc::new(LocalVectorIndex::load(storage_path, config.index.dimension)?)
        } else {
            Arc::new(LocalVectorIndex::new(index_type, ivf)?)
        };

        let membership = Arc::new(
            NodeManager::new(
                config.node.id.clone(),
                config.node.address.clone(),
                config.node.grpc_port,
            )
            .with_failure_threshold(Duration::from_millis(config.network.heartbeat_failure_ms)),
        );

        let pool = RpcClientPool::new(
            Duration::from_millis(config.network.connection_timeout_ms),
            Duration::from_millis(config.performance.query_timeout_ms),
        );

        let consistency = Arc::new(ConsistencyManager::new(
            ConsistencyConfig::new(config.node.id.clone())
                .with_replication_factor(config.node.replication_factor as usize),
        ));

        let metrics = Arc::new(MetricsRegistry::new()?);

        let router = Arc::new(
            QueryRouter::new(
                Arc::clone(&membership) as Arc<dyn ClusterView>,
                Arc::clone(&pool) as Arc<dyn dann_cluster::QueryTransport>,
                dann_cluster::make_balancer(strategy),
                config.node.id.clone(),
                Some(Arc::clone(&index)),
                RouterConfig {
                    cache_enabled: config.performance.cache_enabled,
                    cache_size: config.performance.cache_size,
                    max_retries: config.network.max_retries,
                    ..RouterConfig::default()
                },
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        let loader = BulkLoader::new(
            Arc::clone(&index),
            Some(Arc::clone(&consistency)),
            LoaderConfig {
                batch_size: config.performance.batch_size,
                max_concurrent_loads: config.performance.max_concurrent_loads,
                load_timeout: Duration::from_millis(config.performance.load_timeout_ms),
                ..LoaderConfig::default()
            },
        );
        loader.start_workers();

        consistency.spawn_propagation(
            Arc::clone(&membership) as Arc<dyn ClusterView>,
            Arc::clone(&pool) as Arc<dyn dann_cluster::ReplicationTransport>,
        );
        consistency.spawn_anti_entropy(
            Arc::clone(&membership) as Arc<dyn ClusterView>,
            Arc::clone(&pool) as Arc<dyn dann_cluster::ReplicationTransport>,
            Arc::clone(&index),
        );
        membership.spawn_health_monitor(Duration::from_secs(5));
        spawn_seed_heartbeats(
            Arc::clone(&membership),
            Arc::clone(&pool),
            config.node.seed_nodes.clone(),
        );

        let addr = format!("{}:{}", config.node.address, config.node.grpc_port);
        info!(
            node_id = %config.node.id,
            endpoint = %addr,
            index_type = %index_type,
            dimension = config.index.dimension,
            "node starting"
        );

        spawn_gauge_updater(
            Arc::clone(&metrics),
            Arc::clone(&index),
            Arc::clone(&membership),
            Arc::clone(&consistency),
        );

        let server = RpcServer::new(index, consistency, router, loader, membership, metrics);
        server.bind_and_serve(&addr).await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}

/// Keeps the cluster gauges current.
fn spawn_gauge_updater(
    metrics: Arc<MetricsRegistry>,
    index: Arc<LocalVectorIndex>,
    membership: Arc<NodeManager>,
    consistency: Arc<ConsistencyManager>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            if !membership.is_running() {
                break;
            }
            metrics.set_vector_count(index.size() as i64);
            metrics.set_cluster_node_count(membership.get_cluster_nodes().len());
            metrics.set_cluster_healthy_nodes(membership.active_nodes().len());
            metrics.set_pending_replications(consistency.pending_count());
        }
    });
}

/// Announces this node to the seed endpoints on an interval so the cluster
/// learns about it and keeps seeing its heartbeat.
fn spawn_seed_heartbeats(
    membership: Arc<NodeManager>,
    pool: Arc<RpcClientPool>,
    seeds: Vec<String>,
) {
    if seeds.is_empty() {
        return;
    }
    tokio::spawn(async move {
        let local = membership.local_node().clone();
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            if !membership.is_running() {
                break;
            }
            for seed in &seeds {
                if let Err(e) = pool.heartbeat(seed, &local).await {
                    tracing::debug!(seed = %seed, error = %e, "seed heartbeat failed");
                }
            }
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
