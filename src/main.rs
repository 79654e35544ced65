//! Storage Topology Operator
//!
//! One binary, two roles:
//!
//! - `controller`: cluster-wide PoolCluster and VolumeConfig reconcile loops
//! - `pool-manager`: the per-node loop realizing one PoolInstance

use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_topology_operator::config::DEFAULT_CACHE_FILE;
use storage_topology_operator::controller::events::KubeRecorder;
use storage_topology_operator::controller::runner::{resync, run_workers, watch};
use storage_topology_operator::controller::{pool_cluster, volume_config};
use storage_topology_operator::crd::{PoolCluster, PoolInstance, Volume, VolumeConfig, VolumeReplica};
use storage_topology_operator::{
    ControllerMetrics, Error, LabelSelector, OperatorConfig, PoolClusterController, PoolEngine,
    PoolManager, PoolManagerConfig, Reconciler, Result, ShellExecutor, Stores, VolumeConfigController,
    VolumeEngine, WorkQueue,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Topology Operator - pools, replicas and disruption budgets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cluster-wide controllers
    Controller(ControllerArgs),
    /// Run the pool manager for one pool instance
    PoolManager(PoolManagerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Namespace holding the storage objects
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// Seconds between full resyncs
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value = "30")]
    resync_interval_secs: u64,

    /// Reconcile workers per controller
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,
}

#[derive(Args, Debug)]
struct PoolManagerArgs {
    /// Namespace holding the storage objects
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// PoolInstance managed by this process
    #[arg(long, env = "POOL_INSTANCE_NAME")]
    pool_instance_name: String,

    /// Seed of the on-disk pool name
    #[arg(long, env = "POOL_NAME_SEED")]
    pool_name_seed: String,

    /// Pool cache file
    #[arg(long, env = "POOL_CACHE_FILE", default_value = DEFAULT_CACHE_FILE)]
    pool_cache_file: String,

    /// Seconds between full resyncs
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value = "30")]
    resync_interval_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli);

    info!("Starting Storage Topology Operator");
    info!("  Version: {}", storage_topology_operator::VERSION);

    let result = match cli.command {
        Command::Controller(args) => run_controller(args).await,
        Command::PoolManager(args) => run_pool_manager(args).await,
    };
    if let Err(e) = &result {
        error!(error = %e, "Operator failed");
    }
    result
}

fn name_key<K: ResourceExt>(obj: &K) -> Vec<String> {
    vec![obj.name_any()]
}

async fn run_controller(args: ControllerArgs) -> Result<()> {
    let config = OperatorConfig::new(
        &args.namespace,
        args.resync_interval_secs,
        args.workers,
        &args.health_addr,
        &args.metrics_addr,
    )?;
    info!("  Namespace: {}", config.namespace);
    info!("  Workers: {}", config.workers);

    let client = Client::try_default().await?;
    let stores = Stores::kube(client.clone(), &config.namespace);
    let metrics = ControllerMetrics::register(prometheus::default_registry())?;
    let token = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    spawn_health_server(config.health_addr, ready.clone());
    let metrics_addr = config.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let ns = config.namespace.as_str();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Pool clusters
    let cluster_queue = Arc::new(WorkQueue::new());
    let clusters: Arc<dyn Reconciler> = Arc::new(PoolClusterController::new(
        stores.clone(),
        Arc::new(KubeRecorder::new(client.clone(), "pool-cluster-controller")),
    ));
    tasks.push(tokio::spawn(watch(
        Api::<PoolCluster>::namespaced(client.clone(), ns),
        watcher::Config::default(),
        cluster_queue.clone(),
        name_key::<PoolCluster>,
        token.clone(),
    )));
    tasks.push(tokio::spawn(watch(
        Api::<PoolInstance>::namespaced(client.clone(), ns),
        watcher::Config::default(),
        cluster_queue.clone(),
        pool_cluster::owner_keys,
        token.clone(),
    )));
    tasks.push(tokio::spawn(resync(
        stores.pool_clusters.clone(),
        LabelSelector::everything(),
        cluster_queue.clone(),
        name_key::<PoolCluster>,
        config.resync_interval,
        token.clone(),
    )));
    tasks.push(tokio::spawn(run_workers(
        cluster_queue.clone(),
        config.workers,
        clusters,
        metrics.clone(),
    )));

    // Volume configs
    let volume_queue = Arc::new(WorkQueue::new());
    let volumes: Arc<dyn Reconciler> = Arc::new(VolumeConfigController::new(VolumeEngine::new(
        stores.clone(),
        Arc::new(KubeRecorder::new(client.clone(), "volume-config-controller")),
    )));
    tasks.push(tokio::spawn(watch(
        Api::<VolumeConfig>::namespaced(client.clone(), ns),
        watcher::Config::default(),
        volume_queue.clone(),
        name_key::<VolumeConfig>,
        token.clone(),
    )));
    tasks.push(tokio::spawn(watch(
        Api::<Volume>::namespaced(client.clone(), ns),
        watcher::Config::default(),
        volume_queue.clone(),
        volume_config::volume_keys,
        token.clone(),
    )));
    tasks.push(tokio::spawn(watch(
        Api::<VolumeReplica>::namespaced(client.clone(), ns),
        watcher::Config::default(),
        volume_queue.clone(),
        volume_config::replica_keys,
        token.clone(),
    )));
    tasks.push(tokio::spawn(resync(
        stores.volume_configs.clone(),
        LabelSelector::everything(),
        volume_queue.clone(),
        name_key::<VolumeConfig>,
        config.resync_interval,
        token.clone(),
    )));
    tasks.push(tokio::spawn(run_workers(
        volume_queue.clone(),
        config.workers,
        volumes,
        metrics,
    )));

    ready.store(true, Ordering::SeqCst);
    info!("Controllers started");

    wait_for_shutdown(token, &[cluster_queue, volume_queue], tasks).await;
    info!("Operator shutdown complete");
    Ok(())
}

async fn run_pool_manager(args: PoolManagerArgs) -> Result<()> {
    let config = PoolManagerConfig::new(
        &args.namespace,
        &args.pool_instance_name,
        &args.pool_name_seed,
        &args.pool_cache_file,
        args.resync_interval_secs,
        &args.health_addr,
    )?;
    info!("  Namespace: {}", config.namespace);
    info!("  Pool instance: {}", config.instance_name);
    info!("  Pool: {}", config.pool_name());

    let client = Client::try_default().await?;
    let stores = Stores::kube(client.clone(), &config.namespace);
    let metrics = ControllerMetrics::register(prometheus::default_registry())?;
    let token = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));
    spawn_health_server(config.health_addr, ready.clone());

    let engine = PoolEngine::new(
        Arc::new(ShellExecutor::new()),
        stores.clone(),
        config.pool_name(),
        config.cache_file.as_str(),
    );
    let manager: Arc<dyn Reconciler> = Arc::new(PoolManager::new(
        engine,
        stores.clone(),
        Arc::new(KubeRecorder::new(client.clone(), "pool-manager")),
        config.instance_name.as_str(),
    ));

    let queue = Arc::new(WorkQueue::new());
    let instance_name = config.instance_name.clone();
    let tasks = vec![
        tokio::spawn(watch(
            Api::<PoolInstance>::namespaced(client.clone(), &config.namespace),
            watcher::Config::default().fields(&format!("metadata.name={}", instance_name)),
            queue.clone(),
            name_key::<PoolInstance>,
            token.clone(),
        )),
        tokio::spawn(resync(
            stores.pool_instances.clone(),
            LabelSelector::everything(),
            queue.clone(),
            move |instance: &PoolInstance| {
                name_key(instance)
                    .into_iter()
                    .filter(|name| name == &instance_name)
                    .collect()
            },
            config.resync_interval,
            token.clone(),
        )),
        // Node commands are serialized through a single worker
        tokio::spawn(run_workers(queue.clone(), 1, manager, metrics)),
    ];

    ready.store(true, Ordering::SeqCst);
    info!("Pool manager started");

    wait_for_shutdown(token, &[queue], tasks).await;
    info!("Pool manager shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(
    token: CancellationToken,
    queues: &[Arc<WorkQueue>],
    tasks: Vec<JoinHandle<()>>,
) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
    token.cancel();
    for queue in queues {
        queue.shut_down();
    }
    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!("Task failed during shutdown: {}", e);
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn spawn_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if let Err(e) = run_health_server(addr, ready).await {
            error!("Health server error: {}", e);
        }
    });
}

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = respond(StatusCode::OK, buffer);
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
