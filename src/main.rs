use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use emissions_scheduler::carbon_aware::{CarbonClientConfig, CarbonSignal, WattTimeClient};
use emissions_scheduler::config::{ControllerConfig, ExtenderConfig};
use emissions_scheduler::controller::{self, KubeCluster, NodeCoordinator, WorkloadCoordinator};
use emissions_scheduler::power::{self, IpmiToolController, PowerCommand, PowerEndpoint};
use emissions_scheduler::scheduler::{self, AdmissionGate};
use emissions_scheduler::Error;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the coordinators and the scheduler extender
    Run(RunArgs),
    /// Drive a node's power controller directly
    Power(PowerArgs),
    /// Show version and build information
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct CarbonArgs {
    /// Carbon signal service username
    #[arg(long, env = "WATTTIME_USERNAME")]
    watttime_username: String,

    /// Carbon signal service password
    #[arg(long, env = "WATTTIME_PASSWORD", hide_env_values = true)]
    watttime_password: String,

    /// Balancing authority (grid region) code
    #[arg(long, env = "WATTTIME_BA")]
    watttime_ba: String,

    #[arg(long, env = "WATTTIME_LOGIN_URL", default_value = emissions_scheduler::carbon_aware::types::DEFAULT_LOGIN_URL)]
    watttime_login_url: String,

    #[arg(long, env = "WATTTIME_INDEX_URL", default_value = emissions_scheduler::carbon_aware::types::DEFAULT_INDEX_URL)]
    watttime_index_url: String,

    /// Re-login once the cached token is this old
    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 1800)]
    token_ttl_secs: u64,

    /// Timeout for every carbon service request and BMC command
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 30)]
    http_timeout_secs: u64,
}

impl CarbonArgs {
    fn to_config(&self) -> CarbonClientConfig {
        let mut config = CarbonClientConfig::new(
            &self.watttime_username,
            &self.watttime_password,
            &self.watttime_ba,
        );
        config.login_url = self.watttime_login_url.clone();
        config.index_url = self.watttime_index_url.clone();
        config.token_ttl = Duration::from_secs(self.token_ttl_secs);
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    carbon: CarbonArgs,

    /// Re-evaluate every power-managed node this often
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    resync_interval_secs: u64,

    /// Only pending pods for this scheduler count as demand
    #[arg(long, env = "SCHEDULER_NAME")]
    scheduler_name: Option<String>,

    /// Scheduler extender listen address
    #[arg(long, env = "EXTENDER_ADDR", default_value = "0.0.0.0:8888")]
    extender_addr: SocketAddr,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Act without waiting for the leader lease (single replica)
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,

    /// Log decisions without powering nodes or evicting pods
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PowerAction {
    On,
    Off,
    Cycle,
    Status,
}

#[derive(Parser, Debug)]
struct PowerArgs {
    /// Node whose power annotations select the BMC
    node: String,

    #[arg(value_enum)]
    action: PowerAction,

    /// Timeout for each BMC command
    #[arg(long, env = "POWER_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("emissions-scheduler v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Power(power_args) => {
            init_tracing(args.log_format, false);
            run_power(power_args).await
        }
        Commands::Run(run_args) => {
            init_tracing(args.log_format, true);
            let result = run(run_args).await;
            if let Err(e) = &result {
                error!("emissions-scheduler exited with error: {}", e);
            }
            // Flush any remaining traces
            emissions_scheduler::telemetry::shutdown_telemetry();
            result
        }
    }
}

fn init_tracing(format: LogFormat, with_otel: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (text_layer, json_layer) = match format {
        LogFormat::Text => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_target(true))),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer);

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = with_otel && std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        let otel_layer = emissions_scheduler::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    info!("Starting emissions-scheduler v{}", env!("CARGO_PKG_VERSION"));

    let carbon_config = args.carbon.to_config();
    carbon_config.validate()?;

    let controller_config = ControllerConfig {
        dry_run: args.dry_run,
        scheduler_name: args.scheduler_name.clone(),
        resync_interval: Duration::from_secs(args.resync_interval_secs),
        power_timeout: carbon_config.timeout,
    };
    controller_config.validate()?;

    let extender_config = ExtenderConfig {
        addr: args.extender_addr,
    };

    if controller_config.dry_run {
        info!("Dry run: no node will be powered and no pod evicted");
    }

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let carbon: Arc<dyn CarbonSignal> = Arc::new(WattTimeClient::new(carbon_config)?);
    let power = Arc::new(IpmiToolController::new(controller_config.power_timeout));
    let cluster = Arc::new(KubeCluster::new(client.clone()));

    let is_leader = Arc::new(AtomicBool::new(args.disable_leader_election));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let election = if args.disable_leader_election {
        info!("Leader election disabled, acting as leader");
        None
    } else {
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let lease_client = client.clone();
        let lease_ns = args.namespace.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        Some(tokio::spawn(async move {
            run_leader_election(lease_client, &lease_ns, &holder_identity, is_leader_bg).await;
        }))
    };

    let nodes = Arc::new(
        NodeCoordinator::new(
            carbon.clone(),
            power,
            cluster.clone(),
            controller_config.clone(),
        )
        .with_leader_flag(Arc::clone(&is_leader)),
    );
    let workloads = Arc::new(
        WorkloadCoordinator::new(carbon.clone(), cluster, controller_config.clone())
            .with_leader_flag(Arc::clone(&is_leader)),
    );
    let gate = Arc::new(AdmissionGate::new(carbon));

    // The extender answers on every replica; only the coordinators wait for the lease.
    let extender = {
        let shutdown_rx = shutdown_rx.clone();
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            let result = scheduler::serve(extender_config.addr, gate, shutdown_rx).await;
            if let Err(e) = &result {
                error!("Scheduler extender failed: {}", e);
                let _ = shutdown_tx.send(true);
            }
            result
        })
    };

    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    controller::run_controllers(
        client,
        nodes,
        workloads,
        shutdown_rx,
        controller_config.resync_interval,
    )
    .await;

    // Reactors only return early if the watch streams end; take the extender down with them.
    let _ = shutdown_tx.send(true);

    if let Some(election) = election {
        election.abort();
    }

    match extender.await {
        Ok(result) => result,
        Err(e) => Err(Error::ServerError(format!("extender task failed: {e}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run_power(args: PowerArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    let nodes: Api<Node> = Api::all(client);
    let node = nodes.get(&args.node).await.map_err(Error::KubeError)?;

    let endpoint = PowerEndpoint::from_annotations(&node.name_any(), node.annotations())
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "node {} has no power-control annotations",
                args.node
            ))
        })?;

    let controller = IpmiToolController::new(Duration::from_secs(args.timeout_secs));

    let command = match args.action {
        PowerAction::Status => {
            let state = power::read_status(&controller, &args.node, &endpoint).await?;
            println!("{}: {}", args.node, state);
            return Ok(());
        }
        PowerAction::On => PowerCommand::On,
        PowerAction::Off => PowerCommand::Off,
        PowerAction::Cycle => PowerCommand::Cycle,
    };

    let outcome = power::run_command(&controller, &args.node, &endpoint, command).await?;
    println!(
        "{}: sent power {}, now {}",
        args.node, command, outcome.observed
    );
    Ok(())
}

const LEASE_NAME: &str = "emissions-scheduler-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.swap(true, Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    now > renew.0 + chrono::Duration::seconds(i64::from(duration))
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }

            info!("Lease held by {:?} has expired, taking over", current_holder);
            let patch = serde_json::json!({
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(true)
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
