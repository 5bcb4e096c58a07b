use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wsomgr::display;
use wsomgr::heart::Heart;
use wsomgr::manager::{Manager, Orchestrator};
use wsomgr::model::Config;
use wsomgr::repository::Repository;
use wsomgr::server::{create_router, AppState};
use wsomgr::vmm::{AnsibleProvisioner, LocalReconciler, VirshHypervisor};

#[derive(Parser)]
#[command(name = "wsomgr", about = "Multi-node KVM service orchestrator", version)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager process on this host
    Serve(ServeArgs),
    /// Upload a configuration document to the shared store
    Apply(ApplyArgs),
    /// Beat towards a manager forever (what runs beside a guest service)
    Heart(HeartArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Which config entry is "self"; defaults to the hostname
    #[arg(long, env = "WSOMGR_MANAGER_NAME")]
    manager_name: Option<String>,

    /// Store connection string; must name a database
    #[arg(
        long,
        env = "WSOMGR_CONNECTION_STRING",
        default_value = "mongodb://localhost/wso"
    )]
    db: String,

    /// Address to bind the HTTP/WebSocket server to
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Hypervisor connection URI
    #[arg(long, default_value = "qemu:///system")]
    hypervisor_uri: String,

    /// Print the liveness table once a second
    #[arg(long)]
    status_table: bool,

    /// Load environment variables from this file first
    #[arg(long)]
    env_file: Option<std::path::PathBuf>,
}

#[derive(Args)]
struct ApplyArgs {
    /// Configuration document to apply
    #[arg(short, long, default_value = "config.json")]
    config: std::path::PathBuf,

    /// Store connection string; must name a database
    #[arg(
        long,
        env = "WSOMGR_CONNECTION_STRING",
        default_value = "mongodb://localhost/wso"
    )]
    db: String,
}

#[derive(Args)]
struct HeartArgs {
    /// host:port of the receiving manager
    #[arg(long, env = "WSOMGR_MANAGER_ADDRESS")]
    manager_address: String,

    /// Token identifying this sender
    #[arg(long, env = "WSOMGR_TOKEN")]
    token: uuid::Uuid,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let result = match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Apply(args) => run_apply(args).await,
        Commands::Heart(args) => run_heart(args).await,
    };

    if let Err(error) = result {
        error!("{error:#}");
        process::exit(1);
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("loading env file {}", env_file.display()))?;
    }

    let manager_name = args
        .manager_name
        .clone()
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .context("manager name not set and hostname unavailable")?;

    let repository = Arc::new(Repository::connect(&args.db).await?);
    // A missing config is fatal here; everything after this point retries
    // instead of dying.
    let manager = Arc::new(Manager::create(manager_name.clone(), &repository).await?);
    let self_config = manager.self_config().await.with_context(|| {
        format!("manager '{manager_name}' is not present in the configuration")
    })?;

    let hypervisor = Arc::new(VirshHypervisor::new(args.hypervisor_uri.as_str()));
    let provisioner = Arc::new(AnsibleProvisioner::new(&self_config.imgs_path));
    let reconciler = Arc::new(LocalReconciler::new(
        self_config.clone(),
        hypervisor,
        provisioner,
    ));

    let shutdown = CancellationToken::new();

    let orchestrator = Orchestrator::new(
        Arc::clone(&manager),
        Arc::clone(&repository),
        Arc::clone(&reconciler),
    );
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await });
    }

    if args.status_table {
        tokio::spawn(display::run_status_printer(
            Arc::clone(&manager),
            shutdown.clone(),
        ));
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let addr = format!("{}:{}", args.bind_addr, self_config.port);
    info!("manager '{manager_name}' listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app = create_router(AppState::new(Arc::clone(&manager), Arc::clone(&reconciler)));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    Ok(())
}

async fn run_apply(args: ApplyArgs) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: Config = serde_json::from_str(&raw).context("parsing configuration document")?;
    config.validate()?;

    let repository = Repository::connect(&args.db).await?;
    repository.save_config(&config).await?;
    println!(
        "configuration applied: {} manager(s), {} service(s), {} load balancer(s)",
        config.managers.len(),
        config.services.len(),
        config.load_balancers.len()
    );
    Ok(())
}

async fn run_heart(args: HeartArgs) -> anyhow::Result<()> {
    Heart::new(args.manager_address, args.token)
        .beat_forever()
        .await;
    Ok(())
}
