use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use jobs_core::cfg::{self, AppId, Config};
use jobs_core::{logx, store};
use jobs_core::store::Db;
use tokio::sync::watch;
use tracing::{error, info, warn};

use jobsched::dispatcher::Dispatcher;
use jobsched::election::{LeaderFlag, MasterElection};
use jobsched::engine::Scheduler;
use jobsched::events::EventBus;
use jobsched::handlers::HandlerRegistry;
use jobsched::module::{Module, ModuleCtx};
use jobsched::node::{local_hostname, Node};
use jobsched::registry::RunnerAgent;
use jobsched::web::{AppState, WebServer};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser, Debug)]
#[command(name = "jobsched", version, about = "Lease-elected distributed job scheduler")]
struct Cli {
    /// Config file (default: per-user config dir, created on first run)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Store directory shared by all instances
    #[arg(long)]
    store_dir: Option<PathBuf>,
    /// HTTP port
    #[arg(long)]
    port: Option<u16>,
    /// Do not register as a job runner or contend for leadership
    #[arg(long)]
    no_runner: bool,
    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(p) => cfg::load_from(p)?,
        None => cfg::load_or_init(&APP)?,
    };
    cfg.apply_env()?;
    if let Some(dir) = &cli.store_dir {
        cfg.store_dir = dir.display().to_string();
    }
    if let Some(p) = cli.port {
        cfg.http.port = p;
    }
    if cli.no_runner {
        cfg.scheduler.is_runner = false;
    }
    cfg.validate()?;
    logx::init(cli.log.as_deref().unwrap_or(&cfg.log_level));

    build_runtime()?.block_on(run(cfg))
}

#[cfg(feature = "rt-single")]
fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

#[cfg(not(feature = "rt-single"))]
fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(1))
        .enable_all()
        .build()?)
}

async fn run(cfg: Config) -> Result<()> {
    let store_dir = cfg.resolve_store_dir(&APP)?;
    let db = Db::new(store::open_fs(&store_dir).with_context(|| format!("open store {}", store_dir.display()))?);
    info!("{} boot, store={}", APP.application, store_dir.display());

    let events = EventBus::default();
    let (tx, rx) = watch::channel(false);
    let ctx = ModuleCtx { db: db.clone(), events: events.clone(), shutdown: rx };

    let host = cfg.http.advertise_host.clone().unwrap_or_else(local_hostname);
    let node = Node::new(host, cfg.http.port);
    info!(instance = %node.instance_id, address = %node.address(), "node identity");

    let handlers = HandlerRegistry::with_builtins();
    let dispatcher = Dispatcher::new(db.clone(), events.clone(), &cfg)?;
    let leader = LeaderFlag::default();

    let bind = |port: u16| -> Result<SocketAddr> {
        format!("{}:{}", cfg.http.bind, port)
            .parse()
            .with_context(|| format!("bad bind address {}:{}", cfg.http.bind, port))
    };
    let state = AppState {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
        handlers,
        node: node.clone(),
        lock_name: cfg.election.lock_name.clone(),
        leader: leader.clone(),
        is_runner: cfg.scheduler.is_runner,
        started: Instant::now(),
    };
    let https = cfg.http.https_port.map(&bind).transpose()?;
    let mut modules: Vec<Box<dyn Module>> = vec![Box::new(WebServer::new(
        state,
        Some(bind(cfg.http.port)?),
        https,
        cfg.http.tls_cert_pem.clone(),
        cfg.http.tls_key_pem.clone(),
    ))];

    if cfg.scheduler.is_runner {
        let scheduler = Scheduler::new(db.clone(), dispatcher.clone(), &cfg, events.clone());
        modules.push(Box::new(RunnerAgent::new(node.clone(), cfg.runner.clone())));
        modules.push(Box::new(MasterElection::new(node.clone(), cfg.election.clone(), Arc::new(scheduler), leader)));
    } else {
        warn!("not a job runner; serving the control API only");
    }

    let mut handles = Vec::with_capacity(modules.len());
    for m in modules {
        let name = m.name();
        info!("starting module {name}");
        handles.push((name, m.spawn(ctx.clone())));
    }

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = tx.send(true);

    for (name, h) in handles {
        match h.await {
            Ok(Ok(())) => info!("module {name} stopped"),
            Ok(Err(e)) => error!("module {name} failed: {e:#}"),
            Err(e) => error!("module {name} panicked: {e}"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}
