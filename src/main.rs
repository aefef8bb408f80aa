use srvgate::config::Config;
use srvgate::control::ControlSurface;
use srvgate::discovery::Discovery;
use srvgate::engine::EngineCache;
use srvgate::front::FrontDoor;
use srvgate::housekeeper::Housekeeper;
use srvgate::index::IndexPage;
use srvgate::reconcile::ProxyPlane;
use srvgate::scheduler::Scheduler;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let first_arg = std::env::args().nth(1);
    if first_arg.as_deref() == Some("-v") {
        println!("srvgate {}", VERSION);
        return Ok(());
    }
    let config_path = first_arg
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("conf/srvgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("failed to load configuration {}: {}", config_path.display(), e);
        e
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log)),
        )
        .init();

    info!(
        version = VERSION,
        path = %config_path.display(),
        "Starting gateway"
    );
    info!(
        listen = %config.listen,
        refresh_ms = config.refresh_time,
        engine = %config.docker_addr,
        host_suffix = %config.host_suffix,
        srv_prefix = %config.srv_prefix,
        clear_delay_min = config.docker_clear_delay,
        prune_delay_min = config.docker_prune_delay,
        "Gateway configuration"
    );

    let bind_addr: SocketAddr = config.listen.parse()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Arc::new(EngineCache::new(&config));
    let plane = ProxyPlane::new(config.host_suffix.clone());
    let discovery = Discovery::new(Arc::clone(&engine), config.match_key.clone());
    let housekeeper = Housekeeper::new(Arc::clone(&engine), &config)?;
    let control = Arc::new(ControlSurface::new(
        Arc::clone(&engine),
        config.srv_prefix.clone(),
    ));
    let index = Arc::new(IndexPage::new(&config));

    let scheduler = Scheduler::new(
        discovery,
        Arc::clone(&plane),
        housekeeper,
        &config,
        shutdown_rx.clone(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run());

    let front = FrontDoor::new(
        bind_addr,
        Arc::clone(&plane),
        control,
        index,
        config.srv_prefix.clone(),
        shutdown_rx.clone(),
    );
    let front_handle = tokio::spawn(async move {
        if let Err(e) = front.run().await {
            error!(error = %e, "Front door error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = front_handle.await;
        let _ = scheduler_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
