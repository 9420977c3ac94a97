#![forbid(unsafe_code)]

use clap::Parser;
use meshtap_lib::config::Cli;
use meshtap_lib::{Config, Endpoint};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let cfg = match Config::from_cli(cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "failed to process arguments");
            std::process::exit(1);
        }
    };
    info!(
        server = %cfg.server_addr,
        transport = ?cfg.transport,
        peers_tls = cfg.peer_tls,
        "starting endpoint"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("termination requested");
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = run(cfg, shutdown_rx).await {
        error!(%err, "endpoint exited with error");
        std::process::exit(1);
    }
    info!("exiting");
}

#[cfg(target_os = "linux")]
async fn run(cfg: Config, shutdown: watch::Receiver<bool>) -> meshtap_lib::Result<()> {
    Endpoint::new(cfg).run(shutdown).await
}

#[cfg(not(target_os = "linux"))]
async fn run(_cfg: Config, _shutdown: watch::Receiver<bool>) -> meshtap_lib::Result<()> {
    Err(meshtap_lib::EndpointError::Device(
        "tap devices are only supported on Linux".into(),
    ))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
