// udpeer node: LAN discovery, messaging and file transfer daemon with an operator console.

mod config;
mod console;
mod delivery;
mod sender;
mod service;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("udpeer {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load().context("invalid configuration")?;
    info!(name = %cfg.name, port = cfg.port, "starting udpeer {}", VERSION);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let service = service::Service::bind(&cfg)
            .await
            .with_context(|| format!("cannot bind UDP port {}", cfg.port))?;
        let registry = service.registry();
        let mut service_task = tokio::spawn(service.run());

        tokio::select! {
            res = console::run_console(registry, cfg.outbox_dir.clone()) => res?,
            res = &mut service_task => match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "service stopped"),
                Err(e) => error!(error = %e, "service task panicked"),
            },
            res = shutdown_signal() => res?,
        }
        service_task.abort();
        info!("shutting down");
        anyhow::Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
