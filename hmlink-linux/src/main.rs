// hmlink: TCP bridge for an HM-10 style BLE serial characteristic on BlueZ.

mod bluez;
mod cli;
mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hmlink_core::{bind_listener, shutdown_channel, Bridge};

use crate::bluez::BluezTransport;
use crate::cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let file = config::apply_env(config::load(cli.config.as_deref())?);
    let cfg = config::resolve(file, &cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        channel = %cfg.address.channel,
        listen = %cfg.listen_addr(),
        reconnect = cfg.reconnect,
        keep_connected = cfg.keep_connected,
        "starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let listener = bind_listener(&cfg)
            .await
            .with_context(|| format!("cannot listen on {}", cfg.listen_addr()))?;
        let transport = Arc::new(
            BluezTransport::new()
                .await
                .context("cannot open BlueZ session")?,
        );

        let (trigger, shutdown) = shutdown_channel();
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(()) => {
                    info!("shutdown requested");
                    trigger.trigger();
                }
                Err(e) => warn!(error = %e, "signal handlers unavailable"),
            }
        });

        Bridge::new(transport, cfg, shutdown).run(listener).await?;
        info!("exiting");
        Ok(())
    })
}

/// `RUST_LOG` wins; otherwise debug with -v or RPIBLE_DEBUG, else info.
fn init_tracing(verbose: bool) {
    let fallback = if verbose || std::env::var_os("RPIBLE_DEBUG").is_some() {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
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
