use std::path::PathBuf;

use anyhow::{bail, Context};
use meshward_bridge::{Bridge, BridgeConfig};
use meshward_core::logging;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_config_path(&args)?;

    let config = BridgeConfig::load(config_path.as_deref()).context("invalid configuration")?;
    logging::init_with_format(config.log_format(), &config.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        trust_file = %config.trust_file.display(),
        endpoint = %config.mesh.endpoint,
        sqlite = %config.sink.path.display(),
        table = %config.sink.table,
        "meshward bridge (verified mesh receiver)"
    );

    let bridge = Bridge::init(config).map_err(|e| {
        error!(error = %e, "bridge initialisation failed");
        e
    })?;

    if let Err(e) = bridge.start().await {
        error!(error = %e, "failed to join the mesh");
        bridge.shutdown().await?;
        return Err(e.into());
    }

    let token = CancellationToken::new();
    spawn_signal_handlers(token.clone());

    bridge.run(token).await?;
    Ok(())
}

/// `--config <path>` is optional; without it defaults and environment apply.
fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter().skip(1);
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            match args_iter.next() {
                Some(path) => return Ok(Some(PathBuf::from(path))),
                None => bail!("--config was provided without a path"),
            }
        }
    }
    Ok(None)
}

/// Cancel `token` on the first SIGINT or SIGTERM. Later signals only log.
fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        loop {
            match tokio::signal::ctrl_c().await {
                Ok(()) if ctrl_c_token.is_cancelled() => {
                    info!("interrupt received, shutdown already in progress");
                }
                Ok(()) => {
                    info!("received interrupt signal");
                    ctrl_c_token.cancel();
                }
                Err(err) => {
                    error!(error = %err, "error setting up interrupt handler");
                    return;
                }
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "error setting up SIGTERM handler");
                return;
            }
        };
        while sigterm.recv().await.is_some() {
            if token.is_cancelled() {
                info!("SIGTERM received, shutdown already in progress");
            } else {
                info!("received SIGTERM");
                token.cancel();
            }
        }
    });
}
