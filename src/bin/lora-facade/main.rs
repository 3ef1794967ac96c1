//! lora-facade node.
//!
//! Loads configuration (file, then `LORA_FACADE_*` environment, then flags),
//! starts the coordination facade with its reconciliation task, and runs until
//! SIGINT or SIGTERM.

mod args;

use anyhow::Context;
use anyhow::Result;
use args::Args;
use clap::Parser;
use lora_facade::config::FacadeConfig;
use lora_facade::node::FacadeNode;
use tokio::signal;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = FacadeConfig::load_with_layers(args.config.as_deref()).context("failed to load configuration")?;
    args.apply_to(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        instance_id = %config.instance_id,
        "starting lora-facade v{}",
        env!("CARGO_PKG_VERSION")
    );

    let node = FacadeNode::start(&config).await.context("failed to start node")?;
    info!("ready");

    let signal = shutdown_signal().await;
    info!(signal, "stopping lora-facade, waiting for in-flight reconciliation");
    node.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

/// Resolves once the node is asked to stop, naming the signal that asked.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "cannot listen for SIGINT, relying on SIGTERM");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "cannot listen for SIGTERM, relying on SIGINT");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_sigterm_names_signal() {
        let waiter = tokio::spawn(shutdown_signal());
        // Let the task install its handlers before the signal is sent
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(signal, "SIGTERM");
    }
}
