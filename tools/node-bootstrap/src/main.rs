use std::{future::Future, io};

use clap::Parser;
use cli::{Cli, Command};
use common::tracing::init_tracing;
use hw_node::{BootstrapOrchestrator, NodeDirectory};
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(not(unix))]
    panic!("Cannot run node-bootstrap on non-unix platform");

    init_tracing("node_bootstrap=debug,hw_node=debug,info");

    let cli = Cli::parse();
    tracing::debug!("Cli args: {:?}", cli);

    let directory = NodeDirectory::from_path(&cli.config_file)?;

    if let Command::ListNodes { all } = cli.command {
        commands::list_nodes(&directory, all);
        return Ok(());
    }

    let config = cli.bootstrap_config(&directory)?;
    let orchestrator = BootstrapOrchestrator::new(config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if watch_interrupts(cancel, signal::ctrl_c).await {
                tracing::error!("Interrupted again, exiting without waiting for running applies");
                std::process::exit(130);
            }
        }
    });

    // Plumbing from the CLI to the command modules

    match cli.command {
        Command::ListNodes { .. } => {}
        Command::PowerCycle { node } => {
            let node = directory.require_node(&node)?;
            commands::power_cycle(&orchestrator, node).await?
        }
        Command::LastLine { node } => {
            let node = directory.require_node(&node)?;
            commands::last_line(&orchestrator, node).await?
        }
        Command::WaitReady { node } => {
            let node = directory.require_node(&node)?;
            commands::wait_ready(&orchestrator, node, &cancel).await?
        }
        Command::Apply { node, state } => {
            let node = directory.require_node(&node)?;
            commands::apply(&orchestrator, node, &state).await?
        }
        Command::Bootstrap {
            state,
            nodes,
            report,
            ..
        } => {
            let nodes = commands::select_nodes(&directory, &nodes)?;
            commands::bootstrap(&orchestrator, &nodes, &state, report.as_deref(), &cancel).await?
        }
    }

    Ok(())
}

/// The first interrupt cancels nodes that have not started configuring and lets a running
/// apply finish. Returns `true` on the second interrupt, `false` if signals can't be received.
async fn watch_interrupts<F, Fut>(cancel: CancellationToken, mut next_interrupt: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if let Err(e) = next_interrupt().await {
        tracing::warn!("Unable to listen for ctrl-c: {}", e);
        return false;
    }

    tracing::warn!("Interrupted, cancelling bootstraps that have not started configuring. Press ctrl-c again to exit");
    cancel.cancel();

    next_interrupt().await.is_ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn second_interrupt_exits() {
        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();

        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                watch_interrupts(cancel, || {
                    let rx = rx.clone();
                    async move {
                        rx.lock().await.recv().await;
                        Ok(())
                    }
                })
                .await
            }
        });

        tx.send(()).unwrap();
        cancel.cancelled().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!watcher.is_finished());

        tx.send(()).unwrap();
        assert!(watcher.await.unwrap());
    }

    #[tokio::test]
    async fn signal_error_does_not_cancel() {
        let cancel = CancellationToken::new();

        let exit = watch_interrupts(cancel.clone(), || async { Err(io::Error::other("no signals")) }).await;

        assert!(!exit);
        assert!(!cancel.is_cancelled());
    }
}
