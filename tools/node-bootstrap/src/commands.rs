use std::{fs::File, io::BufWriter, path::Path};

use hw_node::{
    console::last_meaningful_line, BootstrapOrchestrator, BootstrapResult, NodeDirectory,
    NodeRecord,
};
use tokio_util::sync::CancellationToken;

pub fn list_nodes(directory: &NodeDirectory, all: bool) {
    for node in directory.all_nodes() {
        if node.is_excluded() && !all {
            continue;
        }

        let excluded = if node.is_excluded() { " (excluded)" } else { "" };
        let machine_type = node.machine_type.as_deref().unwrap_or("-");

        println!(
            "{}\tbmc={}\ttype={}{}",
            node.name, node.bmc_ip, machine_type, excluded
        );
    }
}

pub async fn power_cycle(
    orchestrator: &BootstrapOrchestrator,
    node: &NodeRecord,
) -> anyhow::Result<()> {
    orchestrator.power().power_cycle(node).await?;
    println!("{}: power cycle issued", node.name);
    Ok(())
}

pub async fn last_line(
    orchestrator: &BootstrapOrchestrator,
    node: &NodeRecord,
) -> anyhow::Result<()> {
    let console = orchestrator.console_for(node);
    let line = last_meaningful_line(console.as_ref()).await?;
    println!("{}", line.text);
    Ok(())
}

pub async fn wait_ready(
    orchestrator: &BootstrapOrchestrator,
    node: &NodeRecord,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let console = orchestrator.console_for(node);
    let line = orchestrator
        .readiness()
        .wait_until_ready(console.as_ref(), cancel)
        .await?;
    println!("{}: {}", node.name, line.text);
    Ok(())
}

pub async fn apply(
    orchestrator: &BootstrapOrchestrator,
    node: &NodeRecord,
    state: &str,
) -> anyhow::Result<()> {
    let output = orchestrator
        .applier()
        .apply_configuration(&node.name, state)
        .await?;
    print!("{}", output.stdout);
    Ok(())
}

/// Picks the named nodes, or every node not marked as excluded when no names are given.
/// Asking for an excluded node by name is allowed.
pub fn select_nodes(directory: &NodeDirectory, names: &[String]) -> anyhow::Result<Vec<NodeRecord>> {
    if names.is_empty() {
        return Ok(directory
            .all_nodes()
            .iter()
            .filter(|node| !node.is_excluded())
            .cloned()
            .collect());
    }

    names
        .iter()
        .map(|name| Ok(directory.require_node(name)?.clone()))
        .collect()
}

pub async fn bootstrap(
    orchestrator: &BootstrapOrchestrator,
    nodes: &[NodeRecord],
    state: &str,
    report: Option<&Path>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if nodes.is_empty() {
        anyhow::bail!("No nodes to bootstrap");
    }

    let results = orchestrator.bootstrap_all(nodes, state, cancel).await;

    for result in &results {
        println!("{}", result.summary());
    }

    if let Some(report) = report {
        write_report(report, &results)?;
        tracing::info!("Wrote bootstrap report to {}", report.display());
    }

    let failed = results.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} nodes failed to bootstrap", failed, results.len());
    }

    Ok(())
}

fn write_report(path: &Path, results: &[BootstrapResult]) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), results)?;
    Ok(())
}
