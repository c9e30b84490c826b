//! Status command

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, NodesResponse, StatusResponse};
use crate::output::{
    color_status, format_percent, format_timestamp, print_warning, short_hash, OutputFormat,
};

/// Row for the per-node fleet table
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Failures")]
    failures: String,
    #[tabled(rename = "Restarts")]
    restarts: String,
    #[tabled(rename = "Config")]
    config: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

/// Show aggregate pipeline status and per-component detail.
///
/// Exit code: 0 when the pipeline is ready, 1 otherwise. Transport and
/// parsing failures bubble up as internal errors (exit code 2).
pub async fn show_status(client: &ApiClient, with_nodes: bool, format: OutputFormat) -> Result<i32> {
    let status: StatusResponse = client.get("api/v1/status").await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OutputFormat::Table => {
            print_status_table(&status);

            if with_nodes {
                let nodes: NodesResponse = client.get("api/v1/nodes").await?;
                println!();
                print_nodes_table(&nodes);
            }
        }
    }

    Ok(exit_code(&status.status))
}

fn exit_code(status: &str) -> i32 {
    // Partially ready is not ready: only a fully ready pipeline exits 0
    if status == "ready" {
        0
    } else {
        1
    }
}

fn component_line(name: &str, ready: bool, message: &Option<String>) {
    let state = if ready {
        "ready".green().to_string()
    } else {
        "not ready".red().to_string()
    };

    match message {
        Some(message) => println!("{name:<12} {state}  ({message})"),
        None => println!("{name:<12} {state}"),
    }
}

fn print_status_table(status: &StatusResponse) {
    println!("{}", "Pipeline Status".bold());
    println!("{}", "=".repeat(50));
    println!("Aggregate:   {}", color_status(&status.status));
    println!("Checked at:  {}", format_timestamp(status.checked_at));
    println!();

    component_line("Storage", status.storage.ready, &status.storage.message);
    component_line(
        "Estimation",
        status.estimation.ready,
        &status.estimation.message,
    );
    println!();

    println!("{}", "Collector Fleet".bold());
    println!("{}", "-".repeat(50));
    println!(
        "Nodes:       {} total, {} running, {} degraded",
        status.fleet.nodes_total, status.fleet.nodes_running, status.fleet.nodes_degraded
    );
    println!(
        "Readiness:   {} (threshold {})",
        format_percent(status.fleet.readiness),
        format_percent(status.fleet.threshold)
    );
    println!();

    println!("{}", "Rollout".bold());
    println!("{}", "-".repeat(50));
    match &status.rollout.target_hash {
        Some(target) => {
            println!("Target:      {}", short_hash(target));
            if status.rollout.converged {
                println!("Converged:   {}", "yes".green());
            } else {
                let pending = status
                    .rollout
                    .nodes
                    .iter()
                    .filter(|(_, n)| {
                        !n.ready || n.applied_hash.as_deref() != Some(target.as_str())
                    })
                    .count();
                println!(
                    "Converged:   {} ({} node(s) pending)",
                    "no".yellow(),
                    pending
                );
            }
        }
        None => println!("Target:      (none published)"),
    }
}

fn print_nodes_table(nodes: &NodesResponse) {
    println!("{}", "Entities".bold());

    if nodes.nodes.is_empty() {
        print_warning("No supervised entities");
        return;
    }

    let rows: Vec<NodeRow> = nodes
        .nodes
        .iter()
        .map(|n| NodeRow {
            entity: n.entity_id.clone(),
            state: color_status(&n.state),
            failures: n.consecutive_failures.to_string(),
            restarts: n.restarts_total.to_string(),
            config: n.applied_hash.as_deref().map(short_hash).unwrap_or_default(),
            last_error: n.last_error.clone().unwrap_or_default(),
        })
        .collect();

    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
}
