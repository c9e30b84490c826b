//! Deploy and undeploy commands

use anyhow::{Context, Result};
use std::path::Path;

use crate::client::{ApiClient, DeployRequest, DeployResponse, UndeployResponse};
use crate::output::{print_success, print_warning, short_hash, OutputFormat};

fn read_config(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))
}

/// Deploy the pipeline from collector and estimation config files
pub async fn deploy(
    client: &ApiClient,
    collector_path: &Path,
    estimation_path: &Path,
    nodes: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    if nodes.is_empty() {
        print_warning("No nodes given; the collector fleet will be empty until nodes join");
    }

    let request = DeployRequest {
        collector: read_config(collector_path)?,
        estimation: read_config(estimation_path)?,
        nodes,
    };

    let response: DeployResponse = client.post("api/v1/deploy", &request).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Table => {
            print_success(&format!(
                "Pipeline deployed to {} node(s)",
                response.nodes
            ));
            println!("Collector config:  {}", short_hash(&response.collector_hash));
            println!("Estimation config: {}", short_hash(&response.estimation_hash));
        }
    }

    Ok(())
}

/// Tear the pipeline down
pub async fn undeploy(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let response: UndeployResponse = client.post_empty("api/v1/undeploy").await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Table => {
            print_success("Pipeline undeployed");
        }
    }

    Ok(())
}
