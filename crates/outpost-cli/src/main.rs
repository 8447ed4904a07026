//! outpost - local CLI for the outpost supervisor daemon.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use outpost_core::deployment::{ConfigurationUpdate, LocalOverrideRequest};
use outpost_core::ipc::{IpcRequest, IpcResponse, LocalDeploymentState};
use semver::Version;

mod client;

use client::DaemonClient;

/// outpost - on-device component orchestrator CLI
#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Supervisor root directory
    #[arg(short, long, default_value = "/var/lib/outpost")]
    root: PathBuf,

    /// Path to the daemon socket (default: <root>/outpostd.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all components
    #[command(alias = "ls")]
    List,

    /// Show one component's details
    Status {
        /// Component name
        name: String,
    },

    /// Stop a component
    Stop {
        /// Component name
        name: String,
    },

    /// Restart a component
    Restart {
        /// Component name
        name: String,
    },

    /// Preload the store from local recipe and artifact directories
    Preload {
        /// Directory of recipe files
        #[arg(long)]
        recipe_dir: PathBuf,

        /// Directory laid out <name>/<version>/<files>
        #[arg(long)]
        artifact_dir: Option<PathBuf>,
    },

    /// Create a local deployment
    Deploy {
        /// Root components to merge, as name=version (repeatable)
        #[arg(long = "merge", value_name = "NAME=VERSION")]
        merge: Vec<String>,

        /// Root components to remove (repeatable)
        #[arg(long = "remove", value_name = "NAME")]
        remove: Vec<String>,

        /// Target group (defaults to the local deployments group)
        #[arg(long)]
        group: Option<String>,

        /// JSON file of per-component configuration updates
        #[arg(long)]
        update_config: Option<PathBuf>,

        /// Wait for the deployment to finish
        #[arg(long)]
        wait: bool,
    },

    /// Show a deployment's status
    DeploymentStatus {
        /// Deployment identifier
        deployment_id: String,
    },

    /// List the local deployment history
    Deployments,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(|| cli.root.join("outpostd.sock"));
    let client = DaemonClient::new(&socket);

    match cli.command {
        Commands::List => list(&client),
        Commands::Status { name } => status(&client, &name),
        Commands::Stop { name } => {
            client.call(&IpcRequest::StopComponent { name: name.clone() })?;
            println!("{name}: SUCCEEDED");
            Ok(())
        },
        Commands::Restart { name } => {
            client.call(&IpcRequest::RestartComponent { name: name.clone() })?;
            println!("{name}: SUCCEEDED");
            Ok(())
        },
        Commands::Preload {
            recipe_dir,
            artifact_dir,
        } => {
            client.call(&IpcRequest::UpdateRecipesAndArtifacts {
                recipe_dir: recipe_dir.display().to_string(),
                artifact_dir: artifact_dir.map(|d| d.display().to_string()),
            })?;
            println!("store preloaded");
            Ok(())
        },
        Commands::Deploy {
            merge,
            remove,
            group,
            update_config,
            wait,
        } => deploy(&client, &merge, remove, group, update_config.as_deref(), wait),
        Commands::DeploymentStatus { deployment_id } => deployment_status(&client, &deployment_id),
        Commands::Deployments => deployments(&client),
    }
}

fn list(client: &DaemonClient<'_>) -> Result<()> {
    match client.call(&IpcRequest::ListComponents)? {
        IpcResponse::ComponentList(components) => {
            println!("{:<24} {:<12} {:<10}", "NAME", "VERSION", "STATE");
            for component in components {
                println!(
                    "{:<24} {:<12} {:<10}",
                    component.name,
                    component.version.as_deref().unwrap_or("-"),
                    component.state
                );
            }
            Ok(())
        },
        other => bail!("unexpected response: {other:?}"),
    }
}

fn status(client: &DaemonClient<'_>, name: &str) -> Result<()> {
    match client.call(&IpcRequest::GetComponentDetails {
        name: name.to_string(),
    })? {
        IpcResponse::ComponentDetails(details) => {
            println!("name:    {}", details.name);
            println!("version: {}", details.version.as_deref().unwrap_or("-"));
            println!("state:   {}", details.state);
            println!(
                "configuration:\n{}",
                serde_json::to_string_pretty(&details.configuration)?
            );
            Ok(())
        },
        other => bail!("unexpected response: {other:?}"),
    }
}

fn deploy(
    client: &DaemonClient<'_>,
    merge: &[String],
    remove: Vec<String>,
    group: Option<String>,
    update_config: Option<&std::path::Path>,
    wait: bool,
) -> Result<()> {
    let mut to_add = BTreeMap::new();
    for entry in merge {
        let (name, version) = entry
            .split_once('=')
            .with_context(|| format!("expected NAME=VERSION, got '{entry}'"))?;
        let version: Version = version
            .parse()
            .with_context(|| format!("invalid version in '{entry}'"))?;
        to_add.insert(name.to_string(), version);
    }

    let component_to_configuration: BTreeMap<String, ConfigurationUpdate> = match update_config {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?
        },
        None => BTreeMap::new(),
    };

    let request = LocalOverrideRequest {
        root_component_versions_to_add: to_add,
        root_components_to_remove: remove,
        component_to_configuration,
        group_name: group,
        ..Default::default()
    };

    let deployment_id = match client.call(&IpcRequest::CreateLocalDeployment(request))? {
        IpcResponse::LocalDeploymentQueued { deployment_id } => deployment_id,
        other => bail!("unexpected response: {other:?}"),
    };
    println!("deployment queued: {deployment_id}");

    if wait {
        loop {
            std::thread::sleep(Duration::from_millis(500));
            let record = match client.call(&IpcRequest::GetLocalDeploymentStatus {
                deployment_id: deployment_id.clone(),
            })? {
                IpcResponse::LocalDeploymentStatus(record) => record,
                other => bail!("unexpected response: {other:?}"),
            };
            match record.state {
                LocalDeploymentState::Succeeded => {
                    println!("deployment {deployment_id}: SUCCEEDED");
                    return Ok(());
                },
                LocalDeploymentState::Failed => {
                    bail!(
                        "deployment {deployment_id}: FAILED ({})",
                        record.detail.unwrap_or_default()
                    );
                },
                LocalDeploymentState::Queued | LocalDeploymentState::InProgress => {},
            }
        }
    }
    Ok(())
}

fn deployment_status(client: &DaemonClient<'_>, deployment_id: &str) -> Result<()> {
    match client.call(&IpcRequest::GetLocalDeploymentStatus {
        deployment_id: deployment_id.to_string(),
    })? {
        IpcResponse::LocalDeploymentStatus(record) => {
            println!("deployment: {}", record.deployment_id);
            println!("state:      {:?}", record.state);
            if let Some(status) = record.status {
                println!("status:     {status}");
            }
            if let Some(detail) = record.detail {
                println!("detail:     {detail}");
            }
            Ok(())
        },
        other => bail!("unexpected response: {other:?}"),
    }
}

fn deployments(client: &DaemonClient<'_>) -> Result<()> {
    match client.call(&IpcRequest::ListLocalDeployments)? {
        IpcResponse::LocalDeployments(records) => {
            println!("{:<40} {:<12} {:<28}", "DEPLOYMENT", "STATE", "CREATED");
            for record in records {
                println!(
                    "{:<40} {:<12} {:<28}",
                    record.deployment_id,
                    format!("{:?}", record.state),
                    record.created_at.to_rfc3339()
                );
            }
            Ok(())
        },
        other => bail!("unexpected response: {other:?}"),
    }
}
