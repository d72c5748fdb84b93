//! cloudspace CLI — operate the workspace orchestrator from a terminal

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cloudspace::backends::cloudrun::{CloudRunBackend, GcloudClient};
use cloudspace::backends::ecs::{AwsCliClient, EcsBackend};
use cloudspace::backends::kubernetes::KubernetesBackend;
use cloudspace::lifecycle::HttpActivityProbe;
use cloudspace::{
    BackendSet, ClusterType, Error, LifecycleController, Orchestrator, Result, Workspace,
    WorkspacePayload, WorkspaceRegistry,
};

#[derive(Parser)]
#[command(name = "cloudspace")]
#[command(about = "Workspace lifecycle orchestrator for per-user dev environments")]
#[command(version)]
struct Cli {
    /// Path to the data directory holding the workspace registry
    #[arg(long, global = true, default_value = "/var/lib/cloudspace")]
    data_dir: PathBuf,

    /// Kubernetes namespace; registers the K8s backend when set
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// ECS cluster name; registers the ECS backend when set
    #[arg(long, global = true)]
    ecs_cluster: Option<String>,

    /// AWS region for the ECS backend
    #[arg(long, global = true)]
    aws_region: Option<String>,

    /// GCP project id; registers the Cloud Run backend together with --gcp-region
    #[arg(long, global = true)]
    gcp_project: Option<String>,

    /// GCP region for the Cloud Run backend
    #[arg(long, global = true)]
    gcp_region: Option<String>,

    /// Base URL of the activity-status endpoint (idle-check/watch)
    #[arg(long, global = true)]
    activity_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered workspaces with their live provider state
    List {
        /// Restrict to one cluster type
        #[arg(long)]
        cluster_type: Option<ClusterType>,
    },
    /// Create a workspace from a payload file (YAML)
    Create {
        cluster_type: ClusterType,
        /// Path to the workspace payload
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Tear a workspace down and forget it
    Delete { name: String },
    /// Scale a workspace to zero
    Stop { name: String },
    /// Bring a stopped workspace back up
    Resume { name: String },
    /// Print the externally reachable URL of a workspace
    Url { name: String },
    /// Run one idle scan over every registered provider
    IdleCheck,
    /// Run the idle-detection loop until interrupted
    Watch {
        /// Scan interval in seconds
        #[arg(long, default_value = "300")]
        interval_secs: u64,
    },
}

#[derive(Tabled)]
struct WorkspaceRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    cluster_type: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "PROJECT UUID")]
    project_uuid: String,
}

impl From<&Workspace> for WorkspaceRow {
    fn from(workspace: &Workspace) -> Self {
        let (status, ip) = match &workspace.instance {
            Some(instance) => (
                instance.status.to_string(),
                instance.ip.clone().unwrap_or_else(|| "-".into()),
            ),
            None => ("UNKNOWN".into(), "-".into()),
        };
        Self {
            name: workspace.config.name.clone(),
            cluster_type: workspace.config.cluster_type.to_string(),
            status,
            ip,
            project_uuid: workspace.config.project_uuid.clone(),
        }
    }
}

async fn build_orchestrator(cli: &Cli) -> Result<Arc<Orchestrator>> {
    let registry = Arc::new(WorkspaceRegistry::open(&cli.data_dir)?);
    let mut backends = BackendSet::new();

    if let Some(namespace) = &cli.namespace {
        backends.register(Arc::new(KubernetesBackend::connect(namespace.clone()).await?));
    }
    if let Some(cluster) = &cli.ecs_cluster {
        let mut client = AwsCliClient::new();
        if let Some(region) = &cli.aws_region {
            client = client.with_region(region.clone());
        }
        backends.register(Arc::new(EcsBackend::new(Arc::new(client), cluster.clone())));
    }
    if let (Some(project), Some(region)) = (&cli.gcp_project, &cli.gcp_region) {
        let client = GcloudClient::new(project.clone(), region.clone());
        backends.register(Arc::new(CloudRunBackend::new(
            Arc::new(client),
            registry.clone(),
        )));
    }

    if backends.is_empty() {
        return Err(Error::Config(
            "no backend configured; pass --namespace, --ecs-cluster or --gcp-project/--gcp-region"
                .into(),
        ));
    }
    Ok(Arc::new(Orchestrator::new(registry, backends)))
}

fn controller(cli: &Cli, orchestrator: Arc<Orchestrator>, interval: Duration) -> Result<LifecycleController> {
    let activity_url = cli.activity_url.as_ref().ok_or_else(|| {
        Error::Config("--activity-url is required for idle detection".into())
    })?;
    Ok(LifecycleController::new(
        orchestrator,
        Arc::new(HttpActivityProbe::new(activity_url.clone())),
        interval,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let orchestrator = build_orchestrator(&cli).await?;

    match &cli.command {
        Commands::List { cluster_type } => {
            let types = match cluster_type {
                Some(t) => vec![*t],
                None => orchestrator.registered_types(),
            };
            let mut rows = Vec::new();
            for cluster_type in types {
                for workspace in orchestrator.collection(cluster_type).await? {
                    rows.push(WorkspaceRow::from(&workspace));
                }
            }
            if rows.is_empty() {
                println!("no workspaces registered");
            } else {
                println!("{}", Table::new(rows));
            }
        }
        Commands::Create { cluster_type, file } => {
            let raw = std::fs::read_to_string(file)?;
            let payload: WorkspacePayload = serde_yaml::from_str(&raw)?;
            let name = payload.name.clone();

            let token = CancellationToken::new();
            let interrupt = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });

            let workspace = orchestrator
                .create_with_token(*cluster_type, payload, token)
                .await?;
            println!(
                "created {} (project {})",
                name, workspace.config.project_uuid
            );
        }
        Commands::Delete { name } => {
            orchestrator.delete(name).await?;
            println!("deleted {}", name);
        }
        Commands::Stop { name } => {
            orchestrator.stop(name).await?;
            println!("stopped {}", name);
        }
        Commands::Resume { name } => {
            orchestrator.resume(name).await?;
            println!("resumed {}", name);
        }
        Commands::Url { name } => match orchestrator.url(name).await? {
            Some(url) => println!("{}", url),
            None => {
                let workspace = orchestrator.member(name).await?;
                match workspace.instance.and_then(|i| i.ip) {
                    Some(ip) => println!("http://{}", ip),
                    None => println!("{} has no reachable address", name),
                }
            }
        },
        Commands::IdleCheck => {
            let controller = controller(&cli, orchestrator.clone(), Duration::from_secs(300))?;
            for cluster_type in orchestrator.registered_types() {
                let stopped = controller.check_auto_termination(cluster_type).await?;
                println!("{}: stopped {} idle workspace(s)", cluster_type, stopped);
            }
        }
        Commands::Watch { interval_secs } => {
            let controller = controller(
                &cli,
                orchestrator.clone(),
                Duration::from_secs(*interval_secs),
            )?;
            let token = CancellationToken::new();
            let interrupt = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });
            println!("watching every {}s, ctrl-c to stop", interval_secs);
            controller.run(token).await;
        }
    }

    Ok(())
}
