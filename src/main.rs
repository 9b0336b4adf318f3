use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sandpiper::config::Config;
use sandpiper::deploy::DeploymentPipeline;
use sandpiper::project::file_store::FileProjectStore;
use sandpiper::project::store::ProjectStore;
use sandpiper::recovery::{RecoveryOptions, SandboxManager};
use sandpiper::sandbox::{ProviderRegistry, SandboxError};
use sandpiper::snapshots::SnapshotLifecycle;

#[derive(Parser)]
#[command(name = "sandpiper", about = "Sandbox lifecycle manager for app previews")]
enum Cli {
    /// Bring up (or recover) the sandbox for a project
    Up {
        project: String,
        /// Template to use when this call creates the project
        #[arg(long)]
        template: Option<String>,
        /// Boot from this snapshot image and skip content restoration
        #[arg(long)]
        recovery_image: Option<String>,
        /// Mark a newly created project as an imported codebase
        #[arg(long)]
        imported: bool,
    },
    /// Show the stored record and current preview URL for a project
    Status { project: String },
    /// Snapshot the sandbox filesystem and bind the image to a fragment
    Snapshot {
        project: String,
        /// Fragment to bind to (defaults to the project's active one)
        #[arg(long)]
        fragment: Option<String>,
    },
    /// Delete snapshots beyond the configured keep count
    Cleanup { project: String },
    /// Build the project in its sandbox and ship it to the deploy target
    Deploy { project: String },
    /// Terminate the project's sandbox
    Terminate { project: String },
    /// Terminate every sandbox whose handle has expired
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandpiper=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        // Raw provider errors go to the log; the terminal gets one
        // stable line.
        if let Some(sandbox_err) = err.downcast_ref::<SandboxError>() {
            eprintln!("{}", sandbox_err.user_message());
        }
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env();

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let store = Arc::new(FileProjectStore::new(config.store_dir.clone()));
    store.load_all().await?;
    let registry = Arc::new(ProviderRegistry::from_config(&config, http_client.clone()));
    let manager = SandboxManager::new(registry.clone(), store.clone(), &config);

    match cli {
        Cli::Up {
            project,
            template,
            recovery_image,
            imported,
        } => {
            let active = manager
                .get_or_create(
                    &project,
                    RecoveryOptions {
                        template,
                        imported,
                        recovery_image_id: recovery_image,
                        health: None,
                    },
                )
                .await?;
            let verb = if active.provisioned {
                "provisioned"
            } else {
                "reattached"
            };
            println!(
                "{verb} sandbox {} ({})",
                active.handle.sandbox_id, active.handle.provider
            );
            if let Some(url) = &active.handle.public_url {
                println!("preview: {url}");
            }
            if !active.ready {
                println!("note: dev server readiness was not confirmed");
            }
        }

        Cli::Status { project } => {
            let url = manager.refresh_url(&project).await?;
            let record = store
                .get_project(&project)
                .await
                .with_context(|| format!("project {project} not found"))?;
            println!("project:         {}", record.id);
            println!(
                "template:        {}",
                record.template.as_deref().unwrap_or("-")
            );
            println!("imported:        {}", record.imported);
            println!(
                "active fragment: {}",
                record.active_fragment_id.as_deref().unwrap_or("-")
            );
            match &record.last_commit {
                Some(commit) => println!(
                    "last commit:     {} ({})",
                    commit.commit_hash, commit.branch
                ),
                None => println!("last commit:     -"),
            }
            match &record.sandbox {
                Some(handle) => {
                    println!("sandbox:         {} ({})", handle.sandbox_id, handle.provider);
                    println!(
                        "expires:         {}",
                        handle
                            .expires_at
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string())
                    );
                    println!("preview:         {}", url.as_deref().unwrap_or("-"));
                }
                None => println!("sandbox:         none"),
            }
        }

        Cli::Snapshot { project, fragment } => {
            let record = store
                .get_project(&project)
                .await
                .with_context(|| format!("project {project} not found"))?;
            let fragment_id = match fragment.or(record.active_fragment_id) {
                Some(id) => id,
                None => store
                    .latest_fragment(&project)
                    .await
                    .map(|f| f.id)
                    .context("no fragment to bind the snapshot to")?,
            };
            let active = manager
                .get_or_create(&project, RecoveryOptions::default())
                .await?;
            let lifecycle = SnapshotLifecycle::new(config.snapshot_keep_count);
            let image_id = lifecycle
                .create_snapshot(
                    registry.as_ref(),
                    active.sandbox.as_ref(),
                    store.as_ref(),
                    &project,
                    &fragment_id,
                )
                .await?;
            println!("snapshot {image_id} bound to fragment {fragment_id}");
        }

        Cli::Cleanup { project } => {
            let lifecycle = SnapshotLifecycle::new(config.snapshot_keep_count);
            let removed = lifecycle
                .cleanup(
                    registry.as_ref(),
                    store.as_ref(),
                    &project,
                    config.snapshot_keep_count,
                )
                .await?;
            println!(
                "removed {removed} snapshot(s), keeping at most {}",
                config.snapshot_keep_count
            );
        }

        Cli::Deploy { project } => {
            let deploy_config = config
                .deploy
                .as_ref()
                .context("DEPLOY_ENDPOINT and DEPLOY_TOKEN are not configured")?;
            let pipeline =
                DeploymentPipeline::new(http_client.clone(), deploy_config, config.workdir.clone());
            if !pipeline.healthy().await {
                tracing::warn!("Deploy target health probe failed; attempting anyway");
            }
            let active = manager
                .get_or_create(&project, RecoveryOptions::default())
                .await?;
            let deployment = pipeline.deploy(active.sandbox.as_ref()).await?;
            println!(
                "deployed via {} upload: {}",
                deployment.strategy.as_str(),
                deployment.url
            );
        }

        Cli::Terminate { project } => {
            manager.terminate(&project).await?;
            println!("sandbox for {project} terminated");
        }

        Cli::Sweep => {
            let swept = manager.sweep_expired().await?;
            println!("terminated {swept} expired sandbox(es)");
        }
    }

    Ok(())
}
