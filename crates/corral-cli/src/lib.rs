//! corral CLI library

pub mod config;
pub mod job;
pub mod workspace;

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::sync::Arc;

use corral_core::{ControllerFactory, Kernel, Workspace};
use corral_local_db::Database;

use crate::config::Config;

// Re-export CLI types for testing
pub use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Local workspace orchestrator")]
#[command(version, long_about = None)]
pub struct Cli {
    /// Workspace directory (defaults to the current directory)
    #[arg(short = 'w', long = "workspace", value_name = "PATH", global = true)]
    pub workspace: Option<PathBuf>,

    /// Config file (defaults to $CORRAL_CONFIG or ~/.corral/config.toml)
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Return job IDs immediately and leave the tasks to `corral worker`
    #[arg(long = "no-wait", global = true)]
    pub no_wait: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register the workspace directory
    Init,
    /// Converge the workspace onto its manifest
    Apply(workspace::ApplyArgs),
    /// List components
    Ls(workspace::LsArgs),
    /// List process components
    Ps,
    /// Create a component
    Create(workspace::CreateArgs),
    /// Dispose and delete a component with its descendants
    Rm(workspace::RefArgs),
    /// Dispose a component's resources but keep its record
    Dispose(workspace::RefArgs),
    /// Start processes (all when no refs are given)
    Start(workspace::RefsArgs),
    /// Stop processes (all when no refs are given)
    Stop(workspace::RefsArgs),
    /// Restart processes (all when no refs are given)
    Restart(workspace::RefsArgs),
    /// Refresh components (all when no refs are given)
    Refresh(workspace::RefsArgs),
    /// Reconcile a component's children
    Reconcile(workspace::RefArgs),
    /// Show jobs, or the task tree of one job
    Jobs(job::JobsArgs),
    /// Cancel a task and its unfinished subtasks
    Cancel(job::CancelArgs),
    /// Run task workers
    Worker(job::WorkerArgs),
    /// Delete every component and the workspace
    Destroy,
    /// Print process components as a Procfile
    ExportProcfile,
    /// Print a file from the workspace
    Cat(workspace::CatArgs),
}

/// Everything a command needs: configuration, the kernel and where the
/// workspace is.
pub struct Context {
    pub config: Config,
    pub kernel: Arc<Kernel>,
    pub workspace_path: PathBuf,
    /// Watch jobs until they complete.
    pub wait: bool,
}

impl Context {
    pub fn new(config: Config, db: Database, workspace_path: PathBuf, wait: bool) -> Self {
        let kernel = Kernel::new(db, ControllerFactory::with_builtin())
            .with_config(config.kernel_config(!wait));
        Self {
            config,
            kernel: Arc::new(kernel),
            workspace_path,
            wait,
        }
    }

    /// Load the config and open the state database for `cli`.
    pub fn open(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
        let config = Config::load_or_init(&config_path)?;
        let db_path = config.state_db_path();
        let db = Database::open(&db_path)
            .with_context(|| format!("Failed to open state database {}", db_path.display()))?;
        let workspace_path = match &cli.workspace {
            Some(path) => path.clone(),
            None => std::env::current_dir().context("Failed to get current directory")?,
        };
        Ok(Self::new(config, db, workspace_path, !cli.no_wait))
    }

    /// The registered workspace containing the workspace path.
    pub fn workspace(&self) -> Result<Workspace> {
        let reference = self.workspace_path.to_string_lossy();
        self.kernel.resolve_workspace(&reference)?.with_context(|| {
            format!(
                "No workspace at {}; run `corral init` first",
                self.workspace_path.display()
            )
        })
    }

    /// Print a job ID and, when waiting, watch it to completion.
    pub async fn finish_job(&self, job_id: &str) -> Result<()> {
        println!("{}", job_id);
        if !self.wait {
            return Ok(());
        }
        let root = self
            .kernel
            .wait_for_job(job_id, job::WATCH_INTERVAL)
            .await?;
        let tasks = self.kernel.tracker().tasks_by_job_id(job_id)?;
        print!("{}", job::render_tree(&tasks));
        if root.error.is_some() || tasks.iter().any(|t| t.error.is_some()) {
            anyhow::bail!("job {} finished with errors", job_id);
        }
        Ok(())
    }
}

impl Commands {
    pub async fn run(self, ctx: &Context) -> Result<()> {
        match self {
            Commands::Init => workspace::init(ctx),
            Commands::Apply(args) => args.run(ctx).await,
            Commands::Ls(args) => args.run(ctx),
            Commands::Ps => workspace::ps(ctx),
            Commands::Create(args) => args.run(ctx).await,
            Commands::Rm(args) => args.remove(ctx).await,
            Commands::Dispose(args) => args.dispose(ctx).await,
            Commands::Start(args) => args.run(ctx, workspace::Bulk::Start).await,
            Commands::Stop(args) => args.run(ctx, workspace::Bulk::Stop).await,
            Commands::Restart(args) => args.run(ctx, workspace::Bulk::Restart).await,
            Commands::Refresh(args) => args.run(ctx, workspace::Bulk::Refresh).await,
            Commands::Reconcile(args) => args.reconcile(ctx).await,
            Commands::Jobs(args) => args.run(ctx),
            Commands::Cancel(args) => args.run(ctx),
            Commands::Worker(args) => args.run(ctx).await,
            Commands::Destroy => workspace::destroy(ctx).await,
            Commands::ExportProcfile => workspace::export_procfile(ctx),
            Commands::Cat(args) => args.run(ctx).await,
        }
    }
}
