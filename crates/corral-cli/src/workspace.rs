//! Workspace and component commands.

use anyhow::{Context as _, Result};
use clap::Args;
use std::path::PathBuf;

use corral_core::manifest::DefaultLoader;
use corral_core::BulkFilter;
use corral_local_db::{ComponentFilter, ComponentRecord};

use crate::Context;

pub fn init(ctx: &Context) -> Result<()> {
    let workspace = ctx
        .kernel
        .ensure_workspace(&ctx.workspace_path)
        .context("Failed to register workspace")?;
    println!("{}\t{}", workspace.id(), workspace.root().display());
    Ok(())
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Manifest file to apply instead of the one found in the workspace
    #[arg(long = "manifest", value_name = "PATH")]
    pub manifest: Option<PathBuf>,
}

impl ApplyArgs {
    pub async fn run(self, ctx: &Context) -> Result<()> {
        let workspace = ctx.workspace()?;
        let report = match self.manifest {
            Some(path) => workspace.apply_with(&DefaultLoader::with_path(path)).await?,
            None => workspace.apply().await?,
        };
        for warning in &report.warnings {
            eprintln!("warning: {}", warning);
        }
        for (verb, names) in [
            ("created", &report.created),
            ("updated", &report.updated),
            ("deleted", &report.deleted),
        ] {
            for name in names {
                println!("{} {}", verb, name);
            }
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct LsArgs {
    /// Only components of this type (repeatable)
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub types: Vec<String>,

    /// Include child components
    #[arg(short = 'a', long = "all")]
    pub all: bool,

    /// Print JSON instead of a table
    #[arg(long = "json")]
    pub json: bool,
}

impl LsArgs {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let filter = ComponentFilter {
            types: (!self.types.is_empty()).then_some(self.types),
            top_level_only: !self.all,
            ..Default::default()
        };
        let components = ctx.workspace()?.describe_components(&filter)?;
        if self.json {
            let values: Vec<serde_json::Value> = components.iter().map(component_json).collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
            return Ok(());
        }
        for component in components {
            println!("{}", component_line(&component));
        }
        Ok(())
    }
}

fn component_json(component: &ComponentRecord) -> serde_json::Value {
    serde_json::json!({
        "id": component.id,
        "parent_id": component.parent_id,
        "name": component.name,
        "type": component.type_,
        "key": component.key,
        "spec": serde_json::from_str::<serde_json::Value>(&component.spec).unwrap_or_default(),
        "state": serde_json::from_str::<serde_json::Value>(&component.state).unwrap_or_default(),
        "initialized_at": component.initialized_at,
        "disposed_at": component.disposed_at,
    })
}

fn component_line(component: &ComponentRecord) -> String {
    let status = if component.disposed_at.is_some() {
        "disposed"
    } else if component.initialized_at.is_some() {
        "initialized"
    } else {
        "pending"
    };
    format!(
        "{}\t{}\t{}\t{}",
        component.id, component.name, component.type_, status
    )
}

pub fn ps(ctx: &Context) -> Result<()> {
    for process in ctx.workspace()?.describe_processes()? {
        let pid = process.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string());
        let status = if process.running { "running" } else { "stopped" };
        println!("{}\t{}\t{}\t{}", process.id, process.name, status, pid);
    }
    Ok(())
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(value_name = "NAME")]
    pub name: String,

    #[arg(value_name = "TYPE")]
    pub type_: String,

    /// Component spec as JSON
    #[arg(long = "spec", value_name = "JSON", default_value = "{}")]
    pub spec: String,
}

impl CreateArgs {
    pub async fn run(self, ctx: &Context) -> Result<()> {
        let spec: serde_json::Value =
            serde_json::from_str(&self.spec).context("--spec must be a JSON document")?;
        let id = ctx
            .workspace()?
            .create_component(&self.name, &self.type_, &spec)
            .await?;
        println!("{}", id);
        Ok(())
    }
}

#[derive(Args)]
pub struct RefArgs {
    /// Component ID or top-level name
    #[arg(value_name = "REF")]
    pub reference: String,
}

impl RefArgs {
    pub async fn remove(self, ctx: &Context) -> Result<()> {
        ctx.workspace()?.delete_component(&self.reference).await?;
        Ok(())
    }

    pub async fn dispose(self, ctx: &Context) -> Result<()> {
        ctx.workspace()?.dispose_component(&self.reference).await?;
        Ok(())
    }

    pub async fn reconcile(self, ctx: &Context) -> Result<()> {
        let job_id = ctx.workspace()?.reconcile(&self.reference).await?;
        ctx.finish_job(&job_id).await
    }
}

/// A fan-out operation over components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bulk {
    Start,
    Stop,
    Restart,
    Refresh,
}

#[derive(Args)]
pub struct RefsArgs {
    /// Component IDs or top-level names
    #[arg(value_name = "REF")]
    pub references: Vec<String>,

    /// Only touch components of these types
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub types: Vec<String>,
}

impl RefsArgs {
    pub fn filter(&self) -> BulkFilter {
        let non_empty = |values: &Vec<String>| (!values.is_empty()).then(|| values.clone());
        BulkFilter {
            refs: non_empty(&self.references),
            types: non_empty(&self.types),
        }
    }

    pub async fn run(self, ctx: &Context, bulk: Bulk) -> Result<()> {
        let workspace = ctx.workspace()?;
        let filter = self.filter();
        let job_id = match bulk {
            Bulk::Start => workspace.start(&filter).await?,
            Bulk::Stop => workspace.stop(&filter).await?,
            Bulk::Restart => workspace.restart(&filter).await?,
            Bulk::Refresh => workspace.refresh(&filter).await?,
        };
        ctx.finish_job(&job_id).await
    }
}

pub async fn destroy(ctx: &Context) -> Result<()> {
    ctx.workspace()?.destroy().await?;
    Ok(())
}

pub fn export_procfile(ctx: &Context) -> Result<()> {
    print!("{}", ctx.workspace()?.export_procfile()?);
    Ok(())
}

#[derive(Args)]
pub struct CatArgs {
    /// Path relative to the workspace root
    #[arg(value_name = "PATH")]
    pub path: String,
}

impl CatArgs {
    pub async fn run(self, ctx: &Context) -> Result<()> {
        print!("{}", ctx.workspace()?.read_file(&self.path).await?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_local_db::now_timestamp;

    #[test]
    fn test_component_line_status() {
        let mut component = ComponentRecord {
            id: "c1".to_string(),
            workspace_id: "w".to_string(),
            parent_id: None,
            name: "web".to_string(),
            type_: "process".to_string(),
            key: None,
            spec: "{}".to_string(),
            state: "{}".to_string(),
            created_at: now_timestamp(),
            initialized_at: None,
            disposed_at: None,
        };
        assert_eq!(component_line(&component), "c1\tweb\tprocess\tpending");
        component.initialized_at = Some(now_timestamp());
        assert!(component_line(&component).ends_with("initialized"));
        component.disposed_at = Some(now_timestamp());
        assert!(component_line(&component).ends_with("disposed"));
    }
}
