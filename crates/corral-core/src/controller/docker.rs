//! Container, network and volume controllers backed by the `docker` CLI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;

use super::{decode_document, Controller, ControllerContext, Lifecycle, Process};
use crate::{Error, Result};

const LABEL_WORKSPACE: &str = "io.corral.workspace";
const LABEL_COMPONENT: &str = "io.corral.component";

/// Execute a docker command and return its trimmed stdout.
async fn docker(args: &[String]) -> Result<String> {
    tracing::debug!(?args, "docker");
    let output = Command::new("docker")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::provider(format!("running docker: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::provider(format!(
            "docker {} failed: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn is_missing(err: &Error) -> bool {
    matches!(err, Error::Provider { message } if message.contains("No such"))
}

/// Name docker resources after their workspace and component so they are
/// recognizable in `docker ps`.
fn resource_name(ctx: &ControllerContext) -> String {
    format!("corral_{}_{}", ctx.workspace_id, ctx.component_name)
}

fn label_args(ctx: &ControllerContext, labels: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("--label".to_string());
    args.push(format!("{}={}", LABEL_WORKSPACE, ctx.workspace_id));
    args.push("--label".to_string());
    args.push(format!("{}={}", LABEL_COMPONENT, ctx.component_id));
    args
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct ContainerController {
    spec: ContainerSpec,
    state: ContainerState,
}

impl ContainerController {
    fn create_args(&self, ctx: &ControllerContext) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            resource_name(ctx),
        ];
        args.extend(label_args(ctx, &self.spec.labels));
        for (key, value) in &self.spec.environment {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for port in &self.spec.ports {
            args.push("--publish".to_string());
            args.push(port.clone());
        }
        for volume in &self.spec.volumes {
            args.push("--volume".to_string());
            args.push(volume.clone());
        }
        // Extra networks are connected after creation; docker only accepts one here.
        if let Some(network) = self.spec.networks.first() {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        args.push(self.spec.image.clone());
        args.extend(self.spec.command.iter().cloned());
        args
    }

    fn container_id(&self) -> Result<String> {
        self.state
            .container_id
            .clone()
            .ok_or_else(|| Error::provider("container has not been created"))
    }
}

impl Controller for ContainerController {
    fn hydrate(&mut self, spec: &str, state: &str) -> Result<()> {
        self.spec = decode_document("container spec", spec)?;
        self.state = decode_document("container state", state)?;
        Ok(())
    }

    fn marshal_state(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.state)?)
    }

    fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        Some(self)
    }

    fn as_process(&mut self) -> Option<&mut dyn Process> {
        Some(self)
    }
}

#[async_trait]
impl Lifecycle for ContainerController {
    async fn initialize(&mut self, ctx: &ControllerContext) -> Result<()> {
        if self.spec.image.is_empty() {
            return Err(Error::provider(format!(
                "container {:?} has no image",
                ctx.component_name
            )));
        }
        let id = docker(&self.create_args(ctx)).await?;
        self.state.container_id = Some(id.clone());
        for network in self.spec.networks.iter().skip(1) {
            docker(&["network".to_string(), "connect".to_string(), network.clone(), id.clone()])
                .await?;
        }
        self.start(ctx).await
    }

    async fn refresh(&mut self, _ctx: &ControllerContext) -> Result<()> {
        let Some(id) = self.state.container_id.clone() else {
            self.state.running = false;
            return Ok(());
        };
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            id,
        ];
        match docker(&args).await {
            Ok(running) => self.state.running = running == "true",
            Err(err) if is_missing(&err) => {
                self.state.container_id = None;
                self.state.running = false;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn dispose(&mut self, _ctx: &ControllerContext) -> Result<()> {
        if let Some(id) = self.state.container_id.clone() {
            match docker(&["rm".to_string(), "--force".to_string(), id]).await {
                Ok(_) => {}
                Err(err) if is_missing(&err) => {}
                Err(err) => return Err(err),
            }
        }
        self.state = ContainerState::default();
        Ok(())
    }
}

#[async_trait]
impl Process for ContainerController {
    async fn start(&mut self, _ctx: &ControllerContext) -> Result<()> {
        let id = self.container_id()?;
        docker(&["start".to_string(), id]).await?;
        self.state.running = true;
        Ok(())
    }

    async fn stop(&mut self, _ctx: &ControllerContext) -> Result<()> {
        let id = self.container_id()?;
        docker(&["stop".to_string(), id]).await?;
        self.state.running = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct NetworkController {
    spec: NetworkSpec,
    state: NetworkState,
}

impl Controller for NetworkController {
    fn hydrate(&mut self, spec: &str, state: &str) -> Result<()> {
        self.spec = decode_document("network spec", spec)?;
        self.state = decode_document("network state", state)?;
        Ok(())
    }

    fn marshal_state(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.state)?)
    }

    fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        Some(self)
    }
}

#[async_trait]
impl Lifecycle for NetworkController {
    async fn initialize(&mut self, ctx: &ControllerContext) -> Result<()> {
        let mut args = vec!["network".to_string(), "create".to_string()];
        if let Some(driver) = &self.spec.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        args.extend(label_args(ctx, &self.spec.labels));
        args.push(resource_name(ctx));
        self.state.network_id = Some(docker(&args).await?);
        Ok(())
    }

    async fn refresh(&mut self, _ctx: &ControllerContext) -> Result<()> {
        if let Some(id) = self.state.network_id.clone() {
            match docker(&["network".to_string(), "inspect".to_string(), id]).await {
                Ok(_) => {}
                Err(err) if is_missing(&err) => self.state.network_id = None,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn dispose(&mut self, _ctx: &ControllerContext) -> Result<()> {
        if let Some(id) = self.state.network_id.take() {
            match docker(&["network".to_string(), "rm".to_string(), id]).await {
                Ok(_) => {}
                Err(err) if is_missing(&err) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

#[derive(Debug, Default)]
pub struct VolumeController {
    spec: VolumeSpec,
    state: VolumeState,
}

impl Controller for VolumeController {
    fn hydrate(&mut self, spec: &str, state: &str) -> Result<()> {
        self.spec = decode_document("volume spec", spec)?;
        self.state = decode_document("volume state", state)?;
        Ok(())
    }

    fn marshal_state(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.state)?)
    }

    fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        Some(self)
    }
}

#[async_trait]
impl Lifecycle for VolumeController {
    async fn initialize(&mut self, ctx: &ControllerContext) -> Result<()> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        if let Some(driver) = &self.spec.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        args.extend(label_args(ctx, &self.spec.labels));
        args.push(resource_name(ctx));
        self.state.volume_name = Some(docker(&args).await?);
        Ok(())
    }

    async fn refresh(&mut self, _ctx: &ControllerContext) -> Result<()> {
        if let Some(name) = self.state.volume_name.clone() {
            match docker(&["volume".to_string(), "inspect".to_string(), name]).await {
                Ok(_) => {}
                Err(err) if is_missing(&err) => self.state.volume_name = None,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn dispose(&mut self, _ctx: &ControllerContext) -> Result<()> {
        if let Some(name) = self.state.volume_name.take() {
            match docker(&["volume".to_string(), "rm".to_string(), name]).await {
                Ok(_) => {}
                Err(err) if is_missing(&err) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ControllerContext {
        ControllerContext {
            workspace_id: "ws1".to_string(),
            workspace_root: std::path::PathBuf::from("/srv/app"),
            component_id: "c1".to_string(),
            component_name: "db".to_string(),
            syslog_port: 4500,
        }
    }

    #[test]
    fn test_container_create_args() {
        let mut controller = ContainerController::default();
        controller
            .hydrate(
                r#"{"image":"postgres:16","command":["postgres","-N","50"],"environment":{"PGDATA":"/data"},"ports":["5432:5432"],"networks":["backend","frontend"]}"#,
                "{}",
            )
            .unwrap();

        let args = controller.create_args(&context());
        assert_eq!(&args[..3], &["create", "--name", "corral_ws1_db"]);
        assert!(args.windows(2).any(|w| w == ["--env", "PGDATA=/data"]));
        assert!(args.windows(2).any(|w| w == ["--publish", "5432:5432"]));
        assert!(args.windows(2).any(|w| w == ["--network", "backend"]));
        assert!(!args.iter().any(|a| a == "frontend"));
        assert!(args.windows(2).any(|w| w == ["--label", "io.corral.component=c1"]));
        assert_eq!(&args[args.len() - 4..], &["postgres:16", "postgres", "-N", "50"]);
    }

    #[tokio::test]
    async fn test_container_start_requires_creation() {
        let mut controller = ContainerController::default();
        let err = controller.start(&context()).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[tokio::test]
    async fn test_dispose_without_resource_is_noop() {
        let ctx = context();
        let mut network = NetworkController::default();
        network.dispose(&ctx).await.unwrap();
        let mut volume = VolumeController::default();
        volume.dispose(&ctx).await.unwrap();
        assert_eq!(volume.marshal_state().unwrap(), "{}");
    }
}
