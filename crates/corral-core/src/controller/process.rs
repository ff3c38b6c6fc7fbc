//! Local process supervisor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;

use super::{decode_document, Controller, ControllerContext, Lifecycle, Process};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Working directory relative to the workspace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Spawns a detached program in the workspace root and tracks it by pid.
#[derive(Debug, Default)]
pub struct ProcessController {
    spec: ProcessSpec,
    state: ProcessState,
}

impl ProcessController {
    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    fn environment(&self, ctx: &ControllerContext) -> BTreeMap<String, String> {
        let mut env = self.spec.environment.clone();
        env.insert("CORRAL_WORKSPACE_ID".to_string(), ctx.workspace_id.clone());
        env.insert("CORRAL_COMPONENT_ID".to_string(), ctx.component_id.clone());
        env.insert("CORRAL_SYSLOG_PORT".to_string(), ctx.syslog_port.to_string());
        env
    }

    fn is_running(&self) -> bool {
        self.state.pid.map(pid_alive).unwrap_or(false)
    }
}

impl Controller for ProcessController {
    fn hydrate(&mut self, spec: &str, state: &str) -> Result<()> {
        self.spec = decode_document("process spec", spec)?;
        self.state = decode_document("process state", state)?;
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
impl Lifecycle for ProcessController {
    async fn initialize(&mut self, ctx: &ControllerContext) -> Result<()> {
        self.start(ctx).await
    }

    async fn refresh(&mut self, _ctx: &ControllerContext) -> Result<()> {
        self.state.running = self.is_running();
        if !self.state.running {
            self.state.pid = None;
        }
        Ok(())
    }

    async fn dispose(&mut self, ctx: &ControllerContext) -> Result<()> {
        self.stop(ctx).await
    }
}

#[async_trait]
impl Process for ProcessController {
    async fn start(&mut self, ctx: &ControllerContext) -> Result<()> {
        if self.is_running() {
            tracing::debug!(component = %ctx.component_name, pid = ?self.state.pid, "already running");
            return Ok(());
        }
        if self.spec.program.is_empty() {
            return Err(Error::provider(format!(
                "process {:?} has no program",
                ctx.component_name
            )));
        }

        let directory = match &self.spec.directory {
            Some(dir) => ctx.workspace_root.join(dir),
            None => ctx.workspace_root.clone(),
        };
        let env = self.environment(ctx);
        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.arguments)
            .current_dir(&directory)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::provider(format!("spawning {:?}: {}", self.spec.program, e))
            })?;

        let pid = child.id().map(|id| id as i32);
        tracing::info!(component = %ctx.component_name, ?pid, "started process");
        // Reap the child when it exits; it is otherwise left to run on its own.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        self.state = ProcessState {
            pid,
            running: pid.is_some(),
            environment: env,
        };
        Ok(())
    }

    async fn stop(&mut self, ctx: &ControllerContext) -> Result<()> {
        if let Some(pid) = self.state.pid {
            terminate(pid)?;
            tracing::info!(component = %ctx.component_name, pid, "stopped process");
        }
        self.state.pid = None;
        self.state.running = false;
        Ok(())
    }
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(unix)]
fn terminate(pid: i32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    match kill(nix::unistd::Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::provider(format!("signalling pid {}: {}", pid, e))),
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}

#[cfg(not(unix))]
fn terminate(pid: i32) -> Result<()> {
    Err(Error::provider(format!(
        "stopping pid {} is not supported on this platform",
        pid
    )))
}
