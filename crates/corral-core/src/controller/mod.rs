//! Component controllers and the capability traits they implement.
//!
//! A controller is the type-specific implementation behind a component. Every
//! controller can be hydrated from the component's persisted spec and state
//! documents and can marshal its state back out; beyond that it exposes some
//! subset of the [`Lifecycle`], [`Process`] and [`Renderer`] capabilities.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::{Error, Result};

pub mod docker;
pub mod group;
pub mod invalid;
pub mod process;

pub use docker::{ContainerController, NetworkController, VolumeController};
pub use group::GroupController;
pub use invalid::InvalidController;
pub use process::ProcessController;

/// Capability names as reported in capability mismatch errors.
pub const CAPABILITY_LIFECYCLE: &str = "Lifecycle";
pub const CAPABILITY_PROCESS: &str = "Process";
pub const CAPABILITY_RENDERER: &str = "Renderer";

/// Environment handed to every controller operation.
#[derive(Clone, Debug)]
pub struct ControllerContext {
    /// Workspace owning the component.
    pub workspace_id: String,
    /// Filesystem root of the workspace; processes run here.
    pub workspace_root: PathBuf,
    /// Component being controlled.
    pub component_id: String,
    /// Component name, used for resource naming by providers.
    pub component_name: String,
    /// Port of the local syslog collector, passed to spawned processes.
    pub syslog_port: u16,
}

/// A child component produced by [`Renderer::render`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderedComponent {
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    /// Explicit reconciliation key; pins identity across spec changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Initialize, refresh and dispose the resources behind a component.
#[async_trait]
pub trait Lifecycle: Send {
    async fn initialize(&mut self, ctx: &ControllerContext) -> Result<()>;

    /// Re-observe the live resource and update state accordingly.
    async fn refresh(&mut self, ctx: &ControllerContext) -> Result<()>;

    async fn dispose(&mut self, ctx: &ControllerContext) -> Result<()>;
}

/// Process-like components that can be started and stopped.
#[async_trait]
pub trait Process: Send {
    async fn start(&mut self, ctx: &ControllerContext) -> Result<()>;

    async fn stop(&mut self, ctx: &ControllerContext) -> Result<()>;

    async fn restart(&mut self, ctx: &ControllerContext) -> Result<()> {
        self.stop(ctx).await?;
        self.start(ctx).await
    }
}

/// Composite components that declare child components.
#[async_trait]
pub trait Renderer: Send {
    async fn render(&mut self, ctx: &ControllerContext) -> Result<Vec<RenderedComponent>>;
}

/// A hydratable controller exposing some subset of the capabilities.
pub trait Controller: Send {
    /// Load the component's spec and state documents into native shapes.
    fn hydrate(&mut self, spec: &str, state: &str) -> Result<()>;

    /// Serialize the (possibly mutated) state document.
    fn marshal_state(&self) -> Result<String>;

    fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        None
    }

    fn as_process(&mut self) -> Option<&mut dyn Process> {
        None
    }

    fn as_renderer(&mut self) -> Option<&mut dyn Renderer> {
        None
    }
}

/// Decode a JSON document, treating an empty document as the default value.
pub fn decode_document<T>(what: &str, doc: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if doc.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(doc).map_err(|e| Error::unmarshal(what, e))
}

/// Builds a fresh controller instance.
pub type Constructor = Arc<dyn Fn() -> Box<dyn Controller> + Send + Sync>;

/// Maps component type names to controller constructors.
#[derive(Clone, Default)]
pub struct ControllerFactory {
    constructors: HashMap<String, Constructor>,
}

impl fmt::Debug for ControllerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("ControllerFactory").field("types", &types).finish()
    }
}

impl ControllerFactory {
    /// Create a factory with no registered types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory with the built-in providers registered.
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        factory.register("process", || Box::new(ProcessController::default()));
        factory.register("container", || Box::new(ContainerController::default()));
        factory.register("network", || Box::new(NetworkController::default()));
        factory.register("volume", || Box::new(VolumeController::default()));
        factory.register("group", || Box::new(GroupController::default()));
        factory
    }

    /// Register (or replace) the constructor for a component type.
    pub fn register<F>(&mut self, type_: &str, constructor: F)
    where
        F: Fn() -> Box<dyn Controller> + Send + Sync + 'static,
    {
        self.constructors.insert(type_.to_string(), Arc::new(constructor));
    }

    pub fn is_registered(&self, type_: &str) -> bool {
        self.constructors.contains_key(type_)
    }

    /// Construct a controller for `type_`.
    pub fn construct(&self, type_: &str) -> Result<Box<dyn Controller>> {
        match self.constructors.get(type_) {
            Some(constructor) => Ok(constructor()),
            None => Err(Error::ControllerConstruction {
                type_: type_.to_string(),
                message: "unsupported component type".to_string(),
            }),
        }
    }

    /// Construct a controller, falling back to an [`InvalidController`] that
    /// reports the construction error from every capability.
    pub fn construct_or_invalid(&self, type_: &str) -> Box<dyn Controller> {
        match self.construct(type_) {
            Ok(controller) => controller,
            Err(err) => {
                tracing::warn!(type_, error = %err, "falling back to invalid controller");
                let message = match err {
                    Error::ControllerConstruction { message, .. } => message,
                    other => other.to_string(),
                };
                Box::new(InvalidController::new(type_, message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types_are_registered() {
        let factory = ControllerFactory::with_builtin();
        for type_ in ["process", "container", "network", "volume", "group"] {
            assert!(factory.is_registered(type_), "{type_} should be registered");
        }
    }

    #[test]
    fn test_unknown_type_fails_construction() {
        let factory = ControllerFactory::with_builtin();
        let err = factory.construct("nope").err().unwrap();
        assert!(matches!(err, Error::ControllerConstruction { ref type_, .. } if type_ == "nope"));
    }

    #[test]
    fn test_decode_document_rejects_malformed_json() {
        let err = decode_document::<serde_json::Value>("spec", "{not json").unwrap_err();
        assert!(matches!(err, Error::Unmarshal { ref what, .. } if what == "spec"));

        let empty: HashMap<String, String> = decode_document("state", "").unwrap();
        assert!(empty.is_empty());
    }
}
