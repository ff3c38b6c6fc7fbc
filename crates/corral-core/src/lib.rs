//! Core orchestration for corral.
//!
//! The crate ties persisted components to the controllers that manage their
//! external resources. A [`Kernel`] owns the state database, the
//! [`TaskTracker`] and the [`Dispatcher`]; a [`Workspace`] is the declarative
//! and imperative surface over one workspace's component graph. Bulk and
//! reconciliation work runs as trees of tasks that any [`Worker`] may claim.

pub mod controller;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod logs;
pub mod manifest;
pub mod reconcile;
pub mod runner;
pub mod tracker;
pub mod workspace;

/// Core result type used throughout corral.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for every component and task operation.
pub use error::Error;

/// Controller capabilities and the factory that builds controllers by type.
pub use controller::{
    Controller, ControllerContext, ControllerFactory, Lifecycle, Process, RenderedComponent,
    Renderer,
};

/// Typed operations and their generic dispatch.
pub use dispatch::{Dispatcher, Operation, Outcome};

/// The server object shared by front-ends and workers.
pub use kernel::{Kernel, KernelConfig};

/// Manifest loading.
pub use manifest::{DefaultLoader, LoadResult, ManifestComponent, ManifestLoader};

/// Task execution.
pub use runner::{Mutation, TaskContext, TaskRunner, Worker};

/// Task tree persistence and claiming.
pub use tracker::{NewTask, TaskTracker};

/// The workspace engine.
pub use workspace::{ApplyReport, BulkFilter, ProcessDescription, Workspace, WorkspaceDescription};
