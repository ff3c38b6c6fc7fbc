//! Generic dispatch of typed operations against persisted components.

use serde::{Deserialize, Serialize};
use std::fmt;

use corral_local_db::{ComponentPatch, ComponentRecord, ComponentStore, Database};

use crate::controller::{
    Controller, ControllerContext, ControllerFactory, RenderedComponent, CAPABILITY_LIFECYCLE,
    CAPABILITY_PROCESS, CAPABILITY_RENDERER,
};
use crate::{Error, Result};

/// An operation bound to one controller capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Initialize,
    Refresh,
    Dispose,
    Start,
    Stop,
    Restart,
    Render,
    /// Transition to a new spec in place: dispose under the old spec, then
    /// initialize under the new one.
    Update { spec: String },
}

impl Operation {
    /// The capability a controller must implement to run this operation.
    pub fn capability(&self) -> &'static str {
        match self {
            Operation::Initialize
            | Operation::Refresh
            | Operation::Dispose
            | Operation::Update { .. } => CAPABILITY_LIFECYCLE,
            Operation::Start | Operation::Stop | Operation::Restart => CAPABILITY_PROCESS,
            Operation::Render => CAPABILITY_RENDERER,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Initialize => "initialize",
            Operation::Refresh => "refresh",
            Operation::Dispose => "dispose",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Restart => "restart",
            Operation::Render => "render",
            Operation::Update { .. } => "update",
        };
        f.write_str(name)
    }
}

/// What an operation produced besides the state side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    Rendered(Vec<RenderedComponent>),
}

impl Outcome {
    pub fn into_rendered(self) -> Vec<RenderedComponent> {
        match self {
            Outcome::Rendered(children) => children,
            Outcome::Done => Vec::new(),
        }
    }
}

/// Hydrates and drives controllers for persisted components.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    db: Database,
    factory: ControllerFactory,
}

impl Dispatcher {
    pub fn new(db: Database, factory: ControllerFactory) -> Self {
        Self { db, factory }
    }

    pub fn factory(&self) -> &ControllerFactory {
        &self.factory
    }

    /// Run `op` against the controller for `component`.
    ///
    /// The controller's state is persisted after the operation regardless of
    /// its outcome. The operation error takes priority over a persistence
    /// error when both occur.
    pub async fn control(
        &self,
        ctx: &ControllerContext,
        component: &ComponentRecord,
        op: Operation,
    ) -> Result<Outcome> {
        tracing::debug!(component = %component.id, type_ = %component.type_, %op, "control");
        let mut controller = self.factory.construct_or_invalid(&component.type_);
        controller.hydrate(&component.spec, &component.state)?;

        let result = run(controller.as_mut(), ctx, &component.type_, &op).await;

        let mut patch = ComponentPatch::default();
        if let (Operation::Update { spec }, Ok(_)) = (&op, &result) {
            patch.spec = Some(spec.clone());
        }
        let persisted = controller.marshal_state().and_then(|state| {
            patch.state = Some(state);
            self.db
                .with_connection(|conn| ComponentStore::new(conn).patch(&component.id, &patch))
                .map_err(Error::from)
        });

        match (result, persisted) {
            (Err(err), persisted) => {
                if let Err(persist_err) = persisted {
                    tracing::warn!(component = %component.id, error = %persist_err, "failed to persist state");
                }
                Err(err)
            }
            (Ok(_), Err(persist_err)) => Err(persist_err),
            (Ok(outcome), Ok(_)) => Ok(outcome),
        }
    }
}

async fn run(
    controller: &mut dyn Controller,
    ctx: &ControllerContext,
    type_: &str,
    op: &Operation,
) -> Result<Outcome> {
    let mismatch = || Error::capability_mismatch(op.capability(), type_);
    match op {
        Operation::Initialize => {
            controller.as_lifecycle().ok_or_else(mismatch)?.initialize(ctx).await?
        }
        Operation::Refresh => controller.as_lifecycle().ok_or_else(mismatch)?.refresh(ctx).await?,
        Operation::Dispose => controller.as_lifecycle().ok_or_else(mismatch)?.dispose(ctx).await?,
        Operation::Update { spec } => {
            controller.as_lifecycle().ok_or_else(mismatch)?.dispose(ctx).await?;
            let state = controller.marshal_state()?;
            controller.hydrate(spec, &state)?;
            controller.as_lifecycle().ok_or_else(mismatch)?.initialize(ctx).await?;
        }
        Operation::Start => controller.as_process().ok_or_else(mismatch)?.start(ctx).await?,
        Operation::Stop => controller.as_process().ok_or_else(mismatch)?.stop(ctx).await?,
        Operation::Restart => controller.as_process().ok_or_else(mismatch)?.restart(ctx).await?,
        Operation::Render => {
            let children = controller.as_renderer().ok_or_else(mismatch)?.render(ctx).await?;
            return Ok(Outcome::Rendered(children));
        }
    }
    Ok(Outcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Lifecycle;
    use async_trait::async_trait;
    use corral_local_db::{now_timestamp, WorkspaceRecord, WorkspaceStore};
    use serde_json::json;

    /// Counts initializations in its state; fails dispose when `fail` is set.
    #[derive(Default)]
    struct Counter {
        fail: bool,
        count: u64,
    }

    impl Controller for Counter {
        fn hydrate(&mut self, spec: &str, state: &str) -> Result<()> {
            let spec: serde_json::Value =
                serde_json::from_str(spec).map_err(|e| Error::unmarshal("spec", e))?;
            self.fail = spec["fail"].as_bool().unwrap_or(false);
            let state: serde_json::Value =
                serde_json::from_str(state).map_err(|e| Error::unmarshal("state", e))?;
            self.count = state["count"].as_u64().unwrap_or(0);
            Ok(())
        }

        fn marshal_state(&self) -> Result<String> {
            Ok(json!({ "count": self.count }).to_string())
        }

        fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
            Some(self)
        }
    }

    #[async_trait]
    impl Lifecycle for Counter {
        async fn initialize(&mut self, _ctx: &ControllerContext) -> Result<()> {
            self.count += 1;
            Ok(())
        }

        async fn refresh(&mut self, _ctx: &ControllerContext) -> Result<()> {
            Ok(())
        }

        async fn dispose(&mut self, _ctx: &ControllerContext) -> Result<()> {
            self.count += 100;
            if self.fail {
                return Err(Error::provider("dispose failed"));
            }
            Ok(())
        }
    }

    fn setup(spec: &str, state: &str) -> (Dispatcher, ComponentRecord, ControllerContext) {
        let db = Database::open_in_memory().unwrap();
        let mut factory = ControllerFactory::new();
        factory.register("counter", || Box::new(Counter::default()));
        let component = ComponentRecord {
            id: "c1".to_string(),
            workspace_id: "w".to_string(),
            parent_id: None,
            name: "web".to_string(),
            type_: "counter".to_string(),
            key: None,
            spec: spec.to_string(),
            state: state.to_string(),
            created_at: now_timestamp(),
            initialized_at: None,
            disposed_at: None,
        };
        db.with_connection(|conn| {
            WorkspaceStore::new(conn).insert(&WorkspaceRecord {
                id: "w".to_string(),
                root: "/tmp/w".to_string(),
                created_at: now_timestamp(),
            })?;
            ComponentStore::new(conn).insert(&component)
        })
        .unwrap();
        let ctx = ControllerContext {
            workspace_id: "w".to_string(),
            workspace_root: "/tmp/w".into(),
            component_id: "c1".to_string(),
            component_name: "web".to_string(),
            syslog_port: 4500,
        };
        (Dispatcher::new(db, factory), component, ctx)
    }

    fn stored_state(dispatcher: &Dispatcher) -> String {
        dispatcher
            .db
            .with_connection(|conn| Ok(ComponentStore::new(conn).get("c1")?.unwrap().state))
            .unwrap()
    }

    #[tokio::test]
    async fn test_state_is_persisted_after_success() {
        let (dispatcher, component, ctx) = setup("{}", "{}");
        dispatcher.control(&ctx, &component, Operation::Initialize).await.unwrap();
        assert_eq!(stored_state(&dispatcher), r#"{"count":1}"#);
    }

    #[tokio::test]
    async fn test_state_is_persisted_after_failure() {
        let (dispatcher, component, ctx) = setup(r#"{"fail":true}"#, r#"{"count":1}"#);
        let err = dispatcher.control(&ctx, &component, Operation::Dispose).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        assert_eq!(stored_state(&dispatcher), r#"{"count":101}"#);
    }

    #[tokio::test]
    async fn test_missing_capability_is_reported() {
        let (dispatcher, component, ctx) = setup("{}", "{}");
        let err = dispatcher.control(&ctx, &component, Operation::Stop).await.unwrap_err();
        match err {
            Error::CapabilityMismatch { capability, type_ } => {
                assert_eq!(capability, "Process");
                assert_eq!(type_, "counter");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_state_fails_hydration() {
        let (dispatcher, component, ctx) = setup("{}", "not json");
        let err = dispatcher.control(&ctx, &component, Operation::Refresh).await.unwrap_err();
        assert!(matches!(err, Error::Unmarshal { .. }));
    }

    #[tokio::test]
    async fn test_unknown_type_reports_construction_error() {
        let (dispatcher, mut component, ctx) = setup("{}", "{}");
        component.type_ = "mystery".to_string();
        let err = dispatcher.control(&ctx, &component, Operation::Initialize).await.unwrap_err();
        assert!(matches!(err, Error::ControllerConstruction { .. }));
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_stored_state() {
        let state = r#"{"pid":42,"running":true}"#;
        let (dispatcher, mut component, ctx) = setup("{}", state);
        component.type_ = "plugin".to_string();
        let err = dispatcher.control(&ctx, &component, Operation::Refresh).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"constructing "plugin" controller: unsupported component type"#
        );
        assert_eq!(stored_state(&dispatcher), state);
    }

    #[tokio::test]
    async fn test_update_patches_spec_and_reinitializes() {
        let (dispatcher, component, ctx) = setup("{}", "{}");
        let op = Operation::Update {
            spec: r#"{"fail":false,"v":2}"#.to_string(),
        };
        dispatcher.control(&ctx, &component, op).await.unwrap();
        let stored = dispatcher
            .db
            .with_connection(|conn| Ok(ComponentStore::new(conn).get("c1")?.unwrap()))
            .unwrap();
        assert_eq!(stored.spec, r#"{"fail":false,"v":2}"#);
        assert_eq!(stored.state, r#"{"count":101}"#);
    }
}
