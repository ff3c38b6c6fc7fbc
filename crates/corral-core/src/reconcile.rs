//! Reconciliation of a component's children against what its controller
//! renders.
//!
//! Each run handles one level of the tree and schedules a child task for
//! every child that was created or transitioned, so a whole tree converges
//! through a cascade of independently cancellable tasks.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use corral_local_db::ComponentRecord;

use crate::controller::RenderedComponent;
use crate::dispatch::Operation;
use crate::runner::{Mutation, TaskContext};
use crate::workspace::{marshal_spec, Workspace};
use crate::{Error, Result};

/// Identity of a child across render calls: `type:name:key`, where key is the
/// explicit key when one is given and otherwise the SHA-256 of the
/// marshalled spec.
pub fn identity(type_: &str, name: &str, key: Option<&str>, spec: &str) -> String {
    match key {
        Some(key) => format!("{}:{}:{}", type_, name, key),
        None => format!("{}:{}:{:x}", type_, name, Sha256::digest(spec.as_bytes())),
    }
}

fn existing_identity(child: &ComponentRecord) -> String {
    identity(&child.type_, &child.name, child.key.as_deref(), &child.spec)
}

struct Desired {
    rendered: RenderedComponent,
    spec: String,
    identity: String,
}

fn desired_children(rendered: Vec<RenderedComponent>) -> Result<Vec<Desired>> {
    let mut names = HashSet::new();
    rendered
        .into_iter()
        .map(|rendered| {
            if !names.insert(rendered.name.clone()) {
                return Err(Error::DuplicateChildName {
                    name: rendered.name,
                });
            }
            let spec = marshal_spec(&rendered.spec)?;
            let identity = identity(&rendered.type_, &rendered.name, rendered.key.as_deref(), &spec);
            Ok(Desired {
                rendered,
                spec,
                identity,
            })
        })
        .collect()
}

/// Bring the children of component `id` in line with its rendered spec.
pub async fn reconcile_component(ctx: &TaskContext, workspace: &Workspace, id: &str) -> Result<()> {
    let component = workspace.component(id)?;
    if component.disposed_at.is_some() {
        tracing::debug!(component = %id, "component disposed, shutting down");
        return workspace.shutdown(id).await;
    }

    let mut probe = workspace
        .kernel()
        .dispatcher()
        .factory()
        .construct_or_invalid(&component.type_);
    let renders = probe.as_renderer().is_some();
    drop(probe);
    if renders {
        let rendered = workspace
            .control_component(id, Operation::Render)
            .await?
            .into_rendered();
        let desired = desired_children(rendered)?;
        reconcile_children(ctx, workspace, &component, desired).await?;
    }

    workspace.initialize(id).await
}

async fn reconcile_children(
    ctx: &TaskContext,
    workspace: &Workspace,
    component: &ComponentRecord,
    desired: Vec<Desired>,
) -> Result<()> {
    let mut existing: HashMap<String, ComponentRecord> = workspace
        .children(&component.id)?
        .into_iter()
        .map(|child| (existing_identity(&child), child))
        .collect();
    let wanted: HashSet<&str> = desired.iter().map(|d| d.identity.as_str()).collect();

    // Removals go first so a replacement can reuse the sibling name.
    let removed: Vec<String> = existing
        .keys()
        .filter(|identity| !wanted.contains(identity.as_str()))
        .cloned()
        .collect();
    for identity in removed {
        if let Some(child) = existing.remove(&identity) {
            check_canceled(ctx)?;
            tracing::info!(parent = %component.id, child = %child.id, name = %child.name, "removing child");
            workspace.shutdown(&child.id).await?;
        }
    }

    for child in desired {
        check_canceled(ctx)?;
        match existing.remove(&child.identity) {
            None => {
                let created = workspace
                    .create_child(
                        Some(&component.id),
                        &child.rendered.name,
                        &child.rendered.type_,
                        &child.spec,
                        child.rendered.key.as_deref(),
                    )
                    .await?;
                tracing::info!(parent = %component.id, child = %created.id, name = %created.name, "created child");
                schedule(ctx, workspace, &created.id)?;
            }
            Some(current) if current.spec != child.spec => {
                tracing::info!(parent = %component.id, child = %current.id, name = %current.name, "updating child in place");
                workspace
                    .control_component(&current.id, Operation::Update { spec: child.spec })
                    .await?;
                schedule(ctx, workspace, &current.id)?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_canceled(ctx: &TaskContext) -> Result<()> {
    if ctx.is_canceled()? {
        return Err(Error::Canceled {
            id: ctx.task().id.clone(),
        });
    }
    Ok(())
}

fn schedule(ctx: &TaskContext, workspace: &Workspace, component_id: &str) -> Result<()> {
    ctx.spawn_subtask(&Mutation::ReconcileComponent {
        workspace_id: workspace.id().to_string(),
        component_id: component_id.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rendered(name: &str, key: Option<&str>, spec: serde_json::Value) -> RenderedComponent {
        RenderedComponent {
            type_: "process".to_string(),
            name: name.to_string(),
            key: key.map(str::to_string),
            spec,
        }
    }

    fn identities(children: Vec<RenderedComponent>) -> Vec<String> {
        desired_children(children)
            .unwrap()
            .into_iter()
            .map(|d| d.identity)
            .collect()
    }

    #[test]
    fn test_unkeyed_identity_is_stable_across_renders() {
        let first = identities(vec![rendered("a", None, json!({"program": "x", "arguments": ["1"]}))]);
        let second = identities(vec![rendered("a", None, json!({"arguments": ["1"], "program": "x"}))]);
        assert_eq!(first, second);
        assert!(first[0].starts_with("process:a:"));
    }

    #[test]
    fn test_unkeyed_spec_change_changes_identity() {
        let before = identities(vec![rendered("a", None, json!({"program": "x"}))]);
        let after = identities(vec![rendered("a", None, json!({"program": "y"}))]);
        assert_ne!(before, after);
    }

    #[test]
    fn test_key_pins_identity_across_spec_change() {
        let before = identities(vec![rendered("a", Some("k"), json!({"program": "x"}))]);
        let after = identities(vec![rendered("a", Some("k"), json!({"program": "y"}))]);
        assert_eq!(before, after);
        assert_eq!(before[0], "process:a:k");
    }

    #[test]
    fn test_type_and_name_are_part_of_identity() {
        assert_ne!(identity("process", "a", Some("k"), ""), identity("container", "a", Some("k"), ""));
        assert_ne!(identity("process", "a", None, "{}"), identity("process", "b", None, "{}"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = desired_children(vec![
            rendered("a", None, json!({})),
            rendered("a", Some("other"), json!({"x": 1})),
        ]);
        assert!(matches!(result, Err(Error::DuplicateChildName { name }) if name == "a"));
    }
}
