//! Workspace engine: the declarative and imperative surface over one
//! workspace's component graph.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use corral_local_db::{
    now_timestamp, ComponentFilter, ComponentPatch, ComponentRecord, ComponentStore,
    WorkspaceStore,
};

use crate::controller::process::ProcessSpec;
use crate::controller::ControllerContext;
use crate::dispatch::{Operation, Outcome};
use crate::kernel::Kernel;
use crate::logs::{self, EventPage, EventQuery, LogCollector, LogDescription};
use crate::manifest::{self, ManifestComponent, ManifestLoader};
use crate::runner::Mutation;
use crate::tracker::new_id;
use crate::{Error, Result};

/// Component types that behave like processes.
pub const PROCESS_TYPES: &[&str] = &["process", "container"];

/// Selects the components a bulk operation touches. Refs and types narrow
/// the selection together; an unset field matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkFilter {
    pub refs: Option<Vec<String>>,
    pub types: Option<Vec<String>>,
}

impl BulkFilter {
    pub fn refs<I, S>(refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            refs: Some(refs.into_iter().map(Into::into).collect()),
            types: None,
        }
    }

    pub fn types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            refs: None,
            types: Some(types.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_unset(&self) -> bool {
        self.refs.is_none() && self.types.is_none()
    }

    fn or_processes(&self) -> BulkFilter {
        if self.is_unset() {
            BulkFilter::types(PROCESS_TYPES.iter().copied())
        } else {
            self.clone()
        }
    }
}

const NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_-]*$";

fn name_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(pattern) = PATTERN.get() {
        return Ok(pattern);
    }
    let pattern = Regex::new(NAME_PATTERN).map_err(|e| Error::invalid_name(e.to_string()))?;
    Ok(PATTERN.get_or_init(|| pattern))
}

/// Check that a component name is non-empty and uses only identifier characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name_pattern()?.is_match(name) {
        Ok(())
    } else {
        Err(Error::invalid_name(name))
    }
}

/// Canonical string form of a spec document.
pub fn marshal_spec(spec: &Value) -> Result<String> {
    Ok(serde_json::to_string(spec)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDescription {
    pub id: String,
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescription {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub running: bool,
    pub pid: Option<i64>,
}

/// What an apply changed, by component name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
    pub warnings: Vec<String>,
}

/// A handle to one workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    kernel: Arc<Kernel>,
    id: String,
    root: PathBuf,
}

impl Workspace {
    pub(crate) fn new(kernel: Arc<Kernel>, id: String, root: PathBuf) -> Self {
        Self { kernel, id, root }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn describe(&self) -> WorkspaceDescription {
        WorkspaceDescription {
            id: self.id.clone(),
            root: self.root.to_string_lossy().to_string(),
        }
    }

    fn context(&self, component: &ComponentRecord) -> ControllerContext {
        ControllerContext {
            workspace_id: self.id.clone(),
            workspace_root: self.root.clone(),
            component_id: component.id.clone(),
            component_name: component.name.clone(),
            syslog_port: self.kernel.config().syslog_port,
        }
    }

    // Component queries

    pub fn describe_components(&self, filter: &ComponentFilter) -> Result<Vec<ComponentRecord>> {
        Ok(self
            .kernel
            .db()
            .with_connection(|conn| ComponentStore::new(conn).list(&self.id, filter))?)
    }

    pub fn component(&self, id: &str) -> Result<ComponentRecord> {
        let component = self
            .kernel
            .db()
            .with_connection(|conn| ComponentStore::new(conn).get(id))?
            .filter(|c| c.workspace_id == self.id);
        component.ok_or_else(|| Error::NoSuchComponent { id: id.to_string() })
    }

    pub fn children(&self, id: &str) -> Result<Vec<ComponentRecord>> {
        Ok(self
            .kernel
            .db()
            .with_connection(|conn| ComponentStore::new(conn).children(id))?)
    }

    /// Resolve refs (IDs or top-level names) to component IDs.
    pub fn resolve(&self, refs: &[String]) -> Result<Vec<Option<String>>> {
        Ok(self
            .kernel
            .db()
            .with_connection(|conn| ComponentStore::new(conn).resolve(&self.id, refs))?)
    }

    pub fn resolve_ref(&self, reference: &str) -> Result<String> {
        self.resolve_refs(&[reference.to_string()])?
            .pop()
            .ok_or_else(|| Error::unresolvable(reference))
    }

    fn resolve_refs(&self, refs: &[String]) -> Result<Vec<String>> {
        self.resolve(refs)?
            .into_iter()
            .zip(refs)
            .map(|(id, reference)| id.ok_or_else(|| Error::unresolvable(reference.as_str())))
            .collect()
    }

    pub fn describe_processes(&self) -> Result<Vec<ProcessDescription>> {
        let components = self.describe_components(&ComponentFilter {
            types: Some(PROCESS_TYPES.iter().map(|t| t.to_string()).collect()),
            ..Default::default()
        })?;
        Ok(components
            .into_iter()
            .map(|component| {
                let state: Value = serde_json::from_str(&component.state).unwrap_or(Value::Null);
                ProcessDescription {
                    running: state["running"].as_bool().unwrap_or(false),
                    pid: state["pid"].as_i64(),
                    id: component.id,
                    name: component.name,
                    type_: component.type_,
                }
            })
            .collect())
    }

    pub fn describe_volumes(&self) -> Result<Vec<ComponentRecord>> {
        self.describe_components(&ComponentFilter {
            types: Some(vec!["volume".to_string()]),
            ..Default::default()
        })
    }

    pub fn describe_networks(&self) -> Result<Vec<ComponentRecord>> {
        self.describe_components(&ComponentFilter {
            types: Some(vec!["network".to_string()]),
            ..Default::default()
        })
    }

    /// Render the workspace's process components as a Procfile.
    pub fn export_procfile(&self) -> Result<String> {
        let processes = self.describe_components(&ComponentFilter {
            types: Some(vec!["process".to_string()]),
            top_level_only: true,
            ..Default::default()
        })?;
        let specs = processes
            .iter()
            .map(|p| {
                let spec: ProcessSpec = serde_json::from_str(&p.spec)
                    .map_err(|e| Error::unmarshal(format!("{} spec", p.name), e))?;
                Ok((p.name.as_str(), spec))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(manifest::generate_procfile(
            specs.iter().map(|(name, spec)| (*name, spec)),
        ))
    }

    // Imperative component lifecycle

    /// Run an operation against a component through its controller.
    pub async fn control_component(&self, id: &str, op: Operation) -> Result<Outcome> {
        let component = self.component(id)?;
        let ctx = self.context(&component);
        self.kernel.dispatcher().control(&ctx, &component, op).await
    }

    /// Create and initialize a top-level component. Returns its ID.
    pub async fn create_component(&self, name: &str, type_: &str, spec: &Value) -> Result<String> {
        let spec = marshal_spec(spec)?;
        let component = self.create_child(None, name, type_, &spec, None).await?;
        Ok(component.id)
    }

    pub(crate) async fn create_child(
        &self,
        parent_id: Option<&str>,
        name: &str,
        type_: &str,
        spec: &str,
        key: Option<&str>,
    ) -> Result<ComponentRecord> {
        validate_name(name)?;
        let record = ComponentRecord {
            id: new_id(),
            workspace_id: self.id.clone(),
            parent_id: parent_id.map(str::to_string),
            name: name.to_string(),
            type_: type_.to_string(),
            key: key.map(str::to_string),
            spec: spec.to_string(),
            state: "{}".to_string(),
            created_at: now_timestamp(),
            initialized_at: None,
            disposed_at: None,
        };
        self.kernel
            .db()
            .with_connection(|conn| ComponentStore::new(conn).insert(&record))?;
        tracing::info!(workspace = %self.id, component = %record.id, name, type_, "created component");

        self.initialize(&record.id).await?;
        self.component(&record.id)
    }

    /// Initialize a component unless it already is, and stamp it.
    pub(crate) async fn initialize(&self, id: &str) -> Result<()> {
        let component = self.component(id)?;
        if component.initialized_at.is_some() {
            return Ok(());
        }
        let ctx = self.context(&component);
        self.kernel
            .dispatcher()
            .control(&ctx, &component, Operation::Initialize)
            .await?;
        self.patch(
            id,
            &ComponentPatch {
                initialized_at: Some(now_timestamp()),
                ..Default::default()
            },
        )
    }

    /// Dispose a component's resources without removing its record.
    pub async fn dispose_component(&self, reference: &str) -> Result<()> {
        let id = self.resolve_ref(reference)?;
        self.dispose(&id).await
    }

    pub(crate) async fn dispose(&self, id: &str) -> Result<()> {
        let component = self.component(id)?;
        if component.disposed_at.is_some() {
            return Ok(());
        }
        let ctx = self.context(&component);
        self.kernel
            .dispatcher()
            .control(&ctx, &component, Operation::Dispose)
            .await?;
        self.patch(
            id,
            &ComponentPatch {
                disposed_at: Some(now_timestamp()),
                ..Default::default()
            },
        )?;
        tracing::info!(workspace = %self.id, component = %id, "disposed component");
        Ok(())
    }

    /// Dispose and remove a component together with its descendants.
    pub async fn delete_component(&self, reference: &str) -> Result<()> {
        let id = self.resolve_ref(reference)?;
        self.shutdown(&id).await
    }

    /// Dispose every component in the subtree rooted at `id`, children before
    /// parents, removing each record once it has been disposed. A failed
    /// dispose stops the shutdown with that component still stored.
    pub(crate) async fn shutdown(&self, id: &str) -> Result<()> {
        let mut order = vec![id.to_string()];
        let mut index = 0;
        while index < order.len() {
            let children = self.children(&order[index])?;
            order.extend(children.into_iter().map(|c| c.id));
            index += 1;
        }

        for id in order.iter().rev() {
            self.dispose(id).await?;
            self.kernel
                .db()
                .with_connection(|conn| ComponentStore::new(conn).remove(id))?;
            tracing::debug!(workspace = %self.id, component = %id, "removed component");
        }
        Ok(())
    }

    /// Replace a component's spec by disposing and recreating it. Returns the
    /// new component ID.
    pub async fn update_component(&self, reference: &str, spec: &Value) -> Result<String> {
        let old = self.component(&self.resolve_ref(reference)?)?;
        self.shutdown(&old.id).await?;
        let spec = marshal_spec(spec)?;
        let created = self
            .create_child(old.parent_id.as_deref(), &old.name, &old.type_, &spec, old.key.as_deref())
            .await?;
        Ok(created.id)
    }

    fn patch(&self, id: &str, patch: &ComponentPatch) -> Result<()> {
        self.kernel
            .db()
            .with_connection(|conn| ComponentStore::new(conn).patch(id, patch))?;
        Ok(())
    }

    // Declarative apply

    /// Load the workspace manifest with the kernel's loader and apply it.
    pub async fn apply(&self) -> Result<ApplyReport> {
        self.apply_with(self.kernel.loader().as_ref()).await
    }

    pub async fn apply_with(&self, loader: &dyn ManifestLoader) -> Result<ApplyReport> {
        let loaded = loader.load(&self.root)?;
        let mut report = self.apply_components(&loaded.components).await?;
        report.warnings = loaded.warnings;
        Ok(report)
    }

    /// Converge the top-level components onto `declared`.
    ///
    /// Same-named components whose type or spec differ are replaced; those no
    /// longer declared are deleted. Not transactional: a failure part way
    /// leaves the changes made so far in place.
    pub async fn apply_components(&self, declared: &[ManifestComponent]) -> Result<ApplyReport> {
        let existing = self.describe_components(&ComponentFilter {
            top_level_only: true,
            ..Default::default()
        })?;
        let mut by_name: HashMap<String, ComponentRecord> =
            existing.into_iter().map(|c| (c.name.clone(), c)).collect();
        let mut report = ApplyReport::default();
        let mut seen = HashSet::new();

        for component in declared {
            if !seen.insert(component.name.as_str()) {
                return Err(Error::manifest(format!(
                    "component {:?} declared twice",
                    component.name
                )));
            }
            match by_name.remove(&component.name) {
                Some(old) if old.type_ == component.type_ && spec_matches(&old.spec, &component.spec) => {
                    report.unchanged.push(component.name.clone());
                }
                Some(old) => {
                    self.shutdown(&old.id)
                        .await
                        .map_err(|e| apply_error("updating", &component.name, e))?;
                    self.create_component(&component.name, &component.type_, &component.spec)
                        .await
                        .map_err(|e| apply_error("updating", &component.name, e))?;
                    report.updated.push(component.name.clone());
                }
                None => {
                    self.create_component(&component.name, &component.type_, &component.spec)
                        .await
                        .map_err(|e| apply_error("adding", &component.name, e))?;
                    report.created.push(component.name.clone());
                }
            }
        }

        let mut removed: Vec<ComponentRecord> = by_name.into_values().collect();
        removed.sort_by(|a, b| a.name.cmp(&b.name));
        for old in removed {
            self.shutdown(&old.id)
                .await
                .map_err(|e| apply_error("deleting", &old.name, e))?;
            report.deleted.push(old.name);
        }

        tracing::info!(
            workspace = %self.id,
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            "applied manifest"
        );
        Ok(report)
    }

    // Bulk operations

    /// Start process-like components. An unset filter selects every
    /// component of a [`PROCESS_TYPES`] type.
    pub async fn start(&self, filter: &BulkFilter) -> Result<String> {
        self.control_each_matching("starting", &filter.or_processes(), Operation::Start)
            .await
    }

    pub async fn stop(&self, filter: &BulkFilter) -> Result<String> {
        self.control_each_matching("stopping", &filter.or_processes(), Operation::Stop)
            .await
    }

    pub async fn restart(&self, filter: &BulkFilter) -> Result<String> {
        self.control_each_matching("restarting", &filter.or_processes(), Operation::Restart)
            .await
    }

    /// Refresh the matching components, or all of them.
    pub async fn refresh(&self, filter: &BulkFilter) -> Result<String> {
        self.control_each_matching("refreshing", filter, Operation::Refresh)
            .await
    }

    async fn control_each_matching(
        &self,
        label: &str,
        filter: &BulkFilter,
        op: Operation,
    ) -> Result<String> {
        let ids = match &filter.refs {
            Some(refs) => Some(self.resolve_refs(refs)?),
            None => None,
        };
        let ids = self
            .describe_components(&ComponentFilter {
                ids,
                types: filter.types.clone(),
                ..Default::default()
            })?
            .into_iter()
            .map(|c| c.id)
            .collect();
        self.control_each(label, ids, op).await
    }

    /// Start a job with one `control` task per component and return its ID
    /// without waiting for the tasks.
    async fn control_each(&self, label: &str, ids: Vec<String>, op: Operation) -> Result<String> {
        let tracker = self.kernel.tracker();
        let job = Mutation::Job {
            label: label.to_string(),
        }
        .to_new_task(None)?
        .claimed_by(self.kernel.worker_id());
        let job = tracker.create_task(job)?;

        let mut children = Vec::with_capacity(ids.len());
        for component_id in ids {
            let mutation = Mutation::Control {
                workspace_id: self.id.clone(),
                component_id,
                operation: op.clone(),
            };
            children.push(tracker.create_task(mutation.to_new_task(Some(&job.id))?)?.id);
        }
        tracker.finish_task(&job.id, None)?;

        tracing::info!(workspace = %self.id, job = %job.id, label, tasks = children.len(), "started job");
        for child in children {
            self.kernel.spawn_task(child);
        }
        Ok(job.id)
    }

    // Reconciliation

    /// Start a reconciliation job for a component. Returns the job ID.
    pub async fn reconcile(&self, reference: &str) -> Result<String> {
        let component_id = self.resolve_ref(reference)?;
        let mutation = Mutation::ReconcileComponent {
            workspace_id: self.id.clone(),
            component_id,
        };
        let job = self.kernel.tracker().create_task(mutation.to_new_task(None)?)?;
        self.kernel.spawn_task(job.id.clone());
        Ok(job.id)
    }

    // Files

    /// Resolve a path relative to the workspace root, refusing paths that
    /// leave the root.
    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for part in Path::new(relative).components() {
            match part {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(Error::PathEscape {
                            path: relative.to_string(),
                        });
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    resolved = PathBuf::from(part.as_os_str());
                }
            }
        }
        if !resolved.starts_with(&self.root) {
            return Err(Error::PathEscape {
                path: relative.to_string(),
            });
        }
        Ok(resolved)
    }

    pub async fn read_file(&self, relative: &str) -> Result<String> {
        let path = self.resolve_path(relative)?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    pub async fn write_file(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.resolve_path(relative)?;
        Ok(tokio::fs::write(path, content).await?)
    }

    // Logs

    /// One log group per process-like component, with the latest event time
    /// over its streams.
    pub async fn describe_logs(&self) -> Result<Vec<LogDescription>> {
        let collector = self.log_collector()?;
        let groups: Vec<String> = self.describe_processes()?.into_iter().map(|p| p.id).collect();
        let mut stream_to_group = HashMap::new();
        let mut streams = Vec::new();
        for (index, group) in groups.iter().enumerate() {
            for stream in logs::group_streams(group) {
                stream_to_group.insert(stream.clone(), index);
                streams.push(stream);
            }
        }

        let mut descriptions: Vec<LogDescription> = groups
            .into_iter()
            .map(|name| LogDescription {
                name,
                last_event_at: None,
            })
            .collect();
        for log in collector.describe_logs(&streams).await? {
            if let Some(&index) = stream_to_group.get(&log.name) {
                let group = &mut descriptions[index];
                group.last_event_at = logs::latest(group.last_event_at.take(), log.last_event_at);
            }
        }
        Ok(descriptions)
    }

    /// Fetch events for the given log groups, or for every group.
    pub async fn get_events(&self, groups: Option<Vec<String>>, query: EventQuery) -> Result<EventPage> {
        let collector = self.log_collector()?.clone();
        let groups = match groups {
            Some(groups) => groups,
            None => self.describe_logs().await?.into_iter().map(|l| l.name).collect(),
        };
        let query = EventQuery {
            logs: groups.iter().flat_map(|g| logs::group_streams(g)).collect(),
            ..query
        };
        collector.get_events(&query).await
    }

    fn log_collector(&self) -> Result<&Arc<dyn LogCollector>> {
        self.kernel
            .log_collector()
            .ok_or_else(|| Error::provider("no log collector configured"))
    }

    // Teardown

    /// Delete every component, then the workspace itself.
    pub async fn destroy(&self) -> Result<()> {
        let top_level = self.describe_components(&ComponentFilter {
            top_level_only: true,
            ..Default::default()
        })?;
        for component in top_level {
            self.shutdown(&component.id).await?;
        }
        self.kernel
            .db()
            .with_connection(|conn| WorkspaceStore::new(conn).remove(&self.id))?;
        tracing::info!(workspace = %self.id, "destroyed workspace");
        Ok(())
    }
}

fn spec_matches(stored: &str, declared: &Value) -> bool {
    serde_json::from_str::<Value>(stored)
        .map(|stored| &stored == declared)
        .unwrap_or(false)
}

fn apply_error(action: &str, name: &str, err: Error) -> Error {
    tracing::warn!(action, name, error = %err, "apply aborted");
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_name() {
        for name in ["web", "_private", "worker-2", "Db_1"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
        for name in ["", "2web", "has space", "dot.ted", "slash/name"] {
            assert!(
                matches!(validate_name(name), Err(Error::InvalidName { .. })),
                "{name:?} should be invalid"
            );
        }
    }

    #[test]
    fn test_spec_matches_ignores_key_order() {
        let stored = marshal_spec(&json!({"b": 1, "a": [1, 2]})).unwrap();
        assert!(spec_matches(&stored, &json!({"a": [1, 2], "b": 1})));
        assert!(!spec_matches(&stored, &json!({"a": [2, 1], "b": 1})));
        assert!(!spec_matches("garbage", &json!({})));
    }
}
