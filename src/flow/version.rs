//! Versioned lifecycle of flow definitions.
//!
//! Version rows are immutable after creation; superseding a version only
//! toggles `is_active` flags, and every deactivate+insert pair happens under
//! the per-name writer lock so the single-active invariant holds after every
//! operation.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::core::errors::{EngineError, Result};
use crate::flow::model::{
    EdgeSpec, FlowDefinition, FlowVersion, NodeSpec, RetryConfig, TriggerType,
};
use crate::flow::store::FlowStore;

/// Shape accepted when creating the first version of a flow (also the YAML
/// import format).
#[derive(Debug, Clone, Deserialize)]
pub struct NewFlowDefinition {
    pub name: String,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Value,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Field overrides applied when cutting a new version from the active one.
/// Absent fields are carried over unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionChanges {
    #[serde(default)]
    pub nodes: Option<Vec<NodeSpec>>,
    #[serde(default)]
    pub edges: Option<Vec<EdgeSpec>>,
    #[serde(default)]
    pub variables: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub trigger_config: Option<Value>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timeout_seconds: Option<Option<u64>>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub created_by: Option<String>,
}

pub struct FlowVersionManager {
    store: Arc<FlowStore>,
}

impl FlowVersionManager {
    pub fn new(store: Arc<FlowStore>) -> Self {
        Self { store }
    }

    /// Creates the first version (`1.0`, active) of a brand-new flow.
    pub async fn create(&self, new: NewFlowDefinition) -> Result<FlowDefinition> {
        let lock = self.store.name_lock(&new.name);
        let _guard = lock.lock().await;

        if !self.store.definitions_by_name(&new.name).is_empty() {
            return Err(EngineError::invalid_transition(format!(
                "flow '{}' already exists; use create_version",
                new.name
            )));
        }
        let now = Utc::now();
        let def = FlowDefinition {
            id: cuid2::create_id(),
            name: new.name,
            version: FlowVersion::initial(),
            is_active: true,
            trigger_type: new.trigger_type,
            trigger_config: new.trigger_config,
            nodes: new.nodes,
            edges: new.edges,
            variables: new.variables,
            priority: new.priority,
            timeout_seconds: new.timeout_seconds,
            retry: new.retry,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        def.validate_graph()?;
        self.store.insert_definition(def.clone());
        info!(flow = %def.name, version = %def.version, "created flow definition");
        Ok(def)
    }

    /// Cuts a new active version from the current active one, with any
    /// fields present in `changes` overridden. Deactivate-then-insert is
    /// all-or-nothing: the new row is fully built and validated before any
    /// flag is touched.
    pub async fn create_version(
        &self,
        flow_name: &str,
        changes: VersionChanges,
    ) -> Result<FlowDefinition> {
        let lock = self.store.name_lock(flow_name);
        let _guard = lock.lock().await;

        let active = self
            .store
            .active_definition(flow_name)
            .ok_or_else(|| EngineError::not_found("flow_definition", flow_name))?;
        let next = self.next_version_locked(flow_name);
        let def = Self::apply_changes(&active, next, changes);
        def.validate_graph()?;

        self.store.set_active_flag(&active.id, false)?;
        self.store.insert_definition(def.clone());
        info!(
            flow = %flow_name,
            from = %active.version,
            to = %def.version,
            "created flow version"
        );
        Ok(def)
    }

    /// Activates `version_id`, deactivating whatever is currently active for
    /// that flow name.
    pub async fn activate(&self, version_id: &str) -> Result<FlowDefinition> {
        let target = self.store.get_definition(version_id)?;
        let lock = self.store.name_lock(&target.name);
        let _guard = lock.lock().await;

        // the row may have been deleted while waiting for the lock; bail
        // before touching the current active flag
        let target = self.store.get_definition(version_id)?;
        if let Some(current) = self.store.active_definition(&target.name) {
            if current.id == target.id {
                return Ok(current);
            }
            self.store.set_active_flag(&current.id, false)?;
        }
        self.store.set_active_flag(&target.id, true)?;
        let row = self.store.get_definition(version_id)?;
        info!(flow = %row.name, version = %row.version, "activated flow version");
        Ok(row)
    }

    /// Clones the target version's content into a brand-new active row with
    /// an incremented version number. The old row itself is never
    /// reactivated, preserving full immutable history.
    pub async fn rollback(&self, version_id: &str) -> Result<FlowDefinition> {
        let target = self.store.get_definition(version_id)?;
        let lock = self.store.name_lock(&target.name);
        let _guard = lock.lock().await;

        let next = self.next_version_locked(&target.name);
        let now = Utc::now();
        let def = FlowDefinition {
            id: cuid2::create_id(),
            version: next,
            is_active: true,
            created_at: now,
            updated_at: now,
            ..target.clone()
        };

        if let Some(current) = self.store.active_definition(&target.name) {
            self.store.set_active_flag(&current.id, false)?;
        }
        self.store.insert_definition(def.clone());
        info!(
            flow = %target.name,
            restored = %target.version,
            as_version = %def.version,
            "rolled back flow definition"
        );
        Ok(def)
    }

    /// Deletes an inactive version row. Refuses to delete the active row.
    pub async fn delete(&self, version_id: &str) -> Result<()> {
        let target = self.store.get_definition(version_id)?;
        let lock = self.store.name_lock(&target.name);
        let _guard = lock.lock().await;

        let current = self.store.get_definition(version_id)?;
        if current.is_active {
            return Err(EngineError::invalid_transition(format!(
                "cannot delete active version {} of flow '{}'",
                current.version, current.name
            )));
        }
        self.store.remove_definition(version_id)?;
        Ok(())
    }

    pub fn get(&self, version_id: &str) -> Result<FlowDefinition> {
        self.store.get_definition(version_id)
    }

    pub fn active(&self, flow_name: &str) -> Option<FlowDefinition> {
        self.store.active_definition(flow_name)
    }

    /// All versions of a flow, oldest first.
    pub fn list_versions(&self, flow_name: &str) -> Vec<FlowDefinition> {
        self.store.definitions_by_name(flow_name)
    }

    /// Creates a flow definition from a YAML file.
    pub async fn import_yaml<P: AsRef<Path>>(&self, path: P) -> Result<FlowDefinition> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| EngineError::Io {
                operation: format!("read {}", path.as_ref().display()),
                source: e,
            })?;
        let new: NewFlowDefinition = serde_yaml::from_str(&contents)?;
        self.create(new).await
    }

    /// Next version for a name: minor bump over the highest version ever
    /// used, so superseded and rolled-back rows are never shadowed.
    /// Callers must hold the name lock.
    fn next_version_locked(&self, flow_name: &str) -> FlowVersion {
        self.store
            .definitions_by_name(flow_name)
            .into_iter()
            .map(|d| d.version)
            .max()
            .map(FlowVersion::bump_minor)
            .unwrap_or_else(FlowVersion::initial)
    }

    fn apply_changes(
        base: &FlowDefinition,
        version: FlowVersion,
        changes: VersionChanges,
    ) -> FlowDefinition {
        let now = Utc::now();
        FlowDefinition {
            id: cuid2::create_id(),
            name: base.name.clone(),
            version,
            is_active: true,
            trigger_type: changes.trigger_type.unwrap_or(base.trigger_type),
            trigger_config: changes
                .trigger_config
                .unwrap_or_else(|| base.trigger_config.clone()),
            nodes: changes.nodes.unwrap_or_else(|| base.nodes.clone()),
            edges: changes.edges.unwrap_or_else(|| base.edges.clone()),
            variables: changes.variables.unwrap_or_else(|| base.variables.clone()),
            priority: changes.priority.unwrap_or(base.priority),
            timeout_seconds: changes.timeout_seconds.unwrap_or(base.timeout_seconds),
            retry: changes.retry.unwrap_or_else(|| base.retry.clone()),
            created_by: changes.created_by.or_else(|| base.created_by.clone()),
            created_at: now,
            updated_at: now,
        }
    }
}
