//! In-memory store for flow definitions, instances and execution logs.
//!
//! Rows mirror the relational layout one-to-one. Definitions toggle
//! `is_active` only through the version manager, which serializes writers
//! per flow name via [`FlowStore::name_lock`].

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::errors::{EngineError, Result};
use crate::flow::model::{FlowDefinition, FlowExecutionLog, FlowInstance, InstanceStatus};

/// Filters for instance listing.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub flow_definition_id: Option<String>,
    pub status: Option<InstanceStatus>,
}

/// Aggregated monitoring statistics over a trailing window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct InstanceStats {
    pub total: usize,
    pub counts_by_status: HashMap<String, usize>,
    pub avg_processing_time_ms: Option<f64>,
    pub per_flow: HashMap<String, FlowNameStats>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FlowNameStats {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct FlowStore {
    definitions: DashMap<String, FlowDefinition>,
    instances: DashMap<String, FlowInstance>,
    /// Per-instance logs, append-ordered by node sequence
    logs: DashMap<String, Vec<FlowExecutionLog>>,
    /// Writer lock per flow name; held across deactivate+insert sections
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The writer lock for a flow name. All `is_active` toggles for rows of
    /// that name happen while this lock is held.
    pub fn name_lock(&self, flow_name: &str) -> Arc<Mutex<()>> {
        self.name_locks
            .entry(flow_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn insert_definition(&self, def: FlowDefinition) {
        self.definitions.insert(def.id.clone(), def);
    }

    pub fn get_definition(&self, id: &str) -> Result<FlowDefinition> {
        self.definitions
            .get(id)
            .map(|d| d.value().clone())
            .ok_or_else(|| EngineError::not_found("flow_definition", id))
    }

    pub fn remove_definition(&self, id: &str) -> Result<FlowDefinition> {
        self.definitions
            .remove(id)
            .map(|(_, d)| d)
            .ok_or_else(|| EngineError::not_found("flow_definition", id))
    }

    /// All versions of a flow name, oldest version first.
    pub fn definitions_by_name(&self, flow_name: &str) -> Vec<FlowDefinition> {
        let mut rows: Vec<FlowDefinition> = self
            .definitions
            .iter()
            .filter(|d| d.name == flow_name)
            .map(|d| d.value().clone())
            .collect();
        rows.sort_by_key(|d| d.version);
        rows
    }

    pub fn active_definition(&self, flow_name: &str) -> Option<FlowDefinition> {
        self.definitions
            .iter()
            .find(|d| d.name == flow_name && d.is_active)
            .map(|d| d.value().clone())
    }

    /// Toggles `is_active`. Callers must hold the name lock.
    pub fn set_active_flag(&self, id: &str, active: bool) -> Result<()> {
        let mut row = self
            .definitions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("flow_definition", id))?;
        row.is_active = active;
        row.updated_at = Utc::now();
        Ok(())
    }

    pub fn insert_instance(&self, instance: FlowInstance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    pub fn get_instance(&self, id: &str) -> Result<FlowInstance> {
        self.instances
            .get(id)
            .map(|i| i.value().clone())
            .ok_or_else(|| EngineError::not_found("flow_instance", id))
    }

    pub fn update_instance<F>(&self, id: &str, mutate: F) -> Result<FlowInstance>
    where
        F: FnOnce(&mut FlowInstance),
    {
        let mut row = self
            .instances
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("flow_instance", id))?;
        mutate(&mut row);
        Ok(row.clone())
    }

    pub fn list_instances(&self, filter: &InstanceFilter) -> Vec<FlowInstance> {
        let mut rows: Vec<FlowInstance> = self
            .instances
            .iter()
            .filter(|i| {
                filter
                    .flow_definition_id
                    .as_ref()
                    .map_or(true, |id| &i.flow_definition_id == id)
                    && filter.status.map_or(true, |s| i.status == s)
            })
            .map(|i| i.value().clone())
            .collect();
        rows.sort_by_key(|i| i.started_at);
        rows
    }

    pub fn append_log(&self, log: FlowExecutionLog) {
        self.logs
            .entry(log.flow_instance_id.clone())
            .or_default()
            .push(log);
    }

    /// Finalizes the most recent log row for `node_id`. Log rows are never
    /// mutated again once completed.
    pub fn finalize_log<F>(&self, instance_id: &str, node_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut FlowExecutionLog),
    {
        let mut entry = self
            .logs
            .get_mut(instance_id)
            .ok_or_else(|| EngineError::not_found("flow_instance", instance_id))?;
        let row = entry
            .iter_mut()
            .rev()
            .find(|l| l.node_id == node_id && l.completed_at.is_none())
            .ok_or_else(|| EngineError::not_found("flow_execution_log", node_id))?;
        mutate(row);
        Ok(())
    }

    pub fn logs_for_instance(&self, instance_id: &str) -> Vec<FlowExecutionLog> {
        self.logs
            .get(instance_id)
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    /// Counts by status, average processing time, and per-flow
    /// success/failure over instances started within `window_secs`.
    pub fn stats(&self, window_secs: u64) -> InstanceStats {
        let cutoff = Utc::now() - Duration::seconds(window_secs as i64);
        let mut stats = InstanceStats::default();
        let mut total_ms: i64 = 0;
        let mut timed: usize = 0;
        for row in self.instances.iter() {
            if row.started_at < cutoff {
                continue;
            }
            stats.total += 1;
            *stats
                .counts_by_status
                .entry(row.status.as_str().to_string())
                .or_default() += 1;
            if let Some(ms) = row.processing_time_ms {
                total_ms += ms;
                timed += 1;
            }
            let per_flow = stats.per_flow.entry(row.flow_name.clone()).or_default();
            match row.status {
                InstanceStatus::Completed => per_flow.completed += 1,
                InstanceStatus::Failed => per_flow.failed += 1,
                _ => {}
            }
        }
        if timed > 0 {
            stats.avg_processing_time_ms = Some(total_ms as f64 / timed as f64);
        }
        stats
    }
}
