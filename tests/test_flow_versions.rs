//! Integration tests for the versioned flow definition lifecycle.

use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;

use collabflow::flow::{
    EdgeSpec, FlowStore, FlowVersionManager, NewFlowDefinition, NodeKind, NodeSpec,
    RetryConfig, TriggerType, VersionChanges,
};
use collabflow::EngineError;

fn manager() -> FlowVersionManager {
    FlowVersionManager::new(Arc::new(FlowStore::new()))
}

fn node(id: &str, kind: NodeKind) -> NodeSpec {
    NodeSpec {
        id: id.into(),
        kind,
        name: id.into(),
        config: serde_json::Value::Null,
    }
}

fn welcome() -> NewFlowDefinition {
    NewFlowDefinition {
        name: "welcome".into(),
        trigger_type: TriggerType::Message,
        trigger_config: serde_json::Value::Null,
        nodes: vec![node("n1", NodeKind::Start), node("n2", NodeKind::End)],
        edges: vec![EdgeSpec {
            source: "n1".into(),
            target: "n2".into(),
            condition: None,
        }],
        variables: HashMap::new(),
        priority: 0,
        timeout_seconds: None,
        retry: RetryConfig::default(),
        created_by: Some("ops".into()),
    }
}

#[tokio::test]
async fn test_create_version_supersedes_active_row() {
    let mgr = manager();
    let v0 = mgr.create(welcome()).await.unwrap();
    assert_eq!(v0.version.to_string(), "1.0");

    let changes = VersionChanges {
        nodes: Some(vec![
            node("n1", NodeKind::Start),
            node("reply", NodeKind::AiReply),
            node("n2", NodeKind::End),
        ]),
        edges: Some(vec![
            EdgeSpec {
                source: "n1".into(),
                target: "reply".into(),
                condition: None,
            },
            EdgeSpec {
                source: "reply".into(),
                target: "n2".into(),
                condition: None,
            },
        ]),
        ..Default::default()
    };
    let v1 = mgr.create_version("welcome", changes).await.unwrap();

    assert_eq!(v1.version.to_string(), "1.1");
    assert!(v1.is_active);
    assert_eq!(v1.nodes.len(), 3);
    // prior row is superseded but preserved
    let old = mgr.get(&v0.id).unwrap();
    assert!(!old.is_active);
    assert_eq!(old.nodes.len(), 2);
}

#[tokio::test]
async fn test_list_versions_keeps_full_history() {
    let mgr = manager();
    let v0 = mgr.create(welcome()).await.unwrap();
    for _ in 0..3 {
        mgr.create_version("welcome", VersionChanges::default())
            .await
            .unwrap();
    }
    mgr.rollback(&v0.id).await.unwrap();

    let versions = mgr.list_versions("welcome");
    assert_eq!(versions.len(), 5);
    let labels: Vec<String> = versions.iter().map(|v| v.version.to_string()).collect();
    assert_eq!(labels, vec!["1.0", "1.1", "1.2", "1.3", "1.4"]);
    assert_eq!(versions.iter().filter(|v| v.is_active).count(), 1);
    assert!(versions.last().unwrap().is_active);
}

#[tokio::test]
async fn test_activate_unknown_version_fails() {
    let mgr = manager();
    mgr.create(welcome()).await.unwrap();
    let err = mgr.activate("no_such_row").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_rollback_restores_content_as_new_version() {
    let mgr = manager();
    let v0 = mgr.create(welcome()).await.unwrap();
    let v1 = mgr
        .create_version(
            "welcome",
            VersionChanges {
                priority: Some(9),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(v1.priority, 9);

    let restored = mgr.rollback(&v0.id).await.unwrap();
    assert_eq!(restored.version.to_string(), "1.2");
    assert_eq!(restored.priority, v0.priority);
    assert!(restored.is_active);
    assert!(!mgr.get(&v1.id).unwrap().is_active);
}

#[tokio::test]
async fn test_import_yaml_definition() {
    let yaml = r#"
name: onboarding
trigger_type: message
nodes:
  - id: entry
    type: start
    name: entry
  - id: watch
    type: monitor
    name: watch room
    config:
      duration_secs: 120
      detect_staff: true
  - id: done
    type: end
    name: done
edges:
  - source: entry
    target: watch
  - source: watch
    target: done
    condition: timeout
  - source: watch
    target: done
    condition: detected
"#;
    let dir = std::env::temp_dir().join("collabflow_yaml_test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("onboarding.yaml");
    std::fs::write(&path, yaml).unwrap();

    let mgr = manager();
    let def = mgr.import_yaml(&path).await.unwrap();
    assert_eq!(def.name, "onboarding");
    assert_eq!(def.version.to_string(), "1.0");
    assert!(def.is_active);
    assert_eq!(def.nodes.len(), 3);
    assert_eq!(def.nodes[1].kind, NodeKind::Monitor);

    let _ = std::fs::remove_file(&path);
}
