//! Per-message arbitration between the AI responder and human staff.
//!
//! A pure decision function plus one external lookup. Safe to call multiple
//! times for the same `message_id`: the persisted decision row is an
//! idempotent upsert keyed by message id, since upstream retries can
//! re-deliver a message.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collab::detect::{StaffActivity, StaffPresenceDetector, TaskRequest, TaskSink};
use crate::collab::role::{
    AiBehavior, BusinessRole, BusinessRoleRegistry, Priority, StaffOnlineReplyMode,
};
use crate::core::errors::{EngineError, Result};

/// An inbound group-chat message requiring arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub session_id: String,
    pub message_id: String,
    pub robot_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiAction {
    Reply,
    DelayedReply,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffAction {
    None,
    Notify,
    Handle,
}

/// The persisted record of who was chosen to respond to a message, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationDecision {
    pub session_id: String,
    /// Unique per decision; the upsert key
    pub message_id: String,
    pub robot_id: String,
    pub should_ai_reply: bool,
    pub ai_action: AiAction,
    pub staff_action: StaffAction,
    pub priority: Priority,
    /// Human-readable trail of the rule that fired
    pub reason: String,
    pub business_role: String,
    #[serde(default)]
    pub staff_context: Value,
    #[serde(default)]
    pub info_context: Value,
    pub strategy: String,
    #[serde(default)]
    pub delay_seconds: Option<u64>,
    #[serde(default)]
    pub staff_id: Option<String>,
    #[serde(default)]
    pub staff_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store of decision rows keyed by message id.
#[derive(Default)]
pub struct DecisionStore {
    rows: DashMap<String, CollaborationDecision>,
}

impl DecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update-in-place by `message_id`, preserving the original
    /// `created_at`.
    pub fn upsert(&self, mut decision: CollaborationDecision) -> CollaborationDecision {
        if let Some(existing) = self.rows.get(&decision.message_id) {
            decision.created_at = existing.created_at;
        }
        decision.updated_at = Utc::now();
        self.rows
            .insert(decision.message_id.clone(), decision.clone());
        decision
    }

    pub fn get(&self, message_id: &str) -> Option<CollaborationDecision> {
        self.rows.get(message_id).map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Tunables for the decision engine.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Trailing window consulted for staff presence under semi_auto
    pub staff_window_secs: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            staff_window_secs: 300,
        }
    }
}

pub struct DecisionEngine {
    roles: Arc<BusinessRoleRegistry>,
    staff: Arc<dyn StaffPresenceDetector>,
    tasks: Option<Arc<dyn TaskSink>>,
    store: Arc<DecisionStore>,
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(
        roles: Arc<BusinessRoleRegistry>,
        staff: Arc<dyn StaffPresenceDetector>,
        store: Arc<DecisionStore>,
        config: DecisionConfig,
    ) -> Self {
        Self {
            roles,
            staff,
            tasks: None,
            store,
            config,
        }
    }

    /// Attaches the optional work-item sink used by roles with task
    /// creation enabled.
    pub fn with_task_sink(mut self, tasks: Arc<dyn TaskSink>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn store(&self) -> &Arc<DecisionStore> {
        &self.store
    }

    /// Arbitrates one inbound message and persists the decision. Calling
    /// again with the same `message_id` replaces the row with the latest
    /// values.
    pub async fn decide(&self, message: &InboundMessage) -> Result<CollaborationDecision> {
        let role = self.roles.resolve(&message.robot_id, &message.text);
        let keyword_hits = role.keyword_hits(&message.text);

        let decision = match role.ai_behavior {
            AiBehavior::FullAuto => self.decide_full_auto(message, &role, keyword_hits),
            AiBehavior::RecordOnly => self.decide_record_only(message, &role, keyword_hits),
            AiBehavior::SemiAuto => self.decide_semi_auto(message, &role, keyword_hits).await,
        };

        let persisted = self.store.upsert(decision);
        info!(
            message_id = %persisted.message_id,
            role = %persisted.business_role,
            should_ai_reply = persisted.should_ai_reply,
            reason = %persisted.reason,
            "collaboration decision persisted"
        );
        self.maybe_create_task(&role, &persisted).await;
        Ok(persisted)
    }

    fn decide_full_auto(
        &self,
        message: &InboundMessage,
        role: &BusinessRole,
        keyword_hits: usize,
    ) -> CollaborationDecision {
        // AI replies unconditionally; keyword matches only raise priority
        let priority = if keyword_hits > 0 {
            Priority::High
        } else {
            Priority::Normal
        };
        self.base_decision(message, role, keyword_hits)
            .should_reply(true, AiAction::Reply, priority)
            .with_reason(format!(
                "full_auto role '{}': AI replies unconditionally ({keyword_hits} keyword match(es))",
                role.code
            ))
            .build()
    }

    fn decide_record_only(
        &self,
        message: &InboundMessage,
        role: &BusinessRole,
        keyword_hits: usize,
    ) -> CollaborationDecision {
        let staff_action = if role.staff_enabled {
            StaffAction::Notify
        } else {
            StaffAction::None
        };
        let mut d = self
            .base_decision(message, role, keyword_hits)
            .should_reply(false, AiAction::None, Priority::Normal)
            .with_reason(format!(
                "record_only role '{}': message logged, AI reply suppressed",
                role.code
            ))
            .build();
        d.staff_action = staff_action;
        d
    }

    async fn decide_semi_auto(
        &self,
        message: &InboundMessage,
        role: &BusinessRole,
        keyword_hits: usize,
    ) -> CollaborationDecision {
        let window = self.config.staff_window_secs;
        let (activity, lookup_note) = match self
            .staff
            .has_staff_activity(&message.session_id, window)
            .await
        {
            Ok(activity) => (activity, None),
            // a decision row must exist for every message; degrade to the
            // no-staff branch and record the failure in the reason
            Err(e) => {
                let err = EngineError::external("staff_detector", e.to_string());
                warn!(
                    session = %message.session_id,
                    error = %err,
                    category = err.category(),
                    "staff presence lookup failed, assuming no staff"
                );
                (StaffActivity::none(), Some(err.to_string()))
            }
        };

        if !activity.has_staff {
            let mut reason = format!(
                "semi_auto role '{}': no staff activity within {window}s window, AI replies",
                role.code
            );
            if let Some(note) = lookup_note {
                reason.push_str(&format!(" (staff lookup failed: {note})"));
            }
            return self
                .base_decision(message, role, keyword_hits)
                .should_reply(true, AiAction::Reply, Priority::Normal)
                .with_staff_context(&activity)
                .with_reason(reason)
                .build();
        }

        let staff_label = activity
            .staff_user_id
            .clone()
            .unwrap_or_else(|| "unknown".into());
        let mode = role.reply_mode_when_staff_online;
        let builder = self
            .base_decision(message, role, keyword_hits)
            .with_staff_context(&activity);
        let mut decision = match mode {
            StaffOnlineReplyMode::Normal => builder
                .should_reply(true, AiAction::Reply, Priority::Normal)
                .with_reason(format!(
                    "semi_auto role '{}': staff {staff_label} present in {window}s window, replying normally",
                    role.code
                ))
                .build(),
            StaffOnlineReplyMode::LowPriority => builder
                .should_reply(true, AiAction::Reply, Priority::Low)
                .with_reason(format!(
                    "semi_auto role '{}': staff {staff_label} present, AI reply queued at low priority",
                    role.code
                ))
                .build(),
            StaffOnlineReplyMode::Delay { seconds } => {
                let mut d = builder
                    .should_reply(true, AiAction::DelayedReply, Priority::Normal)
                    .with_reason(format!(
                        "semi_auto role '{}': staff {staff_label} present, AI reply delayed {seconds}s",
                        role.code
                    ))
                    .build();
                d.delay_seconds = Some(seconds);
                d
            }
            StaffOnlineReplyMode::Skip => builder
                .should_reply(false, AiAction::None, Priority::Normal)
                .with_reason(format!(
                    "semi_auto role '{}': staff {staff_label} present in {window}s window, AI reply skipped",
                    role.code
                ))
                .build(),
        };
        decision.staff_action = StaffAction::Handle;
        decision.staff_id = activity.staff_user_id.clone();
        decision
    }

    async fn maybe_create_task(&self, role: &BusinessRole, decision: &CollaborationDecision) {
        if !role.enable_task_creation || decision.should_ai_reply {
            return;
        }
        let Some(tasks) = &self.tasks else {
            return;
        };
        let request = TaskRequest {
            session_id: decision.session_id.clone(),
            priority: role.default_task_priority,
            reason: decision.reason.clone(),
        };
        if let Err(e) = tasks.create_task(request).await {
            warn!(
                session = %decision.session_id,
                error = %e,
                "task creation failed; decision already persisted"
            );
        } else {
            debug!(session = %decision.session_id, "work item created for staff");
        }
    }

    fn base_decision(
        &self,
        message: &InboundMessage,
        role: &BusinessRole,
        keyword_hits: usize,
    ) -> DecisionBuilder {
        DecisionBuilder {
            decision: CollaborationDecision {
                session_id: message.session_id.clone(),
                message_id: message.message_id.clone(),
                robot_id: message.robot_id.clone(),
                should_ai_reply: false,
                ai_action: AiAction::None,
                staff_action: StaffAction::None,
                priority: Priority::Normal,
                reason: String::new(),
                business_role: role.code.clone(),
                staff_context: Value::Null,
                info_context: json!({ "keyword_hits": keyword_hits }),
                strategy: strategy_name(role),
                delay_seconds: None,
                staff_id: None,
                staff_name: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        }
    }
}

fn strategy_name(role: &BusinessRole) -> String {
    match role.ai_behavior {
        AiBehavior::FullAuto => "full_auto".into(),
        AiBehavior::RecordOnly => "record_only".into(),
        AiBehavior::SemiAuto => match role.reply_mode_when_staff_online {
            StaffOnlineReplyMode::Normal => "semi_auto/normal".into(),
            StaffOnlineReplyMode::LowPriority => "semi_auto/low_priority".into(),
            StaffOnlineReplyMode::Delay { .. } => "semi_auto/delay".into(),
            StaffOnlineReplyMode::Skip => "semi_auto/skip".into(),
        },
    }
}

struct DecisionBuilder {
    decision: CollaborationDecision,
}

impl DecisionBuilder {
    fn should_reply(mut self, should: bool, action: AiAction, priority: Priority) -> Self {
        self.decision.should_ai_reply = should;
        self.decision.ai_action = action;
        self.decision.priority = priority;
        self
    }

    fn with_reason(mut self, reason: String) -> Self {
        self.decision.reason = reason;
        self
    }

    fn with_staff_context(mut self, activity: &StaffActivity) -> Self {
        self.decision.staff_context = serde_json::to_value(activity).unwrap_or(Value::Null);
        self
    }

    fn build(self) -> CollaborationDecision {
        self.decision
    }
}
