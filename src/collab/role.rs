//! Business role configuration and resolution.
//!
//! A business role governs how automated-vs-human reply is arbitrated for a
//! category of conversation. Roles are administrative configuration; the
//! engine only reads them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Reply priority attached to decisions and created tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// How the AI responder behaves under a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiBehavior {
    /// AI always replies, regardless of staff presence
    FullAuto,
    /// AI replies unless staff is actively handling the session
    SemiAuto,
    /// AI never replies; messages are still logged
    RecordOnly,
}

/// What a semi-auto role does when staff is online in the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StaffOnlineReplyMode {
    /// Reply as usual
    #[default]
    Normal,
    /// Reply, but queued at low priority
    LowPriority,
    /// Reply after a fixed delay, giving staff a head start
    Delay { seconds: u64 },
    /// Do not reply at all
    Skip,
}

/// Configuration governing arbitration for one category of conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRole {
    /// Unique role code, e.g. `"after_sales"`
    pub code: String,
    pub name: String,
    pub ai_behavior: AiBehavior,
    #[serde(default)]
    pub staff_enabled: bool,
    #[serde(default)]
    pub staff_type_filter: Vec<String>,
    /// Keywords used for best-match role resolution
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub reply_mode_when_staff_online: StaffOnlineReplyMode,
    #[serde(default)]
    pub enable_task_creation: bool,
    #[serde(default)]
    pub default_task_priority: Priority,
}

impl BusinessRole {
    /// The fallback role applied when nothing is configured for a robot and
    /// no keywords match.
    pub fn default_role() -> Self {
        Self {
            code: "default".into(),
            name: "Default".into(),
            ai_behavior: AiBehavior::SemiAuto,
            staff_enabled: true,
            staff_type_filter: Vec::new(),
            keywords: Vec::new(),
            reply_mode_when_staff_online: StaffOnlineReplyMode::Normal,
            enable_task_creation: false,
            default_task_priority: Priority::Normal,
        }
    }

    /// Number of keywords of this role appearing in `text`.
    pub fn keyword_hits(&self, text: &str) -> usize {
        self.keywords.iter().filter(|k| text.contains(k.as_str())).count()
    }
}

/// Registry of business roles plus explicit robot-to-role bindings.
///
/// Resolution order: explicit binding first, then best keyword match, then
/// the default role.
#[derive(Default)]
pub struct BusinessRoleRegistry {
    roles: DashMap<String, BusinessRole>,
    /// robot_id -> role code
    bindings: DashMap<String, String>,
}

impl BusinessRoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, role: BusinessRole) {
        self.roles.insert(role.code.clone(), role);
    }

    pub fn get(&self, code: &str) -> Option<BusinessRole> {
        self.roles.get(code).map(|r| r.value().clone())
    }

    /// Binds a robot to a role explicitly; explicit config always wins over
    /// keyword matching.
    pub fn bind_robot(&self, robot_id: impl Into<String>, role_code: impl Into<String>) {
        self.bindings.insert(robot_id.into(), role_code.into());
    }

    /// Resolves the role for a message: explicit binding, else the role with
    /// the most keyword hits in the text, else the default role.
    pub fn resolve(&self, robot_id: &str, text: &str) -> BusinessRole {
        if let Some(code) = self.bindings.get(robot_id) {
            if let Some(role) = self.get(code.value()) {
                return role;
            }
        }
        self.roles
            .iter()
            .map(|r| (r.value().keyword_hits(text), r.value().clone()))
            .filter(|(hits, _)| *hits > 0)
            .max_by_key(|(hits, _)| *hits)
            .map(|(_, role)| role)
            .unwrap_or_else(BusinessRole::default_role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(code: &str, keywords: &[&str]) -> BusinessRole {
        BusinessRole {
            code: code.into(),
            name: code.into(),
            ai_behavior: AiBehavior::SemiAuto,
            staff_enabled: true,
            staff_type_filter: vec![],
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            reply_mode_when_staff_online: StaffOnlineReplyMode::Normal,
            enable_task_creation: false,
            default_task_priority: Priority::Normal,
        }
    }

    #[test]
    fn test_explicit_binding_wins_over_keywords() {
        let registry = BusinessRoleRegistry::new();
        registry.register(role("sales", &["refund"]));
        registry.register(role("support", &["help"]));
        registry.bind_robot("bot_1", "support");

        let resolved = registry.resolve("bot_1", "I want a refund");
        assert_eq!(resolved.code, "support");
    }

    #[test]
    fn test_best_keyword_match_wins() {
        let registry = BusinessRoleRegistry::new();
        registry.register(role("sales", &["refund"]));
        registry.register(role("after_sales", &["refund", "broken"]));

        let resolved = registry.resolve("bot_2", "my refund for the broken item");
        assert_eq!(resolved.code, "after_sales");
    }

    #[test]
    fn test_falls_back_to_default_role() {
        let registry = BusinessRoleRegistry::new();
        registry.register(role("sales", &["refund"]));

        let resolved = registry.resolve("bot_2", "hello there");
        assert_eq!(resolved.code, "default");
        assert_eq!(resolved.ai_behavior, AiBehavior::SemiAuto);
    }
}
