//! Permission results returned by access contracts

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The action being checked against an artifact's access contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Read,
    Write,
    Edit,
    Invoke,
    Delete,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionAction::Read => "read",
            PermissionAction::Write => "write",
            PermissionAction::Edit => "edit",
            PermissionAction::Invoke => "invoke",
            PermissionAction::Delete => "delete",
        }
    }

    /// Lenient parse; unknown strings fall back to `Read`, the least
    /// privileged check.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "write" => PermissionAction::Write,
            "edit" => PermissionAction::Edit,
            "invoke" => PermissionAction::Invoke,
            "delete" => PermissionAction::Delete,
            _ => PermissionAction::Read,
        }
    }
}

/// Decision from a contract evaluation.
///
/// `state_updates` is the only write path into an artifact's
/// `auth_state`; the engine merges it after an allowed check so
/// contracts can carry state (e.g. a rotating writer) across calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResult {
    pub allowed: bool,
    pub reason: String,
    #[serde(default)]
    pub scrip_cost: i64,
    #[serde(default)]
    pub scrip_payer: Option<String>,
    #[serde(default)]
    pub scrip_recipient: Option<String>,
    #[serde(default)]
    pub resource_payer: Option<String>,
    #[serde(default)]
    pub state_updates: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub conditions: Option<serde_json::Map<String, Value>>,
}

impl PermissionResult {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            scrip_cost: 0,
            scrip_payer: None,
            scrip_recipient: None,
            resource_payer: None,
            state_updates: None,
            conditions: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            ..Self::allow(reason)
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.scrip_recipient = Some(recipient.into());
        self
    }
}
