//! Action intents - the closed set of mediated kernel actions
//!
//! One sum type with a variant per action, each carrying only the
//! fields that action needs. The common envelope (acting principal and
//! free-text reasoning) lives on `ActionIntent`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields of a `write_artifact` action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteSpec {
    pub artifact_id: String,
    pub artifact_type: String,
    pub content: String,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub read_price: i64,
    #[serde(default)]
    pub invoke_price: i64,
    #[serde(default)]
    pub access_contract_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub interface: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub has_standing: bool,
    #[serde(default)]
    pub has_loop: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// The per-action payload of an intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionKind {
    Noop,
    ReadArtifact {
        artifact_id: String,
    },
    WriteArtifact(WriteSpec),
    EditArtifact {
        artifact_id: String,
        old_string: String,
        new_string: String,
    },
    DeleteArtifact {
        artifact_id: String,
    },
    InvokeArtifact {
        artifact_id: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    QueryKernel {
        query_type: String,
        #[serde(default)]
        params: serde_json::Map<String, Value>,
    },
    SubscribeArtifact {
        artifact_id: String,
    },
    UnsubscribeArtifact {
        artifact_id: String,
    },
    Transfer {
        recipient_id: String,
        amount: i64,
        #[serde(default)]
        memo: Option<String>,
    },
    Mint {
        recipient_id: String,
        amount: i64,
        reason: String,
    },
    SubmitToMint {
        artifact_id: String,
        bid: i64,
    },
    UpdateMetadata {
        artifact_id: String,
        key: String,
        value: Value,
    },
}

impl ActionKind {
    /// Stable wire name of the action, as logged in events.
    pub fn action_type(&self) -> &'static str {
        match self {
            ActionKind::Noop => "noop",
            ActionKind::ReadArtifact { .. } => "read_artifact",
            ActionKind::WriteArtifact(_) => "write_artifact",
            ActionKind::EditArtifact { .. } => "edit_artifact",
            ActionKind::DeleteArtifact { .. } => "delete_artifact",
            ActionKind::InvokeArtifact { .. } => "invoke_artifact",
            ActionKind::QueryKernel { .. } => "query_kernel",
            ActionKind::SubscribeArtifact { .. } => "subscribe_artifact",
            ActionKind::UnsubscribeArtifact { .. } => "unsubscribe_artifact",
            ActionKind::Transfer { .. } => "transfer",
            ActionKind::Mint { .. } => "mint",
            ActionKind::SubmitToMint { .. } => "submit_to_mint",
            ActionKind::UpdateMetadata { .. } => "update_metadata",
        }
    }
}

/// A typed action intent: envelope plus per-action payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionIntent {
    pub principal_id: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl ActionIntent {
    pub fn new(principal_id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            principal_id: principal_id.into(),
            reasoning: String::new(),
            kind,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Flat JSON representation used in the `action` log event.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_serializes_with_flat_action_type() {
        let intent = ActionIntent::new(
            "alpha_1",
            ActionKind::Transfer {
                recipient_id: "alpha_2".to_string(),
                amount: 5,
                memo: Some("rent".to_string()),
            },
        )
        .with_reasoning("pay rent");

        let json = intent.to_json();
        assert_eq!(json["action_type"], "transfer");
        assert_eq!(json["principal_id"], "alpha_1");
        assert_eq!(json["recipient_id"], "alpha_2");
        assert_eq!(json["amount"], 5);
        assert_eq!(json["reasoning"], "pay rent");
    }

    #[test]
    fn noop_round_trips() {
        let intent = ActionIntent::new("alpha_1", ActionKind::Noop);
        let json = intent.to_json();
        let back: ActionIntent = serde_json::from_value(json).unwrap();
        assert!(matches!(back.kind, ActionKind::Noop));
    }
}
