//! Action results
//!
//! Every mediated action returns an `ActionResult`; failures always
//! carry an error code, its category, and the retriability flag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorCategory, ErrorCode};

/// Outcome of one executed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_consumed: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charged_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default)]
    pub retriable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
}

impl ActionResult {
    /// Successful result with a human message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            resources_consumed: None,
            charged_to: None,
            error_code: None,
            error_category: None,
            retriable: false,
            error_details: None,
        }
    }

    /// Successful result carrying structured data.
    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        let mut result = Self::ok(message);
        result.data = Some(data);
        result
    }

    /// Failed result; category and retriability derive from the code.
    pub fn fail(message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            resources_consumed: None,
            charged_to: None,
            error_code: Some(code),
            error_category: Some(code.category()),
            retriable: code.retriable(),
            error_details: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_charged_to(mut self, payer: impl Into<String>) -> Self {
        self.charged_to = Some(payer.into());
        self
    }

    pub fn with_resources(mut self, resources: BTreeMap<String, f64>) -> Self {
        if !resources.is_empty() {
            self.resources_consumed = Some(resources);
        }
        self
    }

    /// JSON representation used in the `action` log event and by
    /// sandboxed callers; failure fields are present only on failure.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_carries_category_and_retriability() {
        let result = ActionResult::fail("cannot afford", ErrorCode::InsufficientFunds);
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::InsufficientFunds));
        assert_eq!(result.error_category, Some(ErrorCategory::Resource));
        assert!(result.retriable);
    }

    #[test]
    fn success_omits_error_fields_in_json() {
        let json = ActionResult::ok("done").to_json();
        assert_eq!(json["success"], true);
        assert!(json.get("error_code").is_none());
        assert!(json.get("data").is_none());
    }
}
