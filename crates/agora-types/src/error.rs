//! Error codes surfaced on action results
//!
//! Codes are stable wire identifiers; categories group them for
//! dashboards and retriability drives caller backoff.

use serde::{Deserialize, Serialize};

/// Machine-readable failure code attached to a failed action result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    NotAuthorized,
    InsufficientFunds,
    QuotaExceeded,
    InvalidCode,
    InvalidArgument,
    InvalidChargeDirective,
    NotEnabled,
    InvalidSubmission,
    RuntimeError,
    InvalidAction,
    ModelNotAllowed,
    InsufficientBudget,
    RateLimited,
    LlmError,
    MissingParam,
    InvalidQueryType,
    InvalidType,
    Deleted,
    NotFoundInContent,
    NotUnique,
    NoChange,
}

/// Broad failure category for an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Resource,
    Permission,
    Validation,
    Execution,
}

impl ErrorCode {
    /// The category this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        use ErrorCode::*;
        match self {
            NotFound | Deleted | InsufficientFunds | QuotaExceeded | InsufficientBudget
            | RateLimited => ErrorCategory::Resource,
            NotAuthorized => ErrorCategory::Permission,
            InvalidCode | InvalidArgument | InvalidChargeDirective | NotEnabled
            | InvalidSubmission | InvalidAction | ModelNotAllowed | MissingParam
            | InvalidQueryType | InvalidType | NotFoundInContent | NotUnique | NoChange => {
                ErrorCategory::Validation
            }
            RuntimeError | LlmError => ErrorCategory::Execution,
        }
    }

    /// Whether a caller may legitimately retry after backoff.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::InsufficientFunds
                | ErrorCode::QuotaExceeded
                | ErrorCode::InvalidSubmission
                | ErrorCode::InvalidAction
        )
    }

    /// Stable wire name, as it appears in event logs.
    pub fn as_str(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            NotFound => "not_found",
            NotAuthorized => "not_authorized",
            InsufficientFunds => "insufficient_funds",
            QuotaExceeded => "quota_exceeded",
            InvalidCode => "invalid_code",
            InvalidArgument => "invalid_argument",
            InvalidChargeDirective => "invalid_charge_directive",
            NotEnabled => "not_enabled",
            InvalidSubmission => "invalid_submission",
            RuntimeError => "runtime_error",
            InvalidAction => "invalid_action",
            ModelNotAllowed => "model_not_allowed",
            InsufficientBudget => "insufficient_budget",
            RateLimited => "rate_limited",
            LlmError => "llm_error",
            MissingParam => "missing_param",
            InvalidQueryType => "invalid_query_type",
            InvalidType => "invalid_type",
            Deleted => "deleted",
            NotFoundInContent => "not_found_in_content",
            NotUnique => "not_unique",
            NoChange => "no_change",
        }
    }
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Resource => "resource",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Execution => "execution",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_codes_match_backoff_contract() {
        assert!(ErrorCode::InsufficientFunds.retriable());
        assert!(ErrorCode::QuotaExceeded.retriable());
        assert!(ErrorCode::InvalidSubmission.retriable());
        assert!(!ErrorCode::NotAuthorized.retriable());
        assert!(!ErrorCode::RuntimeError.retriable());
    }

    #[test]
    fn categories_partition_codes() {
        assert_eq!(ErrorCode::NotFound.category(), ErrorCategory::Resource);
        assert_eq!(
            ErrorCode::NotAuthorized.category(),
            ErrorCategory::Permission
        );
        assert_eq!(ErrorCode::InvalidCode.category(), ErrorCategory::Validation);
        assert_eq!(ErrorCode::LlmError.category(), ErrorCategory::Execution);
    }

    #[test]
    fn wire_names_are_snake_case() {
        let json = serde_json::to_string(&ErrorCode::InvalidChargeDirective).unwrap();
        assert_eq!(json, "\"invalid_charge_directive\"");
        assert_eq!(ErrorCode::InvalidChargeDirective.as_str(), "invalid_charge_directive");
    }
}
