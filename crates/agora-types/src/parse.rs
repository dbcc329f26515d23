//! JSON payload parsing into typed intents
//!
//! Agent-produced payloads are messy: aliased keys, parameters nested
//! under a `parameters` object, free-text query types. The parser
//! normalizes first, then validates per variant. Malformed payloads
//! return a descriptive rejection string the caller feeds back to the
//! agent; they never panic and never touch kernel state.

use serde_json::{Map, Value};

use crate::{ActionIntent, ActionKind, WriteSpec};

/// Query types the kernel query handler understands.
pub const KNOWN_QUERY_TYPES: &[&str] = &[
    "artifacts",
    "artifact",
    "principals",
    "principal",
    "balances",
    "resources",
    "quotas",
    "mint",
    "events",
    "frozen",
    "libraries",
    "dependencies",
];

fn coerce_int(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Bool(_)) => None,
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => {
            let text = s.trim();
            if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
                text.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

fn get_str<'a>(data: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn require_id(data: &Map<String, Value>, key: &str, action: &str) -> Result<String, String> {
    match get_str(data, key) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(format!("{action} requires '{key}' (string)")),
    }
}

/// Map a free-text query description onto a known query type plus
/// default params, so loose agent output still lands on a handler.
fn infer_query_type(query_text: &str, principal_id: &str) -> (String, Map<String, Value>) {
    let lowered = query_text.trim().to_lowercase();
    let mut params = Map::new();
    if KNOWN_QUERY_TYPES.contains(&lowered.as_str()) {
        return (lowered, params);
    }

    let has = |tokens: &[&str]| tokens.iter().any(|t| lowered.contains(t));

    if has(&["mint", "auction", "bid"]) {
        return ("mint".to_string(), params);
    }
    if has(&["event", "history", "log", "timeline", "status", "state", "time"]) {
        params.insert("limit".to_string(), Value::from(20));
        return ("events".to_string(), params);
    }
    if has(&["resource", "quota", "budget", "cpu", "token"]) {
        params.insert("principal_id".to_string(), Value::from(principal_id));
        return ("resources".to_string(), params);
    }
    if has(&["balance", "scrip", "currency"]) {
        params.insert("principal_id".to_string(), Value::from(principal_id));
        return ("balances".to_string(), params);
    }
    if lowered.contains("frozen") {
        return ("frozen".to_string(), params);
    }
    if lowered.contains("library") {
        params.insert("principal_id".to_string(), Value::from(principal_id));
        return ("libraries".to_string(), params);
    }
    if lowered.contains("depend") {
        params.insert("limit".to_string(), Value::from(50));
        return ("artifacts".to_string(), params);
    }
    if has(&["principal", "agent"]) {
        if lowered.contains("self") {
            params.insert("principal_id".to_string(), Value::from(principal_id));
            return ("principal".to_string(), params);
        }
        return ("principals".to_string(), params);
    }
    if lowered.contains("artifact") {
        params.insert("limit".to_string(), Value::from(50));
        return ("artifacts".to_string(), params);
    }
    params.insert("principal_id".to_string(), Value::from(principal_id));
    ("balances".to_string(), params)
}

/// Fold key aliases and the `parameters` envelope into a flat payload.
fn normalize_payload(principal_id: &str, payload: &Map<String, Value>) -> Map<String, Value> {
    let mut data = payload.clone();

    if let Some(Value::Object(parameters)) = payload.get("parameters") {
        for (key, value) in parameters {
            data.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    if !data.contains_key("query_type") {
        if let Some(qt) = get_str(&data, "queryType").map(str::to_string) {
            data.insert("query_type".to_string(), Value::from(qt));
        }
    }
    if !data.contains_key("recipient_id") {
        if let Some(r) = get_str(&data, "recipient").map(str::to_string) {
            data.insert("recipient_id".to_string(), Value::from(r));
        }
    }
    if !data.contains_key("method") {
        if let Some(m) = get_str(&data, "fn").map(str::to_string) {
            data.insert("method".to_string(), Value::from(m));
        }
    }

    let mut action_type = get_str(&data, "action_type")
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    if let Some(alias) = get_str(&data, "action") {
        let alias = alias.trim().to_lowercase();
        if !alias.is_empty() && (action_type.is_empty() || action_type == "noop") && alias != "noop"
        {
            action_type = alias.clone();
            data.insert("action_type".to_string(), Value::from(alias));
        }
    }

    if action_type == "query_kernel" {
        let mut params = match data.get("params") {
            Some(Value::Object(p)) => p.clone(),
            _ => Map::new(),
        };

        if let Some(Value::Object(parameters)) = payload.get("parameters") {
            if let Some(Value::Object(nested)) = parameters.get("params") {
                for (key, value) in nested {
                    params.insert(key.clone(), value.clone());
                }
            }
            for (key, value) in parameters {
                if key != "params" {
                    params.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        let mut query_type = get_str(&data, "query_type")
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        if let Some(qt) = &query_type {
            if !KNOWN_QUERY_TYPES.contains(&qt.as_str()) {
                let (inferred, inferred_params) = infer_query_type(qt, principal_id);
                query_type = Some(inferred);
                for (key, value) in inferred_params {
                    params.entry(key).or_insert(value);
                }
            }
        }

        if query_type.is_none() {
            let candidate = get_str(&data, "query")
                .or_else(|| match payload.get("parameters") {
                    Some(Value::Object(p)) => p.get("query").and_then(Value::as_str),
                    _ => None,
                })
                .map(str::to_string);
            if let Some(text) = candidate {
                let (inferred, inferred_params) = infer_query_type(&text, principal_id);
                query_type = Some(inferred);
                for (key, value) in inferred_params {
                    params.entry(key).or_insert(value);
                }
            } else {
                query_type = Some("balances".to_string());
                params
                    .entry("principal_id".to_string())
                    .or_insert_with(|| Value::from(principal_id));
            }
        }

        data.insert(
            "query_type".to_string(),
            Value::from(query_type.unwrap_or_default()),
        );
        data.insert("params".to_string(), Value::Object(params));
    }

    data
}

/// Parse an agent-produced JSON action payload into a typed intent.
///
/// Returns a human-readable rejection string on any malformation.
pub fn parse_intent(principal_id: &str, json_str: &str) -> Result<ActionIntent, String> {
    let parsed: Value =
        serde_json::from_str(json_str).map_err(|e| format!("Invalid JSON: {e}"))?;
    let Value::Object(payload) = parsed else {
        return Err("Action payload must be a JSON object".to_string());
    };

    let data = normalize_payload(principal_id, &payload);
    let action_type = get_str(&data, "action_type")
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    let reasoning = get_str(&data, "reasoning").unwrap_or_default().to_string();

    let kind = match action_type.as_str() {
        "noop" => ActionKind::Noop,

        "read_artifact" => ActionKind::ReadArtifact {
            artifact_id: require_id(&data, "artifact_id", "read_artifact")?,
        },

        "write_artifact" => {
            let artifact_id = require_id(&data, "artifact_id", "write_artifact")?;
            let artifact_type = get_str(&data, "artifact_type")
                .unwrap_or("generic")
                .to_string();
            let content = match data.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let executable = data
                .get("executable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let code = get_str(&data, "code").unwrap_or_default().to_string();
            if executable && code.is_empty() {
                return Err("write_artifact executable=true requires 'code'".to_string());
            }
            let read_price = coerce_int(data.get("read_price")).unwrap_or(0);
            let invoke_price = coerce_int(data.get("invoke_price"))
                .or_else(|| coerce_int(data.get("price")))
                .unwrap_or(0);
            let access_contract_id = match data.get("access_contract_id") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => return Err("access_contract_id must be a string or null".to_string()),
            };
            let metadata = match data.get("metadata") {
                None | Some(Value::Null) => None,
                Some(Value::Object(m)) => Some(m.clone()),
                Some(_) => return Err("metadata must be an object or null".to_string()),
            };
            let interface = match data.get("interface") {
                None | Some(Value::Null) => None,
                Some(Value::Object(m)) => Some(m.clone()),
                Some(_) => return Err("interface must be an object or null".to_string()),
            };
            let has_standing = data
                .get("has_standing")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let has_loop = data
                .get("has_loop")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let capabilities = match data.get("capabilities") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                Some(_) => return Err("capabilities must be a list".to_string()),
            };

            ActionKind::WriteArtifact(WriteSpec {
                artifact_id,
                artifact_type,
                content,
                executable,
                code,
                read_price,
                invoke_price,
                access_contract_id,
                metadata,
                interface,
                // A loop artifact is always a principal as well.
                has_standing: has_standing || has_loop,
                has_loop,
                capabilities,
            })
        }

        "edit_artifact" => {
            let artifact_id = require_id(&data, "artifact_id", "edit_artifact")?;
            let old_string = get_str(&data, "old_string")
                .ok_or_else(|| "edit_artifact requires 'old_string'".to_string())?
                .to_string();
            let new_string = get_str(&data, "new_string")
                .ok_or_else(|| "edit_artifact requires 'new_string'".to_string())?
                .to_string();
            if old_string == new_string {
                return Err("edit_artifact old_string and new_string must differ".to_string());
            }
            ActionKind::EditArtifact {
                artifact_id,
                old_string,
                new_string,
            }
        }

        "invoke_artifact" => {
            let artifact_id = require_id(&data, "artifact_id", "invoke_artifact")?;
            let method = match get_str(&data, "method") {
                Some(m) if !m.is_empty() => m.to_string(),
                _ => return Err("invoke_artifact requires 'method'".to_string()),
            };
            let args = match data.get("args") {
                None => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(_) => return Err("invoke_artifact 'args' must be a list".to_string()),
            };
            ActionKind::InvokeArtifact {
                artifact_id,
                method,
                args,
            }
        }

        "delete_artifact" => ActionKind::DeleteArtifact {
            artifact_id: require_id(&data, "artifact_id", "delete_artifact")?,
        },

        "query_kernel" => {
            let query_type = match get_str(&data, "query_type") {
                Some(q) if !q.is_empty() => q.to_string(),
                _ => return Err("query_kernel requires 'query_type'".to_string()),
            };
            let params = match data.get("params") {
                None => Map::new(),
                Some(Value::Object(p)) => p.clone(),
                Some(_) => return Err("query_kernel params must be an object".to_string()),
            };
            ActionKind::QueryKernel { query_type, params }
        }

        "subscribe_artifact" => ActionKind::SubscribeArtifact {
            artifact_id: require_id(&data, "artifact_id", "subscribe_artifact")?,
        },

        "unsubscribe_artifact" => ActionKind::UnsubscribeArtifact {
            artifact_id: require_id(&data, "artifact_id", "unsubscribe_artifact")?,
        },

        "transfer" => {
            let recipient_id = require_id(&data, "recipient_id", "transfer")?;
            let amount = coerce_int(data.get("amount"))
                .filter(|a| *a > 0)
                .ok_or_else(|| "transfer requires positive integer 'amount'".to_string())?;
            let memo = match data.get("memo") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => return Err("transfer memo must be string or null".to_string()),
            };
            ActionKind::Transfer {
                recipient_id,
                amount,
                memo,
            }
        }

        "mint" => {
            let recipient_id = require_id(&data, "recipient_id", "mint")?;
            let amount = coerce_int(data.get("amount"))
                .filter(|a| *a > 0)
                .ok_or_else(|| "mint requires positive integer 'amount'".to_string())?;
            let reason = match get_str(&data, "reason") {
                Some(r) if !r.is_empty() => r.to_string(),
                _ => return Err("mint requires 'reason'".to_string()),
            };
            ActionKind::Mint {
                recipient_id,
                amount,
                reason,
            }
        }

        "submit_to_mint" => {
            let artifact_id = require_id(&data, "artifact_id", "submit_to_mint")?;
            let bid = coerce_int(data.get("bid"))
                .filter(|b| *b > 0)
                .ok_or_else(|| "submit_to_mint requires positive integer 'bid'".to_string())?;
            ActionKind::SubmitToMint { artifact_id, bid }
        }

        "update_metadata" => {
            let artifact_id = require_id(&data, "artifact_id", "update_metadata")?;
            let key = match get_str(&data, "key") {
                Some(k) if !k.is_empty() => k.to_string(),
                _ => return Err("update_metadata requires 'key'".to_string()),
            };
            let value = data.get("value").cloned().unwrap_or(Value::Null);
            ActionKind::UpdateMetadata {
                artifact_id,
                key,
                value,
            }
        }

        other => {
            return Err(format!(
                "Unknown action_type: {other}. Valid actions: noop, read_artifact, \
                 write_artifact, edit_artifact, delete_artifact, invoke_artifact, \
                 query_kernel, subscribe_artifact, unsubscribe_artifact, transfer, \
                 mint, submit_to_mint, update_metadata"
            ))
        }
    };

    Ok(ActionIntent {
        principal_id: principal_id.to_string(),
        reasoning,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_json_with_message() {
        let err = parse_intent("alpha_1", "not json").unwrap_err();
        assert!(err.starts_with("Invalid JSON"));
    }

    #[test]
    fn rejects_non_object_payload() {
        let err = parse_intent("alpha_1", "[1, 2]").unwrap_err();
        assert!(err.contains("JSON object"));
    }

    #[test]
    fn parses_transfer_with_recipient_alias() {
        let intent = parse_intent(
            "alpha_1",
            r#"{"action_type": "transfer", "recipient": "alpha_2", "amount": "7"}"#,
        )
        .unwrap();
        match intent.kind {
            ActionKind::Transfer {
                recipient_id,
                amount,
                memo,
            } => {
                assert_eq!(recipient_id, "alpha_2");
                assert_eq!(amount, 7);
                assert!(memo.is_none());
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_amount_transfer() {
        let err = parse_intent(
            "alpha_1",
            r#"{"action_type": "transfer", "recipient_id": "alpha_2", "amount": 0}"#,
        )
        .unwrap_err();
        assert!(err.contains("positive integer"));
    }

    #[test]
    fn executable_write_requires_code() {
        let err = parse_intent(
            "alpha_1",
            r#"{"action_type": "write_artifact", "artifact_id": "a", "content": "x", "executable": true}"#,
        )
        .unwrap_err();
        assert!(err.contains("requires 'code'"));
    }

    #[test]
    fn edit_requires_differing_strings() {
        let err = parse_intent(
            "alpha_1",
            r#"{"action_type": "edit_artifact", "artifact_id": "a", "old_string": "x", "new_string": "x"}"#,
        )
        .unwrap_err();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn has_loop_implies_has_standing() {
        let intent = parse_intent(
            "alpha_1",
            r#"{"action_type": "write_artifact", "artifact_id": "a", "content": "", "has_loop": true}"#,
        )
        .unwrap();
        match intent.kind {
            ActionKind::WriteArtifact(spec) => {
                assert!(spec.has_loop);
                assert!(spec.has_standing);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn free_text_query_type_is_inferred() {
        let intent = parse_intent(
            "alpha_1",
            r#"{"action_type": "query_kernel", "query_type": "show me my scrip balance"}"#,
        )
        .unwrap();
        match intent.kind {
            ActionKind::QueryKernel { query_type, params } => {
                assert_eq!(query_type, "balances");
                assert_eq!(params["principal_id"], "alpha_1");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn action_alias_promotes_over_noop() {
        let intent = parse_intent(
            "alpha_1",
            r#"{"action": "read_artifact", "artifact_id": "doc_1"}"#,
        )
        .unwrap();
        assert!(matches!(intent.kind, ActionKind::ReadArtifact { .. }));
    }

    #[test]
    fn parameters_envelope_is_flattened() {
        let intent = parse_intent(
            "alpha_1",
            r#"{"action_type": "read_artifact", "parameters": {"artifact_id": "doc_1"}}"#,
        )
        .unwrap();
        match intent.kind {
            ActionKind::ReadArtifact { artifact_id } => assert_eq!(artifact_id, "doc_1"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_lists_valid_ones() {
        let err = parse_intent("alpha_1", r#"{"action_type": "explode"}"#).unwrap_err();
        assert!(err.contains("Unknown action_type"));
        assert!(err.contains("submit_to_mint"));
    }
}
