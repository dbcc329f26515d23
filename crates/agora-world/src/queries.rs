//! Read-only kernel queries
//!
//! Queries never mutate economic state (the rate windows they report on
//! decay with time, which is why `run_query` takes `&mut self`). Every
//! handler returns a JSON payload shaped for agent consumption; missing
//! parameters and unknown targets fail with distinct codes.

use serde_json::{json, Map, Value};

use agora_types::ErrorCode;

use crate::World;

const CODE_PREVIEW_CHARS: usize = 220;

/// A failed query: the code drives the action result, the message is
/// surfaced verbatim.
#[derive(Debug, Clone)]
pub struct QueryError {
    pub code: ErrorCode,
    pub message: String,
}

impl QueryError {
    fn missing(param: &str) -> Self {
        Self {
            code: ErrorCode::MissingParam,
            message: format!("'{param}' parameter is required"),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: message.into(),
        }
    }
}

fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn usize_param(params: &Map<String, Value>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(default)
}

impl World {
    pub fn run_query(
        &mut self,
        query_type: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, QueryError> {
        match query_type {
            "artifacts" => Ok(self.query_artifacts(params)),
            "artifact" => self.query_artifact(params),
            "principals" => Ok(self.query_principals(params)),
            "principal" => self.query_principal(params),
            "balances" => self.query_balances(params),
            "resources" => self.query_resources(params),
            "quotas" => self.query_quotas(params),
            "mint" => Ok(self.query_mint(params)),
            "events" => Ok(json!({
                "query_type": "events",
                "events": self.log.read_recent(usize_param(params, "limit", 50)),
            })),
            "frozen" => Ok(self.query_frozen(params)),
            "libraries" => self.query_libraries(params),
            "dependencies" => self.query_dependencies(params),
            other => Err(QueryError {
                code: ErrorCode::InvalidQueryType,
                message: format!("unknown query type '{other}'"),
            }),
        }
    }

    fn query_artifacts(&self, params: &Map<String, Value>) -> Value {
        let owner = str_param(params, "owner");
        let artifact_type = str_param(params, "type");
        let executable = params.get("executable").and_then(Value::as_bool);
        let limit = usize_param(params, "limit", 50);
        let offset = usize_param(params, "offset", 0);

        let matches: Vec<_> = self
            .store
            .iter()
            .filter(|a| !a.deleted)
            .filter(|a| owner.map_or(true, |o| a.owner == o))
            .filter(|a| artifact_type.map_or(true, |t| a.artifact_type == t))
            .filter(|a| executable.map_or(true, |e| a.executable == e))
            .collect();
        let total = matches.len();
        let results: Vec<Value> = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|a| {
                json!({
                    "id": a.id,
                    "type": a.artifact_type,
                    "owner": a.owner,
                    "created_by": a.created_by,
                    "executable": a.executable,
                    "content_size": a.content.len(),
                    "code_preview": a.code.chars().take(CODE_PREVIEW_CHARS).collect::<String>(),
                })
            })
            .collect();
        json!({
            "query_type": "artifacts",
            "total": total,
            "returned": results.len(),
            "results": results,
        })
    }

    fn query_artifact(&self, params: &Map<String, Value>) -> Result<Value, QueryError> {
        let artifact_id =
            str_param(params, "artifact_id").ok_or_else(|| QueryError::missing("artifact_id"))?;
        let artifact = self
            .store
            .get(artifact_id)
            .filter(|a| !a.deleted)
            .ok_or_else(|| QueryError::not_found(format!("artifact '{artifact_id}' not found")))?;
        Ok(json!({ "query_type": "artifact", "artifact": artifact.to_json(false) }))
    }

    fn query_principals(&self, params: &Map<String, Value>) -> Value {
        let limit = usize_param(params, "limit", 100);
        let principals: Vec<String> = self.principal_ids().into_iter().take(limit).collect();
        json!({
            "query_type": "principals",
            "count": principals.len(),
            "principals": principals,
        })
    }

    fn query_principal(&self, params: &Map<String, Value>) -> Result<Value, QueryError> {
        let principal_id =
            str_param(params, "principal_id").ok_or_else(|| QueryError::missing("principal_id"))?;
        Ok(json!({
            "query_type": "principal",
            "principal_id": principal_id,
            "exists": self.ledger.principal_exists(principal_id),
            "scrip": self.ledger.scrip(principal_id),
            "resources": self.ledger.all_resources(principal_id),
        }))
    }

    fn query_balances(&self, params: &Map<String, Value>) -> Result<Value, QueryError> {
        if let Some(principal_id) = str_param(params, "principal_id") {
            if !self.ledger.principal_exists(principal_id) {
                return Err(QueryError::not_found(format!(
                    "principal '{principal_id}' not found"
                )));
            }
            return Ok(json!({
                "query_type": "balances",
                "principal_id": principal_id,
                "scrip": self.ledger.scrip(principal_id),
            }));
        }
        Ok(json!({ "query_type": "balances", "balances": self.ledger.all_balances() }))
    }

    fn query_resources(&mut self, params: &Map<String, Value>) -> Result<Value, QueryError> {
        let principal_id = str_param(params, "principal_id")
            .ok_or_else(|| QueryError::missing("principal_id"))?
            .to_string();
        let data = json!({
            "llm_budget": self.ledger.llm_budget(&principal_id),
            "disk_used": self.store.owner_usage(&principal_id),
            "cpu_seconds_remaining": self.ledger.resource_remaining(&principal_id, "cpu_seconds"),
            "llm_calls_remaining": self.ledger.resource_remaining(&principal_id, "llm_calls"),
            "llm_tokens_remaining": self.ledger.resource_remaining(&principal_id, "llm_tokens"),
        });
        if let Some(resource) = str_param(params, "resource") {
            let Some(value) = data.get(resource) else {
                return Err(QueryError::not_found(format!(
                    "unknown resource '{resource}'"
                )));
            };
            return Ok(json!({
                "query_type": "resources",
                "principal_id": principal_id,
                "resource": resource,
                "data": value,
            }));
        }
        Ok(json!({
            "query_type": "resources",
            "principal_id": principal_id,
            "resources": data,
        }))
    }

    fn query_quotas(&mut self, params: &Map<String, Value>) -> Result<Value, QueryError> {
        let principal_id = str_param(params, "principal_id")
            .ok_or_else(|| QueryError::missing("principal_id"))?
            .to_string();
        let quotas = self.principal_quotas(&principal_id);
        if let Some(resource) = str_param(params, "resource") {
            let Some(value) = quotas.get(resource) else {
                return Err(QueryError::not_found(format!(
                    "unknown quota resource '{resource}'"
                )));
            };
            return Ok(json!({
                "query_type": "quotas",
                "principal_id": principal_id,
                "resource": resource,
                "data": value,
            }));
        }
        Ok(json!({
            "query_type": "quotas",
            "principal_id": principal_id,
            "quotas": quotas,
        }))
    }

    fn query_mint(&self, params: &Map<String, Value>) -> Value {
        let limit = usize_param(params, "limit", 10);
        match self.mint.as_ref() {
            Some(mint) => json!({
                "query_type": "mint",
                "status": mint.status(),
                "submissions": mint.submissions(),
                "history": mint.history(limit),
            }),
            None => json!({
                "query_type": "mint",
                "status": { "phase": "disabled" },
                "submissions": [],
                "history": [],
            }),
        }
    }

    fn query_frozen(&self, params: &Map<String, Value>) -> Value {
        if let Some(agent_id) = str_param(params, "agent_id") {
            return json!({
                "query_type": "frozen",
                "agent_id": agent_id,
                "frozen": self.is_frozen(agent_id),
            });
        }
        json!({ "query_type": "frozen", "frozen_agents": self.frozen_agents() })
    }

    fn query_libraries(&self, params: &Map<String, Value>) -> Result<Value, QueryError> {
        let principal_id =
            str_param(params, "principal_id").ok_or_else(|| QueryError::missing("principal_id"))?;
        Ok(json!({
            "query_type": "libraries",
            "principal_id": principal_id,
            "installed_libraries": self.installed_libraries(principal_id),
        }))
    }

    fn query_dependencies(&self, params: &Map<String, Value>) -> Result<Value, QueryError> {
        let artifact_id =
            str_param(params, "artifact_id").ok_or_else(|| QueryError::missing("artifact_id"))?;
        let artifact = self
            .store
            .get(artifact_id)
            .filter(|a| !a.deleted)
            .ok_or_else(|| QueryError::not_found(format!("artifact '{artifact_id}' not found")))?;
        let dependents: Vec<String> = self
            .store
            .iter()
            .filter(|a| !a.deleted && a.depends_on.iter().any(|d| d == artifact_id))
            .map(|a| a.id.clone())
            .collect();
        Ok(json!({
            "query_type": "dependencies",
            "artifact_id": artifact_id,
            "depends_on": artifact.depends_on,
            "dependents": dependents,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::world;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn artifacts_query_filters_and_pages() {
        let mut w = world();
        let all = w.run_query("artifacts", &Map::new()).unwrap();
        // 3 profiles + 3 loops + 4 kernel services
        assert_eq!(all["total"], 10);

        let loops = w
            .run_query("artifacts", &params(json!({ "type": "agent_loop" })))
            .unwrap();
        assert_eq!(loops["total"], 3);
        assert_eq!(loops["results"][0]["id"], "alpha_1_loop");
        assert!(loops["results"][0].get("code").is_none());
        assert!(
            loops["results"][0]["code_preview"]
                .as_str()
                .is_some_and(|p| p.len() <= CODE_PREVIEW_CHARS)
        );

        let paged = w
            .run_query("artifacts", &params(json!({ "limit": 2, "offset": 9 })))
            .unwrap();
        assert_eq!(paged["returned"], 1);
    }

    #[test]
    fn artifact_query_requires_an_id() {
        let mut w = world();
        let err = w.run_query("artifact", &Map::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingParam);

        let err = w
            .run_query("artifact", &params(json!({ "artifact_id": "ghost" })))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let found = w
            .run_query("artifact", &params(json!({ "artifact_id": "alpha_1" })))
            .unwrap();
        assert_eq!(found["artifact"]["type"], "agent_profile");
    }

    #[test]
    fn balances_and_principal_queries_report_scrip() {
        let mut w = world();
        let all = w.run_query("balances", &Map::new()).unwrap();
        assert_eq!(all["balances"]["alpha_2"], 100);

        let one = w
            .run_query("balances", &params(json!({ "principal_id": "alpha_1" })))
            .unwrap();
        assert_eq!(one["scrip"], 100);

        let err = w
            .run_query("balances", &params(json!({ "principal_id": "ghost" })))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let principal = w
            .run_query("principal", &params(json!({ "principal_id": "alpha_1" })))
            .unwrap();
        assert_eq!(principal["exists"], true);
        assert_eq!(principal["scrip"], 100);
    }

    #[test]
    fn resources_query_supports_a_single_key() {
        let mut w = world();
        let all = w
            .run_query("resources", &params(json!({ "principal_id": "alpha_1" })))
            .unwrap();
        assert_eq!(all["resources"]["llm_budget"], 2.0);
        assert_eq!(all["resources"]["cpu_seconds_remaining"], 12.0);

        let one = w.run_query(
            "resources",
            &params(json!({ "principal_id": "alpha_1", "resource": "llm_budget" })),
        );
        assert_eq!(one.unwrap()["data"], 2.0);

        let err = w.run_query(
            "resources",
            &params(json!({ "principal_id": "alpha_1", "resource": "mana" })),
        );
        assert_eq!(err.unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn mint_query_reports_the_phase() {
        let mut w = world();
        let mint = w.run_query("mint", &Map::new()).unwrap();
        assert_eq!(mint["status"]["phase"], "waiting_first_auction");
        assert_eq!(mint["submissions"].as_array().map(Vec::len), Some(0));

        w.mint = None;
        let mint = w.run_query("mint", &Map::new()).unwrap();
        assert_eq!(mint["status"]["phase"], "disabled");
    }

    #[test]
    fn frozen_query_answers_both_forms() {
        let mut w = world();
        w.freeze_agent("alpha_2");
        let one = w
            .run_query("frozen", &params(json!({ "agent_id": "alpha_2" })))
            .unwrap();
        assert_eq!(one["frozen"], true);
        let all = w.run_query("frozen", &Map::new()).unwrap();
        assert_eq!(all["frozen_agents"], json!(["alpha_2"]));
    }

    #[test]
    fn dependencies_query_finds_dependents() {
        let mut w = world();
        w.store
            .write(
                "lib_base",
                "alpha_1",
                agora_store::WriteRequest {
                    artifact_type: "library".to_string(),
                    content: "base".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        w.store
            .write(
                "app_top",
                "alpha_1",
                agora_store::WriteRequest {
                    artifact_type: "service".to_string(),
                    content: "top".to_string(),
                    depends_on: Some(vec!["lib_base".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();

        let deps = w
            .run_query("dependencies", &params(json!({ "artifact_id": "lib_base" })))
            .unwrap();
        assert_eq!(deps["dependents"], json!(["app_top"]));
    }

    #[test]
    fn unknown_query_type_is_rejected() {
        let mut w = world();
        let err = w.run_query("gossip", &Map::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidQueryType);
    }
}
