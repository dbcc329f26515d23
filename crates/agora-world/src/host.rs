//! Host functions injected into sandboxed artifact code
//!
//! Everything a running artifact can see or do goes through this one
//! surface, bound to the invoking caller for the duration of the run.
//! Economic denials come back as `{"success": false, ...}` values so
//! scripts can recover; only malformed calls are hard errors.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use agora_sandbox::{HostEnv, ScriptValue};

use crate::World;

const HOST_FNS: &[&str] = &[
    "pay",
    "get_balance",
    "invoke",
    "read_artifact",
    "list_artifacts",
    "get_resources",
    "recent_events",
    "now_seconds",
    "llm_complete",
];

pub(crate) struct InvokeHost<'a> {
    world: &'a mut World,
    caller_id: String,
    artifact_id: String,
    depth: u32,
    can_call_llm: bool,
}

impl<'a> InvokeHost<'a> {
    pub fn new(
        world: &'a mut World,
        caller_id: &str,
        artifact_id: &str,
        depth: u32,
        can_call_llm: bool,
    ) -> Self {
        Self {
            world,
            caller_id: caller_id.to_string(),
            artifact_id: artifact_id.to_string(),
            depth,
            can_call_llm,
        }
    }

    fn pay(&mut self, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        let target = str_arg(args, 0, "pay")?;
        let amount = int_arg(args, 1, "pay")?;
        if amount <= 0 {
            return Ok(denial("amount must be positive", "invalid_argument"));
        }
        if !self.world.ledger.principal_exists(&target) {
            return Ok(denial(
                &format!("recipient '{target}' is not a principal"),
                "not_found",
            ));
        }
        if !self.world.ledger.transfer(&self.caller_id, &target, amount) {
            return Ok(denial("insufficient funds", "insufficient_funds"));
        }
        let event = json!({
            "event_number": self.world.event_number,
            "sender": self.caller_id,
            "recipient": target,
            "amount": amount,
            "memo": format!("paid from artifact {}", self.artifact_id),
        });
        self.world.log.log("transfer", crate::obj(event));
        Ok(from_json(&json!({ "success": true, "amount": amount })))
    }

    fn invoke(&mut self, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        let target = str_arg(args, 0, "invoke")?;
        if self.depth + 1 > self.world.max_invoke_depth {
            return Ok(denial(
                &format!("max invoke depth {} exceeded", self.world.max_invoke_depth),
                "runtime_error",
            ));
        }
        let rest: Vec<Value> = args[1..].iter().map(ScriptValue::to_json).collect();
        let payload = self.world.invoke_from_executor(
            &self.caller_id,
            &target,
            "run",
            &rest,
            self.depth + 1,
        );
        Ok(from_json(&payload))
    }

    fn read_artifact(&mut self, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        let artifact_id = str_arg(args, 0, "read_artifact")?;
        let result = self.world.execute_action_data(
            &self.caller_id,
            &json!({ "action_type": "read_artifact", "artifact_id": artifact_id }),
            false,
        );
        let content = result
            .data
            .as_ref()
            .and_then(|d| d.get("artifact"))
            .and_then(|a| a.get("content"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(from_json(&content))
    }

    fn list_artifacts(&mut self, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        let limit = match args.first() {
            Some(ScriptValue::Int(n)) if *n > 0 => json!(n),
            _ => json!(50),
        };
        let params = crate::obj(json!({ "limit": limit }));
        let results = self
            .world
            .run_query("artifacts", &params)
            .map(|payload| payload["results"].clone())
            .unwrap_or_else(|_| json!([]));
        Ok(from_json(&results))
    }

    fn get_resources(&mut self) -> ScriptValue {
        let caller = self.caller_id.clone();
        from_json(&json!({
            "llm_budget": self.world.ledger.llm_budget(&caller),
            "disk_quota": self.world.disk_quota(&caller),
            "disk_used": self.world.store.owner_usage(&caller),
            "disk_available": self.world.available_disk(&caller),
            "llm_calls_remaining": self.world.ledger.resource_remaining(&caller, "llm_calls"),
            "llm_tokens_remaining": self.world.ledger.resource_remaining(&caller, "llm_tokens"),
            "cpu_seconds_remaining": self.world.ledger.resource_remaining(&caller, "cpu_seconds"),
        }))
    }

    fn recent_events(&mut self, args: &[ScriptValue]) -> ScriptValue {
        let limit = match args.first() {
            Some(ScriptValue::Int(n)) if *n > 0 => *n as usize,
            _ => 20,
        };
        from_json(&Value::Array(self.world.log.read_recent(limit)))
    }

    fn llm_complete(&mut self, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        if !self.can_call_llm {
            return Ok(denial("missing can_call_llm capability", "not_authorized"));
        }
        let model = str_arg(args, 0, "llm_complete")?;
        let messages = match args.get(1) {
            Some(ScriptValue::List(items)) => {
                items.iter().map(ScriptValue::to_json).collect::<Vec<_>>()
            }
            _ => return Err("llm_complete expects (model, messages)".to_string()),
        };
        let caller = self.caller_id.clone();
        let payload = self.world.call_llm_as_syscall(&caller, &model, &messages);
        Ok(from_json(&payload))
    }
}

impl HostEnv for InvokeHost<'_> {
    fn provides(&self, name: &str) -> bool {
        HOST_FNS.contains(&name)
    }

    fn call(&mut self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        match name {
            "pay" => self.pay(args),
            "get_balance" => Ok(ScriptValue::Int(self.world.ledger.scrip(&self.caller_id))),
            "invoke" => self.invoke(args),
            "read_artifact" => self.read_artifact(args),
            "list_artifacts" => self.list_artifacts(args),
            "get_resources" => Ok(self.get_resources()),
            "recent_events" => Ok(self.recent_events(args)),
            "now_seconds" => Ok(ScriptValue::Float(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0),
            )),
            "llm_complete" => self.llm_complete(args),
            other => Err(format!("unknown host function '{other}'")),
        }
    }
}

fn from_json(value: &Value) -> ScriptValue {
    ScriptValue::from_json(value)
}

fn denial(error: &str, code: &str) -> ScriptValue {
    from_json(&json!({ "success": false, "error": error, "error_code": code }))
}

fn str_arg(args: &[ScriptValue], idx: usize, fn_name: &str) -> Result<String, String> {
    match args.get(idx) {
        Some(ScriptValue::Str(s)) => Ok(s.clone()),
        _ => Err(format!("{fn_name} expects a string at position {idx}")),
    }
}

fn int_arg(args: &[ScriptValue], idx: usize, fn_name: &str) -> Result<i64, String> {
    match args.get(idx) {
        Some(ScriptValue::Int(n)) => Ok(*n),
        Some(ScriptValue::Float(f)) => Ok(*f as i64),
        _ => Err(format!("{fn_name} expects a number at position {idx}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::world;
    use serde_json::json;

    fn write_service(w: &mut crate::World, owner: &str, id: &str, code: &str) {
        let result = w.execute_action_data(
            owner,
            &json!({
                "action_type": "write_artifact",
                "artifact_id": id,
                "artifact_type": "service",
                "content": "svc",
                "executable": true,
                "code": code,
            }),
            true,
        );
        assert!(result.success, "{}", result.message);
    }

    fn invoke(w: &mut crate::World, caller: &str, id: &str) -> agora_types::ActionResult {
        w.execute_action_data(
            caller,
            &json!({ "action_type": "invoke_artifact", "artifact_id": id, "method": "run" }),
            true,
        )
    }

    #[test]
    fn scripts_can_pay_and_check_balances() {
        let mut w = world();
        write_service(
            &mut w,
            "alpha_1",
            "alpha_1_payer",
            r#"fn run() { pay("alpha_2", 10); return get_balance(); }"#,
        );
        let result = invoke(&mut w, "alpha_1", "alpha_1_payer");
        assert!(result.success, "{}", result.message);
        assert_eq!(result.data.unwrap()["result"], 90);
        assert_eq!(w.ledger.scrip("alpha_2"), 110);
    }

    #[test]
    fn overdraft_is_a_soft_denial_not_a_crash() {
        let mut w = world();
        write_service(
            &mut w,
            "alpha_1",
            "alpha_1_spender",
            r#"fn run() { return pay("alpha_2", 100000); }"#,
        );
        let result = invoke(&mut w, "alpha_1", "alpha_1_spender");
        assert!(result.success);
        let payload = result.data.unwrap()["result"].clone();
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error_code"], "insufficient_funds");
    }

    #[test]
    fn nested_invokes_respect_the_depth_limit() {
        let mut w = world();
        write_service(
            &mut w,
            "alpha_1",
            "alpha_1_rec",
            r#"fn run() { return invoke("alpha_1_rec"); }"#,
        );
        let result = invoke(&mut w, "alpha_1", "alpha_1_rec");
        assert!(result.success, "{}", result.message);
        let text = result.data.unwrap()["result"].to_string();
        assert!(text.contains("max invoke depth"), "{text}");
    }

    #[test]
    fn read_artifact_returns_content_or_null() {
        let mut w = world();
        w.execute_action_data(
            "alpha_2",
            &json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_2_note",
                "artifact_type": "note",
                "content": "hello from alpha_2",
            }),
            true,
        );
        write_service(
            &mut w,
            "alpha_1",
            "alpha_1_reader",
            r#"fn run() {
                let found = read_artifact("alpha_2_note");
                let missing = read_artifact("no_such_thing");
                return { "found": found, "missing": missing };
            }"#,
        );
        let result = invoke(&mut w, "alpha_1", "alpha_1_reader");
        assert!(result.success, "{}", result.message);
        let payload = result.data.unwrap()["result"].clone();
        assert_eq!(payload["found"], "hello from alpha_2");
        assert_eq!(payload["missing"], Value::Null);
    }

    #[test]
    fn state_helpers_expose_listings_and_resources() {
        let mut w = world();
        write_service(
            &mut w,
            "alpha_1",
            "alpha_1_probe",
            r#"fn run() {
                let arts = list_artifacts(5);
                let res = get_resources();
                let events = recent_events(3);
                return {
                    "n": len(arts),
                    "cpu": res["cpu_seconds_remaining"],
                    "events": len(events),
                    "t": now_seconds() > 0.0,
                };
            }"#,
        );
        let result = invoke(&mut w, "alpha_1", "alpha_1_probe");
        assert!(result.success, "{}", result.message);
        let payload = result.data.unwrap()["result"].clone();
        assert_eq!(payload["n"], 5);
        assert_eq!(payload["events"], 3);
        assert_eq!(payload["t"], true);
        assert!(payload["cpu"].as_f64().is_some());
    }

    #[test]
    fn llm_requires_the_capability() {
        let mut w = world();
        write_service(
            &mut w,
            "alpha_1",
            "alpha_1_asker",
            r#"fn run() {
                return llm_complete("deterministic", [{ "role": "user", "content": "hi" }]);
            }"#,
        );
        let result = invoke(&mut w, "alpha_1", "alpha_1_asker");
        assert!(result.success, "{}", result.message);
        let payload = result.data.unwrap()["result"].clone();
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error_code"], "not_authorized");

        if let Some(artifact) = w.store.get_mut("alpha_1_asker") {
            artifact.capabilities.push("can_call_llm".to_string());
        }
        let result = invoke(&mut w, "alpha_1", "alpha_1_asker");
        assert!(result.success, "{}", result.message);
        let payload = result.data.unwrap()["result"].clone();
        assert_eq!(payload["success"], true);
        assert!(payload["content"].as_str().is_some());
    }
}
