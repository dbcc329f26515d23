//! Bootstrap agent loop script
//!
//! Every principal gets one kernel-protected loop artifact running this
//! script. Each turn it asks the model for a single action, falls back
//! to a deterministic 4-phase rotation (write, read, transfer, mint)
//! when the model is unavailable or unhelpful, and submits the chosen
//! action through `kernel_act`. The fallback keeps the economy moving
//! even with no model configured.

const TEMPLATE: &str = r#"
fn extract_json(text) {
    if type_of(text) != "string" {
        return null;
    }
    let start = find(text, "{");
    let end = rfind(text, "}");
    if start < 0 || end < start {
        return null;
    }
    return json_parse(slice(text, start, end + 1));
}

fn neighbor_principal(turn) {
    let idx = (turn % __COUNT__) + 1;
    let pid = "__PREFIX__" + str(idx);
    if pid == "__PID__" {
        idx = ((turn + 1) % __COUNT__) + 1;
        pid = "__PREFIX__" + str(idx);
    }
    return pid;
}

fn artifact_ids(state) {
    let ids = [];
    for art in state["artifacts"] {
        ids = push(ids, art["id"]);
    }
    return ids;
}

fn pick_read_target(ids) {
    let candidate = null;
    for id in ids {
        if count(id, "_") < 2 {
            continue;
        }
        if starts_with(id, "__PID___") {
            continue;
        }
        if ends_with(id, "_scratch") {
            return id;
        }
        if candidate == null {
            candidate = id;
        }
    }
    return candidate;
}

fn artifact_exists(id) {
    return read_artifact(id) != null;
}

fn note(id, text) {
    return {
        "action_type": "write_artifact",
        "artifact_id": id,
        "artifact_type": "note",
        "content": text
    };
}

fn fallback_action(turn, state) {
    let own_scratch = "__PID___scratch";
    let balance = state["balance"];
    let phase = turn % 4;
    if phase == 0 || !artifact_exists(own_scratch) {
        return note(own_scratch, "heartbeat from __PID__ at turn " + str(turn));
    } else if phase == 1 {
        let target = pick_read_target(artifact_ids(state));
        if target != null {
            return { "action_type": "read_artifact", "artifact_id": target };
        }
        return note(own_scratch, "snapshot: balance " + str(balance) + " at turn " + str(turn));
    } else if phase == 2 {
        if balance <= 1 {
            return note(own_scratch, "holding at balance " + str(balance));
        }
        return {
            "action_type": "transfer",
            "recipient_id": neighbor_principal(turn),
            "amount": 1,
            "memo": "coordination pulse"
        };
    } else {
        if !artifact_exists(own_scratch) || balance < 1 {
            return note(own_scratch, "preparing mint entry at turn " + str(turn));
        }
        return { "action_type": "submit_to_mint", "artifact_id": own_scratch, "bid": 1 };
    }
}

fn should_force_explore(turn, decision) {
    if turn % 5 == 0 {
        return true;
    }
    if type_of(decision) != "map" {
        return true;
    }
    let action = decision["action_type"];
    if action == null {
        action = decision["action"];
    }
    if action == null || action == "" || action == "noop" {
        return true;
    }
    if action == "query_kernel" {
        return turn % 3 == 0;
    }
    return false;
}

fn run() {
    let turn = to_int(now_seconds()) + __SLOT__;
    let state = {
        "balance": get_balance(),
        "resources": get_resources(),
        "artifacts": list_artifacts(12)
    };
    let prompt = "You are agent __PID__ in an economy simulation. Return exactly one JSON action object and never use noop. Valid action_type values include write_artifact, read_artifact, transfer, submit_to_mint, query_kernel. Do not invoke artifacts directly. For query_kernel you must include query_type and params object. Do not modify *_loop artifacts. When writing artifacts, use ids prefixed with __PID___. Prefer interaction and production actions over status checks.";
    let llm = llm_complete("__MODEL__", [
        { "role": "system", "content": "Return only one valid JSON action object. No prose." },
        { "role": "user", "content": prompt + "\nState:\n" + json_dump(state) }
    ]);
    let decision = null;
    if llm["success"] == true {
        decision = extract_json(llm["content"]);
    }
    let fallback = null;
    if should_force_explore(turn, decision) {
        fallback = fallback_action(turn, state);
        decision = fallback;
    }
    let result = invoke("kernel_act", decision);
    if result["success"] != true && fallback == null {
        fallback = fallback_action(turn, state);
        let recovery = invoke("kernel_act", fallback);
        return { "decision": decision, "fallback": fallback, "result": recovery };
    }
    if fallback != null {
        return { "decision": decision, "fallback": fallback, "result": result };
    }
    return { "decision": decision, "result": result };
}
"#;

/// Render the loop script for one principal. `slot` staggers the turn
/// counter so principals do not act in lockstep.
pub(crate) fn default_loop_code(
    principal_id: &str,
    slot: u32,
    id_prefix: &str,
    principal_count: u32,
    model: &str,
) -> String {
    TEMPLATE
        .replace("__PID__", principal_id)
        .replace("__SLOT__", &slot.to_string())
        .replace("__PREFIX__", id_prefix)
        .replace("__COUNT__", &principal_count.max(1).to_string())
        .replace("__MODEL__", model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::world;
    use serde_json::json;

    #[test]
    fn generated_code_parses_with_a_run_entry() {
        let code = default_loop_code("alpha_1", 1, "alpha_", 3, "deterministic");
        let program = agora_sandbox::validate(&code).expect("loop code must parse");
        assert!(program.defines("run"));
        assert!(code.contains("alpha_1_scratch"));
        assert!(!code.contains("__PID__"));
        assert!(!code.contains("__SLOT__"));
    }

    #[test]
    fn loop_runs_end_to_end_against_the_kernel() {
        let mut w = world();
        let result = w.execute_action_data(
            "alpha_1",
            &json!({
                "action_type": "invoke_artifact",
                "artifact_id": "alpha_1_loop",
                "method": "run",
            }),
            true,
        );
        assert!(result.success, "{}", result.message);
        let payload = result.data.unwrap()["result"].clone();
        assert!(payload["decision"].is_object(), "{payload}");
        assert!(payload["result"].is_object());

        let decisions = w
            .log
            .read_recent(2000)
            .iter()
            .filter(|e| e["event_type"] == "loop_decision")
            .count();
        assert_eq!(decisions, 1);
    }

    #[test]
    fn other_principals_cannot_run_someone_elses_loop() {
        let mut w = world();
        let result = w.execute_action_data(
            "alpha_2",
            &json!({
                "action_type": "invoke_artifact",
                "artifact_id": "alpha_1_loop",
                "method": "run",
            }),
            true,
        );
        assert!(!result.success);
        assert_eq!(
            result.error_code,
            Some(agora_types::ErrorCode::NotAuthorized)
        );
    }
}
