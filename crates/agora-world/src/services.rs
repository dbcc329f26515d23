//! Built-in kernel service artifacts
//!
//! Services are invocable like executable artifacts but are implemented
//! in the kernel, not in sandboxed code. Payloads always carry a
//! `success` flag; a `None` return means the method does not exist on
//! that service.

use serde_json::{json, Value};

use crate::World;

impl World {
    pub(crate) fn run_kernel_service(
        &mut self,
        service_id: &str,
        method: &str,
        args: &[Value],
        principal_id: &str,
    ) -> Option<Value> {
        match (service_id, method) {
            ("kernel_act", "run") => Some(self.service_act(principal_id, args)),
            ("kernel_delegation", "run") => Some(self.service_delegation(principal_id, args)),
            ("kernel_mint", "run") => Some(self.service_mint(principal_id, args)),
            ("kernel_mint", "status") => Some(self.mint_status_payload()),
            ("kernel_mint", "update") => Some(self.service_mint_update()),
            ("kernel_time", "run") => Some(json!({
                "success": true,
                "now": self.now_iso(),
                "event_number": self.event_number,
            })),
            _ => None,
        }
    }

    /// Execute a nested action on behalf of the caller. This is the
    /// path agent loops use to act: they invoke `kernel_act` with one
    /// action payload per turn.
    fn service_act(&mut self, principal_id: &str, args: &[Value]) -> Value {
        let Some(payload) = args.first() else {
            return json!({
                "success": false,
                "error": "kernel_act requires an action payload",
                "error_code": "invalid_argument",
            });
        };
        let result = self.execute_action_data(principal_id, payload, true);
        let mut value = result.to_json();
        if !result.success {
            if let Some(map) = value.as_object_mut() {
                map.entry("error".to_string())
                    .or_insert(Value::from(result.message.clone()));
            }
        }
        value
    }

    fn service_delegation(&mut self, principal_id: &str, args: &[Value]) -> Value {
        let subcommand = args.first().and_then(Value::as_str).unwrap_or("list");
        match subcommand {
            "list" | "status" => json!({
                "success": true,
                "payer_id": principal_id,
                "delegations": self.delegations.list_for_payer(principal_id),
            }),
            "grant" => {
                let Some(charger_id) = args.get(1).and_then(Value::as_str) else {
                    return json!({
                        "success": false,
                        "error": "grant requires a charger_id",
                        "error_code": "invalid_argument",
                    });
                };
                let opts = args.get(2).and_then(Value::as_object);
                self.delegations.grant(
                    principal_id,
                    charger_id,
                    opts.and_then(|o| o.get("max_per_call")).and_then(Value::as_f64),
                    opts.and_then(|o| o.get("max_per_window")).and_then(Value::as_f64),
                    opts.and_then(|o| o.get("window_seconds")).and_then(Value::as_u64),
                    opts.and_then(|o| o.get("expires_at"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                );
                json!({ "success": true, "payer_id": principal_id, "charger_id": charger_id })
            }
            "revoke" => {
                let Some(charger_id) = args.get(1).and_then(Value::as_str) else {
                    return json!({
                        "success": false,
                        "error": "revoke requires a charger_id",
                        "error_code": "invalid_argument",
                    });
                };
                let revoked = self.delegations.revoke(principal_id, charger_id);
                json!({ "success": true, "revoked": revoked, "charger_id": charger_id })
            }
            other => json!({
                "success": false,
                "error": format!("unknown delegation subcommand '{other}'"),
                "error_code": "invalid_argument",
            }),
        }
    }

    fn service_mint(&mut self, principal_id: &str, args: &[Value]) -> Value {
        let subcommand = args.first().and_then(Value::as_str).unwrap_or("status");
        match subcommand {
            "status" => self.mint_status_payload(),
            "update" => self.service_mint_update(),
            "submit" => {
                let artifact_id = args.get(1).and_then(Value::as_str).unwrap_or("");
                let bid = args.get(2).and_then(Value::as_i64).unwrap_or(0);
                if artifact_id.is_empty() {
                    return json!({
                        "success": false,
                        "error": "submit requires an artifact_id and bid",
                        "error_code": "invalid_argument",
                    });
                }
                let event_number = self.event_number;
                let Some(mint) = self.mint.as_mut() else {
                    return mint_disabled();
                };
                match mint.submit(
                    principal_id,
                    artifact_id,
                    bid,
                    &mut self.ledger,
                    &self.store,
                    self.log.as_mut(),
                    event_number,
                ) {
                    Ok(submission_id) => {
                        json!({ "success": true, "submission_id": submission_id })
                    }
                    Err(error) => json!({
                        "success": false,
                        "error": error.to_string(),
                        "error_code": error.code().as_str(),
                    }),
                }
            }
            "cancel" => {
                let Some(submission_id) = args.get(1).and_then(Value::as_str) else {
                    return json!({
                        "success": false,
                        "error": "cancel requires a submission_id",
                        "error_code": "invalid_argument",
                    });
                };
                let event_number = self.event_number;
                let Some(mint) = self.mint.as_mut() else {
                    return mint_disabled();
                };
                let cancelled = mint.cancel(
                    principal_id,
                    submission_id,
                    &mut self.ledger,
                    self.log.as_mut(),
                    event_number,
                );
                json!({ "success": cancelled, "submission_id": submission_id })
            }
            other => json!({
                "success": false,
                "error": format!("unknown mint subcommand '{other}'"),
                "error_code": "invalid_argument",
            }),
        }
    }

    fn mint_status_payload(&self) -> Value {
        match self.mint.as_ref() {
            Some(mint) => json!({
                "success": true,
                "status": mint.status(),
                "submissions": mint.submissions(),
                "history": mint.history(20),
            }),
            None => mint_disabled(),
        }
    }

    fn service_mint_update(&mut self) -> Value {
        if self.mint.is_none() {
            return mint_disabled();
        }
        let resolved = self.tick();
        json!({ "success": true, "resolved": resolved })
    }
}

fn mint_disabled() -> Value {
    json!({
        "success": false,
        "error": "mint auction disabled",
        "error_code": "not_enabled",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::world;

    #[test]
    fn kernel_act_runs_a_nested_action() {
        let mut w = world();
        let payload = w
            .run_kernel_service(
                "kernel_act",
                "run",
                &[json!({
                    "action_type": "transfer",
                    "recipient_id": "alpha_2",
                    "amount": 7,
                })],
                "alpha_1",
            )
            .unwrap();
        assert_eq!(payload["success"], true);
        assert_eq!(w.ledger.scrip("alpha_2"), 107);

        let payload = w
            .run_kernel_service("kernel_act", "run", &[], "alpha_1")
            .unwrap();
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error_code"], "invalid_argument");
    }

    #[test]
    fn delegation_grants_round_trip() {
        let mut w = world();
        let granted = w
            .run_kernel_service(
                "kernel_delegation",
                "run",
                &[json!("grant"), json!("alpha_2"), json!({ "max_per_call": 5.0 })],
                "alpha_1",
            )
            .unwrap();
        assert_eq!(granted["success"], true);

        let listed = w
            .run_kernel_service("kernel_delegation", "run", &[json!("list")], "alpha_1")
            .unwrap();
        assert_eq!(listed["success"], true);
        assert!(listed["delegations"].to_string().contains("alpha_2"));

        let revoked = w
            .run_kernel_service(
                "kernel_delegation",
                "run",
                &[json!("revoke"), json!("alpha_2")],
                "alpha_1",
            )
            .unwrap();
        assert_eq!(revoked["revoked"], true);
    }

    #[test]
    fn mint_service_reports_status_and_validates_submissions() {
        let mut w = world();
        let status = w
            .run_kernel_service("kernel_mint", "status", &[], "alpha_1")
            .unwrap();
        assert_eq!(status["success"], true);
        assert_eq!(status["status"]["phase"], "waiting_first_auction");

        let rejected = w
            .run_kernel_service(
                "kernel_mint",
                "run",
                &[json!("submit"), json!("ghost"), json!(3)],
                "alpha_1",
            )
            .unwrap();
        assert_eq!(rejected["success"], false);
        assert_eq!(rejected["error_code"], "not_found");
    }

    #[test]
    fn unknown_method_yields_none() {
        let mut w = world();
        assert!(w
            .run_kernel_service("kernel_time", "explode", &[], "alpha_1")
            .is_none());
        let time = w
            .run_kernel_service("kernel_time", "run", &[], "alpha_1")
            .unwrap();
        assert_eq!(time["success"], true);
        assert!(time["now"].as_str().is_some());
    }
}
