//! Per-action execution against world state
//!
//! One method per intent variant. Each follows the same shape: resolve
//! the target, check the access contract, check resources, mutate, log
//! the domain event. The paired `action` envelope event is logged by
//! `World::execute_intent`, never here.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use agora_contracts::apply_state_updates;
use agora_delegation::resolve_payer;
use agora_sandbox::{parse_json_args, Executor, ScriptValue, ENTRY_HANDLE_REQUEST, ENTRY_RUN};
use agora_store::WriteRequest;
use agora_types::{ActionIntent, ActionKind, ActionResult, ErrorCode, PermissionAction, WriteSpec};

use crate::{obj, World, KERNEL_SERVICE_IDS};

impl World {
    pub(crate) fn dispatch_action(&mut self, intent: &ActionIntent, depth: u32) -> ActionResult {
        let principal_id = intent.principal_id.as_str();
        match &intent.kind {
            ActionKind::Noop => ActionResult::ok("noop"),
            ActionKind::ReadArtifact { artifact_id } => self.do_read(principal_id, artifact_id),
            ActionKind::WriteArtifact(spec) => self.do_write(principal_id, spec),
            ActionKind::EditArtifact {
                artifact_id,
                old_string,
                new_string,
            } => self.do_edit(principal_id, artifact_id, old_string, new_string),
            ActionKind::DeleteArtifact { artifact_id } => {
                self.do_delete(principal_id, artifact_id)
            }
            ActionKind::InvokeArtifact {
                artifact_id,
                method,
                args,
            } => self.do_invoke(principal_id, artifact_id, method, args, depth),
            ActionKind::QueryKernel { query_type, params } => {
                self.do_query(principal_id, query_type, params)
            }
            ActionKind::SubscribeArtifact { artifact_id } => {
                self.do_subscription(principal_id, artifact_id, true)
            }
            ActionKind::UnsubscribeArtifact { artifact_id } => {
                self.do_subscription(principal_id, artifact_id, false)
            }
            ActionKind::Transfer {
                recipient_id,
                amount,
                memo,
            } => self.do_transfer(principal_id, recipient_id, *amount, memo.as_deref()),
            ActionKind::Mint {
                recipient_id,
                amount,
                reason,
            } => self.do_mint(principal_id, recipient_id, *amount, reason),
            ActionKind::SubmitToMint { artifact_id, bid } => {
                self.do_submit_to_mint(principal_id, artifact_id, *bid)
            }
            ActionKind::UpdateMetadata {
                artifact_id,
                key,
                value,
            } => self.do_update_metadata(principal_id, artifact_id, key, value),
        }
    }

    fn do_read(&mut self, principal_id: &str, artifact_id: &str) -> ActionResult {
        let Some(artifact) = self.store.get(artifact_id).filter(|a| !a.deleted).cloned() else {
            return ActionResult::fail(
                format!("artifact '{artifact_id}' not found"),
                ErrorCode::NotFound,
            );
        };

        let perm = self.contracts().check(
            principal_id,
            PermissionAction::Read,
            &artifact,
            None,
            None,
            &self.store,
            &self.ledger,
        );
        if !perm.allowed {
            return ActionResult::fail(
                format!("read not allowed: {}", perm.reason),
                ErrorCode::NotAuthorized,
            );
        }
        apply_state_updates(&mut self.store, artifact_id, &perm);

        let read_price = artifact.read_price;
        let recipient = perm
            .scrip_recipient
            .unwrap_or_else(|| artifact.owner.clone());
        if read_price > 0 {
            if !self.ledger.can_afford(principal_id, read_price) {
                return ActionResult::fail(
                    format!("cannot afford read price {read_price}"),
                    ErrorCode::InsufficientFunds,
                );
            }
            if recipient != principal_id {
                self.ledger.transfer(principal_id, &recipient, read_price);
            }
        }

        let event = json!({
            "event_number": self.event_number,
            "principal_id": principal_id,
            "artifact_id": artifact.id,
            "read_price_paid": read_price,
            "recipient": recipient,
            "content_size": artifact.content.len(),
        });
        self.log.log("artifact_read", obj(event));
        ActionResult::ok_with(
            format!("read '{}'", artifact.id),
            json!({ "artifact": artifact.to_json(true), "read_price_paid": read_price }),
        )
    }

    fn do_write(&mut self, principal_id: &str, spec: &WriteSpec) -> ActionResult {
        let artifact_id = spec.artifact_id.as_str();
        let existing = self.store.get(artifact_id).cloned();
        if let Some(existing) = &existing {
            if existing.deleted {
                return ActionResult::fail(
                    format!("artifact '{artifact_id}' is deleted"),
                    ErrorCode::Deleted,
                );
            }
            if existing.kernel_protected {
                return ActionResult::fail(
                    "artifact is kernel_protected",
                    ErrorCode::NotAuthorized,
                );
            }
            let perm = self.contracts().check(
                principal_id,
                PermissionAction::Write,
                existing,
                None,
                None,
                &self.store,
                &self.ledger,
            );
            if !perm.allowed {
                return ActionResult::fail(
                    format!("write not allowed: {}", perm.reason),
                    ErrorCode::NotAuthorized,
                );
            }
            apply_state_updates(&mut self.store, artifact_id, &perm);
        }

        let access_contract_id = match &spec.access_contract_id {
            Some(contract) if !contract.is_empty() => Some(contract.clone()),
            _ if existing.is_none() => {
                Some(self.config.contracts.default_for_new_artifact.clone())
            }
            _ => None,
        };

        if spec.executable {
            if let Err(error) = agora_sandbox::validate(&spec.code) {
                return ActionResult::fail(
                    format!("code validation failed: {error}"),
                    ErrorCode::InvalidCode,
                );
            }
        }

        let new_size = (spec.content.len() + spec.code.len()) as i64;
        let old_size = existing
            .as_ref()
            .map(|a| (a.content.len() + a.code.len()) as i64)
            .unwrap_or(0);
        let size_delta = new_size - old_size;
        if size_delta > 0 {
            let available = self.available_disk(principal_id);
            if available < size_delta {
                return ActionResult::fail(
                    format!("disk quota exceeded: need {size_delta}, available {available}"),
                    ErrorCode::QuotaExceeded,
                );
            }
        }

        let owner = existing
            .as_ref()
            .map(|a| a.owner.clone())
            .unwrap_or_else(|| principal_id.to_string());
        let was_update = existing.is_some();
        let write = self.store.write(
            artifact_id,
            principal_id,
            WriteRequest {
                artifact_type: spec.artifact_type.clone(),
                content: spec.content.clone(),
                executable: spec.executable,
                code: spec.code.clone(),
                read_price: spec.read_price,
                invoke_price: spec.invoke_price,
                access_contract_id,
                metadata: spec.metadata.clone(),
                interface: spec.interface.clone(),
                has_standing: spec.has_standing,
                has_loop: spec.has_loop,
                capabilities: Some(spec.capabilities.clone()),
                owner: Some(owner),
                ..Default::default()
            },
        );
        let (has_standing, has_loop, artifact_type) = match write {
            Ok(artifact) => (
                artifact.has_standing,
                artifact.has_loop,
                artifact.artifact_type.clone(),
            ),
            Err(error) => return ActionResult::fail(error.to_string(), error.code()),
        };

        // A standing artifact is a principal with its own balances.
        let principal_created =
            !was_update && has_standing && !self.ledger.principal_exists(artifact_id);
        if principal_created {
            self.ledger.create_principal(artifact_id, 0, &[]);
            self.set_disk_quota(artifact_id, self.config.principals.starting_disk_quota_bytes);
            let event = json!({
                "event_number": self.event_number,
                "principal_id": artifact_id,
                "created_by": principal_id,
                "has_loop": has_loop,
            });
            self.log.log("principal_created", obj(event));
        }

        let event = json!({
            "event_number": self.event_number,
            "principal_id": principal_id,
            "artifact_id": artifact_id,
            "artifact_type": artifact_type,
            "executable": spec.executable,
            "size_bytes": new_size,
            "was_update": was_update,
            "has_standing": has_standing,
            "has_loop": has_loop,
        });
        self.log.log("artifact_written", obj(event));
        ActionResult::ok_with(
            format!(
                "{} artifact '{artifact_id}'",
                if was_update { "updated" } else { "created" }
            ),
            json!({
                "artifact_id": artifact_id,
                "size_bytes": new_size,
                "was_update": was_update,
                "principal_created": principal_created,
            }),
        )
    }

    fn do_edit(
        &mut self,
        principal_id: &str,
        artifact_id: &str,
        old_string: &str,
        new_string: &str,
    ) -> ActionResult {
        let Some(artifact) = self.store.get(artifact_id).filter(|a| !a.deleted).cloned() else {
            return ActionResult::fail("artifact not found", ErrorCode::NotFound);
        };
        if artifact.kernel_protected {
            return ActionResult::fail("artifact is kernel_protected", ErrorCode::NotAuthorized);
        }

        let perm = self.contracts().check(
            principal_id,
            PermissionAction::Edit,
            &artifact,
            None,
            None,
            &self.store,
            &self.ledger,
        );
        if !perm.allowed {
            return ActionResult::fail(
                format!("edit not allowed: {}", perm.reason),
                ErrorCode::NotAuthorized,
            );
        }
        apply_state_updates(&mut self.store, artifact_id, &perm);

        let size_delta = new_string.len() as i64 - old_string.len() as i64;
        if size_delta > 0 && self.available_disk(principal_id) < size_delta {
            return ActionResult::fail("disk quota exceeded", ErrorCode::QuotaExceeded);
        }

        if let Err(error) = self.store.edit(artifact_id, old_string, new_string) {
            return ActionResult::fail(error.to_string(), error.code());
        }

        let event = json!({
            "event_number": self.event_number,
            "principal_id": principal_id,
            "artifact_id": artifact_id,
            "size_delta": size_delta,
        });
        self.log.log("artifact_edited", obj(event));
        ActionResult::ok_with(
            format!("edited '{artifact_id}'"),
            json!({ "size_delta": size_delta }),
        )
    }

    fn do_delete(&mut self, principal_id: &str, artifact_id: &str) -> ActionResult {
        let Some(artifact) = self.store.get(artifact_id).cloned() else {
            return ActionResult::fail(
                format!("artifact '{artifact_id}' not found"),
                ErrorCode::NotFound,
            );
        };
        if artifact.kernel_protected || KERNEL_SERVICE_IDS.contains(&artifact_id) {
            return ActionResult::fail("cannot delete kernel artifact", ErrorCode::NotAuthorized);
        }
        if artifact.deleted {
            return ActionResult::fail("artifact already deleted", ErrorCode::NotFound);
        }

        let perm = self.contracts().check(
            principal_id,
            PermissionAction::Delete,
            &artifact,
            None,
            None,
            &self.store,
            &self.ledger,
        );
        if !perm.allowed {
            return ActionResult::fail(
                format!("delete not allowed: {}", perm.reason),
                ErrorCode::NotAuthorized,
            );
        }

        let freed = artifact.content.len() + artifact.code.len();
        self.store.soft_delete(artifact_id, principal_id);
        let event = json!({
            "event_number": self.event_number,
            "principal_id": principal_id,
            "artifact_id": artifact_id,
            "freed_bytes": freed,
        });
        self.log.log("artifact_deleted", obj(event));
        ActionResult::ok_with(
            format!("deleted '{artifact_id}'"),
            json!({ "freed_bytes": freed }),
        )
    }

    pub(crate) fn do_invoke(
        &mut self,
        principal_id: &str,
        artifact_id: &str,
        method: &str,
        args: &[Value],
        depth: u32,
    ) -> ActionResult {
        let start = std::time::Instant::now();

        if KERNEL_SERVICE_IDS.contains(&artifact_id) {
            return self.invoke_kernel_service(principal_id, artifact_id, method, args, start);
        }

        let Some(artifact) = self.store.get(artifact_id).filter(|a| !a.deleted).cloned() else {
            return ActionResult::fail(
                format!("artifact '{artifact_id}' not found"),
                ErrorCode::NotFound,
            );
        };
        if !artifact.executable {
            return ActionResult::fail(
                format!("artifact '{}' is not executable", artifact.id),
                ErrorCode::InvalidType,
            );
        }

        // Interface introspection is free and uncontracted.
        if method == "describe" {
            return ActionResult::ok_with(
                format!("interface for '{}'", artifact.id),
                json!({
                    "artifact_id": artifact.id,
                    "type": artifact.artifact_type,
                    "owner": artifact.owner,
                    "interface": artifact.interface,
                    "description": artifact.content,
                }),
            );
        }

        let perm = self.contracts().check(
            principal_id,
            PermissionAction::Invoke,
            &artifact,
            Some(method),
            Some(args),
            &self.store,
            &self.ledger,
        );
        if !perm.allowed {
            return ActionResult::fail(
                format!("invoke not allowed: {}", perm.reason),
                ErrorCode::NotAuthorized,
            );
        }
        apply_state_updates(&mut self.store, artifact_id, &perm);

        let charge_to = artifact
            .metadata
            .get("charge_to")
            .and_then(Value::as_str)
            .unwrap_or("caller")
            .to_string();
        let payer = match resolve_payer(&charge_to, principal_id, &artifact) {
            Ok(payer) => payer,
            Err(error) => {
                return ActionResult::fail(error.to_string(), ErrorCode::InvalidChargeDirective)
            }
        };

        if payer != principal_id {
            let (authorized, reason) =
                self.delegations
                    .authorize_charge(&payer, principal_id, artifact.invoke_price as f64);
            if !authorized {
                return ActionResult::fail(
                    format!("delegation denied: {reason}"),
                    ErrorCode::NotAuthorized,
                );
            }
        }

        if artifact.invoke_price > 0 && !self.ledger.can_afford(&payer, artifact.invoke_price) {
            return ActionResult::fail(
                "insufficient scrip for invoke price",
                ErrorCode::InsufficientFunds,
            );
        }

        let entry = match agora_sandbox::validate(&artifact.code) {
            Ok(program) => Executor::select_entry(&program, method),
            Err(_) => ENTRY_RUN.to_string(),
        };
        let script_args: Vec<ScriptValue> = if entry == ENTRY_HANDLE_REQUEST {
            vec![
                ScriptValue::Str(principal_id.to_string()),
                ScriptValue::Str(method.to_string()),
                ScriptValue::List(parse_json_args(args)),
            ]
        } else {
            parse_json_args(args)
        };

        let limits = self.exec_limits();
        let can_call_llm = artifact.has_capability("can_call_llm");
        let code = artifact.code.clone();
        let outcome = {
            let mut host = crate::host::InvokeHost::new(
                self,
                principal_id,
                artifact_id,
                depth,
                can_call_llm,
            );
            Executor::new(limits).execute(&code, &entry, script_args, &mut host)
        };

        let cpu_used = outcome.cpu_seconds;
        if cpu_used > 0.0 {
            // Overage is tolerated; the window refuses further work.
            let _ = self.ledger.consume_resource(&payer, "cpu_seconds", cpu_used);
        }
        let mut resources = BTreeMap::new();
        if cpu_used > 0.0 {
            resources.insert("cpu_seconds".to_string(), cpu_used);
        }
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        if !outcome.success {
            let error = outcome.error.unwrap_or_else(|| "execution failed".to_string());
            let event = json!({
                "event_number": self.event_number,
                "invoker_id": principal_id,
                "artifact_id": artifact.id,
                "method": method,
                "duration_ms": duration_ms,
                "error": error,
            });
            self.log.log("invoke_failure", obj(event));
            return ActionResult::fail(
                format!("execution failed: {error}"),
                ErrorCode::RuntimeError,
            )
            .with_data(json!({ "error": error }))
            .with_charged_to(payer)
            .with_resources(resources);
        }

        let recipient = perm
            .scrip_recipient
            .unwrap_or_else(|| artifact.owner.clone());
        if artifact.invoke_price > 0 && recipient != payer {
            self.ledger.transfer(&payer, &recipient, artifact.invoke_price);
        }
        if payer != principal_id && artifact.invoke_price > 0 {
            self.delegations
                .record_charge(&payer, principal_id, artifact.invoke_price as f64);
        }

        if artifact.has_loop && method == ENTRY_RUN {
            self.log_loop_decision(principal_id, &artifact.id, &outcome.result);
        }

        let event = json!({
            "event_number": self.event_number,
            "invoker_id": principal_id,
            "artifact_id": artifact.id,
            "method": method,
            "duration_ms": duration_ms,
        });
        self.log.log("invoke_success", obj(event));

        ActionResult::ok_with(
            format!("invoked '{}'", artifact.id),
            json!({
                "result": outcome.result,
                "price_paid": artifact.invoke_price,
                "recipient": recipient,
            }),
        )
        .with_charged_to(payer)
        .with_resources(resources)
    }

    fn invoke_kernel_service(
        &mut self,
        principal_id: &str,
        service_id: &str,
        method: &str,
        args: &[Value],
        start: std::time::Instant,
    ) -> ActionResult {
        let Some(payload) = self.run_kernel_service(service_id, method, args, principal_id) else {
            return ActionResult::fail(
                format!("unknown method '{method}' on {service_id}"),
                ErrorCode::NotFound,
            );
        };
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let success = payload["success"].as_bool().unwrap_or(false);
        if success {
            let event = json!({
                "event_number": self.event_number,
                "invoker_id": principal_id,
                "artifact_id": service_id,
                "method": method,
                "duration_ms": duration_ms,
            });
            self.log.log("invoke_success", obj(event));
            return ActionResult::ok_with(format!("invoked {service_id}.{method}"), payload);
        }
        let error = payload["error"]
            .as_str()
            .unwrap_or("service failed")
            .to_string();
        let code = payload["error_code"]
            .as_str()
            .and_then(error_code_from_str)
            .unwrap_or(ErrorCode::RuntimeError);
        let event = json!({
            "event_number": self.event_number,
            "invoker_id": principal_id,
            "artifact_id": service_id,
            "method": method,
            "duration_ms": duration_ms,
            "error": error,
        });
        self.log.log("invoke_failure", obj(event));
        ActionResult::fail(error, code).with_data(payload)
    }

    fn log_loop_decision(&mut self, principal_id: &str, artifact_id: &str, payload: &Value) {
        let Value::Object(map) = payload else {
            return;
        };
        let decision = map.get("decision").filter(|v| v.is_object());
        let fallback = map.get("fallback").filter(|v| v.is_object());
        let result = map.get("result").and_then(Value::as_object);
        let event = json!({
            "event_number": self.event_number,
            "principal_id": principal_id,
            "artifact_id": artifact_id,
            "decision": decision,
            "decision_action": decision.and_then(extract_action_name),
            "fallback_used": fallback.is_some(),
            "fallback": fallback,
            "fallback_action": fallback.and_then(extract_action_name),
            "result_success": result.and_then(|r| r.get("success")).and_then(Value::as_bool),
            "result_error_code": result
                .and_then(|r| r.get("error_code"))
                .and_then(Value::as_str),
        });
        self.log.log("loop_decision", obj(event));
    }

    fn do_query(
        &mut self,
        principal_id: &str,
        query_type: &str,
        params: &Map<String, Value>,
    ) -> ActionResult {
        match self.run_query(query_type, params) {
            Ok(payload) => {
                let event = json!({
                    "event_number": self.event_number,
                    "principal_id": principal_id,
                    "query_type": query_type,
                    "params": params,
                });
                self.log.log("kernel_query", obj(event));
                ActionResult::ok_with(format!("query '{query_type}' succeeded"), payload)
            }
            Err(error) => ActionResult::fail(error.message, error.code),
        }
    }

    fn do_subscription(
        &mut self,
        principal_id: &str,
        artifact_id: &str,
        subscribe: bool,
    ) -> ActionResult {
        let Some(profile) = self.store.get(principal_id).cloned() else {
            return ActionResult::fail(
                format!("agent artifact '{principal_id}' not found"),
                ErrorCode::NotFound,
            );
        };
        if subscribe && self.store.get(artifact_id).is_none() {
            return ActionResult::fail(
                format!("artifact '{artifact_id}' not found"),
                ErrorCode::NotFound,
            );
        }

        let mut config: Map<String, Value> = serde_json::from_str(&profile.content)
            .ok()
            .and_then(|v: Value| v.as_object().cloned())
            .unwrap_or_default();
        let mut subscribed: Vec<String> = config
            .get("subscribed_artifacts")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let message = if subscribe {
            if subscribed.iter().any(|id| id == artifact_id) {
                format!("already subscribed to '{artifact_id}'")
            } else {
                subscribed.push(artifact_id.to_string());
                format!("subscribed to '{artifact_id}'")
            }
        } else if let Some(pos) = subscribed.iter().position(|id| id == artifact_id) {
            subscribed.remove(pos);
            format!("unsubscribed from '{artifact_id}'")
        } else {
            format!("not subscribed to '{artifact_id}'")
        };

        config.insert("subscribed_artifacts".to_string(), json!(subscribed));
        // Profiles are kernel-maintained; skip the contract path.
        self.store
            .modify_protected_content(principal_id, &Value::Object(config).to_string());
        ActionResult::ok_with(message, json!({ "subscribed_artifacts": subscribed }))
    }

    fn do_transfer(
        &mut self,
        principal_id: &str,
        recipient_id: &str,
        amount: i64,
        memo: Option<&str>,
    ) -> ActionResult {
        if amount <= 0 {
            return ActionResult::fail("amount must be positive", ErrorCode::InvalidArgument);
        }
        if !self.ledger.principal_exists(principal_id) {
            return ActionResult::fail("sender is not a principal", ErrorCode::NotFound);
        }
        if !self.ledger.principal_exists(recipient_id) {
            return ActionResult::fail("recipient is not a principal", ErrorCode::NotFound);
        }
        if !self.ledger.transfer(principal_id, recipient_id, amount) {
            return ActionResult::fail("insufficient funds", ErrorCode::InsufficientFunds);
        }

        let event = json!({
            "event_number": self.event_number,
            "sender": principal_id,
            "recipient": recipient_id,
            "amount": amount,
            "memo": memo,
        });
        self.log.log("transfer", obj(event));
        ActionResult::ok(format!("transferred {amount} scrip to {recipient_id}"))
    }

    fn do_mint(
        &mut self,
        principal_id: &str,
        recipient_id: &str,
        amount: i64,
        reason: &str,
    ) -> ActionResult {
        let Some(minter) = self.store.get(principal_id) else {
            return ActionResult::fail("minter artifact not found", ErrorCode::NotFound);
        };
        if !minter.has_capability("can_mint") {
            return ActionResult::fail(
                "caller lacks can_mint capability",
                ErrorCode::NotAuthorized,
            );
        }
        if !self.ledger.principal_exists(recipient_id) {
            return ActionResult::fail("recipient is not a principal", ErrorCode::NotFound);
        }
        if amount <= 0 {
            return ActionResult::fail("mint amount must be positive", ErrorCode::InvalidArgument);
        }

        self.ledger.credit(recipient_id, amount);
        let event = json!({
            "event_number": self.event_number,
            "minter": principal_id,
            "recipient": recipient_id,
            "amount": amount,
            "reason": reason,
        });
        self.log.log("mint", obj(event));
        ActionResult::ok(format!("minted {amount} to {recipient_id}"))
    }

    fn do_submit_to_mint(
        &mut self,
        principal_id: &str,
        artifact_id: &str,
        bid: i64,
    ) -> ActionResult {
        let event_number = self.event_number;
        let Some(mint) = self.mint.as_mut() else {
            return ActionResult::fail("mint auction disabled", ErrorCode::NotEnabled);
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
            Ok(submission_id) => ActionResult::ok_with(
                format!("submitted to mint as {submission_id}"),
                json!({ "submission_id": submission_id }),
            ),
            Err(error) => ActionResult::fail(error.to_string(), error.code()),
        }
    }

    fn do_update_metadata(
        &mut self,
        principal_id: &str,
        artifact_id: &str,
        key: &str,
        value: &Value,
    ) -> ActionResult {
        let Some(artifact) = self.store.get(artifact_id).filter(|a| !a.deleted).cloned() else {
            return ActionResult::fail("artifact not found", ErrorCode::NotFound);
        };

        let perm = self.contracts().check(
            principal_id,
            PermissionAction::Write,
            &artifact,
            None,
            None,
            &self.store,
            &self.ledger,
        );
        if !perm.allowed {
            return ActionResult::fail(
                format!("metadata update not allowed: {}", perm.reason),
                ErrorCode::NotAuthorized,
            );
        }

        let now = self.now_iso();
        if let Some(artifact) = self.store.get_mut(artifact_id) {
            if value.is_null() {
                artifact.metadata.remove(key);
            } else {
                artifact.metadata.insert(key.to_string(), value.clone());
            }
            artifact.updated_at = now;
        }

        let event = json!({
            "event_number": self.event_number,
            "principal_id": principal_id,
            "artifact_id": artifact_id,
            "key": key,
            "value": value,
        });
        self.log.log("metadata_updated", obj(event));
        ActionResult::ok(format!("metadata '{key}' updated"))
    }
}

fn extract_action_name(decision: &Value) -> Option<Value> {
    let map = decision.as_object()?;
    let action = map
        .get("action_type")
        .and_then(Value::as_str)
        .or_else(|| map.get("action").and_then(Value::as_str))?;
    let normalized = action.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    Some(Value::from(normalized))
}

fn error_code_from_str(raw: &str) -> Option<ErrorCode> {
    serde_json::from_value(Value::from(raw)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::world;

    fn run(w: &mut crate::World, principal: &str, payload: Value) -> ActionResult {
        w.execute_action_data(principal, &payload, true)
    }

    #[test]
    fn write_then_read_pays_the_owner() {
        let mut w = world();
        let result = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_paper",
                "artifact_type": "note",
                "content": "findings",
                "read_price": 5,
            }),
        );
        assert!(result.success, "{}", result.message);

        let result = run(
            &mut w,
            "alpha_2",
            json!({ "action_type": "read_artifact", "artifact_id": "alpha_1_paper" }),
        );
        assert!(result.success);
        assert_eq!(w.ledger.scrip("alpha_2"), 95);
        assert_eq!(w.ledger.scrip("alpha_1"), 105);
        let data = result.data.unwrap();
        assert_eq!(data["artifact"]["content"], "findings");
        assert_eq!(data["read_price_paid"], 5);
    }

    #[test]
    fn read_refuses_when_price_is_unaffordable() {
        let mut w = world();
        run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_rare",
                "artifact_type": "note",
                "content": "x",
                "read_price": 1000,
            }),
        );
        let result = run(
            &mut w,
            "alpha_2",
            json!({ "action_type": "read_artifact", "artifact_id": "alpha_1_rare" }),
        );
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::InsufficientFunds));
        assert!(result.retriable);
        assert_eq!(w.ledger.scrip("alpha_2"), 100);
    }

    #[test]
    fn write_enforces_disk_quota() {
        let mut w = world();
        w.set_disk_quota("alpha_1", w.store.owner_usage("alpha_1") as i64 + 10);
        let result = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_big",
                "artifact_type": "note",
                "content": "x".repeat(100),
            }),
        );
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::QuotaExceeded));
        assert!(result.retriable);
    }

    #[test]
    fn kernel_protected_artifacts_refuse_writes_and_deletes() {
        let mut w = world();
        let write = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_loop",
                "artifact_type": "agent_loop",
                "content": "hijack",
            }),
        );
        assert!(!write.success);
        assert_eq!(write.error_code, Some(ErrorCode::NotAuthorized));

        let delete = run(
            &mut w,
            "alpha_1",
            json!({ "action_type": "delete_artifact", "artifact_id": "kernel_act" }),
        );
        assert!(!delete.success);
        assert_eq!(delete.error_code, Some(ErrorCode::NotAuthorized));
    }

    #[test]
    fn executable_writes_validate_code() {
        let mut w = world();
        let bad = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_svc",
                "artifact_type": "service",
                "content": "svc",
                "executable": true,
                "code": "fn helper() { return 1; }",
            }),
        );
        assert!(!bad.success);
        assert_eq!(bad.error_code, Some(ErrorCode::InvalidCode));

        let good = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_svc",
                "artifact_type": "service",
                "content": "svc",
                "executable": true,
                "code": "fn run() { return 41 + 1; }",
            }),
        );
        assert!(good.success, "{}", good.message);
    }

    #[test]
    fn standing_artifact_becomes_a_principal() {
        let mut w = world();
        let result = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_agentling",
                "artifact_type": "service",
                "content": "junior",
                "has_standing": true,
            }),
        );
        assert!(result.success);
        assert_eq!(result.data.unwrap()["principal_created"], true);
        assert!(w.ledger.principal_exists("alpha_1_agentling"));
        assert_eq!(w.ledger.scrip("alpha_1_agentling"), 0);
    }

    #[test]
    fn invoke_runs_code_and_charges_the_payer() {
        let mut w = world();
        run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_adder",
                "artifact_type": "service",
                "content": "adds",
                "executable": true,
                "invoke_price": 3,
                "code": "fn run(a, b) { return a + b; }",
            }),
        );
        let result = run(
            &mut w,
            "alpha_2",
            json!({
                "action_type": "invoke_artifact",
                "artifact_id": "alpha_1_adder",
                "method": "run",
                "args": [20, 22],
            }),
        );
        assert!(result.success, "{}", result.message);
        let data = result.data.unwrap();
        assert_eq!(data["result"], 42);
        assert_eq!(data["price_paid"], 3);
        assert_eq!(result.charged_to.as_deref(), Some("alpha_2"));
        assert_eq!(w.ledger.scrip("alpha_2"), 97);
        assert_eq!(w.ledger.scrip("alpha_1"), 103);
        assert!(result
            .resources_consumed
            .is_some_and(|r| r.get("cpu_seconds").is_some_and(|c| *c > 0.0)));
    }

    #[test]
    fn invoke_failure_still_bills_cpu() {
        let mut w = world();
        run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_boom",
                "artifact_type": "service",
                "content": "boom",
                "executable": true,
                "code": "fn run() { return 1 / 0; }",
            }),
        );
        let result = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "invoke_artifact",
                "artifact_id": "alpha_1_boom",
                "method": "run",
            }),
        );
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::RuntimeError));
        assert!(result.message.contains("division by zero"));
    }

    #[test]
    fn transfer_moves_scrip_between_principals() {
        let mut w = world();
        let result = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "transfer",
                "recipient_id": "alpha_2",
                "amount": 30,
                "memo": "rent",
            }),
        );
        assert!(result.success);
        assert_eq!(w.ledger.scrip("alpha_1"), 70);
        assert_eq!(w.ledger.scrip("alpha_2"), 130);

        let result = run(
            &mut w,
            "alpha_1",
            json!({ "action_type": "transfer", "recipient_id": "nobody", "amount": 1 }),
        );
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::NotFound));
    }

    #[test]
    fn mint_requires_the_capability() {
        let mut w = world();
        let result = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "mint",
                "recipient_id": "alpha_2",
                "amount": 10,
                "reason": "bonus",
            }),
        );
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::NotAuthorized));
    }

    #[test]
    fn submit_to_mint_escrows_the_bid() {
        let mut w = world();
        run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_entry",
                "artifact_type": "note",
                "content": "entry",
            }),
        );
        let result = run(
            &mut w,
            "alpha_1",
            json!({ "action_type": "submit_to_mint", "artifact_id": "alpha_1_entry", "bid": 4 }),
        );
        assert!(result.success, "{}", result.message);
        assert_eq!(w.ledger.scrip("alpha_1"), 96);
    }

    #[test]
    fn subscriptions_round_trip_through_the_profile() {
        let mut w = world();
        run(
            &mut w,
            "alpha_2",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_2_feed",
                "artifact_type": "note",
                "content": "news",
            }),
        );
        let result = run(
            &mut w,
            "alpha_1",
            json!({ "action_type": "subscribe_artifact", "artifact_id": "alpha_2_feed" }),
        );
        assert!(result.success);
        let profile = w.store.get("alpha_1").unwrap();
        assert!(profile.content.contains("alpha_2_feed"));

        let result = run(
            &mut w,
            "alpha_1",
            json!({ "action_type": "unsubscribe_artifact", "artifact_id": "alpha_2_feed" }),
        );
        assert!(result.success);
        assert!(!w.store.get("alpha_1").unwrap().content.contains("alpha_2_feed"));
    }

    #[test]
    fn update_metadata_respects_the_contract() {
        let mut w = world();
        run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "write_artifact",
                "artifact_id": "alpha_1_doc",
                "artifact_type": "note",
                "content": "x",
            }),
        );
        let denied = run(
            &mut w,
            "alpha_2",
            json!({
                "action_type": "update_metadata",
                "artifact_id": "alpha_1_doc",
                "key": "charge_to",
                "value": "target",
            }),
        );
        assert!(!denied.success);

        let allowed = run(
            &mut w,
            "alpha_1",
            json!({
                "action_type": "update_metadata",
                "artifact_id": "alpha_1_doc",
                "key": "tag",
                "value": "research",
            }),
        );
        assert!(allowed.success);
        assert_eq!(w.store.get("alpha_1_doc").unwrap().metadata["tag"], "research");
    }
}
