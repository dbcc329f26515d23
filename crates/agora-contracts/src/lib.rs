//! Contract-gated access control
//!
//! Every mediated artifact action is checked against the target's
//! access contract. Five kernel contracts cover the common policies;
//! any other contract id resolves to an artifact whose code defines
//! `check_permission`, evaluated in the sandbox with a read-only view
//! of the ledger. Unresolvable ids fall back to the configured
//! default. A contract's `state_updates` are the only write path into
//! an artifact's `auth_state`.

use serde_json::{Map, Value};
use tracing::warn;

use agora_ledger::Ledger;
use agora_sandbox::{
    Executor, HostEnv, Limits, ScriptValue, ENTRY_CHECK_PERMISSION,
};
use agora_store::{Artifact, ArtifactStore};
use agora_types::{PermissionAction, PermissionResult};

pub const KERNEL_CONTRACT_FREEWARE: &str = "kernel_contract_freeware";
pub const KERNEL_CONTRACT_TRANSFERABLE_FREEWARE: &str = "kernel_contract_transferable_freeware";
pub const KERNEL_CONTRACT_SELF_OWNED: &str = "kernel_contract_self_owned";
pub const KERNEL_CONTRACT_PRIVATE: &str = "kernel_contract_private";
pub const KERNEL_CONTRACT_PUBLIC: &str = "kernel_contract_public";

pub const KERNEL_CONTRACT_IDS: &[&str] = &[
    KERNEL_CONTRACT_FREEWARE,
    KERNEL_CONTRACT_TRANSFERABLE_FREEWARE,
    KERNEL_CONTRACT_SELF_OWNED,
    KERNEL_CONTRACT_PRIVATE,
    KERNEL_CONTRACT_PUBLIC,
];

fn state_str<'a>(context: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    context
        .get("_artifact_state")
        .and_then(Value::as_object)
        .and_then(|state| state.get(key))
        .and_then(Value::as_str)
}

/// Freeware: open read and invoke, only the recorded writer may
/// modify. Payments default to the writer.
fn check_freeware(
    caller: &str,
    action: PermissionAction,
    context: &Map<String, Value>,
) -> PermissionResult {
    let writer = state_str(context, "writer");
    match action {
        PermissionAction::Read | PermissionAction::Invoke => {
            let mut result = PermissionResult::allow("freeware open access");
            if let Some(writer) = writer {
                result = result.with_recipient(writer);
            }
            result
        }
        _ => match writer {
            Some(writer) if caller == writer => {
                PermissionResult::allow("freeware writer access").with_recipient(writer)
            }
            _ => PermissionResult::deny("freeware only writer can modify"),
        },
    }
}

/// Self-owned: the artifact itself or its recorded principal.
fn check_self_owned(
    caller: &str,
    target: &str,
    context: &Map<String, Value>,
) -> PermissionResult {
    let principal = state_str(context, "principal");
    if caller == target {
        let mut result = PermissionResult::allow("self access");
        if let Some(principal) = principal {
            result = result.with_recipient(principal);
        }
        return result;
    }
    match principal {
        Some(principal) if caller == principal => {
            PermissionResult::allow("principal access").with_recipient(principal)
        }
        _ => PermissionResult::deny("self_owned access denied"),
    }
}

fn check_private(caller: &str, context: &Map<String, Value>) -> PermissionResult {
    match state_str(context, "principal") {
        Some(principal) if caller == principal => {
            PermissionResult::allow("private principal access").with_recipient(principal)
        }
        _ => PermissionResult::deny("private access denied"),
    }
}

/// Read-only ledger surface exposed to contract scripts.
struct ContractHost<'a> {
    ledger: &'a Ledger,
}

impl HostEnv for ContractHost<'_> {
    fn provides(&self, name: &str) -> bool {
        matches!(
            name,
            "balance_of" | "can_afford" | "resource_of" | "principal_exists"
        )
    }

    fn call(&mut self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        let principal = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("{name}() needs a principal id"))?;
        match name {
            "balance_of" => Ok(ScriptValue::Int(self.ledger.scrip(principal))),
            "can_afford" => {
                let amount = args.get(1).and_then(|v| v.as_int()).unwrap_or(0);
                Ok(ScriptValue::Bool(self.ledger.can_afford(principal, amount)))
            }
            "resource_of" => {
                let resource = args
                    .get(1)
                    .and_then(|v| v.as_str())
                    .ok_or("resource_of() needs a resource name")?;
                Ok(ScriptValue::Float(self.ledger.resource(principal, resource)))
            }
            "principal_exists" => Ok(ScriptValue::Bool(self.ledger.principal_exists(principal))),
            other => Err(format!("unknown function '{other}'")),
        }
    }
}

/// Resolves contract ids and evaluates permission checks.
pub struct ContractEngine {
    default_when_missing: String,
    limits: Limits,
}

impl ContractEngine {
    pub fn new(default_when_missing: impl Into<String>, timeout_seconds: f64) -> Self {
        Self {
            default_when_missing: default_when_missing.into(),
            limits: Limits::with_timeout_seconds(timeout_seconds),
        }
    }

    /// Check `caller` performing `action` on `artifact`.
    ///
    /// Returns the decision only; merging `state_updates` into the
    /// artifact is the caller's job (see [`apply_state_updates`])
    /// because the store may be borrowed elsewhere during the check.
    pub fn check(
        &self,
        caller: &str,
        action: PermissionAction,
        artifact: &Artifact,
        method: Option<&str>,
        args: Option<&[Value]>,
        store: &ArtifactStore,
        ledger: &Ledger,
    ) -> PermissionResult {
        let mut context = Map::new();
        context.insert(
            "target_created_by".to_string(),
            Value::from(artifact.created_by.clone()),
        );
        context.insert(
            "target_metadata".to_string(),
            Value::Object(artifact.metadata.clone()),
        );
        context.insert(
            "_artifact_state".to_string(),
            Value::Object(artifact.auth_state.clone()),
        );
        if let Some(method) = method {
            context.insert("method".to_string(), Value::from(method));
        }
        if let Some(args) = args {
            context.insert("args".to_string(), Value::Array(args.to_vec()));
        }

        let contract_id = if artifact.access_contract_id.is_empty() {
            self.default_when_missing.as_str()
        } else {
            artifact.access_contract_id.as_str()
        };
        self.dispatch(contract_id, caller, action, &artifact.id, &context, store, ledger)
    }

    fn dispatch(
        &self,
        contract_id: &str,
        caller: &str,
        action: PermissionAction,
        target: &str,
        context: &Map<String, Value>,
        store: &ArtifactStore,
        ledger: &Ledger,
    ) -> PermissionResult {
        match contract_id {
            KERNEL_CONTRACT_FREEWARE | KERNEL_CONTRACT_TRANSFERABLE_FREEWARE => {
                check_freeware(caller, action, context)
            }
            KERNEL_CONTRACT_SELF_OWNED => check_self_owned(caller, target, context),
            KERNEL_CONTRACT_PRIVATE => check_private(caller, context),
            KERNEL_CONTRACT_PUBLIC => PermissionResult::allow("public access"),
            other => {
                if let Some(contract) = store.get(other) {
                    if contract.executable && script_defines_check(&contract.code) {
                        return self.run_script_contract(
                            &contract.code,
                            caller,
                            action,
                            target,
                            context,
                            ledger,
                        );
                    }
                }
                // Unresolvable contract id: fall back to the default.
                if self.default_when_missing != other
                    && KERNEL_CONTRACT_IDS.contains(&self.default_when_missing.as_str())
                {
                    self.dispatch(
                        &self.default_when_missing.clone(),
                        caller,
                        action,
                        target,
                        context,
                        store,
                        ledger,
                    )
                } else {
                    check_freeware(caller, action, context)
                }
            }
        }
    }

    fn run_script_contract(
        &self,
        code: &str,
        caller: &str,
        action: PermissionAction,
        target: &str,
        context: &Map<String, Value>,
        ledger: &Ledger,
    ) -> PermissionResult {
        let mut host = ContractHost { ledger };
        let executor = Executor::new(self.limits);
        let args = vec![
            ScriptValue::Str(caller.to_string()),
            ScriptValue::Str(action.as_str().to_string()),
            ScriptValue::Str(target.to_string()),
            ScriptValue::from_json(&Value::Object(context.clone())),
        ];
        let outcome = executor.execute(code, ENTRY_CHECK_PERMISSION, args, &mut host);
        if !outcome.success {
            let reason = outcome
                .error
                .unwrap_or_else(|| "contract execution failed".to_string());
            warn!(target_id = target, %reason, "contract evaluation failed");
            return PermissionResult::deny(format!("contract error: {reason}"));
        }
        let Value::Object(raw) = outcome.result else {
            return PermissionResult::deny("contract returned non-map");
        };
        PermissionResult {
            allowed: raw.get("allowed").and_then(Value::as_bool).unwrap_or(false),
            reason: raw
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("contract decision")
                .to_string(),
            scrip_cost: raw.get("scrip_cost").and_then(Value::as_i64).unwrap_or(0),
            scrip_payer: raw
                .get("scrip_payer")
                .and_then(Value::as_str)
                .map(str::to_string),
            scrip_recipient: raw
                .get("scrip_recipient")
                .and_then(Value::as_str)
                .map(str::to_string),
            resource_payer: raw
                .get("resource_payer")
                .and_then(Value::as_str)
                .map(str::to_string),
            state_updates: raw
                .get("state_updates")
                .and_then(Value::as_object)
                .cloned(),
            conditions: raw.get("conditions").and_then(Value::as_object).cloned(),
        }
    }
}

fn script_defines_check(code: &str) -> bool {
    agora_sandbox::parser::parse(code)
        .map(|program| program.defines(ENTRY_CHECK_PERMISSION))
        .unwrap_or(false)
}

/// Merge a decision's `state_updates` into the target artifact.
pub fn apply_state_updates(
    store: &mut ArtifactStore,
    artifact_id: &str,
    result: &PermissionResult,
) {
    if let Some(updates) = &result.state_updates {
        if let Some(artifact) = store.get_mut(artifact_id) {
            for (key, value) in updates {
                artifact.auth_state.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_ledger::RateTracker;
    use agora_store::WriteRequest;

    fn world() -> (ArtifactStore, Ledger, ContractEngine) {
        (
            ArtifactStore::new(),
            Ledger::new(RateTracker::new(60.0)),
            ContractEngine::new(KERNEL_CONTRACT_FREEWARE, 2.0),
        )
    }

    fn write(store: &mut ArtifactStore, id: &str, by: &str, contract: &str) {
        store
            .write(
                id,
                by,
                WriteRequest {
                    artifact_type: "generic".to_string(),
                    content: "x".to_string(),
                    access_contract_id: Some(contract.to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn freeware_open_read_writer_only_modify() {
        let (mut store, ledger, engine) = world();
        write(&mut store, "doc_1", "alpha_1", KERNEL_CONTRACT_FREEWARE);
        let artifact = store.get("doc_1").unwrap().clone();

        let read = engine.check(
            "alpha_2",
            PermissionAction::Read,
            &artifact,
            None,
            None,
            &store,
            &ledger,
        );
        assert!(read.allowed);
        assert_eq!(read.scrip_recipient.as_deref(), Some("alpha_1"));

        let write_other = engine.check(
            "alpha_2",
            PermissionAction::Write,
            &artifact,
            None,
            None,
            &store,
            &ledger,
        );
        assert!(!write_other.allowed);

        let write_owner = engine.check(
            "alpha_1",
            PermissionAction::Write,
            &artifact,
            None,
            None,
            &store,
            &ledger,
        );
        assert!(write_owner.allowed);
    }

    #[test]
    fn private_only_principal() {
        let (mut store, ledger, engine) = world();
        write(&mut store, "svc_1", "alpha_1", KERNEL_CONTRACT_PRIVATE);
        let artifact = store.get("svc_1").unwrap().clone();

        assert!(
            engine
                .check(
                    "alpha_1",
                    PermissionAction::Invoke,
                    &artifact,
                    None,
                    None,
                    &store,
                    &ledger
                )
                .allowed
        );
        assert!(
            !engine
                .check(
                    "alpha_2",
                    PermissionAction::Invoke,
                    &artifact,
                    None,
                    None,
                    &store,
                    &ledger
                )
                .allowed
        );
    }

    #[test]
    fn self_owned_allows_the_artifact_itself() {
        let (mut store, ledger, engine) = world();
        write(&mut store, "agent_1", "alpha_1", KERNEL_CONTRACT_SELF_OWNED);
        let artifact = store.get("agent_1").unwrap().clone();

        assert!(
            engine
                .check(
                    "agent_1",
                    PermissionAction::Write,
                    &artifact,
                    None,
                    None,
                    &store,
                    &ledger
                )
                .allowed
        );
        assert!(
            !engine
                .check(
                    "alpha_2",
                    PermissionAction::Read,
                    &artifact,
                    None,
                    None,
                    &store,
                    &ledger
                )
                .allowed
        );
    }

    #[test]
    fn script_contract_runs_with_ledger_builtins() {
        let (mut store, mut ledger, engine) = world();
        ledger.create_principal("alpha_rich", 100, &[]);
        ledger.create_principal("alpha_poor", 1, &[]);

        store
            .write(
                "toll_contract",
                "alpha_1",
                WriteRequest {
                    artifact_type: "contract".to_string(),
                    executable: true,
                    code: r#"
                        fn check_permission(caller, action, target, context) {
                            if can_afford(caller, 10) {
                                return { "allowed": true, "reason": "solvent",
                                         "scrip_cost": 10, "state_updates": { "last_caller": caller } };
                            }
                            return { "allowed": false, "reason": "too poor" };
                        }
                    "#
                    .to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        write(&mut store, "gated", "alpha_1", "toll_contract");
        let artifact = store.get("gated").unwrap().clone();

        let rich = engine.check(
            "alpha_rich",
            PermissionAction::Read,
            &artifact,
            None,
            None,
            &store,
            &ledger,
        );
        assert!(rich.allowed);
        assert_eq!(rich.scrip_cost, 10);
        apply_state_updates(&mut store, "gated", &rich);
        assert_eq!(
            store.get("gated").unwrap().auth_state["last_caller"],
            "alpha_rich"
        );

        let poor = engine.check(
            "alpha_poor",
            PermissionAction::Read,
            &artifact,
            None,
            None,
            &store,
            &ledger,
        );
        assert!(!poor.allowed);
        assert_eq!(poor.reason, "too poor");
    }

    #[test]
    fn broken_script_contract_denies() {
        let (mut store, ledger, engine) = world();
        store
            .write(
                "bad_contract",
                "alpha_1",
                WriteRequest {
                    executable: true,
                    code: "fn check_permission(c, a, t, ctx) { return 1 / 0; }".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        write(&mut store, "gated", "alpha_1", "bad_contract");
        let artifact = store.get("gated").unwrap().clone();

        let result = engine.check(
            "alpha_2",
            PermissionAction::Read,
            &artifact,
            None,
            None,
            &store,
            &ledger,
        );
        assert!(!result.allowed);
        assert!(result.reason.starts_with("contract error"));
    }

    #[test]
    fn unknown_contract_falls_back_to_default() {
        let (mut store, ledger, engine) = world();
        write(&mut store, "doc_1", "alpha_1", "no_such_contract");
        let artifact = store.get("doc_1").unwrap().clone();

        // Default is freeware: open reads, writer-only writes.
        assert!(
            engine
                .check(
                    "alpha_2",
                    PermissionAction::Read,
                    &artifact,
                    None,
                    None,
                    &store,
                    &ledger
                )
                .allowed
        );
        assert!(
            !engine
                .check(
                    "alpha_2",
                    PermissionAction::Delete,
                    &artifact,
                    None,
                    None,
                    &store,
                    &ledger
                )
                .allowed
        );
    }
}
