//! World kernel
//!
//! Owns all mutable state of one simulated economy: the scrip ledger,
//! the artifact store, delegation grants, the contract engine, the
//! mint auction, and the event log. Every external mutation arrives as
//! an `ActionIntent` and leaves exactly one `action` event behind.

pub mod config;

mod actions;
mod host;
mod loop_code;
mod queries;
mod services;
mod syscall;

pub use config::WorldConfig;
pub use queries::QueryError;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::info;

use agora_audit::{EventLog, SummarySnapshot};
use agora_contracts::{ContractEngine, KERNEL_CONTRACT_PRIVATE, KERNEL_CONTRACT_SELF_OWNED};
use agora_delegation::DelegationManager;
use agora_ledger::{Ledger, RateTracker, LLM_BUDGET};
use agora_llm::CompletionProvider;
use agora_mint::{MintAuction, MintConfig, MintScorer};
use agora_sandbox::Limits;
use agora_store::{ArtifactStore, WriteRequest};
use agora_types::{parse_intent, ActionIntent, ActionResult, ErrorCode};

/// Owner recorded on kernel-maintained artifacts. The prefix also
/// excludes it from UBI payouts.
pub const KERNEL_OWNER: &str = "SYSTEM_KERNEL";

/// Built-in invocable services that are not backed by artifact code.
pub const KERNEL_SERVICE_IDS: &[&str] = &[
    "kernel_act",
    "kernel_delegation",
    "kernel_mint",
    "kernel_time",
];

fn kernel_service_description(service_id: &str) -> &'static str {
    match service_id {
        "kernel_act" => "Execute kernel action payloads",
        "kernel_delegation" => "Manage charge delegation grants",
        "kernel_mint" => "Inspect and submit to the mint auction",
        "kernel_time" => "Return the current kernel clock",
        _ => "",
    }
}

/// Unwrap a `json!({...})` literal into event fields.
pub(crate) fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn generate_run_id() -> String {
    Utc::now().format("run_%Y%m%d_%H%M%S").to_string()
}

pub struct World {
    pub config: WorldConfig,
    pub run_id: String,
    pub event_number: u64,
    pub max_invoke_depth: u32,

    pub ledger: Ledger,
    pub store: ArtifactStore,
    pub delegations: DelegationManager,
    pub mint: Option<MintAuction>,
    pub log: Box<dyn EventLog>,

    contracts: ContractEngine,
    provider: Arc<dyn CompletionProvider>,
    exec_limits: Limits,

    frozen_agents: BTreeSet<String>,
    disk_quotas: BTreeMap<String, i64>,
    installed_libraries: BTreeMap<String, Vec<Value>>,
}

impl World {
    pub fn new(
        config: WorldConfig,
        provider: Arc<dyn CompletionProvider>,
        log: Box<dyn EventLog>,
        run_id: impl Into<String>,
    ) -> Self {
        let mut rates = RateTracker::new(config.resources.rate_window_seconds);
        rates.configure_limit("llm_calls", config.resources.rate_limits.llm_calls_per_window);
        rates.configure_limit(
            "llm_tokens",
            config.resources.rate_limits.llm_tokens_per_window,
        );
        rates.configure_limit(
            "cpu_seconds",
            config.resources.rate_limits.cpu_seconds_per_window,
        );

        let contracts = ContractEngine::new(
            config.contracts.default_when_missing.clone(),
            config.llm.timeout_seconds.max(3.0),
        );
        let exec_limits = Limits::with_timeout_seconds(config.llm.timeout_seconds.max(3.0));

        let mut world = Self {
            config,
            run_id: run_id.into(),
            event_number: 0,
            max_invoke_depth: 6,
            ledger: Ledger::new(rates),
            store: ArtifactStore::new(),
            delegations: DelegationManager::default(),
            mint: None,
            log,
            contracts,
            provider,
            exec_limits,
            frozen_agents: BTreeSet::new(),
            disk_quotas: BTreeMap::new(),
            installed_libraries: BTreeMap::new(),
        };

        world.bootstrap_principals();
        world.bootstrap_kernel_services();
        world.bootstrap_loop_artifacts();
        world.bootstrap_mint();

        let event = json!({
            "event_number": world.event_number,
            "run_id": world.run_id,
            "principal_count": world.principal_ids().len(),
            "artifact_count": world.store.count(),
        });
        world.log.log("world_initialized", obj(event));
        info!(run_id = %world.run_id, "world initialized");
        world
    }

    fn bootstrap_principals(&mut self) {
        for idx in 1..=self.config.principals.count {
            let principal_id = format!("{}{idx}", self.config.principals.id_prefix);
            self.ledger.create_principal(
                &principal_id,
                self.config.principals.starting_scrip,
                &[(LLM_BUDGET, self.config.principals.starting_llm_budget)],
            );
            self.set_disk_quota(&principal_id, self.config.principals.starting_disk_quota_bytes);
            self.installed_libraries
                .insert(principal_id.clone(), Vec::new());

            // Private mutable profile artifact, one per principal.
            let profile = json!({ "subscribed_artifacts": [], "context_sections": {} });
            let _ = self.store.write(
                &principal_id,
                &principal_id,
                WriteRequest {
                    artifact_type: "agent_profile".to_string(),
                    content: profile.to_string(),
                    access_contract_id: Some(KERNEL_CONTRACT_SELF_OWNED.to_string()),
                    has_standing: true,
                    ..Default::default()
                },
            );
        }
    }

    fn bootstrap_kernel_services(&mut self) {
        for service_id in KERNEL_SERVICE_IDS {
            let _ = self.store.write(
                service_id,
                KERNEL_OWNER,
                WriteRequest {
                    artifact_type: "kernel_service".to_string(),
                    content: kernel_service_description(service_id).to_string(),
                    access_contract_id: Some(KERNEL_CONTRACT_PRIVATE.to_string()),
                    owner: Some(KERNEL_OWNER.to_string()),
                    kernel_protected: true,
                    ..Default::default()
                },
            );
        }
    }

    fn bootstrap_loop_artifacts(&mut self) {
        let capabilities = if self.config.llm.enable_bootstrap_loop_llm {
            vec!["can_call_llm".to_string()]
        } else {
            Vec::new()
        };
        for (slot, principal_id) in self.principal_ids().iter().enumerate() {
            let loop_id = format!("{principal_id}_loop");
            let code = loop_code::default_loop_code(
                principal_id,
                slot as u32 + 1,
                &self.config.principals.id_prefix,
                self.config.principals.count,
                &self.config.llm.default_model,
            );
            let _ = self.store.write(
                &loop_id,
                KERNEL_OWNER,
                WriteRequest {
                    artifact_type: "agent_loop".to_string(),
                    content: format!("Autonomous loop artifact for {principal_id}"),
                    executable: true,
                    code,
                    access_contract_id: Some(KERNEL_CONTRACT_PRIVATE.to_string()),
                    has_loop: true,
                    capabilities: Some(capabilities.clone()),
                    owner: Some(principal_id.clone()),
                    kernel_protected: true,
                    ..Default::default()
                },
            );
        }
    }

    fn bootstrap_mint(&mut self) {
        if !self.config.mint.enabled {
            return;
        }
        let scorer = MintScorer::new(self.provider.clone(), self.config.llm.default_model.clone());
        self.mint = Some(MintAuction::new(
            MintConfig {
                minimum_bid: self.config.mint.minimum_bid,
                first_auction_delay_seconds: self.config.mint.first_auction_delay_seconds,
                bidding_window_seconds: self.config.mint.bidding_window_seconds,
                period_seconds: self.config.mint.period_seconds,
                mint_ratio: self.config.mint.mint_ratio,
            },
            scorer,
        ));
    }

    pub fn principal_ids(&self) -> Vec<String> {
        self.ledger.all_scrip().keys().cloned().collect()
    }

    pub fn now_iso(&self) -> String {
        Utc::now().to_rfc3339()
    }

    // ---- disk quotas ----

    pub fn set_disk_quota(&mut self, principal_id: &str, quota_bytes: i64) {
        self.disk_quotas
            .insert(principal_id.to_string(), quota_bytes.max(0));
    }

    pub fn disk_quota(&self, principal_id: &str) -> i64 {
        self.disk_quotas
            .get(principal_id)
            .copied()
            .unwrap_or(self.config.principals.starting_disk_quota_bytes)
    }

    pub fn available_disk(&self, principal_id: &str) -> i64 {
        let used = self.store.owner_usage(principal_id) as i64;
        (self.disk_quota(principal_id) - used).max(0)
    }

    pub fn principal_quotas(&mut self, principal_id: &str) -> Value {
        let disk_quota = self.disk_quota(principal_id);
        let disk_used = self.store.owner_usage(principal_id) as i64;
        let disk_available = self.available_disk(principal_id);
        let budget = self.ledger.llm_budget(principal_id);
        let calls_limit = self.ledger.rates().limit("llm_calls");
        let tokens_limit = self.ledger.rates().limit("llm_tokens");
        let cpu_limit = self.ledger.rates().limit("cpu_seconds");
        json!({
            "disk": { "quota": disk_quota, "used": disk_used, "available": disk_available },
            "llm_budget": { "balance": budget },
            "llm_calls": {
                "limit": calls_limit,
                "remaining": self.ledger.resource_remaining(principal_id, "llm_calls"),
            },
            "llm_tokens": {
                "limit": tokens_limit,
                "remaining": self.ledger.resource_remaining(principal_id, "llm_tokens"),
            },
            "cpu_seconds": {
                "limit": cpu_limit,
                "remaining": self.ledger.resource_remaining(principal_id, "cpu_seconds"),
            },
        })
    }

    // ---- frozen agents ----

    pub fn is_frozen(&self, agent_id: &str) -> bool {
        self.frozen_agents.contains(agent_id)
    }

    pub fn freeze_agent(&mut self, agent_id: &str) {
        self.frozen_agents.insert(agent_id.to_string());
    }

    pub fn unfreeze_agent(&mut self, agent_id: &str) {
        self.frozen_agents.remove(agent_id);
    }

    pub fn frozen_agents(&self) -> Vec<String> {
        self.frozen_agents.iter().cloned().collect()
    }

    pub fn installed_libraries(&self, principal_id: &str) -> Vec<Value> {
        self.installed_libraries
            .get(principal_id)
            .cloned()
            .unwrap_or_default()
    }

    // ---- action entry points ----

    /// Execute a typed intent, logging the paired `action` event.
    pub fn execute_intent(&mut self, intent: &ActionIntent, increment_event: bool) -> ActionResult {
        if increment_event {
            self.event_number += 1;
        }
        let result = self.dispatch_action(intent, 0);
        let event = json!({
            "event_number": self.event_number,
            "intent": intent.to_json(),
            "result": result.to_json(),
            "scrip_after": self.ledger.scrip(&intent.principal_id),
        });
        self.log.log("action", obj(event));
        result
    }

    /// Parse a raw JSON payload into an intent and execute it. Parse
    /// failures come back as retriable `invalid_action` results.
    pub fn execute_action_json(
        &mut self,
        principal_id: &str,
        payload: &str,
        increment_event: bool,
    ) -> ActionResult {
        match parse_intent(principal_id, payload) {
            Ok(intent) => self.execute_intent(&intent, increment_event),
            Err(message) => ActionResult::fail(message, ErrorCode::InvalidAction),
        }
    }

    pub fn execute_action_data(
        &mut self,
        principal_id: &str,
        payload: &Value,
        increment_event: bool,
    ) -> ActionResult {
        let raw = match payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.execute_action_json(principal_id, &raw, increment_event)
    }

    /// Nested invoke issued by running artifact code. The payload is
    /// the action-result JSON with `success`/`error` guaranteed.
    pub(crate) fn invoke_from_executor(
        &mut self,
        caller_id: &str,
        target_id: &str,
        method: &str,
        args: &[Value],
        depth: u32,
    ) -> Value {
        self.event_number += 1;
        let result = self.do_invoke(caller_id, target_id, method, args, depth);
        let mut payload = obj(result.to_json());
        payload
            .entry("success".to_string())
            .or_insert(Value::from(result.success));
        if !result.success {
            payload
                .entry("error".to_string())
                .or_insert(Value::from(result.message.clone()));
        }
        Value::Object(payload)
    }

    // ---- periodic upkeep ----

    /// Advance the mint schedule; at most one resolution per call.
    pub fn tick(&mut self) -> Option<Value> {
        let mint = self.mint.as_mut()?;
        let result = mint.update(
            &mut self.ledger,
            &self.store,
            self.log.as_mut(),
            self.event_number,
        )?;
        serde_json::to_value(&result).ok()
    }

    pub fn log_summary_snapshot(&mut self) {
        let action_count = self
            .log
            .read_recent(500)
            .iter()
            .filter(|e| e["event_type"] == "action")
            .count() as u64;
        let snapshot = SummarySnapshot {
            timestamp: self.now_iso(),
            event_number: self.event_number,
            action_count,
            principal_count: self.principal_ids().len(),
            artifact_count: self.store.iter().filter(|a| !a.deleted).count(),
            total_scrip: self.ledger.all_scrip().values().sum(),
        };
        self.log.log_summary(&snapshot);
    }

    /// Full state dump for operators and the end-of-run report.
    pub fn state_summary(&mut self, event_limit: usize) -> Value {
        let artifacts: Vec<Value> = self
            .store
            .iter()
            .filter(|a| !a.deleted)
            .map(|a| a.to_json(false))
            .collect();
        let quotas: Map<String, Value> = self
            .principal_ids()
            .into_iter()
            .map(|pid| {
                let quotas = self.principal_quotas(&pid);
                (pid, quotas)
            })
            .collect();
        json!({
            "run_id": self.run_id,
            "event_number": self.event_number,
            "principal_count": self.principal_ids().len(),
            "artifact_count": artifacts.len(),
            "principals": self.principal_ids(),
            "balances": self.ledger.all_balances(),
            "quotas": quotas,
            "artifacts": artifacts,
            "mint": {
                "enabled": self.mint.is_some(),
                "status": self
                    .mint
                    .as_ref()
                    .map(|m| m.status())
                    .unwrap_or_else(|| json!({ "phase": "disabled" })),
            },
            "events": self.log.read_recent(event_limit),
            "frozen": self.frozen_agents(),
        })
    }

    pub(crate) fn exec_limits(&self) -> Limits {
        self.exec_limits
    }

    pub(crate) fn contracts(&self) -> &ContractEngine {
        &self.contracts
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use agora_audit::MemoryEventLog;
    use agora_llm::DeterministicProvider;

    /// World with three principals, an in-memory log, and the
    /// deterministic provider.
    pub fn world() -> World {
        World::new(
            WorldConfig::default(),
            Arc::new(DeterministicProvider::new()),
            Box::new(MemoryEventLog::default()),
            "run_test",
        )
    }
}
