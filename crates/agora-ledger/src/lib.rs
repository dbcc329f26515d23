//! Scrip ledger and resource pools
//!
//! Invariants:
//! - Scrip balances never go negative; every deduction is checked
//!   before mutation and transfers are all-or-nothing.
//! - UBI distribution hands out exactly the requested amount, split
//!   over non-system principals in sorted order with the remainder
//!   going to the first few.
//! - Float resource pools (llm_budget, disk bytes) follow the same
//!   check-then-spend discipline.

pub mod rates;

pub use rates::{Clock, RateTracker, SystemClock};

use std::collections::BTreeMap;

use serde_json::{json, Value};

use agora_types::Scrip;

/// Prefix marking kernel-owned principals that never receive UBI.
pub const SYSTEM_PREFIX: &str = "SYSTEM";

/// Resource pool name for LLM spend budgets.
pub const LLM_BUDGET: &str = "llm_budget";

/// In-memory balances for every principal in the world.
///
/// Sorted maps keep snapshots and UBI payouts deterministic.
pub struct Ledger {
    rates: RateTracker,
    scrip: BTreeMap<String, Scrip>,
    resources: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Ledger {
    pub fn new(rates: RateTracker) -> Self {
        Self {
            rates,
            scrip: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn rates(&mut self) -> &mut RateTracker {
        &mut self.rates
    }

    pub fn create_principal(
        &mut self,
        principal_id: &str,
        starting_scrip: Scrip,
        starting_resources: &[(&str, f64)],
    ) {
        self.scrip
            .entry(principal_id.to_string())
            .or_insert(starting_scrip);
        let pools = self.resources.entry(principal_id.to_string()).or_default();
        for (name, value) in starting_resources {
            pools.insert((*name).to_string(), *value);
        }
    }

    pub fn principal_exists(&self, principal_id: &str) -> bool {
        self.scrip.contains_key(principal_id) || self.resources.contains_key(principal_id)
    }

    pub fn ensure_principal(&mut self, principal_id: &str) {
        self.scrip.entry(principal_id.to_string()).or_insert(0);
        self.resources.entry(principal_id.to_string()).or_default();
    }

    // ---- scrip ----

    pub fn scrip(&self, principal_id: &str) -> Scrip {
        self.scrip.get(principal_id).copied().unwrap_or(0)
    }

    pub fn all_scrip(&self) -> &BTreeMap<String, Scrip> {
        &self.scrip
    }

    pub fn can_afford(&self, principal_id: &str, amount: Scrip) -> bool {
        self.scrip(principal_id) >= amount
    }

    pub fn credit(&mut self, principal_id: &str, amount: Scrip) {
        self.ensure_principal(principal_id);
        if let Some(balance) = self.scrip.get_mut(principal_id) {
            *balance += amount;
        }
    }

    /// False (and no mutation) on negative amounts or insufficient
    /// balance.
    pub fn deduct(&mut self, principal_id: &str, amount: Scrip) -> bool {
        if amount < 0 || !self.can_afford(principal_id, amount) {
            return false;
        }
        if let Some(balance) = self.scrip.get_mut(principal_id) {
            *balance -= amount;
            true
        } else {
            false
        }
    }

    /// Atomic move between principals; the credit only happens after
    /// the deduction succeeds.
    pub fn transfer(&mut self, from_id: &str, to_id: &str, amount: Scrip) -> bool {
        if amount <= 0 {
            return false;
        }
        if !self.deduct(from_id, amount) {
            return false;
        }
        self.credit(to_id, amount);
        true
    }

    /// Split `amount` evenly over all non-system principals except
    /// `exclude`, remainder to the first recipients in sorted order.
    /// Returns the payout map; its values always sum to `amount` when
    /// any recipient exists.
    pub fn distribute_ubi(
        &mut self,
        amount: Scrip,
        exclude: Option<&str>,
    ) -> BTreeMap<String, Scrip> {
        let recipients: Vec<String> = self
            .scrip
            .keys()
            .filter(|pid| !pid.starts_with(SYSTEM_PREFIX))
            .filter(|pid| Some(pid.as_str()) != exclude)
            .cloned()
            .collect();
        let mut payout = BTreeMap::new();
        if amount <= 0 || recipients.is_empty() {
            return payout;
        }
        let per = amount / recipients.len() as Scrip;
        let rem = amount % recipients.len() as Scrip;
        for (idx, pid) in recipients.iter().enumerate() {
            let share = per + if (idx as Scrip) < rem { 1 } else { 0 };
            if share > 0 {
                self.credit(pid, share);
                payout.insert(pid.clone(), share);
            }
        }
        payout
    }

    // ---- float resource pools ----

    pub fn resource(&self, principal_id: &str, resource: &str) -> f64 {
        self.resources
            .get(principal_id)
            .and_then(|pools| pools.get(resource))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn set_resource(&mut self, principal_id: &str, resource: &str, amount: f64) {
        self.ensure_principal(principal_id);
        if let Some(pools) = self.resources.get_mut(principal_id) {
            pools.insert(resource.to_string(), amount);
        }
    }

    pub fn credit_resource(&mut self, principal_id: &str, resource: &str, amount: f64) {
        let current = self.resource(principal_id, resource);
        self.set_resource(principal_id, resource, current + amount);
    }

    pub fn can_spend_resource(&self, principal_id: &str, resource: &str, amount: f64) -> bool {
        self.resource(principal_id, resource) >= amount
    }

    pub fn spend_resource(&mut self, principal_id: &str, resource: &str, amount: f64) -> bool {
        if amount < 0.0 || !self.can_spend_resource(principal_id, resource, amount) {
            return false;
        }
        let current = self.resource(principal_id, resource);
        self.set_resource(principal_id, resource, current - amount);
        true
    }

    pub fn transfer_resource(
        &mut self,
        from_id: &str,
        to_id: &str,
        resource: &str,
        amount: f64,
    ) -> bool {
        if amount <= 0.0 {
            return false;
        }
        if !self.spend_resource(from_id, resource, amount) {
            return false;
        }
        self.credit_resource(to_id, resource, amount);
        true
    }

    pub fn all_resources(&self, principal_id: &str) -> BTreeMap<String, f64> {
        self.resources
            .get(principal_id)
            .cloned()
            .unwrap_or_default()
    }

    // ---- llm budget ----

    pub fn llm_budget(&self, principal_id: &str) -> f64 {
        self.resource(principal_id, LLM_BUDGET)
    }

    pub fn can_afford_llm_call(&self, principal_id: &str, estimated_cost: f64) -> bool {
        self.llm_budget(principal_id) >= estimated_cost
    }

    pub fn deduct_llm_cost(&mut self, principal_id: &str, actual_cost: f64) -> bool {
        self.spend_resource(principal_id, LLM_BUDGET, actual_cost)
    }

    // ---- rate-limited resources ----

    pub fn check_resource_capacity(
        &mut self,
        principal_id: &str,
        resource: &str,
        amount: f64,
    ) -> bool {
        self.rates.has_capacity(principal_id, resource, amount)
    }

    pub fn consume_resource(&mut self, principal_id: &str, resource: &str, amount: f64) -> bool {
        self.rates.consume(principal_id, resource, amount)
    }

    pub fn refund_resource_usage(
        &mut self,
        principal_id: &str,
        resource: &str,
        amount: f64,
    ) -> bool {
        self.rates.refund(principal_id, resource, amount)
    }

    pub fn resource_remaining(&mut self, principal_id: &str, resource: &str) -> f64 {
        self.rates.remaining(principal_id, resource)
    }

    /// Snapshot of every principal's scrip and resource pools, for
    /// queries and the periodic summary event.
    pub fn all_balances(&self) -> Value {
        let mut out = serde_json::Map::new();
        let mut principals: Vec<&String> =
            self.scrip.keys().chain(self.resources.keys()).collect();
        principals.sort();
        principals.dedup();
        for pid in principals {
            out.insert(
                pid.clone(),
                json!({
                    "scrip": self.scrip(pid),
                    "resources": self.all_resources(pid),
                }),
            );
        }
        Value::Object(out)
    }
}
