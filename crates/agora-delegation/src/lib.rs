//! Charge delegation
//!
//! An artifact invocation can bill its invoke price and resource use
//! to someone other than the caller. Delegations are standing grants
//! from a payer to a charger, optionally bounded by expiry, a
//! per-call cap, and a rolling-window cap.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use agora_store::Artifact;

const DEFAULT_WINDOW_SECONDS: u64 = 3600;

/// One standing grant from a payer to a charger.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationEntry {
    pub charger_id: String,
    pub max_per_call: Option<f64>,
    pub max_per_window: Option<f64>,
    pub window_seconds: u64,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ChargeRecord {
    timestamp: f64,
    amount: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported charge_to directive: {0}")]
pub struct InvalidChargeDirective(pub String);

/// Who pays for a charge, per the caller's `charge_to` directive.
///
/// `target` and `contract` resolve through the artifact's auth_state
/// (`principal`, then `writer`, then owner); `pool:<id>` names a
/// shared pool principal directly.
pub fn resolve_payer(
    charge_to: &str,
    caller_id: &str,
    target: &Artifact,
) -> Result<String, InvalidChargeDirective> {
    match charge_to {
        "caller" => Ok(caller_id.to_string()),
        "target" | "contract" => Ok(target.auth_principal().to_string()),
        other => {
            if let Some(pool_id) = other.strip_prefix("pool:") {
                let pool_id = pool_id.trim();
                if !pool_id.is_empty() {
                    return Ok(pool_id.to_string());
                }
            }
            Err(InvalidChargeDirective(other.to_string()))
        }
    }
}

/// Standing delegations plus a bounded per-pair charge history used
/// for window-cap checks.
pub struct DelegationManager {
    entries_by_payer: HashMap<String, HashMap<String, DelegationEntry>>,
    history: HashMap<(String, String), VecDeque<ChargeRecord>>,
    max_history: usize,
}

impl Default for DelegationManager {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DelegationManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            entries_by_payer: HashMap::new(),
            history: HashMap::new(),
            max_history,
        }
    }

    fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn grant(
        &mut self,
        payer_id: &str,
        charger_id: &str,
        max_per_call: Option<f64>,
        max_per_window: Option<f64>,
        window_seconds: Option<u64>,
        expires_at: Option<String>,
    ) {
        self.entries_by_payer
            .entry(payer_id.to_string())
            .or_default()
            .insert(
                charger_id.to_string(),
                DelegationEntry {
                    charger_id: charger_id.to_string(),
                    max_per_call,
                    max_per_window,
                    window_seconds: window_seconds.unwrap_or(DEFAULT_WINDOW_SECONDS),
                    expires_at,
                },
            );
    }

    pub fn revoke(&mut self, payer_id: &str, charger_id: &str) -> bool {
        self.entries_by_payer
            .get_mut(payer_id)
            .map(|entries| entries.remove(charger_id).is_some())
            .unwrap_or(false)
    }

    /// Whether `charger_id` may bill `amount` to `payer_id` right now.
    /// The denial reason is surfaced to the caller verbatim.
    pub fn authorize_charge(
        &mut self,
        payer_id: &str,
        charger_id: &str,
        amount: f64,
    ) -> (bool, &'static str) {
        let Some(entry) = self
            .entries_by_payer
            .get(payer_id)
            .and_then(|entries| entries.get(charger_id))
        else {
            return (false, "no delegation");
        };

        if let Some(expires_at) = &entry.expires_at {
            match DateTime::parse_from_rfc3339(expires_at) {
                Ok(expiry) => {
                    if Utc::now() >= expiry {
                        return (false, "delegation expired");
                    }
                }
                Err(_) => return (false, "invalid expires_at"),
            }
        }

        if entry.max_per_call.is_some_and(|cap| amount > cap) {
            return (false, "exceeds per-call cap");
        }

        if let Some(cap) = entry.max_per_window {
            let window = entry.window_seconds;
            let used = self.window_usage(payer_id, charger_id, window);
            if used + amount > cap {
                return (false, "exceeds window cap");
            }
        }

        (true, "ok")
    }

    pub fn record_charge(&mut self, payer_id: &str, charger_id: &str, amount: f64) {
        let bucket = self
            .history
            .entry((payer_id.to_string(), charger_id.to_string()))
            .or_default();
        bucket.push_back(ChargeRecord {
            timestamp: Self::now(),
            amount,
        });
        while bucket.len() > self.max_history {
            bucket.pop_front();
        }
    }

    fn window_usage(&mut self, payer_id: &str, charger_id: &str, window_seconds: u64) -> f64 {
        let Some(bucket) = self
            .history
            .get_mut(&(payer_id.to_string(), charger_id.to_string()))
        else {
            return 0.0;
        };
        let cutoff = Self::now() - window_seconds as f64;
        while bucket.front().is_some_and(|r| r.timestamp < cutoff) {
            bucket.pop_front();
        }
        bucket.iter().map(|r| r.amount).sum()
    }

    /// Delegations granted by one payer, for queries.
    pub fn list_for_payer(&self, payer_id: &str) -> Value {
        let delegations: Vec<Value> = self
            .entries_by_payer
            .get(payer_id)
            .map(|entries| {
                let mut items: Vec<&DelegationEntry> = entries.values().collect();
                items.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
                items
                    .into_iter()
                    .filter_map(|e| serde_json::to_value(e).ok())
                    .collect()
            })
            .unwrap_or_default();
        json!({ "payer": payer_id, "delegations": delegations })
    }
}
