//! LLM completion syscall
//!
//! Model calls are metered three ways at once: a spendable budget
//! (estimated up front, reconciled against the provider's actual cost),
//! a call-count rate window, and a token rate window. Reservations are
//! taken before the call and unwound on failure, so a failed call costs
//! nothing. Cache hits refund the call slot and cost nothing.

use std::time::Instant;

use serde_json::{json, Value};

use agora_ledger::LLM_BUDGET;
use agora_llm::{CompletionRequest, Message};

use crate::{obj, World};

const MIN_ESTIMATED_COST: f64 = 0.0002;
const COST_PER_KILOTOKEN: f64 = 0.003;

fn messages_from_json(messages: &[Value]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| {
            let content = m
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match m.get("role").and_then(Value::as_str) {
                Some("system") => Message::system(content),
                Some("assistant") => Message::assistant(content),
                _ => Message::user(content),
            }
        })
        .collect()
}

impl World {
    /// Run one completion on behalf of `payer_id`, charging its budget
    /// and rate windows. Always returns a JSON payload with `success`.
    pub fn call_llm_as_syscall(
        &mut self,
        payer_id: &str,
        model: &str,
        messages: &[Value],
    ) -> Value {
        let allowed = &self.config.llm.allowed_models;
        if !allowed.is_empty() && !allowed.iter().any(|m| m == model) {
            return json!({
                "success": false,
                "error": format!("model '{model}' is not allowed"),
                "error_code": "model_not_allowed",
            });
        }

        let request = CompletionRequest::new(model, messages_from_json(messages));
        let estimated_tokens = request.estimate_tokens();
        let estimated_cost =
            (estimated_tokens as f64 / 1000.0 * COST_PER_KILOTOKEN).max(MIN_ESTIMATED_COST);

        if !self.ledger.can_afford_llm_call(payer_id, estimated_cost) {
            return json!({
                "success": false,
                "error": format!(
                    "insufficient llm budget: estimated cost {estimated_cost:.6}, budget {:.6}",
                    self.ledger.llm_budget(payer_id)
                ),
                "error_code": "insufficient_budget",
                "estimated_cost": estimated_cost,
                "budget": self.ledger.llm_budget(payer_id),
            });
        }
        if !self.ledger.deduct_llm_cost(payer_id, estimated_cost) {
            return json!({
                "success": false,
                "error": "failed to reserve llm_budget",
                "error_code": "insufficient_budget",
            });
        }

        if !self.ledger.consume_resource(payer_id, "llm_calls", 1.0) {
            self.ledger
                .credit_resource(payer_id, LLM_BUDGET, estimated_cost);
            let retry = self
                .ledger
                .rates()
                .time_until_capacity(payer_id, "llm_calls", 1.0);
            return json!({
                "success": false,
                "error": "llm_calls rate limit exceeded",
                "error_code": "rate_limited",
                "retry_after_seconds": retry,
            });
        }
        if !self
            .ledger
            .consume_resource(payer_id, "llm_tokens", estimated_tokens as f64)
        {
            self.ledger.refund_resource_usage(payer_id, "llm_calls", 1.0);
            self.ledger
                .credit_resource(payer_id, LLM_BUDGET, estimated_cost);
            let retry = self.ledger.rates().time_until_capacity(
                payer_id,
                "llm_tokens",
                estimated_tokens as f64,
            );
            return json!({
                "success": false,
                "error": "llm_tokens rate limit exceeded",
                "error_code": "rate_limited",
                "retry_after_seconds": retry,
            });
        }

        let started = Instant::now();
        let response = self.provider.complete(&request);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                self.ledger.refund_resource_usage(payer_id, "llm_calls", 1.0);
                self.ledger.refund_resource_usage(
                    payer_id,
                    "llm_tokens",
                    estimated_tokens as f64,
                );
                self.ledger
                    .credit_resource(payer_id, LLM_BUDGET, estimated_cost);
                let event = json!({
                    "event_number": self.event_number,
                    "payer_id": payer_id,
                    "model": model,
                    "error": error.to_string(),
                    "duration_ms": duration_ms,
                });
                self.log.log("llm_syscall_error", obj(event));
                return json!({
                    "success": false,
                    "error": format!("llm call failed: {error}"),
                    "error_code": "llm_error",
                    "duration_ms": duration_ms,
                });
            }
        };

        let (actual_tokens, actual_cost) = if response.cache_hit {
            self.ledger.refund_resource_usage(payer_id, "llm_calls", 1.0);
            (0u64, 0.0f64)
        } else {
            (response.usage.total_tokens, response.cost)
        };

        // Token reconciliation against the up-front estimate.
        if actual_tokens < estimated_tokens {
            self.ledger.refund_resource_usage(
                payer_id,
                "llm_tokens",
                (estimated_tokens - actual_tokens) as f64,
            );
        } else if actual_tokens > estimated_tokens {
            let extra = (actual_tokens - estimated_tokens) as f64;
            if !self.ledger.consume_resource(payer_id, "llm_tokens", extra) {
                let event = json!({
                    "event_number": self.event_number,
                    "payer_id": payer_id,
                    "model": model,
                    "estimated_tokens": estimated_tokens,
                    "actual_tokens": actual_tokens,
                    "extra_tokens": actual_tokens - estimated_tokens,
                });
                self.log.log("llm_syscall_token_overage", obj(event));
            }
        }

        // Budget reconciliation. Undercharge is possible when the
        // payer cannot cover an overrun; it is reported, not clawed
        // back later.
        let (charged_cost, undercharged_cost) = if actual_cost <= estimated_cost {
            self.ledger
                .credit_resource(payer_id, LLM_BUDGET, estimated_cost - actual_cost);
            (actual_cost, 0.0)
        } else {
            let extra = actual_cost - estimated_cost;
            let charge_extra = extra.min(self.ledger.llm_budget(payer_id));
            self.ledger.deduct_llm_cost(payer_id, charge_extra);
            (estimated_cost + charge_extra, extra - charge_extra)
        };

        let usage = json!({
            "prompt_tokens": response.usage.prompt_tokens,
            "completion_tokens": response.usage.completion_tokens,
            "total_tokens": response.usage.total_tokens,
        });
        let event = json!({
            "event_number": self.event_number,
            "payer_id": payer_id,
            "model": model,
            "actual_cost": actual_cost,
            "charged_cost": charged_cost,
            "cache_hit": response.cache_hit,
            "undercharged_cost": undercharged_cost,
            "duration_ms": duration_ms,
            "tokens": usage,
        });
        self.log.log("llm_syscall", obj(event));

        json!({
            "success": true,
            "content": response.content,
            "model": response.model.unwrap_or_else(|| model.to_string()),
            "cost": actual_cost,
            "charged_cost": charged_cost,
            "cache_hit": response.cache_hit,
            "undercharged_cost": undercharged_cost,
            "usage": usage,
            "duration_ms": duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::world;
    use crate::WorldConfig;
    use agora_audit::MemoryEventLog;
    use agora_llm::FailingProvider;
    use std::sync::Arc;

    fn ask(w: &mut crate::World, payer: &str) -> Value {
        w.call_llm_as_syscall(
            payer,
            "deterministic",
            &[json!({ "role": "user", "content": "what should I build next?" })],
        )
    }

    #[test]
    fn successful_call_charges_actual_cost() {
        let mut w = world();
        let before = w.ledger.llm_budget("alpha_1");
        let payload = ask(&mut w, "alpha_1");
        assert_eq!(payload["success"], true, "{payload}");
        assert!(payload["content"].as_str().is_some());
        let charged = payload["charged_cost"].as_f64().unwrap();
        let after = w.ledger.llm_budget("alpha_1");
        assert!((before - after - charged).abs() < 1e-9);
        assert_eq!(w.ledger.resource_remaining("alpha_1", "llm_calls"), 119.0);
    }

    #[test]
    fn repeat_call_is_a_free_cache_hit() {
        let mut w = world();
        ask(&mut w, "alpha_1");
        let after_first = w.ledger.llm_budget("alpha_1");
        let calls_after_first = w.ledger.resource_remaining("alpha_1", "llm_calls");

        let payload = ask(&mut w, "alpha_1");
        assert_eq!(payload["cache_hit"], true);
        assert_eq!(payload["charged_cost"], 0.0);
        assert!((w.ledger.llm_budget("alpha_1") - after_first).abs() < 1e-9);
        // The reserved call slot was refunded.
        assert_eq!(
            w.ledger.resource_remaining("alpha_1", "llm_calls"),
            calls_after_first
        );
    }

    #[test]
    fn disallowed_model_is_rejected_before_any_charge() {
        let mut w = world();
        w.config.llm.allowed_models = vec!["deterministic".to_string()];
        let payload = w.call_llm_as_syscall(
            "alpha_1",
            "frontier-9000",
            &[json!({ "role": "user", "content": "hi" })],
        );
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error_code"], "model_not_allowed");
        assert!((w.ledger.llm_budget("alpha_1") - 2.0).abs() < 1e-9);
    }

    #[test]
    fn exhausted_budget_is_a_distinct_failure() {
        let mut w = world();
        w.ledger.set_resource("alpha_1", LLM_BUDGET, 0.0);
        let payload = ask(&mut w, "alpha_1");
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error_code"], "insufficient_budget");
    }

    #[test]
    fn provider_failure_refunds_every_reservation() {
        let mut w = crate::World::new(
            WorldConfig::default(),
            Arc::new(FailingProvider),
            Box::new(MemoryEventLog::default()),
            "run_test",
        );
        let payload = ask(&mut w, "alpha_1");
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error_code"], "llm_error");
        assert!((w.ledger.llm_budget("alpha_1") - 2.0).abs() < 1e-9);
        assert_eq!(w.ledger.resource_remaining("alpha_1", "llm_calls"), 120.0);
        assert_eq!(
            w.ledger.resource_remaining("alpha_1", "llm_tokens"),
            200_000.0
        );
    }

    #[test]
    fn call_rate_limit_reports_retry_after() {
        let mut w = world();
        w.ledger.rates().configure_limit("llm_calls", 1.0);
        ask(&mut w, "alpha_1");
        let payload = w.call_llm_as_syscall(
            "alpha_1",
            "deterministic",
            &[json!({ "role": "user", "content": "a different prompt entirely" })],
        );
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error_code"], "rate_limited");
        assert!(payload["retry_after_seconds"].as_f64().is_some());
        // The budget reservation was returned.
        let spent_once = w.ledger.llm_budget("alpha_1");
        assert!(spent_once > 2.0 - 0.001);
    }
}
