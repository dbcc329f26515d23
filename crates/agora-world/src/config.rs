//! World configuration
//!
//! Every section has usable defaults so a world can be built with
//! `WorldConfig::default()`; files only need to name what they change.
//! Unknown keys are rejected so typos fail loudly at startup.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub max_consecutive_errors: u32,
    pub resource_check_interval_seconds: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            min_delay_seconds: 0.2,
            max_delay_seconds: 8.0,
            max_consecutive_errors: 5,
            resource_check_interval_seconds: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub default_duration_seconds: f64,
    pub max_runtime_seconds: f64,
    pub summary_interval_seconds: f64,
    #[serde(rename = "loop")]
    pub agent_loop: LoopConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            default_duration_seconds: 120.0,
            max_runtime_seconds: 3600.0,
            summary_interval_seconds: 15.0,
            agent_loop: LoopConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrincipalsConfig {
    pub count: u32,
    pub id_prefix: String,
    pub starting_scrip: i64,
    pub starting_llm_budget: f64,
    pub starting_disk_quota_bytes: i64,
}

impl Default for PrincipalsConfig {
    fn default() -> Self {
        Self {
            count: 3,
            id_prefix: "alpha_".to_string(),
            starting_scrip: 100,
            starting_llm_budget: 2.0,
            starting_disk_quota_bytes: 250_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitsConfig {
    pub llm_calls_per_window: f64,
    pub llm_tokens_per_window: f64,
    pub cpu_seconds_per_window: f64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            llm_calls_per_window: 120.0,
            llm_tokens_per_window: 200_000.0,
            cpu_seconds_per_window: 12.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourcesConfig {
    pub rate_window_seconds: f64,
    pub rate_limits: RateLimitsConfig,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            rate_window_seconds: 60.0,
            rate_limits: RateLimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    pub default_model: String,
    pub timeout_seconds: f64,
    /// Empty means any model.
    pub allowed_models: Vec<String>,
    pub enable_bootstrap_loop_llm: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: "deterministic".to_string(),
            timeout_seconds: 60.0,
            allowed_models: Vec::new(),
            enable_bootstrap_loop_llm: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContractsConfig {
    pub default_when_missing: String,
    pub default_for_new_artifact: String,
}

impl Default for ContractsConfig {
    fn default() -> Self {
        Self {
            default_when_missing: "kernel_contract_freeware".to_string(),
            default_for_new_artifact: "kernel_contract_freeware".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MintSettings {
    pub enabled: bool,
    pub minimum_bid: i64,
    pub first_auction_delay_seconds: f64,
    pub bidding_window_seconds: f64,
    pub period_seconds: f64,
    pub mint_ratio: i64,
}

impl Default for MintSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_bid: 1,
            first_auction_delay_seconds: 20.0,
            bidding_window_seconds: 30.0,
            period_seconds: 60.0,
            mint_ratio: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub logs_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logs_dir: "logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorldConfig {
    pub simulation: SimulationConfig,
    pub principals: PrincipalsConfig,
    pub resources: ResourcesConfig,
    pub llm: LlmConfig,
    pub contracts: ContractsConfig,
    pub mint: MintSettings,
    pub logging: LoggingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_stand_alone() {
        let config = WorldConfig::default();
        assert_eq!(config.principals.count, 3);
        assert_eq!(config.principals.id_prefix, "alpha_");
        assert_eq!(config.principals.starting_scrip, 100);
        assert_eq!(config.resources.rate_limits.cpu_seconds_per_window, 12.0);
        assert!(config.mint.enabled);
        assert_eq!(config.mint.mint_ratio, 10);
    }

    #[test]
    fn partial_json_overrides_one_field() {
        let config: WorldConfig =
            serde_json::from_str(r#"{"principals": {"count": 5}}"#).unwrap();
        assert_eq!(config.principals.count, 5);
        assert_eq!(config.principals.starting_scrip, 100);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_str::<WorldConfig>(r#"{"principls": {}}"#);
        assert!(err.is_err());
    }
}
