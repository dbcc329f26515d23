//! Script runtime for executable artifacts
//!
//! Artifact code runs in a closed interpreter with no ambient I/O:
//! scripts can only touch the world through host functions the kernel
//! injects for that specific run. Enforcement is portable by
//! construction: an instruction-fuel budget bounds work, a wall-clock
//! deadline bounds elapsed time, and the fuel count doubles as the
//! CPU charge so compute is billed without billing I/O wait.
//!
//! Entry points mirror the artifact calling convention:
//! - `handle_request(caller, method, args)` when defined,
//! - else `run(args…)`,
//! - contracts implement `check_permission(caller, action, target, context)`.

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

pub use eval::{EvalError, HostEnv, NoHost};
pub use value::ScriptValue;

use std::time::{Duration, Instant};

use serde_json::Value as Json;
use thiserror::Error;

use ast::Program;

/// Fuel units billed as one second of CPU.
pub const FUEL_PER_CPU_SECOND: f64 = 4_000_000.0;

pub const ENTRY_RUN: &str = "run";
pub const ENTRY_HANDLE_REQUEST: &str = "handle_request";
pub const ENTRY_CHECK_PERMISSION: &str = "check_permission";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty code")]
    Empty,
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("code must define run(), handle_request(), or check_permission()")]
    NoEntryPoint,
}

/// Parse and check that the code exposes a callable entry point.
pub fn validate(code: &str) -> Result<Program, ValidationError> {
    if code.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let program = parser::parse(code).map_err(ValidationError::Syntax)?;
    if !program.defines(ENTRY_RUN)
        && !program.defines(ENTRY_HANDLE_REQUEST)
        && !program.defines(ENTRY_CHECK_PERMISSION)
    {
        return Err(ValidationError::NoEntryPoint);
    }
    Ok(program)
}

/// Per-run resource limits.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_fuel: u64,
    pub timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_fuel: 2_000_000,
            timeout: Duration::from_secs(5),
        }
    }
}

impl Limits {
    pub fn with_timeout_seconds(seconds: f64) -> Self {
        Self {
            timeout: Duration::from_secs_f64(seconds.max(0.1)),
            ..Self::default()
        }
    }
}

/// What one execution did, successful or not. `cpu_seconds` derives
/// from fuel and is what the kernel bills against the CPU rate window.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub result: Json,
    pub error: Option<String>,
    pub wall_ms: f64,
    pub cpu_seconds: f64,
    pub fuel_used: u64,
}

impl ExecOutcome {
    fn failure(error: String, wall_ms: f64, fuel_used: u64) -> Self {
        Self {
            success: false,
            result: Json::Null,
            error: Some(error),
            wall_ms,
            cpu_seconds: fuel_used as f64 / FUEL_PER_CPU_SECOND,
            fuel_used,
        }
    }
}

/// JSON-looking string args are decoded before they reach the script,
/// so callers can pass structured payloads through string transports.
pub fn parse_json_args(args: &[Json]) -> Vec<ScriptValue> {
    args.iter()
        .map(|arg| {
            if let Json::String(s) = arg {
                let trimmed = s.trim();
                if (trimmed.starts_with('{') && trimmed.ends_with('}'))
                    || (trimmed.starts_with('[') && trimmed.ends_with(']'))
                {
                    if let Ok(parsed) = serde_json::from_str::<Json>(trimmed) {
                        return ScriptValue::from_json(&parsed);
                    }
                }
            }
            ScriptValue::from_json(arg)
        })
        .collect()
}

/// Runs validated artifact code under limits with an injected host.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor {
    pub limits: Limits,
}

impl Executor {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// Pick the conventional entry point for an invocation.
    pub fn select_entry(program: &Program, method: &str) -> String {
        if program.defines(ENTRY_HANDLE_REQUEST) {
            ENTRY_HANDLE_REQUEST.to_string()
        } else if program.defines(method) {
            method.to_string()
        } else {
            ENTRY_RUN.to_string()
        }
    }

    pub fn execute(
        &self,
        code: &str,
        entry: &str,
        args: Vec<ScriptValue>,
        host: &mut dyn HostEnv,
    ) -> ExecOutcome {
        let started = Instant::now();
        let program = match validate(code) {
            Ok(program) => program,
            Err(err) => return ExecOutcome::failure(err.to_string(), 0.0, 0),
        };
        if !program.defines(entry) {
            return ExecOutcome::failure(format!("entry point '{entry}' not found"), 0.0, 0);
        }

        let deadline = started + self.limits.timeout;
        let mut interp =
            eval::Interpreter::new(&program, host, deadline, self.limits.max_fuel);

        let outcome = interp
            .run_top_level()
            .and_then(|_| interp.call_function(entry, args));
        let fuel_used = interp.fuel_used;
        let wall_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => ExecOutcome {
                success: true,
                result: result.to_json(),
                error: None,
                wall_ms,
                cpu_seconds: fuel_used as f64 / FUEL_PER_CPU_SECOND,
                fuel_used,
            },
            Err(EvalError::Runtime(message)) => {
                ExecOutcome::failure(format!("runtime error: {message}"), wall_ms, fuel_used)
            }
            Err(err) => ExecOutcome::failure(err.to_string(), wall_ms, fuel_used),
        }
    }
}
