//! Agora Types - Canonical domain types for the Agora kernel
//!
//! This crate contains the foundational types of the kernel with zero
//! dependencies on other agora crates:
//!
//! - Action intents (the closed set of mediated actions)
//! - Action results with structured error codes
//! - Permission results returned by access contracts
//! - The JSON payload parser that turns agent output into typed intents
//!
//! # Architectural Invariants
//!
//! 1. Every external mutation of kernel state arrives as an `ActionIntent`
//! 2. Malformed payloads are rejected with a descriptive string, never a panic
//! 3. Error codes carry a category and a retriability flag the caller can
//!    use for backoff decisions

pub mod error;
pub mod intent;
pub mod parse;
pub mod permission;
pub mod result;

pub use error::*;
pub use intent::*;
pub use parse::*;
pub use permission::*;
pub use result::*;

/// Scrip is the kernel's integer unit of account.
pub type Scrip = i64;
