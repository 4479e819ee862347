//! # strand-core
//!
//! Foundation types, errors, branded IDs, and utilities for the Strand
//! thread orchestrator.
//!
//! This crate provides the shared vocabulary that all other Strand crates
//! depend on:
//!
//! - **Branded IDs**: [`ids::ThreadId`] as a newtype over a sanitized
//!   logical name plus a time-based disambiguator
//! - **Capabilities**: [`capability::Capability`] patterns, attenuation,
//!   and permission checks
//! - **Limits**: [`limits::Limits`] and the four-layer resolution with
//!   parent clamping
//! - **Cost**: [`cost::CostTracker`] accumulating turns, tokens, spawns,
//!   and spend
//! - **Conditions**: [`condition::Condition`] trees evaluated against a
//!   JSON context document
//! - **Errors**: [`errors::StrandError`] hierarchy via `thiserror`
//! - **Retry**: [`retry::RetryConfig`] and backoff calculation
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other strand crates. No I/O.

#![deny(unsafe_code)]

pub mod capability;
pub mod condition;
pub mod cost;
pub mod errors;
pub mod ids;
pub mod limits;
pub mod logging;
pub mod retry;
