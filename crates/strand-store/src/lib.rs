//! # strand-store
//!
//! SQLite-backed persistence for the Strand orchestrator:
//!
//! - **Budget ledger** ([`ledger::BudgetLedger`]): transactionally
//!   consistent spend reservations across the thread tree. Sibling
//!   reservations against a shared parent pool are strictly serialized.
//! - **Thread registry** ([`registry::ThreadRegistry`]): the durable
//!   per-thread record (status, limits, capabilities, cost, continuation
//!   pointers) that audit tooling and cross-process waiters read.
//! - **Journal** ([`journal::Journal`]): append-only per-thread event log
//!   from which conversations are reconstructed for resume and trailing
//!   windows are selected for handoff.
//!
//! All write methods run inside transactions behind an in-process write
//! lock with SQLITE_BUSY retry — callers never observe partial state.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod journal;
pub mod ledger;
pub mod migrations;
pub mod registry;

pub use connection::{ConnectionConfig, ConnectionPool, new_in_memory, new_pool};
pub use errors::{Result, StoreError};
