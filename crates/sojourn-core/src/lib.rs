// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sojourn Core - durable instance hosting
//!
//! This crate hosts long-lived, stateful workflow instances on top of an
//! instance store. It loads instances by id or correlation key, runs them
//! under a per-instance execution lock, enrolls them in transactions, and
//! persists or unloads them when they go idle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        HostRuntime                           │
//! │            (config, store, engine factory, leases)           │
//! └──────────────────────────────────────────────────────────────┘
//!                              │ acquire
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    InstanceDirectory                         │
//! │     cache by id and key, throttle, in-flight loads           │
//! └──────────────────────────────────────────────────────────────┘
//!                              │ owns
//!                              ▼
//! ┌─────────────────────────┐   owns   ┌─────────────────────────┐
//! │   PersistenceContext    │─────────>│   InstanceController    │
//! │ save/release/keys,      │<─ weak ──│ execution lock, state,  │
//! │ transaction lock        │          │ unload policy, engine   │
//! └─────────────────────────┘          └─────────────────────────┘
//!              │                                   │
//!              ▼                                   ▼
//! ┌─────────────────────────┐          ┌─────────────────────────┐
//! │     InstanceStore       │          │     WorkflowEngine      │
//! │ (memory or SQLite)      │          │ (supplied by the host)  │
//! └─────────────────────────┘          └─────────────────────────┘
//! ```
//!
//! # Instance lifecycle
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Active` | Loaded; runs whenever it is runnable and has work |
//! | `Suspended` | Loaded but will not run until unsuspended |
//! | `Completed` | The engine finished; the instance unloads itself |
//! | `Aborted` | Torn down after a fault; its context is evicted |
//! | `Unloaded` | Saved and dropped from memory |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SOJOURN_DATABASE_URL` | - | SQLite URL for the bundled store |
//! | `SOJOURN_MAX_INSTANCES` | `32` | Resident instance limit |
//! | `SOJOURN_TIME_TO_PERSIST_MS` | disabled | Idle time before persisting |
//! | `SOJOURN_TIME_TO_UNLOAD_MS` | `60000` | Idle time before unloading, or `never` |
//! | `SOJOURN_UNHANDLED_EXCEPTION_ACTION` | `abandon_and_suspend` | Reaction to engine faults |
//!
//! See [`config::HostConfig::from_env`] for the full list.

/// Host configuration loaded from environment variables.
pub mod config;

/// Per-instance controller and control operations.
pub mod controller;

/// Instance cache and load protocol.
pub mod directory;

/// Workflow engine contract and a scripted mock engine.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Exclusive hand-off execution lock; waiters are served in order, abort-priority waiters first.
pub mod execution_lock;

/// Embedded SQLite migrations.
#[cfg(feature = "sqlite")]
pub mod migrations;

/// Keys, instance data and other shared types.
pub mod model;

/// Per-instance persistence context.
pub mod persistence;

/// Persistence pipeline modules.
pub mod pipeline;

/// Embeddable host runtime.
pub mod runtime;

/// Instance store contract and implementations.
pub mod store;

/// Wait handles and timeout helpers.
pub mod sync;

/// Resident instance throttle.
pub mod throttle;

/// Lightweight two-phase transactions.
pub mod transaction;

mod unload_policy;

pub use controller::{InstanceController, InstanceState};
pub use directory::{InstanceDirectory, LoadOutcome, LoadRequest};
pub use error::{CoreError, Result};
pub use runtime::{HostRuntime, InstanceLease};
