// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Moorage Core - Routing, Placement Policy, and the Instance Registry
//!
//! This crate is the foundation of the moorage platform: it owns the data
//! model for tenant instances, routes database operations across the two
//! clusters, decides shared vs dedicated placement, and provides the
//! registry that every orchestrator writes committed state through.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       moorage-engine (orchestrators)                     │
//! │        Provisioning · Backup/Restore · Reconciler · Worker Pool          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                      │                          │
//!        │ select()             │ resolve()                │ transition()
//!        ▼                      ▼                          ▼
//! ┌──────────────┐   ┌──────────────────┐      ┌─────────────────────────┐
//! │   Strategy   │   │    Connection    │      │    Instance Registry    │
//! │   Selector   │   │      Router      │      │  (this crate, trait +   │
//! │ (pure policy)│   │ (dual clusters)  │      │   Postgres / memory)    │
//! └──────────────┘   └──────────────────┘      └─────────────────────────┘
//!                       │             │                    │
//!                       ▼             ▼                    ▼
//!              ┌────────────────┐ ┌────────────────┐ ┌────────────────┐
//!              │ Workload       │ │ Workload       │ │ Platform       │
//!              │ cluster alpha  │ │ cluster beta…  │ │ cluster        │
//!              │ (tenant DBs)   │ │ (tenant DBs)   │ │ (metadata)     │
//!              └────────────────┘ └────────────────┘ └────────────────┘
//! ```
//!
//! # Instance Status State Machine
//!
//! ```text
//!   ┌─────────┐      ┌──────────────┐        ┌─────────┐
//!   │ PENDING │─────▶│ PROVISIONING │───────▶│ RUNNING │◀──────────┐
//!   └─────────┘      └──────┬───────┘        └──┬─┬─┬──┘           │
//!                           │       ▲           │ │ │              │
//!                           ▼       │ retry     │ │ │ backup       │
//!                      ┌────────┐   │    stop   │ │ ▼              │
//!                      │ FAILED │◀──┼───────────┼─│ BACKING_UP ────┤
//!                      └───┬────┘   │           │ │ │              │
//!                          │        │           ▼ │ ▼              │
//!                          │        │      ┌─────────┐             │
//!                          │        └──────│ STOPPED │─ restore ─▶ RESTORING
//!                          │               └────┬────┘             │
//!                          ▼                    │                  │
//!                     ┌──────────┐              │                  │
//!                     │ DELETING │◀─────────────┘◀─────────────────┘ (fail)
//!                     └────┬─────┘
//!                          ▼
//!                     ┌─────────┐
//!                     │ DELETED │
//!                     └─────────┘
//! ```
//!
//! Every status change goes through [`registry::Registry::transition`],
//! which enforces the edges above plus optimistic concurrency, so no
//! combination of racing orchestrators can observe an illegal transition.
//!
//! # Modules
//!
//! - [`config`]: cluster routing configuration from environment variables
//! - [`error`]: error taxonomy with machine-readable codes
//! - [`model`]: instances, backups, allocations, and the status machine
//! - [`registry`]: the authoritative record store (trait + backends)
//! - [`router`]: purpose → cluster/credential/database resolution
//! - [`strategy`]: shared-vs-dedicated placement policy

#![deny(missing_docs)]

/// Cluster routing configuration loaded from environment variables.
pub mod config;

/// Error taxonomy with machine-readable codes.
pub mod error;

/// Data model: instances, backups, allocations, and the status machine.
pub mod model;

/// The instance registry: trait plus PostgreSQL and in-memory backends.
pub mod registry;

/// Connection routing across the platform and workload clusters.
pub mod router;

/// Shared-vs-dedicated placement policy.
pub mod strategy;
