// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The instance registry: authoritative store for instance, backup, and
//! shared-cluster-occupancy records on the platform cluster.
//!
//! The registry is the sole writer of committed state. Orchestrators propose
//! status changes through [`Registry::transition`], which enforces both the
//! lifecycle state machine and optimistic concurrency; everything else an
//! orchestrator wants to record rides along in the same atomic call.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryRegistry;
pub use self::postgres::PostgresRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{
    BackupKind, BackupRecord, DatabaseStrategy, Instance, InstanceDraft, InstanceStatus,
    SharedClusterAllocation,
};

/// Workload database placement. The three fields are always written together
/// (the invariant that strategy and cluster ref never drift apart).
#[derive(Debug, Clone)]
pub struct DatabasePlacement {
    /// Shared or dedicated.
    pub strategy: DatabaseStrategy,
    /// Workload cluster holding the database.
    pub cluster_ref: String,
    /// Name of the workload database.
    pub database_name: String,
}

/// Container/network facts recorded when an instance comes up.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    /// Container reference from the container runtime.
    pub container_ref: String,
    /// Address (host:port) the application is reachable at.
    pub address: String,
}

/// Fields folded into a status transition. `last_error` is always written
/// (a `None` clears it); placement and network are written only when
/// present, and placement always lands as a unit.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    /// New `last_error` value; `None` clears the previous one.
    pub last_error: Option<String>,
    /// New database placement, set as a unit.
    pub database: Option<DatabasePlacement>,
    /// New container/network info.
    pub network: Option<NetworkInfo>,
}

impl TransitionUpdate {
    /// An update that only records a failure cause.
    pub fn with_error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Filter for instance listings.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Only instances of this tenant.
    pub tenant_id: Option<String>,
    /// Only instances in this status.
    pub status: Option<InstanceStatus>,
}

/// Authoritative record store for tenant instance metadata.
///
/// Guarantees read-after-write consistency per instance and uniqueness of
/// `subdomain` across non-deleted instances. Conditional updates (status
/// CAS, in-flight marker, shared-slot reservation) are atomic in every
/// implementation.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create an instance in `pending`. Fails with [`Error::Conflict`] when
    /// the subdomain is already held by a non-deleted instance.
    async fn create_instance(&self, draft: &InstanceDraft) -> Result<Instance>;

    /// Fetch an instance by id.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>>;

    /// Fetch the non-deleted instance holding a subdomain.
    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Option<Instance>>;

    /// List instances matching a filter, newest first.
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Instance>>;

    /// Atomically move an instance from `expected` to `new`, folding the
    /// update into the same write.
    ///
    /// Fails with [`Error::InvalidTransition`] when `expected → new` is not
    /// a state-machine edge, and with [`Error::Conflict`] when the stored
    /// status is no longer `expected` (two orchestrators racing).
    async fn transition(
        &self,
        instance_id: &str,
        expected: InstanceStatus,
        new: InstanceStatus,
        update: TransitionUpdate,
    ) -> Result<Instance>;

    /// Claim the advisory single-flight marker for an operation. Fails with
    /// [`Error::OperationInProgress`] if another operation holds it.
    async fn begin_operation(&self, instance_id: &str, operation: &str) -> Result<()>;

    /// Release the advisory single-flight marker.
    async fn end_operation(&self, instance_id: &str) -> Result<()>;

    // ========================================================================
    // Backup records
    // ========================================================================

    /// Create a `pending` backup record for an instance.
    async fn create_backup(
        &self,
        instance_id: &str,
        kind: BackupKind,
        retention_expires_at: Option<DateTime<Utc>>,
    ) -> Result<BackupRecord>;

    /// Move a backup record from `pending` to `in_progress`.
    async fn mark_backup_running(&self, backup_id: &str) -> Result<()>;

    /// Terminally complete a backup record with both artifact refs and the
    /// combined size. Terminal records are never mutated again.
    async fn complete_backup(
        &self,
        backup_id: &str,
        database_snapshot_ref: &str,
        volume_snapshot_ref: &str,
        size_bytes: i64,
    ) -> Result<BackupRecord>;

    /// Terminally fail a backup record, retaining whatever partial refs were
    /// produced for diagnostics.
    async fn fail_backup(
        &self,
        backup_id: &str,
        database_snapshot_ref: Option<&str>,
        volume_snapshot_ref: Option<&str>,
    ) -> Result<BackupRecord>;

    /// Fetch a backup record by id.
    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>>;

    /// List backup records for an instance, newest first.
    async fn list_backups(&self, instance_id: &str) -> Result<Vec<BackupRecord>>;

    /// Delete all backup records of an instance (cascade on instance
    /// deletion). Returns the number removed.
    async fn delete_backups_for_instance(&self, instance_id: &str) -> Result<u64>;

    /// Delete terminal backup records whose retention has expired. Returns
    /// the number removed.
    async fn purge_expired_backups(&self, now: DateTime<Utc>) -> Result<u64>;

    // ========================================================================
    // Shared-cluster allocations
    // ========================================================================

    /// Register occupancy tracking for a shared cluster (idempotent).
    async fn register_shared_cluster(&self, cluster_ref: &str, capacity_limit: i32) -> Result<()>;

    /// All shared-cluster allocations.
    async fn list_shared_clusters(&self) -> Result<Vec<SharedClusterAllocation>>;

    /// Conditionally increment a cluster's tenant count. Returns `false`
    /// when the cluster is at capacity (or unknown) — the count never
    /// exceeds `capacity_limit`.
    async fn reserve_shared_slot(&self, cluster_ref: &str) -> Result<bool>;

    /// Decrement a cluster's tenant count (never below zero).
    async fn release_shared_slot(&self, cluster_ref: &str) -> Result<()>;

    /// Cluster refs currently in use: referenced by any non-deleted
    /// instance or registered as a shared allocation.
    async fn clusters_in_use(&self) -> Result<Vec<String>>;

    /// Whether the underlying store is reachable.
    async fn health_check(&self) -> Result<bool>;
}

/// Validate a draft before intake. Shared by every registry implementation.
pub fn validate_draft(draft: &InstanceDraft) -> Result<()> {
    if draft.tenant_id.trim().is_empty() {
        return Err(Error::Validation {
            field: "tenant_id",
            message: "must not be empty".to_string(),
        });
    }

    if draft.subdomain.is_empty() || draft.subdomain.len() > 63 {
        return Err(Error::Validation {
            field: "subdomain",
            message: "must be 1-63 characters".to_string(),
        });
    }

    let valid_chars = draft
        .subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || draft.subdomain.starts_with('-') || draft.subdomain.ends_with('-') {
        return Err(Error::Validation {
            field: "subdomain",
            message: "must be lowercase alphanumerics and inner hyphens".to_string(),
        });
    }

    if draft.image.trim().is_empty() {
        return Err(Error::Validation {
            field: "image",
            message: "must not be empty".to_string(),
        });
    }

    Ok(())
}
