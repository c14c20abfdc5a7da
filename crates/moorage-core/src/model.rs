// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model for tenant instances, backups, and shared-cluster occupancy.
//!
//! The status state machine lives here: [`InstanceStatus::can_transition_to`]
//! is the single definition of the legal lifecycle edges, enforced by every
//! [`Registry`](crate::registry::Registry) implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a tenant instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created in the registry, provisioning not yet started.
    Pending,
    /// Workload database and container are being brought up.
    Provisioning,
    /// Container is up and serving.
    Running,
    /// Container is stopped; workload database and volume are retained.
    Stopped,
    /// A backup is in progress.
    BackingUp,
    /// A restore (or strategy migration) is in progress.
    Restoring,
    /// The last operation failed; recovery requires an explicit retry.
    Failed,
    /// Teardown is in progress.
    Deleting,
    /// Terminal: all resources released.
    Deleted,
}

impl InstanceStatus {
    /// All statuses, in a stable order. Useful for scans and tests.
    pub const ALL: [InstanceStatus; 9] = [
        InstanceStatus::Pending,
        InstanceStatus::Provisioning,
        InstanceStatus::Running,
        InstanceStatus::Stopped,
        InstanceStatus::BackingUp,
        InstanceStatus::Restoring,
        InstanceStatus::Failed,
        InstanceStatus::Deleting,
        InstanceStatus::Deleted,
    ];

    /// Stable string form, as stored in the platform cluster.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::BackingUp => "backing_up",
            InstanceStatus::Restoring => "restoring",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Deleted => "deleted",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<InstanceStatus> {
        Self::ALL.iter().copied().find(|st| st.as_str() == s)
    }

    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Deleted)
    }

    /// Whether the instance can be handed back to its tenant in this status.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Stopped)
    }

    /// Whether `next` is a legal successor of this status.
    ///
    /// The edges:
    /// - `pending → provisioning`
    /// - `provisioning → running | failed`
    /// - `running ⇄ stopped`
    /// - `running | stopped → backing_up → running | stopped | failed`
    /// - `stopped → restoring → running | stopped | failed`
    /// - `running | stopped | failed → deleting → deleted`
    /// - `running → failed` (reconciler: container missing)
    /// - `failed → provisioning` (explicit operator retry)
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (*self, next),
            (Pending, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Running, Stopped)
                | (Running, BackingUp)
                | (Running, Deleting)
                | (Running, Failed)
                | (Stopped, Running)
                | (Stopped, BackingUp)
                | (Stopped, Restoring)
                | (Stopped, Deleting)
                | (BackingUp, Running)
                | (BackingUp, Stopped)
                | (BackingUp, Failed)
                | (Restoring, Running)
                | (Restoring, Stopped)
                | (Restoring, Failed)
                | (Failed, Provisioning)
                | (Failed, Deleting)
                | (Deleting, Deleted)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a tenant's workload database lives relative to other tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStrategy {
    /// Co-located with other tenants on a shared workload cluster.
    Shared,
    /// A workload cluster exclusively serving this tenant.
    Dedicated,
}

impl DatabaseStrategy {
    /// Stable string form, as stored in the platform cluster.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseStrategy::Shared => "shared",
            DatabaseStrategy::Dedicated => "dedicated",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<DatabaseStrategy> {
        match s {
            "shared" => Some(DatabaseStrategy::Shared),
            "dedicated" => Some(DatabaseStrategy::Dedicated),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource tier of a tenant, driving container limits and placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTier {
    /// Entry tier.
    Basic,
    /// Default paid tier.
    Standard,
    /// High tier; placed on dedicated workload clusters.
    Premium,
    /// Top tier; placed on dedicated workload clusters.
    Enterprise,
}

impl ResourceTier {
    /// Stable string form, as stored in the platform cluster.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceTier::Basic => "basic",
            ResourceTier::Standard => "standard",
            ResourceTier::Premium => "premium",
            ResourceTier::Enterprise => "enterprise",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<ResourceTier> {
        match s {
            "basic" => Some(ResourceTier::Basic),
            "standard" => Some(ResourceTier::Standard),
            "premium" => Some(ResourceTier::Premium),
            "enterprise" => Some(ResourceTier::Enterprise),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tenant's deployed application plus its workload database.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    /// Unique identifier (UUID).
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Subdomain published by the ingress collaborator; unique among
    /// non-deleted instances.
    pub subdomain: String,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Placement strategy; set together with `database_cluster_ref` and
    /// `database_name` during provisioning or strategy migration, never
    /// mutated independently.
    pub database_strategy: Option<DatabaseStrategy>,
    /// Workload cluster holding this instance's database.
    pub database_cluster_ref: Option<String>,
    /// Name of the workload database.
    pub database_name: Option<String>,
    /// Resource tier.
    pub resource_tier: ResourceTier,
    /// Application image the container runs.
    pub image: String,
    /// Container reference from the container runtime.
    pub container_ref: Option<String>,
    /// Address (host:port) the application is reachable at.
    pub address: Option<String>,
    /// Advisory single-flight marker: name of the orchestration operation
    /// currently holding this instance, if any.
    pub in_flight_operation: Option<String>,
    /// Cause of the most recent failure; cleared by successful transitions.
    pub last_error: Option<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last mutated.
    pub updated_at: DateTime<Utc>,
}

/// Intake request for a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDraft {
    /// Owning tenant.
    pub tenant_id: String,
    /// Requested subdomain.
    pub subdomain: String,
    /// Resource tier.
    pub resource_tier: ResourceTier,
    /// Application image to run.
    pub image: String,
    /// Compliance flags declared for the tenant (e.g. `HIPAA`).
    pub compliance_flags: Vec<String>,
    /// Projected workload volume in GB, from the intake form.
    pub projected_volume_gb: u32,
    /// Operator-set placement override, bypassing policy.
    pub strategy_override: Option<DatabaseStrategy>,
}

/// Whether a backup was requested by a user or by the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Explicitly requested.
    Manual,
    /// Produced by the backup schedule; subject to retention expiry.
    Scheduled,
}

impl BackupKind {
    /// Stable string form, as stored in the platform cluster.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Scheduled => "scheduled",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<BackupKind> {
        match s {
            "manual" => Some(BackupKind::Manual),
            "scheduled" => Some(BackupKind::Scheduled),
            _ => None,
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a backup record. Transitions exactly once into a terminal
/// status and is never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Record created, work not started.
    Pending,
    /// Dump/snapshot in progress.
    InProgress,
    /// Both artifacts captured; usable as a restore source.
    Completed,
    /// Failed; partial refs retained for diagnostics, never restored from.
    Failed,
}

impl BackupStatus {
    /// Stable string form, as stored in the platform cluster.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<BackupStatus> {
        match s {
            "pending" => Some(BackupStatus::Pending),
            "in_progress" => Some(BackupStatus::InProgress),
            "completed" => Some(BackupStatus::Completed),
            "failed" => Some(BackupStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Failed)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time capture of one instance: a workload database dump plus a
/// persistent-volume snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    /// Unique identifier (UUID).
    pub id: String,
    /// Instance this backup belongs to.
    pub instance_id: String,
    /// Manual or scheduled.
    pub kind: BackupKind,
    /// Current status.
    pub status: BackupStatus,
    /// Reference to the database dump artifact.
    pub database_snapshot_ref: Option<String>,
    /// Reference to the volume snapshot artifact.
    pub volume_snapshot_ref: Option<String>,
    /// Combined size of both artifacts in bytes; > 0 for completed records.
    pub size_bytes: i64,
    /// When the backup was started.
    pub created_at: DateTime<Utc>,
    /// When the record becomes eligible for retention purge, if ever.
    pub retention_expires_at: Option<DateTime<Utc>>,
}

/// Occupancy of one shared workload cluster.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SharedClusterAllocation {
    /// Workload cluster this allocation tracks.
    pub cluster_ref: String,
    /// Number of tenants currently placed on the cluster.
    pub tenant_count: i32,
    /// Policy ceiling; `tenant_count` never exceeds it.
    pub capacity_limit: i32,
}

impl SharedClusterAllocation {
    /// Whether another tenant fits on this cluster.
    pub fn has_capacity(&self) -> bool {
        self.tenant_count < self.capacity_limit
    }
}
