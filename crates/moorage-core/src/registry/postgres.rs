// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed registry on the platform cluster.
//!
//! All conditional updates (status CAS, in-flight marker, shared-slot
//! reservation) are single `UPDATE ... WHERE <condition>` statements so they
//! stay correct across multiple engine processes sharing one platform
//! cluster.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{InstanceFilter, Registry, TransitionUpdate, validate_draft};
use crate::error::{Error, Result};
use crate::model::{
    BackupKind, BackupRecord, BackupStatus, DatabaseStrategy, Instance, InstanceDraft,
    InstanceStatus, ResourceTier, SharedClusterAllocation,
};

/// PostgreSQL-backed registry implementation.
#[derive(Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    /// Create a registry over an existing platform-cluster pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the registry schema (idempotent).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const INSTANCE_COLUMNS: &str = "id, tenant_id, subdomain, status, database_strategy, \
     database_cluster_ref, database_name, resource_tier, image, container_ref, address, \
     in_flight_operation, last_error, created_at, updated_at";

const BACKUP_COLUMNS: &str = "id, instance_id, kind, status, database_snapshot_ref, \
     volume_snapshot_ref, size_bytes, created_at, retention_expires_at";

/// Raw instance row; statuses and enums stored as text.
#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    id: String,
    tenant_id: String,
    subdomain: String,
    status: String,
    database_strategy: Option<String>,
    database_cluster_ref: Option<String>,
    database_name: Option<String>,
    resource_tier: String,
    image: String,
    container_ref: Option<String>,
    address: Option<String>,
    in_flight_operation: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = Error;

    fn try_from(row: InstanceRow) -> Result<Instance> {
        let status = InstanceStatus::parse(&row.status)
            .ok_or_else(|| Error::resource("decode instance record", &row.status))?;
        let resource_tier = ResourceTier::parse(&row.resource_tier)
            .ok_or_else(|| Error::resource("decode instance record", &row.resource_tier))?;
        let database_strategy = match row.database_strategy {
            Some(s) => Some(
                DatabaseStrategy::parse(&s)
                    .ok_or_else(|| Error::resource("decode instance record", &s))?,
            ),
            None => None,
        };

        Ok(Instance {
            id: row.id,
            tenant_id: row.tenant_id,
            subdomain: row.subdomain,
            status,
            database_strategy,
            database_cluster_ref: row.database_cluster_ref,
            database_name: row.database_name,
            resource_tier,
            image: row.image,
            container_ref: row.container_ref,
            address: row.address,
            in_flight_operation: row.in_flight_operation,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Raw backup row.
#[derive(Debug, sqlx::FromRow)]
struct BackupRow {
    id: String,
    instance_id: String,
    kind: String,
    status: String,
    database_snapshot_ref: Option<String>,
    volume_snapshot_ref: Option<String>,
    size_bytes: i64,
    created_at: DateTime<Utc>,
    retention_expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<BackupRow> for BackupRecord {
    type Error = Error;

    fn try_from(row: BackupRow) -> Result<BackupRecord> {
        let kind = BackupKind::parse(&row.kind)
            .ok_or_else(|| Error::resource("decode backup record", &row.kind))?;
        let status = BackupStatus::parse(&row.status)
            .ok_or_else(|| Error::resource("decode backup record", &row.status))?;

        Ok(BackupRecord {
            id: row.id,
            instance_id: row.instance_id,
            kind,
            status,
            database_snapshot_ref: row.database_snapshot_ref,
            volume_snapshot_ref: row.volume_snapshot_ref,
            size_bytes: row.size_bytes,
            created_at: row.created_at,
            retention_expires_at: row.retention_expires_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[async_trait]
impl Registry for PostgresRegistry {
    async fn create_instance(&self, draft: &InstanceDraft) -> Result<Instance> {
        validate_draft(draft)?;

        let id = Uuid::new_v4().to_string();
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            INSERT INTO instances (id, tenant_id, subdomain, status, resource_tier, image, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, NOW(), NOW())
            RETURNING {INSTANCE_COLUMNS}
            "#,
        ))
        .bind(&id)
        .bind(&draft.tenant_id)
        .bind(&draft.subdomain)
        .bind(draft.resource_tier.as_str())
        .bind(&draft.image)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict {
                    entity: "subdomain",
                    id: draft.subdomain.clone(),
                    reason: "already held by a non-deleted instance".to_string(),
                }
            } else {
                e.into()
            }
        })?;

        row.try_into()
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = $1",
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE subdomain = $1 AND status <> 'deleted'",
        ))
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM instances
            WHERE ($1::text IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        ))
        .bind(filter.tenant_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Instance::try_from).collect()
    }

    async fn transition(
        &self,
        instance_id: &str,
        expected: InstanceStatus,
        new: InstanceStatus,
        update: TransitionUpdate,
    ) -> Result<Instance> {
        if !expected.can_transition_to(new) {
            return Err(Error::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: expected,
                to: new,
            });
        }

        let (strategy, cluster_ref, database_name) = match &update.database {
            Some(placement) => (
                Some(placement.strategy.as_str()),
                Some(placement.cluster_ref.as_str()),
                Some(placement.database_name.as_str()),
            ),
            None => (None, None, None),
        };
        let (container_ref, address) = match &update.network {
            Some(network) => (
                Some(network.container_ref.as_str()),
                Some(network.address.as_str()),
            ),
            None => (None, None),
        };

        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            UPDATE instances SET
                status = $3,
                last_error = $4,
                database_strategy = COALESCE($5, database_strategy),
                database_cluster_ref = COALESCE($6, database_cluster_ref),
                database_name = COALESCE($7, database_name),
                container_ref = COALESCE($8, container_ref),
                address = COALESCE($9, address),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {INSTANCE_COLUMNS}
            "#,
        ))
        .bind(instance_id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(update.last_error.as_deref())
        .bind(strategy)
        .bind(cluster_ref)
        .bind(database_name)
        .bind(container_ref)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            // CAS lost: distinguish a missing instance from a raced status.
            None => match self.get_instance(instance_id).await? {
                Some(current) => Err(Error::Conflict {
                    entity: "instance",
                    id: instance_id.to_string(),
                    reason: format!(
                        "expected status '{}', found '{}'",
                        expected, current.status
                    ),
                }),
                None => Err(Error::NotFound {
                    kind: "instance",
                    id: instance_id.to_string(),
                }),
            },
        }
    }

    async fn begin_operation(&self, instance_id: &str, operation: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET in_flight_operation = $2, updated_at = NOW()
            WHERE id = $1 AND in_flight_operation IS NULL
            "#,
        )
        .bind(instance_id)
        .bind(operation)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get_instance(instance_id).await? {
            Some(current) => Err(Error::OperationInProgress {
                instance_id: instance_id.to_string(),
                operation: current
                    .in_flight_operation
                    .unwrap_or_else(|| "unknown".to_string()),
            }),
            None => Err(Error::NotFound {
                kind: "instance",
                id: instance_id.to_string(),
            }),
        }
    }

    async fn end_operation(&self, instance_id: &str) -> Result<()> {
        sqlx::query("UPDATE instances SET in_flight_operation = NULL WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_backup(
        &self,
        instance_id: &str,
        kind: BackupKind,
        retention_expires_at: Option<DateTime<Utc>>,
    ) -> Result<BackupRecord> {
        let id = Uuid::new_v4().to_string();
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            r#"
            INSERT INTO backup_records (id, instance_id, kind, status, size_bytes, created_at, retention_expires_at)
            VALUES ($1, $2, $3, 'pending', 0, NOW(), $4)
            RETURNING {BACKUP_COLUMNS}
            "#,
        ))
        .bind(&id)
        .bind(instance_id)
        .bind(kind.as_str())
        .bind(retention_expires_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn mark_backup_running(&self, backup_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backup_records SET status = 'in_progress' WHERE id = $1 AND status = 'pending'",
        )
        .bind(backup_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                kind: "backup",
                id: backup_id.to_string(),
            });
        }
        Ok(())
    }

    async fn complete_backup(
        &self,
        backup_id: &str,
        database_snapshot_ref: &str,
        volume_snapshot_ref: &str,
        size_bytes: i64,
    ) -> Result<BackupRecord> {
        if size_bytes <= 0 {
            return Err(Error::Validation {
                field: "size_bytes",
                message: "completed backups must have a positive size".to_string(),
            });
        }

        let row = sqlx::query_as::<_, BackupRow>(&format!(
            r#"
            UPDATE backup_records SET
                status = 'completed',
                database_snapshot_ref = $2,
                volume_snapshot_ref = $3,
                size_bytes = $4
            WHERE id = $1 AND status IN ('pending', 'in_progress')
            RETURNING {BACKUP_COLUMNS}
            "#,
        ))
        .bind(backup_id)
        .bind(database_snapshot_ref)
        .bind(volume_snapshot_ref)
        .bind(size_bytes)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(Error::Conflict {
                entity: "backup",
                id: backup_id.to_string(),
                reason: "missing or already terminal".to_string(),
            }),
        }
    }

    async fn fail_backup(
        &self,
        backup_id: &str,
        database_snapshot_ref: Option<&str>,
        volume_snapshot_ref: Option<&str>,
    ) -> Result<BackupRecord> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            r#"
            UPDATE backup_records SET
                status = 'failed',
                database_snapshot_ref = COALESCE($2, database_snapshot_ref),
                volume_snapshot_ref = COALESCE($3, volume_snapshot_ref)
            WHERE id = $1 AND status IN ('pending', 'in_progress')
            RETURNING {BACKUP_COLUMNS}
            "#,
        ))
        .bind(backup_id)
        .bind(database_snapshot_ref)
        .bind(volume_snapshot_ref)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(Error::Conflict {
                entity: "backup",
                id: backup_id.to_string(),
                reason: "missing or already terminal".to_string(),
            }),
        }
    }

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backup_records WHERE id = $1",
        ))
        .bind(backup_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BackupRecord::try_from).transpose()
    }

    async fn list_backups(&self, instance_id: &str) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query_as::<_, BackupRow>(&format!(
            r#"
            SELECT {BACKUP_COLUMNS} FROM backup_records
            WHERE instance_id = $1
            ORDER BY created_at DESC
            "#,
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BackupRecord::try_from).collect()
    }

    async fn delete_backups_for_instance(&self, instance_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM backup_records WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired_backups(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM backup_records
            WHERE retention_expires_at IS NOT NULL
              AND retention_expires_at < $1
              AND status IN ('completed', 'failed')
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn register_shared_cluster(&self, cluster_ref: &str, capacity_limit: i32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO shared_cluster_allocations (cluster_ref, tenant_count, capacity_limit)
            VALUES ($1, 0, $2)
            ON CONFLICT (cluster_ref) DO NOTHING
            "#,
        )
        .bind(cluster_ref)
        .bind(capacity_limit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_shared_clusters(&self) -> Result<Vec<SharedClusterAllocation>> {
        let allocations = sqlx::query_as::<_, SharedClusterAllocation>(
            "SELECT cluster_ref, tenant_count, capacity_limit FROM shared_cluster_allocations ORDER BY cluster_ref",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(allocations)
    }

    async fn reserve_shared_slot(&self, cluster_ref: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE shared_cluster_allocations
            SET tenant_count = tenant_count + 1
            WHERE cluster_ref = $1 AND tenant_count < capacity_limit
            "#,
        )
        .bind(cluster_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_shared_slot(&self, cluster_ref: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE shared_cluster_allocations
            SET tenant_count = GREATEST(tenant_count - 1, 0)
            WHERE cluster_ref = $1
            "#,
        )
        .bind(cluster_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clusters_in_use(&self) -> Result<Vec<String>> {
        let refs = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT database_cluster_ref FROM instances
            WHERE database_cluster_ref IS NOT NULL AND status <> 'deleted'
            UNION
            SELECT cluster_ref FROM shared_cluster_allocations
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(refs)
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
