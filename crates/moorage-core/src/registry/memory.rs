// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry for tests and database-free embedding.
//!
//! Semantics match [`PostgresRegistry`](super::PostgresRegistry): the same
//! state-machine enforcement, optimistic concurrency, and conditional
//! counters, all under one lock.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{InstanceFilter, Registry, TransitionUpdate, validate_draft};
use crate::error::{Error, Result};
use crate::model::{
    BackupKind, BackupRecord, BackupStatus, Instance, InstanceDraft, InstanceStatus,
    SharedClusterAllocation,
};

#[derive(Default)]
struct Inner {
    instances: HashMap<String, Instance>,
    backups: HashMap<String, BackupRecord>,
    clusters: BTreeMap<String, SharedClusterAllocation>,
}

/// In-memory [`Registry`] implementation.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance verbatim, bypassing intake. Test control: lets
    /// callers seed arbitrary statuses and timestamps.
    pub async fn put_instance(&self, instance: Instance) {
        let mut inner = self.inner.lock().await;
        inner.instances.insert(instance.id.clone(), instance);
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn create_instance(&self, draft: &InstanceDraft) -> Result<Instance> {
        validate_draft(draft)?;

        let mut inner = self.inner.lock().await;

        let taken = inner.instances.values().any(|inst| {
            inst.subdomain == draft.subdomain && inst.status != InstanceStatus::Deleted
        });
        if taken {
            return Err(Error::Conflict {
                entity: "subdomain",
                id: draft.subdomain.clone(),
                reason: "already held by a non-deleted instance".to_string(),
            });
        }

        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4().to_string(),
            tenant_id: draft.tenant_id.clone(),
            subdomain: draft.subdomain.clone(),
            status: InstanceStatus::Pending,
            database_strategy: None,
            database_cluster_ref: None,
            database_name: None,
            resource_tier: draft.resource_tier,
            image: draft.image.clone(),
            container_ref: None,
            address: None,
            in_flight_operation: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        inner
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        let inner = self.inner.lock().await;
        Ok(inner.instances.get(instance_id).cloned())
    }

    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Option<Instance>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .values()
            .find(|inst| inst.subdomain == subdomain && inst.status != InstanceStatus::Deleted)
            .cloned())
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Instance>> {
        let inner = self.inner.lock().await;
        let mut matches: Vec<Instance> = inner
            .instances
            .values()
            .filter(|inst| {
                filter
                    .tenant_id
                    .as_ref()
                    .is_none_or(|tenant| &inst.tenant_id == tenant)
                    && filter.status.is_none_or(|status| inst.status == status)
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
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

        let mut inner = self.inner.lock().await;
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::NotFound {
                kind: "instance",
                id: instance_id.to_string(),
            })?;

        if instance.status != expected {
            return Err(Error::Conflict {
                entity: "instance",
                id: instance_id.to_string(),
                reason: format!(
                    "expected status '{}', found '{}'",
                    expected, instance.status
                ),
            });
        }

        instance.status = new;
        instance.last_error = update.last_error;
        if let Some(placement) = update.database {
            instance.database_strategy = Some(placement.strategy);
            instance.database_cluster_ref = Some(placement.cluster_ref);
            instance.database_name = Some(placement.database_name);
        }
        if let Some(network) = update.network {
            instance.container_ref = Some(network.container_ref);
            instance.address = Some(network.address);
        }
        instance.updated_at = Utc::now();

        Ok(instance.clone())
    }

    async fn begin_operation(&self, instance_id: &str, operation: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::NotFound {
                kind: "instance",
                id: instance_id.to_string(),
            })?;

        if let Some(current) = &instance.in_flight_operation {
            return Err(Error::OperationInProgress {
                instance_id: instance_id.to_string(),
                operation: current.clone(),
            });
        }

        instance.in_flight_operation = Some(operation.to_string());
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn end_operation(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.get_mut(instance_id) {
            instance.in_flight_operation = None;
        }
        Ok(())
    }

    async fn create_backup(
        &self,
        instance_id: &str,
        kind: BackupKind,
        retention_expires_at: Option<DateTime<Utc>>,
    ) -> Result<BackupRecord> {
        let mut inner = self.inner.lock().await;
        let record = BackupRecord {
            id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            kind,
            status: BackupStatus::Pending,
            database_snapshot_ref: None,
            volume_snapshot_ref: None,
            size_bytes: 0,
            created_at: Utc::now(),
            retention_expires_at,
        };
        inner.backups.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn mark_backup_running(&self, backup_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .backups
            .get_mut(backup_id)
            .filter(|r| r.status == BackupStatus::Pending)
            .ok_or_else(|| Error::NotFound {
                kind: "backup",
                id: backup_id.to_string(),
            })?;
        record.status = BackupStatus::InProgress;
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

        let mut inner = self.inner.lock().await;
        let record = inner
            .backups
            .get_mut(backup_id)
            .filter(|r| !r.status.is_terminal())
            .ok_or_else(|| Error::Conflict {
                entity: "backup",
                id: backup_id.to_string(),
                reason: "missing or already terminal".to_string(),
            })?;

        record.status = BackupStatus::Completed;
        record.database_snapshot_ref = Some(database_snapshot_ref.to_string());
        record.volume_snapshot_ref = Some(volume_snapshot_ref.to_string());
        record.size_bytes = size_bytes;
        Ok(record.clone())
    }

    async fn fail_backup(
        &self,
        backup_id: &str,
        database_snapshot_ref: Option<&str>,
        volume_snapshot_ref: Option<&str>,
    ) -> Result<BackupRecord> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .backups
            .get_mut(backup_id)
            .filter(|r| !r.status.is_terminal())
            .ok_or_else(|| Error::Conflict {
                entity: "backup",
                id: backup_id.to_string(),
                reason: "missing or already terminal".to_string(),
            })?;

        record.status = BackupStatus::Failed;
        if let Some(db_ref) = database_snapshot_ref {
            record.database_snapshot_ref = Some(db_ref.to_string());
        }
        if let Some(vol_ref) = volume_snapshot_ref {
            record.volume_snapshot_ref = Some(vol_ref.to_string());
        }
        Ok(record.clone())
    }

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.backups.get(backup_id).cloned())
    }

    async fn list_backups(&self, instance_id: &str) -> Result<Vec<BackupRecord>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<BackupRecord> = inner
            .backups
            .values()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn delete_backups_for_instance(&self, instance_id: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.backups.len();
        inner.backups.retain(|_, r| r.instance_id != instance_id);
        Ok((before - inner.backups.len()) as u64)
    }

    async fn purge_expired_backups(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.backups.len();
        inner.backups.retain(|_, r| {
            !(r.status.is_terminal() && r.retention_expires_at.is_some_and(|exp| exp < now))
        });
        Ok((before - inner.backups.len()) as u64)
    }

    async fn register_shared_cluster(&self, cluster_ref: &str, capacity_limit: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .clusters
            .entry(cluster_ref.to_string())
            .or_insert_with(|| SharedClusterAllocation {
                cluster_ref: cluster_ref.to_string(),
                tenant_count: 0,
                capacity_limit,
            });
        Ok(())
    }

    async fn list_shared_clusters(&self) -> Result<Vec<SharedClusterAllocation>> {
        let inner = self.inner.lock().await;
        Ok(inner.clusters.values().cloned().collect())
    }

    async fn reserve_shared_slot(&self, cluster_ref: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.clusters.get_mut(cluster_ref) {
            Some(alloc) if alloc.has_capacity() => {
                alloc.tenant_count += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_shared_slot(&self, cluster_ref: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(alloc) = inner.clusters.get_mut(cluster_ref) {
            alloc.tenant_count = (alloc.tenant_count - 1).max(0);
        }
        Ok(())
    }

    async fn clusters_in_use(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut refs: Vec<String> = inner
            .instances
            .values()
            .filter(|inst| inst.status != InstanceStatus::Deleted)
            .filter_map(|inst| inst.database_cluster_ref.clone())
            .chain(inner.clusters.keys().cloned())
            .collect();
        refs.sort();
        refs.dedup();
        Ok(refs)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceTier;
    use crate::registry::DatabasePlacement;
    use crate::model::DatabaseStrategy;

    fn draft(subdomain: &str) -> InstanceDraft {
        InstanceDraft {
            tenant_id: "acme".to_string(),
            subdomain: subdomain.to_string(),
            resource_tier: ResourceTier::Basic,
            image: "registry.internal/app:stable".to_string(),
            compliance_flags: vec![],
            projected_volume_gb: 1,
            strategy_override: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = MemoryRegistry::new();
        let created = registry.create_instance(&draft("acme")).await.unwrap();
        assert_eq!(created.status, InstanceStatus::Pending);

        let fetched = registry.get_instance(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.subdomain, "acme");

        let by_subdomain = registry.get_by_subdomain("acme").await.unwrap().unwrap();
        assert_eq!(by_subdomain.id, created.id);
    }

    #[tokio::test]
    async fn test_duplicate_subdomain_rejected_until_deleted() {
        let registry = MemoryRegistry::new();
        let first = registry.create_instance(&draft("acme")).await.unwrap();

        let err = registry.create_instance(&draft("acme")).await.unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");

        // Walk the first instance to deleted; the subdomain frees up.
        registry
            .transition(
                &first.id,
                InstanceStatus::Pending,
                InstanceStatus::Provisioning,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();
        registry
            .transition(
                &first.id,
                InstanceStatus::Provisioning,
                InstanceStatus::Failed,
                TransitionUpdate::with_error("boom"),
            )
            .await
            .unwrap();
        registry
            .transition(
                &first.id,
                InstanceStatus::Failed,
                InstanceStatus::Deleting,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();
        registry
            .transition(
                &first.id,
                InstanceStatus::Deleting,
                InstanceStatus::Deleted,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();

        assert!(registry.create_instance(&draft("acme")).await.is_ok());
    }

    #[tokio::test]
    async fn test_transition_cas_conflict() {
        let registry = MemoryRegistry::new();
        let instance = registry.create_instance(&draft("acme")).await.unwrap();

        registry
            .transition(
                &instance.id,
                InstanceStatus::Pending,
                InstanceStatus::Provisioning,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();

        // A second orchestrator still believing 'pending' loses the race.
        let err = registry
            .transition(
                &instance.id,
                InstanceStatus::Pending,
                InstanceStatus::Provisioning,
                TransitionUpdate::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_transition_rejects_non_edges() {
        let registry = MemoryRegistry::new();
        let instance = registry.create_instance(&draft("acme")).await.unwrap();

        let err = registry
            .transition(
                &instance.id,
                InstanceStatus::Pending,
                InstanceStatus::Running,
                TransitionUpdate::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_transition_folds_placement_and_clears_error() {
        let registry = MemoryRegistry::new();
        let instance = registry.create_instance(&draft("acme")).await.unwrap();

        registry
            .transition(
                &instance.id,
                InstanceStatus::Pending,
                InstanceStatus::Provisioning,
                TransitionUpdate::with_error("previous failure"),
            )
            .await
            .unwrap();

        let updated = registry
            .transition(
                &instance.id,
                InstanceStatus::Provisioning,
                InstanceStatus::Running,
                TransitionUpdate {
                    last_error: None,
                    database: Some(DatabasePlacement {
                        strategy: DatabaseStrategy::Shared,
                        cluster_ref: "alpha".to_string(),
                        database_name: "tenant_acme_1".to_string(),
                    }),
                    network: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, InstanceStatus::Running);
        assert_eq!(updated.database_strategy, Some(DatabaseStrategy::Shared));
        assert_eq!(updated.database_cluster_ref.as_deref(), Some("alpha"));
        assert_eq!(updated.last_error, None);
    }

    #[tokio::test]
    async fn test_single_flight_marker() {
        let registry = MemoryRegistry::new();
        let instance = registry.create_instance(&draft("acme")).await.unwrap();

        registry
            .begin_operation(&instance.id, "provision")
            .await
            .unwrap();

        let err = registry
            .begin_operation(&instance.id, "backup")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::OperationInProgress { operation, .. } if operation == "provision"
        ));

        registry.end_operation(&instance.id).await.unwrap();
        assert!(registry.begin_operation(&instance.id, "backup").await.is_ok());
    }

    #[tokio::test]
    async fn test_shared_slot_reservation_respects_capacity() {
        let registry = MemoryRegistry::new();
        registry.register_shared_cluster("alpha", 2).await.unwrap();

        assert!(registry.reserve_shared_slot("alpha").await.unwrap());
        assert!(registry.reserve_shared_slot("alpha").await.unwrap());
        // Third tenant never pushes the count past the limit.
        assert!(!registry.reserve_shared_slot("alpha").await.unwrap());

        let allocs = registry.list_shared_clusters().await.unwrap();
        assert_eq!(allocs[0].tenant_count, 2);

        registry.release_shared_slot("alpha").await.unwrap();
        assert!(registry.reserve_shared_slot("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_record_lifecycle() {
        let registry = MemoryRegistry::new();
        let instance = registry.create_instance(&draft("acme")).await.unwrap();

        let record = registry
            .create_backup(&instance.id, BackupKind::Manual, None)
            .await
            .unwrap();
        assert_eq!(record.status, BackupStatus::Pending);

        registry.mark_backup_running(&record.id).await.unwrap();
        let completed = registry
            .complete_backup(&record.id, "dump-1", "volsnap-1", 4096)
            .await
            .unwrap();
        assert_eq!(completed.status, BackupStatus::Completed);
        assert_eq!(completed.size_bytes, 4096);

        // Terminal records are never mutated again.
        let err = registry
            .fail_backup(&record.id, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_completed_backup_requires_positive_size() {
        let registry = MemoryRegistry::new();
        let record = registry
            .create_backup("i-1", BackupKind::Manual, None)
            .await
            .unwrap();
        let err = registry
            .complete_backup(&record.id, "dump-1", "volsnap-1", 0)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_purge_expired_backups() {
        let registry = MemoryRegistry::new();
        let old = registry
            .create_backup("i-1", BackupKind::Scheduled, Some(Utc::now() - chrono::Duration::days(1)))
            .await
            .unwrap();
        registry
            .complete_backup(&old.id, "dump", "volsnap", 100)
            .await
            .unwrap();

        let keeper = registry
            .create_backup("i-1", BackupKind::Manual, None)
            .await
            .unwrap();

        // Non-terminal expired records are not purged.
        let pending_expired = registry
            .create_backup("i-1", BackupKind::Scheduled, Some(Utc::now() - chrono::Duration::days(1)))
            .await
            .unwrap();

        let purged = registry.purge_expired_backups(Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(registry.get_backup(&old.id).await.unwrap().is_none());
        assert!(registry.get_backup(&keeper.id).await.unwrap().is_some());
        assert!(registry.get_backup(&pending_expired.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clusters_in_use_unions_instances_and_allocations() {
        let registry = MemoryRegistry::new();
        registry.register_shared_cluster("alpha", 50).await.unwrap();

        let instance = registry.create_instance(&draft("acme")).await.unwrap();
        registry
            .transition(
                &instance.id,
                InstanceStatus::Pending,
                InstanceStatus::Provisioning,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();
        registry
            .transition(
                &instance.id,
                InstanceStatus::Provisioning,
                InstanceStatus::Running,
                TransitionUpdate {
                    last_error: None,
                    database: Some(DatabasePlacement {
                        strategy: DatabaseStrategy::Dedicated,
                        cluster_ref: "beta".to_string(),
                        database_name: "tenant_acme_1".to_string(),
                    }),
                    network: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(registry.clusters_in_use().await.unwrap(), vec!["alpha", "beta"]);
    }
}
