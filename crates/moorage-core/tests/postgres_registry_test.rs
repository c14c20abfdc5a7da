// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the PostgreSQL-backed registry.
//!
//! These run against a real platform-cluster database and are skipped when
//! `MOORAGE_TEST_DATABASE_URL` is not set.

use moorage_core::model::{BackupKind, InstanceDraft, InstanceStatus, ResourceTier};
use moorage_core::registry::{
    InstanceFilter, PostgresRegistry, Registry, TransitionUpdate,
};
use sqlx::PgPool;
use uuid::Uuid;

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("MOORAGE_TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: MOORAGE_TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a migrated registry for testing.
async fn get_test_registry() -> Option<PostgresRegistry> {
    let database_url = std::env::var("MOORAGE_TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    let registry = PostgresRegistry::new(pool);
    registry.migrate().await.ok()?;
    Some(registry)
}

fn unique_draft(tenant_id: &str) -> InstanceDraft {
    let suffix = Uuid::new_v4().simple().to_string();
    InstanceDraft {
        tenant_id: tenant_id.to_string(),
        subdomain: format!("t-{}", &suffix[..12]),
        resource_tier: ResourceTier::Basic,
        image: "registry.internal/app:stable".to_string(),
        compliance_flags: vec![],
        projected_volume_gb: 1,
        strategy_override: None,
    }
}

/// Clean up test data.
async fn cleanup(registry: &PostgresRegistry, instance_id: &str) {
    sqlx::query("DELETE FROM backup_records WHERE instance_id = $1")
        .bind(instance_id)
        .execute(registry.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM instances WHERE id = $1")
        .bind(instance_id)
        .execute(registry.pool())
        .await
        .ok();
}

#[tokio::test]
async fn test_create_get_and_list() {
    skip_if_no_db!();
    let registry = get_test_registry().await.expect("registry");

    let draft = unique_draft("tenant-pg-1");
    let created = registry.create_instance(&draft).await.unwrap();
    assert_eq!(created.status, InstanceStatus::Pending);
    assert_eq!(created.subdomain, draft.subdomain);

    let fetched = registry.get_instance(&created.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.resource_tier, ResourceTier::Basic);

    let listed = registry
        .list_instances(
            &InstanceFilter {
                tenant_id: Some("tenant-pg-1".to_string()),
                status: Some(InstanceStatus::Pending),
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert!(listed.iter().any(|inst| inst.id == created.id));

    cleanup(&registry, &created.id).await;
}

#[tokio::test]
async fn test_duplicate_live_subdomain_rejected() {
    skip_if_no_db!();
    let registry = get_test_registry().await.expect("registry");

    let draft = unique_draft("tenant-pg-2");
    let first = registry.create_instance(&draft).await.unwrap();

    let err = registry.create_instance(&draft).await.unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");

    cleanup(&registry, &first.id).await;
}

#[tokio::test]
async fn test_transition_cas_and_invalid_edge() {
    skip_if_no_db!();
    let registry = get_test_registry().await.expect("registry");

    let instance = registry
        .create_instance(&unique_draft("tenant-pg-3"))
        .await
        .unwrap();

    // pending -> running is not an edge.
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

    registry
        .transition(
            &instance.id,
            InstanceStatus::Pending,
            InstanceStatus::Provisioning,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();

    // Stale expectation loses the CAS.
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

    let current = registry.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(current.status, InstanceStatus::Provisioning);

    cleanup(&registry, &instance.id).await;
}

#[tokio::test]
async fn test_single_flight_marker_cas() {
    skip_if_no_db!();
    let registry = get_test_registry().await.expect("registry");

    let instance = registry
        .create_instance(&unique_draft("tenant-pg-4"))
        .await
        .unwrap();

    registry
        .begin_operation(&instance.id, "provision")
        .await
        .unwrap();
    let err = registry
        .begin_operation(&instance.id, "backup")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "OPERATION_IN_PROGRESS");

    registry.end_operation(&instance.id).await.unwrap();
    registry
        .begin_operation(&instance.id, "backup")
        .await
        .unwrap();

    cleanup(&registry, &instance.id).await;
}

#[tokio::test]
async fn test_shared_slot_conditional_increment() {
    skip_if_no_db!();
    let registry = get_test_registry().await.expect("registry");

    let cluster_ref = format!("test-cluster-{}", Uuid::new_v4().simple());
    registry
        .register_shared_cluster(&cluster_ref, 2)
        .await
        .unwrap();

    assert!(registry.reserve_shared_slot(&cluster_ref).await.unwrap());
    assert!(registry.reserve_shared_slot(&cluster_ref).await.unwrap());
    assert!(!registry.reserve_shared_slot(&cluster_ref).await.unwrap());

    let allocations = registry.list_shared_clusters().await.unwrap();
    let alloc = allocations
        .iter()
        .find(|a| a.cluster_ref == cluster_ref)
        .unwrap();
    assert_eq!(alloc.tenant_count, 2);

    sqlx::query("DELETE FROM shared_cluster_allocations WHERE cluster_ref = $1")
        .bind(&cluster_ref)
        .execute(registry.pool())
        .await
        .ok();
}

#[tokio::test]
async fn test_backup_record_lifecycle() {
    skip_if_no_db!();
    let registry = get_test_registry().await.expect("registry");

    let instance = registry
        .create_instance(&unique_draft("tenant-pg-5"))
        .await
        .unwrap();

    let record = registry
        .create_backup(&instance.id, BackupKind::Manual, None)
        .await
        .unwrap();
    registry.mark_backup_running(&record.id).await.unwrap();
    let completed = registry
        .complete_backup(&record.id, "dump-ref", "volsnap-ref", 2048)
        .await
        .unwrap();
    assert_eq!(completed.size_bytes, 2048);

    // Terminal records reject further mutation.
    let err = registry
        .fail_backup(&record.id, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");

    let listed = registry.list_backups(&instance.id).await.unwrap();
    assert_eq!(listed.len(), 1);

    cleanup(&registry, &instance.id).await;
}
