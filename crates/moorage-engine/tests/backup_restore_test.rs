// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup/restore orchestrator tests: consistent capture, recoverable
//! failure handling, and content-equal round trips.

mod common;

use common::*;
use moorage_core::model::{BackupKind, BackupStatus, InstanceStatus};
use moorage_core::registry::Registry;
use moorage_engine::{backup, provision};

#[tokio::test]
async fn test_manual_backup_of_running_instance_completes() {
    let h = harness();
    let instance = provision::provision(&h.state, basic_draft("acme"))
        .await
        .unwrap();
    let db_name = instance.database_name.clone().unwrap();
    h.databases.seed("alpha", &db_name, "orders=17").await;
    h.volumes
        .write(&moorage_engine::state::volume_ref(&instance.id), "uploads-v1")
        .await;

    let record = backup::backup(&h.state, &instance.id, BackupKind::Manual)
        .await
        .unwrap();

    assert_eq!(record.status, BackupStatus::Completed);
    assert_eq!(record.kind, BackupKind::Manual);
    assert!(record.size_bytes > 0);
    assert!(record.database_snapshot_ref.is_some());
    assert!(record.volume_snapshot_ref.is_some());
    // Manual backups carry no retention expiry.
    assert!(record.retention_expires_at.is_none());

    // Stopped for consistency, then handed back running.
    let after = h.registry.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(after.status, InstanceStatus::Running);
    assert!(after.in_flight_operation.is_none());
    assert!(
        h.containers
            .is_running(after.container_ref.as_deref().unwrap())
            .await
    );
}

#[tokio::test]
async fn test_scheduled_backup_carries_retention_expiry() {
    let h = harness();
    let instance = provision::provision(&h.state, basic_draft("acme"))
        .await
        .unwrap();

    let record = backup::backup(&h.state, &instance.id, BackupKind::Scheduled)
        .await
        .unwrap();
    assert_eq!(record.status, BackupStatus::Completed);
    assert!(record.retention_expires_at.is_some());
}

#[tokio::test]
async fn test_backup_of_stopped_instance_stays_stopped() {
    let h = harness();
    let instance = provision::provision(&h.state, basic_draft("acme"))
        .await
        .unwrap();
    provision::stop_instance(&h.state, &instance.id).await.unwrap();

    let record = backup::backup(&h.state, &instance.id, BackupKind::Manual)
        .await
        .unwrap();
    assert_eq!(record.status, BackupStatus::Completed);

    let after = h.registry.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(after.status, InstanceStatus::Stopped);
    assert!(
        !h.containers
            .is_running(after.container_ref.as_deref().unwrap())
            .await
    );
}

#[tokio::test]
async fn test_backup_restore_round_trip_preserves_content() {
    let h = harness();
    let instance = provision::provision(&h.state, basic_draft("acme"))
        .await
        .unwrap();
    let db_name = instance.database_name.clone().unwrap();
    let volume = moorage_engine::state::volume_ref(&instance.id);

    h.databases.seed("alpha", &db_name, "orders=17").await;
    h.volumes.write(&volume, "uploads-v1").await;

    let record = backup::backup(&h.state, &instance.id, BackupKind::Manual)
        .await
        .unwrap();

    // The tenant's data drifts (or is corrupted) after the capture.
    h.databases.seed("alpha", &db_name, "orders=99-corrupted").await;
    h.volumes.write(&volume, "uploads-v2-corrupted").await;

    provision::stop_instance(&h.state, &instance.id).await.unwrap();
    let restored = backup::restore(&h.state, &instance.id, &record.id)
        .await
        .unwrap();

    assert_eq!(restored.status, InstanceStatus::Running);
    assert!(restored.last_error.is_none());

    // Content equality with the captured state, for both stores.
    assert_eq!(
        h.databases.content_of("alpha", &db_name).await.as_deref(),
        Some("orders=17")
    );
    assert_eq!(h.volumes.read(&volume).await.as_deref(), Some("uploads-v1"));

    // A fresh container serves the restored data.
    assert!(
        h.containers
            .is_running(restored.container_ref.as_deref().unwrap())
            .await
    );
    assert_ne!(restored.container_ref, instance.container_ref);
}

#[tokio::test]
async fn test_restore_rejects_non_completed_records() {
    let h = harness();
    let instance = provision::provision(&h.state, basic_draft("acme"))
        .await
        .unwrap();
    provision::stop_instance(&h.state, &instance.id).await.unwrap();

    // A pending record is never a restore source.
    let pending = h
        .registry
        .create_backup(&instance.id, BackupKind::Manual, None)
        .await
        .unwrap();
    let err = backup::restore(&h.state, &instance.id, &pending.id)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    // Neither is a failed one, even with partial refs.
    let failed = h
        .registry
        .create_backup(&instance.id, BackupKind::Manual, None)
        .await
        .unwrap();
    h.registry
        .fail_backup(&failed.id, Some("dump-partial"), None)
        .await
        .unwrap();
    let err = backup::restore(&h.state, &instance.id, &failed.id)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    // The instance was never moved out of stopped.
    let after = h.registry.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(after.status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn test_failed_dump_leaves_instance_recoverable() {
    let h = harness();
    let instance = provision::provision(&h.state, basic_draft("acme"))
        .await
        .unwrap();
    h.databases
        .fail_dump
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = backup::backup(&h.state, &instance.id, BackupKind::Manual)
        .await
        .unwrap_err();
    assert!(err.is_resource_failure());

    // The record is terminal-failed; the instance is back in running (the
    // container was restarted best-effort), never left in backing_up.
    let records = h.registry.list_backups(&instance.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Failed);

    let after = h.registry.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(after.status, InstanceStatus::Running);
    assert!(after.last_error.as_deref().unwrap().contains("dump"));
    assert!(after.in_flight_operation.is_none());
    assert!(
        h.containers
            .is_running(after.container_ref.as_deref().unwrap())
            .await
    );
}

#[tokio::test]
async fn test_failed_restore_marks_instance_failed() {
    let h = harness();
    let instance = provision::provision(&h.state, basic_draft("acme"))
        .await
        .unwrap();

    let record = backup::backup(&h.state, &instance.id, BackupKind::Manual)
        .await
        .unwrap();
    provision::stop_instance(&h.state, &instance.id).await.unwrap();

    // Recreating the workload database fails mid-restore.
    h.databases
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = backup::restore(&h.state, &instance.id, &record.id)
        .await
        .unwrap_err();
    assert!(err.is_resource_failure());

    // Failures are not silently retried; the caller sees a failed
    // instance and must re-invoke restore explicitly.
    let after = h.registry.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(after.status, InstanceStatus::Failed);
    assert!(after.last_error.is_some());
    assert!(after.in_flight_operation.is_none());
}

#[tokio::test]
async fn test_backup_rejected_while_operation_in_flight() {
    let h = harness();
    let instance = provision::provision(&h.state, basic_draft("acme"))
        .await
        .unwrap();

    // Simulate another orchestrator holding the single-flight marker.
    h.registry
        .begin_operation(&instance.id, "restore")
        .await
        .unwrap();

    let err = backup::backup(&h.state, &instance.id, BackupKind::Manual)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "OPERATION_IN_PROGRESS");
}
