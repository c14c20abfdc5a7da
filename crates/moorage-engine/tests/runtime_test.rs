// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests through the runtime: operations queued on the worker
//! pool, executed under the concurrency bound, and a graceful shutdown.

mod common;

use std::time::Duration;

use common::*;
use moorage_core::model::{BackupKind, BackupStatus, InstanceStatus};
use moorage_core::registry::Registry;
use moorage_engine::reconciler::ReconcilerConfig;
use moorage_engine::runtime::EngineRuntime;

async fn start_runtime(h: &Harness) -> EngineRuntime {
    EngineRuntime::builder()
        .registry(h.registry.clone())
        .router(h.state.router.clone())
        .containers(h.containers.clone())
        .volumes(h.volumes.clone())
        .databases(h.databases.clone())
        .operation_timeout(Duration::from_secs(2))
        .reconciler_config(ReconcilerConfig {
            interval: Duration::from_secs(3600),
            staleness_threshold: Duration::from_secs(3600),
        })
        .worker_concurrency(4)
        .build()
        .expect("runtime config")
        .start()
        .await
        .expect("runtime start")
}

#[tokio::test]
async fn test_provision_backup_delete_through_the_pool() {
    let h = harness();
    let runtime = start_runtime(&h).await;

    let instance = runtime.provision(basic_draft("acme")).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);

    let record = runtime
        .backup(&instance.id, BackupKind::Manual)
        .await
        .unwrap();
    assert_eq!(record.status, BackupStatus::Completed);
    assert!(record.size_bytes > 0);

    let deleted = runtime.delete(&instance.id).await.unwrap();
    assert_eq!(deleted.status, InstanceStatus::Deleted);

    // Backups cascade with the instance.
    assert!(runtime.registry().list_backups(&instance.id).await.unwrap().is_empty());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_parallel_operations_on_distinct_instances() {
    let h = harness();
    let runtime = start_runtime(&h).await;

    let (a, b, c) = tokio::join!(
        runtime.provision(basic_draft("one")),
        runtime.provision(basic_draft("two")),
        runtime.provision(basic_draft("three")),
    );

    for result in [a, b, c] {
        assert_eq!(result.unwrap().status, InstanceStatus::Running);
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_builder_rejects_missing_pieces() {
    let result = EngineRuntime::builder().build();
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("registry is required"));
}

#[tokio::test]
async fn test_stop_restore_cycle_through_runtime() {
    let h = harness();
    let runtime = start_runtime(&h).await;

    let instance = runtime.provision(basic_draft("acme")).await.unwrap();
    let db_name = instance.database_name.clone().unwrap();
    h.databases.seed("alpha", &db_name, "orders=17").await;

    let record = runtime
        .backup(&instance.id, BackupKind::Manual)
        .await
        .unwrap();

    h.databases.seed("alpha", &db_name, "garbage").await;
    runtime.stop_instance(&instance.id).await.unwrap();

    let restored = runtime.restore(&instance.id, &record.id).await.unwrap();
    assert_eq!(restored.status, InstanceStatus::Running);
    assert_eq!(
        h.databases.content_of("alpha", &db_name).await.as_deref(),
        Some("orders=17")
    );

    runtime.shutdown().await.unwrap();
}
