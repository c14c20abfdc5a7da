// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup/restore orchestration.
//!
//! A backup is one atomic-intent operation: database dump + volume snapshot
//! bracketed by container stop/start. Consistency wins over availability -
//! a running container is stopped before the capture. Whatever happens, the
//! instance is handed back in a recoverable status and the backup record
//! reaches a terminal status exactly once.

use chrono::{Duration as ChronoDuration, Utc};
use moorage_core::error::{Error, Result};
use moorage_core::model::{BackupKind, BackupRecord, Instance, InstanceStatus};
use moorage_core::registry::{NetworkInfo, TransitionUpdate};
use tracing::{error, info, warn};

use crate::infra::ContainerHandle;
use crate::provision::{release_marker, require_instance, wait_until_healthy};
use crate::state::{EngineState, volume_ref};

/// Retention for scheduled backups; manual backups live until the instance
/// is deleted.
const SCHEDULED_RETENTION_DAYS: i64 = 30;

/// Artifacts produced so far by a backup attempt, for the failure record.
#[derive(Debug, Default)]
struct CaptureProgress {
    database_snapshot_ref: Option<String>,
    volume_snapshot_ref: Option<String>,
    stopped_container: bool,
}

/// Back up an instance.
///
/// The instance must be `running` or `stopped`. Returns the `completed`
/// record on success; on failure the record is `failed` (partial refs
/// retained) and the instance is back in `running` or `stopped`.
pub async fn backup(
    state: &EngineState,
    instance_id: &str,
    kind: BackupKind,
) -> Result<BackupRecord> {
    let instance = require_instance(state, instance_id).await?;
    let prior = instance.status;
    if !prior.is_recoverable() {
        return Err(Error::Validation {
            field: "status",
            message: format!(
                "backup requires a running or stopped instance, found '{prior}'"
            ),
        });
    }

    state.registry.begin_operation(instance_id, "backup").await?;

    let retention = match kind {
        BackupKind::Scheduled => Some(Utc::now() + ChronoDuration::days(SCHEDULED_RETENTION_DAYS)),
        BackupKind::Manual => None,
    };
    let result = async {
        let record = state
            .registry
            .create_backup(instance_id, kind, retention)
            .await?;
        run_backup(state, &instance, &record).await
    }
    .await;

    release_marker(state, instance_id).await;
    result
}

async fn run_backup(
    state: &EngineState,
    instance: &Instance,
    record: &BackupRecord,
) -> Result<BackupRecord> {
    let prior = instance.status;

    state
        .registry
        .transition(
            &instance.id,
            prior,
            InstanceStatus::BackingUp,
            TransitionUpdate::default(),
        )
        .await?;
    state.registry.mark_backup_running(&record.id).await?;

    info!(
        instance_id = %instance.id,
        backup_id = %record.id,
        kind = %record.kind,
        "backup started"
    );

    let mut progress = CaptureProgress::default();
    match capture(state, instance, &mut progress).await {
        Ok((db_ref, vol_ref, size_bytes)) => {
            state
                .registry
                .transition(
                    &instance.id,
                    InstanceStatus::BackingUp,
                    prior,
                    TransitionUpdate::default(),
                )
                .await?;
            let completed = state
                .registry
                .complete_backup(&record.id, &db_ref, &vol_ref, size_bytes)
                .await?;

            info!(
                instance_id = %instance.id,
                backup_id = %completed.id,
                size_bytes = completed.size_bytes,
                "backup completed"
            );
            Ok(completed)
        }
        Err(e) => {
            warn!(
                instance_id = %instance.id,
                backup_id = %record.id,
                error = %e,
                "backup failed"
            );

            if let Err(record_err) = state
                .registry
                .fail_backup(
                    &record.id,
                    progress.database_snapshot_ref.as_deref(),
                    progress.volume_snapshot_ref.as_deref(),
                )
                .await
            {
                error!(backup_id = %record.id, error = %record_err, "failed to mark backup failed");
            }

            // Hand the instance back in a recoverable status: restart if we
            // stopped it, fall back to stopped when the restart also fails.
            let recovered = recover_container(state, instance, &progress).await;
            if let Err(transition_err) = state
                .registry
                .transition(
                    &instance.id,
                    InstanceStatus::BackingUp,
                    recovered,
                    TransitionUpdate::with_error(e.to_string()),
                )
                .await
            {
                error!(
                    instance_id = %instance.id,
                    error = %transition_err,
                    "failed to return instance to a recoverable status"
                );
            }
            Err(e)
        }
    }
}

/// Stop (when running), dump, snapshot, and restart. Returns the two
/// artifact refs and the combined size.
async fn capture(
    state: &EngineState,
    instance: &Instance,
    progress: &mut CaptureProgress,
) -> Result<(String, String, i64)> {
    let (cluster_ref, db_name) = placement_of(instance)?;

    // Consistent over online: quiesce the application first.
    if instance.status == InstanceStatus::Running
        && let Some(container_ref) = &instance.container_ref
    {
        state
            .timed("container stop", state.containers.stop(container_ref))
            .await?;
        progress.stopped_container = true;
    }

    let artifact = state
        .timed("database dump", state.databases.dump(cluster_ref, db_name))
        .await?;
    progress.database_snapshot_ref = Some(artifact.snapshot_ref.clone());

    let volume = volume_ref(&instance.id);
    let volume_snapshot = state
        .timed("volume snapshot", state.volumes.snapshot(&volume))
        .await?;
    progress.volume_snapshot_ref = Some(volume_snapshot.clone());
    let volume_size = state
        .timed("volume size", state.volumes.size(&volume))
        .await?;

    if progress.stopped_container
        && let Some(container_ref) = &instance.container_ref
    {
        state
            .timed("container restart", state.containers.start(container_ref))
            .await?;
        let handle = ContainerHandle {
            container_ref: container_ref.clone(),
            address: instance.address.clone().unwrap_or_default(),
        };
        wait_until_healthy(state, &handle).await?;
    }

    let size_bytes = (artifact.size_bytes + volume_size) as i64;
    Ok((artifact.snapshot_ref, volume_snapshot, size_bytes))
}

/// Best-effort restart after a failed capture. Returns the status the
/// instance should be handed back in.
async fn recover_container(
    state: &EngineState,
    instance: &Instance,
    progress: &CaptureProgress,
) -> InstanceStatus {
    if !progress.stopped_container {
        // Never touched the container; the prior status still holds.
        return instance.status;
    }

    let Some(container_ref) = &instance.container_ref else {
        return InstanceStatus::Stopped;
    };

    match state.containers.start(container_ref).await {
        Ok(()) => InstanceStatus::Running,
        Err(restart_err) => {
            error!(
                instance_id = %instance.id,
                error = %restart_err,
                "best-effort restart after failed backup did not succeed"
            );
            InstanceStatus::Stopped
        }
    }
}

/// Restore an instance from a completed backup.
///
/// The instance must be `stopped` and the record `completed`; failed
/// records are never a restore source. The workload database is dropped,
/// recreated, and re-owned by the operating credential before the container
/// comes back. Any failure leaves the instance `failed`; restore is never
/// retried implicitly.
pub async fn restore(
    state: &EngineState,
    instance_id: &str,
    backup_id: &str,
) -> Result<Instance> {
    let instance = require_instance(state, instance_id).await?;
    if instance.status != InstanceStatus::Stopped {
        return Err(Error::Validation {
            field: "status",
            message: format!(
                "restore requires a stopped instance, found '{}'",
                instance.status
            ),
        });
    }

    let record = state
        .registry
        .get_backup(backup_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "backup",
            id: backup_id.to_string(),
        })?;
    if record.instance_id != instance_id {
        return Err(Error::Validation {
            field: "backup_id",
            message: "backup belongs to a different instance".to_string(),
        });
    }
    if record.status != moorage_core::model::BackupStatus::Completed {
        return Err(Error::Validation {
            field: "backup_id",
            message: format!(
                "only completed backups can be restored, record is '{}'",
                record.status
            ),
        });
    }
    let (Some(db_snapshot), Some(vol_snapshot)) = (
        record.database_snapshot_ref.clone(),
        record.volume_snapshot_ref.clone(),
    ) else {
        return Err(Error::Validation {
            field: "backup_id",
            message: "backup record is missing artifacts".to_string(),
        });
    };

    state.registry.begin_operation(instance_id, "restore").await?;
    let result = run_restore(state, &instance, &db_snapshot, &vol_snapshot).await;
    release_marker(state, instance_id).await;
    result
}

async fn run_restore(
    state: &EngineState,
    instance: &Instance,
    db_snapshot: &str,
    vol_snapshot: &str,
) -> Result<Instance> {
    let (cluster_ref, db_name) = placement_of(instance)?;

    state
        .registry
        .transition(
            &instance.id,
            InstanceStatus::Stopped,
            InstanceStatus::Restoring,
            TransitionUpdate::default(),
        )
        .await?;

    info!(
        instance_id = %instance.id,
        database_snapshot = %db_snapshot,
        volume_snapshot = %vol_snapshot,
        "restore started"
    );

    match rebuild(state, instance, cluster_ref, db_name, db_snapshot, vol_snapshot).await {
        Ok(network) => {
            let restored = state
                .registry
                .transition(
                    &instance.id,
                    InstanceStatus::Restoring,
                    InstanceStatus::Running,
                    TransitionUpdate {
                        last_error: None,
                        database: None,
                        network: Some(network),
                    },
                )
                .await?;
            info!(instance_id = %restored.id, "restore completed");
            Ok(restored)
        }
        Err(e) => {
            warn!(instance_id = %instance.id, error = %e, "restore failed");
            state
                .registry
                .transition(
                    &instance.id,
                    InstanceStatus::Restoring,
                    InstanceStatus::Failed,
                    TransitionUpdate::with_error(e.to_string()),
                )
                .await?;
            Err(e)
        }
    }
}

/// Drop/recreate the database, restore both artifacts, repair ownership,
/// and bring a fresh container up.
async fn rebuild(
    state: &EngineState,
    instance: &Instance,
    cluster_ref: &str,
    db_name: &str,
    db_snapshot: &str,
    vol_snapshot: &str,
) -> Result<NetworkInfo> {
    // Remove the old container first; it holds connections to the database
    // about to be dropped.
    if let Some(old_container) = &instance.container_ref {
        if let Err(e) = state.containers.stop(old_container).await {
            warn!(container_ref = %old_container, error = %e, "old container stop failed");
        }
        if let Err(e) = state.containers.remove(old_container).await {
            warn!(container_ref = %old_container, error = %e, "old container removal failed");
        }
    }

    state
        .timed(
            "workload database drop",
            state.databases.drop_database(cluster_ref, db_name),
        )
        .await?;
    state
        .timed(
            "workload database creation",
            state.databases.create_database(cluster_ref, db_name),
        )
        .await?;
    state
        .timed(
            "database restore",
            state
                .databases
                .restore_dump(cluster_ref, db_name, db_snapshot),
        )
        .await?;

    let volume = volume_ref(&instance.id);
    state
        .timed(
            "volume restore",
            state.volumes.restore(&volume, vol_snapshot),
        )
        .await?;

    // A restored schema is owned by whatever role produced the dump; reset
    // it or the next migration fails with permission errors.
    state
        .timed(
            "ownership repair",
            state.databases.fix_ownership(cluster_ref, db_name),
        )
        .await?;

    let spec = crate::provision::container_spec(state, instance, cluster_ref, db_name)?;
    let handle = state
        .timed("container creation", state.containers.create(&spec))
        .await?;
    state
        .timed(
            "container start",
            state.containers.start(&handle.container_ref),
        )
        .await?;
    wait_until_healthy(state, &handle).await?;

    Ok(NetworkInfo {
        container_ref: handle.container_ref,
        address: handle.address,
    })
}

fn placement_of(instance: &Instance) -> Result<(&str, &str)> {
    match (&instance.database_cluster_ref, &instance.database_name) {
        (Some(cluster_ref), Some(db_name)) => Ok((cluster_ref, db_name)),
        _ => Err(Error::Validation {
            field: "database_name",
            message: "instance has no database placement".to_string(),
        }),
    }
}
