// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning orchestration: bring-up, stop/start, deletion, retry, and
//! strategy migration.
//!
//! Every sequence here ends in a well-defined terminal instance status.
//! There are no cross-resource transactions between the container runtime
//! and the database server; partially created resources are compensated
//! once, best-effort, and the primary failure is always the one reported.

use std::collections::HashMap;
use std::time::Duration;

use moorage_core::error::{Error, Result};
use moorage_core::model::{DatabaseStrategy, Instance, InstanceDraft, InstanceStatus};
use moorage_core::registry::{DatabasePlacement, NetworkInfo, TransitionUpdate};
use moorage_core::strategy::{PlacementDecision, StrategyRequest};
use tracing::{error, info, warn};

use crate::infra::{ContainerHandle, ContainerSpec};
use crate::state::{EngineState, container_name, database_name, tier_limits, volume_ref};

/// Interval between health probes while waiting for a started container.
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between in-flight marker polls while a delete waits its turn.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resources created so far by a bring-up, for compensation on failure.
#[derive(Debug, Default)]
struct ProvisionContext {
    reserved_slot: Option<String>,
    created_database: Option<(String, String)>,
    created_container: Option<String>,
}

/// Provision a new instance from a draft.
///
/// Creates the registry record, then drives it to `running` or `failed`;
/// an instance never stays in `pending`. Duplicate live subdomains are
/// rejected before any resource is touched.
pub async fn provision(state: &EngineState, draft: InstanceDraft) -> Result<Instance> {
    let instance = state.registry.create_instance(&draft).await?;

    info!(
        instance_id = %instance.id,
        tenant_id = %instance.tenant_id,
        subdomain = %instance.subdomain,
        tier = %instance.resource_tier,
        "instance accepted for provisioning"
    );

    state.registry.begin_operation(&instance.id, "provision").await?;
    let request = StrategyRequest::from_draft(&draft);
    let result = run_provisioning(state, &instance, &request).await;
    release_marker(state, &instance.id).await;
    result
}

/// Re-run provisioning for a `failed` instance. Explicit recovery: the
/// reconciler never does this on its own.
///
/// When the failed instance already has a database placement it is kept;
/// otherwise placement is re-evaluated from the stored tier.
pub async fn retry_provision(state: &EngineState, instance_id: &str) -> Result<Instance> {
    let instance = require_instance(state, instance_id).await?;
    if instance.status != InstanceStatus::Failed {
        return Err(Error::Validation {
            field: "status",
            message: format!("retry requires a failed instance, found '{}'", instance.status),
        });
    }

    state.registry.begin_operation(&instance.id, "provision").await?;
    let request = StrategyRequest {
        tier: instance.resource_tier,
        compliance_flags: vec![],
        projected_volume_gb: 0,
        custom_override: instance.database_strategy,
        measured: None,
    };
    let result = run_provisioning(state, &instance, &request).await;
    release_marker(state, &instance.id).await;
    result
}

async fn run_provisioning(
    state: &EngineState,
    instance: &Instance,
    request: &StrategyRequest,
) -> Result<Instance> {
    state
        .registry
        .transition(
            &instance.id,
            instance.status,
            InstanceStatus::Provisioning,
            TransitionUpdate::default(),
        )
        .await?;

    let mut ctx = ProvisionContext::default();
    match bring_up(state, instance, request, &mut ctx).await {
        Ok((placement, network)) => {
            let running = state
                .registry
                .transition(
                    &instance.id,
                    InstanceStatus::Provisioning,
                    InstanceStatus::Running,
                    TransitionUpdate {
                        last_error: None,
                        database: Some(placement),
                        network: Some(network),
                    },
                )
                .await?;

            info!(
                instance_id = %running.id,
                cluster_ref = ?running.database_cluster_ref,
                strategy = ?running.database_strategy,
                address = ?running.address,
                "instance provisioned"
            );
            Ok(running)
        }
        Err(e) => {
            warn!(instance_id = %instance.id, error = %e, "provisioning failed, compensating");
            compensate(state, &ctx).await;
            state
                .registry
                .transition(
                    &instance.id,
                    InstanceStatus::Provisioning,
                    InstanceStatus::Failed,
                    TransitionUpdate::with_error(e.to_string()),
                )
                .await?;
            Err(e)
        }
    }
}

/// Allocate placement, create the workload database, and start the
/// container. On error the caller compensates using the context.
async fn bring_up(
    state: &EngineState,
    instance: &Instance,
    request: &StrategyRequest,
    ctx: &mut ProvisionContext,
) -> Result<(DatabasePlacement, NetworkInfo)> {
    // Reuse an existing placement on retry; otherwise decide one.
    let (strategy, cluster_ref, db_name) = match (
        instance.database_strategy,
        &instance.database_cluster_ref,
        &instance.database_name,
    ) {
        (Some(strategy), Some(cluster_ref), Some(db_name)) => {
            (strategy, cluster_ref.clone(), db_name.clone())
        }
        _ => {
            let (strategy, cluster_ref) = resolve_placement(state, request, ctx).await?;
            let db_name = database_name(&instance.tenant_id, &instance.id);
            (strategy, cluster_ref, db_name)
        }
    };

    if !state
        .timed(
            "workload database lookup",
            state.databases.database_exists(&cluster_ref, &db_name),
        )
        .await?
    {
        state
            .timed(
                "workload database creation",
                state.databases.create_database(&cluster_ref, &db_name),
            )
            .await?;
        ctx.created_database = Some((cluster_ref.clone(), db_name.clone()));
    }

    let volume = volume_ref(&instance.id);
    state
        .timed("volume creation", state.volumes.ensure(&volume))
        .await?;

    let spec = container_spec(state, instance, &cluster_ref, &db_name)?;
    let handle = state
        .timed("container creation", state.containers.create(&spec))
        .await?;
    ctx.created_container = Some(handle.container_ref.clone());

    state
        .timed(
            "container start",
            state.containers.start(&handle.container_ref),
        )
        .await?;
    wait_until_healthy(state, &handle).await?;

    Ok((
        DatabasePlacement {
            strategy,
            cluster_ref,
            database_name: db_name,
        },
        NetworkInfo {
            container_ref: handle.container_ref,
            address: handle.address,
        },
    ))
}

/// Decide and reserve placement for a new instance.
///
/// Shared reservations go through the registry's conditional increment, so
/// two concurrent provisions can never both take the last slot. When no
/// shared cluster has room, a configured-but-unused endpoint is registered
/// as a new shared cluster; when none is free the request fails with
/// [`Error::Capacity`].
async fn resolve_placement(
    state: &EngineState,
    request: &StrategyRequest,
    ctx: &mut ProvisionContext,
) -> Result<(DatabaseStrategy, String)> {
    let max_attempts = state.router.cluster_refs().len() + 2;

    for _ in 0..max_attempts {
        let allocations = state.registry.list_shared_clusters().await?;
        match state.policy.select(request, &allocations) {
            PlacementDecision::Dedicated { reason } => {
                let cluster_ref = pick_free_cluster(state).await?;
                info!(
                    cluster_ref = %cluster_ref,
                    reason = %reason,
                    "dedicated workload cluster selected"
                );
                return Ok((DatabaseStrategy::Dedicated, cluster_ref));
            }
            PlacementDecision::Shared { cluster_ref } => {
                if state.registry.reserve_shared_slot(&cluster_ref).await? {
                    ctx.reserved_slot = Some(cluster_ref.clone());
                    return Ok((DatabaseStrategy::Shared, cluster_ref));
                }
                // Lost the slot race; re-read occupancy and pick again.
            }
            PlacementDecision::SharedNeedsCluster => {
                let cluster_ref = pick_free_cluster(state).await.map_err(|_| Error::Capacity {
                    reason: "every shared cluster is at capacity and no configured endpoint is free"
                        .to_string(),
                })?;
                state
                    .registry
                    .register_shared_cluster(&cluster_ref, state.policy.shared_cluster_capacity)
                    .await?;
                info!(cluster_ref = %cluster_ref, "stood up new shared workload cluster");
            }
        }
    }

    Err(Error::Capacity {
        reason: "could not reserve a shared slot after repeated attempts".to_string(),
    })
}

/// A configured workload cluster not referenced by any instance or shared
/// allocation.
async fn pick_free_cluster(state: &EngineState) -> Result<String> {
    let in_use = state.registry.clusters_in_use().await?;
    state
        .router
        .cluster_refs()
        .into_iter()
        .find(|cluster_ref| !in_use.contains(cluster_ref))
        .ok_or_else(|| Error::Capacity {
            reason: "no configured workload cluster is free".to_string(),
        })
}

pub(crate) fn container_spec(
    state: &EngineState,
    instance: &Instance,
    cluster_ref: &str,
    db_name: &str,
) -> Result<ContainerSpec> {
    let (cpu_limit, memory_limit_mb) = tier_limits(instance.resource_tier);

    let mut env = HashMap::new();
    env.insert(
        "DATABASE_URL".to_string(),
        workload_database_url(state, cluster_ref, db_name)?,
    );
    env.insert("TENANT_ID".to_string(), instance.tenant_id.clone());
    env.insert("SUBDOMAIN".to_string(), instance.subdomain.clone());

    Ok(ContainerSpec {
        name: container_name(&instance.id),
        image: instance.image.clone(),
        env,
        volume_ref: volume_ref(&instance.id),
        cpu_limit: Some(cpu_limit),
        memory_limit_mb: Some(memory_limit_mb),
    })
}

/// Connection URL handed to the application container.
fn workload_database_url(state: &EngineState, cluster_ref: &str, db_name: &str) -> Result<String> {
    let endpoint = state.router.endpoint(cluster_ref)?;
    let admin = state.router.admin_credential();
    Ok(format!(
        "postgres://{}:{}@{}:{}/{}",
        admin.username, admin.password, endpoint.host, endpoint.port, db_name
    ))
}

/// Wait for a started container to report healthy, under the operation
/// timeout.
pub(crate) async fn wait_until_healthy(state: &EngineState, handle: &ContainerHandle) -> Result<()> {
    state
        .timed("container health", async {
            loop {
                if state.containers.health(&handle.container_ref).await? {
                    return Ok(());
                }
                tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
            }
        })
        .await
}

/// Undo partially created resources after a failed bring-up. One attempt,
/// best-effort: compensation failures are logged and never mask the primary
/// failure.
async fn compensate(state: &EngineState, ctx: &ProvisionContext) {
    if let Some(container_ref) = &ctx.created_container
        && let Err(e) = state.containers.remove(container_ref).await
    {
        error!(container_ref = %container_ref, error = %e, "compensation: container removal failed");
    }

    if let Some((cluster_ref, db_name)) = &ctx.created_database
        && let Err(e) = state.databases.drop_database(cluster_ref, db_name).await
    {
        error!(
            cluster_ref = %cluster_ref,
            database = %db_name,
            error = %e,
            "compensation: database drop failed"
        );
    }

    if let Some(cluster_ref) = &ctx.reserved_slot
        && let Err(e) = state.registry.release_shared_slot(cluster_ref).await
    {
        error!(cluster_ref = %cluster_ref, error = %e, "compensation: slot release failed");
    }
}

/// Stop a running instance's container.
pub async fn stop_instance(state: &EngineState, instance_id: &str) -> Result<Instance> {
    let instance = require_instance(state, instance_id).await?;
    if instance.status != InstanceStatus::Running {
        return Err(Error::Validation {
            field: "status",
            message: format!("stop requires a running instance, found '{}'", instance.status),
        });
    }

    state.registry.begin_operation(instance_id, "stop").await?;
    let result = async {
        if let Some(container_ref) = &instance.container_ref {
            state
                .timed("container stop", state.containers.stop(container_ref))
                .await?;
        }
        state
            .registry
            .transition(
                instance_id,
                InstanceStatus::Running,
                InstanceStatus::Stopped,
                TransitionUpdate::default(),
            )
            .await
    }
    .await;
    release_marker(state, instance_id).await;
    result
}

/// Start a stopped instance's container. A failed start leaves the instance
/// `stopped` with the error surfaced to the caller.
pub async fn start_instance(state: &EngineState, instance_id: &str) -> Result<Instance> {
    let instance = require_instance(state, instance_id).await?;
    if instance.status != InstanceStatus::Stopped {
        return Err(Error::Validation {
            field: "status",
            message: format!("start requires a stopped instance, found '{}'", instance.status),
        });
    }
    let container_ref = instance.container_ref.clone().ok_or_else(|| {
        Error::resource("container start", "instance has no container to start")
    })?;

    state.registry.begin_operation(instance_id, "start").await?;
    let result = async {
        state
            .timed("container start", state.containers.start(&container_ref))
            .await?;
        let handle = ContainerHandle {
            container_ref: container_ref.clone(),
            address: instance.address.clone().unwrap_or_default(),
        };
        wait_until_healthy(state, &handle).await?;
        state
            .registry
            .transition(
                instance_id,
                InstanceStatus::Stopped,
                InstanceStatus::Running,
                TransitionUpdate::default(),
            )
            .await
    }
    .await;
    release_marker(state, instance_id).await;
    result
}

/// Delete an instance and all its resources.
///
/// Idempotent: deleting a `deleted` instance is a no-op returning the same
/// terminal record. A delete arriving mid-operation waits for the current
/// operation to finish rather than preempting it. A partially failed
/// teardown leaves the instance in `deleting`; calling delete again resumes
/// it.
pub async fn delete_instance(state: &EngineState, instance_id: &str) -> Result<Instance> {
    let instance = require_instance(state, instance_id).await?;
    if instance.status == InstanceStatus::Deleted {
        return Ok(instance);
    }

    wait_for_idle(state, instance_id).await?;
    state.registry.begin_operation(instance_id, "delete").await?;
    let result = run_delete(state, instance_id).await;
    release_marker(state, instance_id).await;
    result
}

async fn run_delete(state: &EngineState, instance_id: &str) -> Result<Instance> {
    let mut instance = require_instance(state, instance_id).await?;

    // Resume a previously interrupted teardown without re-transitioning.
    if instance.status != InstanceStatus::Deleting {
        instance = state
            .registry
            .transition(
                instance_id,
                instance.status,
                InstanceStatus::Deleting,
                TransitionUpdate::default(),
            )
            .await?;
    }

    if let Some(container_ref) = &instance.container_ref {
        if let Err(e) = state.containers.stop(container_ref).await {
            warn!(container_ref = %container_ref, error = %e, "container stop during delete failed");
        }
        if let Err(e) = state.containers.remove(container_ref).await {
            warn!(container_ref = %container_ref, error = %e, "container removal during delete failed");
        }
    }

    // The workload database must actually be gone before the record turns
    // terminal; a failure here leaves the instance resumable in 'deleting'.
    if let (Some(cluster_ref), Some(db_name)) =
        (&instance.database_cluster_ref, &instance.database_name)
    {
        state
            .timed(
                "workload database drop",
                state.databases.drop_database(cluster_ref, db_name),
            )
            .await?;
    }

    let volume = volume_ref(instance_id);
    if let Err(e) = state.volumes.remove(&volume).await {
        warn!(volume_ref = %volume, error = %e, "volume removal during delete failed");
    }

    if instance.database_strategy == Some(DatabaseStrategy::Shared)
        && let Some(cluster_ref) = &instance.database_cluster_ref
    {
        state.registry.release_shared_slot(cluster_ref).await?;
    }

    let purged = state.registry.delete_backups_for_instance(instance_id).await?;
    if purged > 0 {
        info!(instance_id = %instance_id, backups = purged, "cascaded backup records");
    }

    let deleted = state
        .registry
        .transition(
            instance_id,
            InstanceStatus::Deleting,
            InstanceStatus::Deleted,
            TransitionUpdate::default(),
        )
        .await?;

    info!(instance_id = %instance_id, "instance deleted");
    Ok(deleted)
}

/// Re-evaluate placement for a stopped instance and move its workload
/// database when the decision changed.
///
/// The move is bracketed as `stopped → restoring → stopped` and is the only
/// writer of database placement besides provisioning.
pub async fn migrate_strategy(
    state: &EngineState,
    instance_id: &str,
    request: &StrategyRequest,
) -> Result<Instance> {
    let instance = require_instance(state, instance_id).await?;
    if instance.status != InstanceStatus::Stopped {
        return Err(Error::Validation {
            field: "status",
            message: format!(
                "strategy migration requires a stopped instance, found '{}'",
                instance.status
            ),
        });
    }
    let (Some(current_strategy), Some(current_cluster), Some(db_name)) = (
        instance.database_strategy,
        instance.database_cluster_ref.clone(),
        instance.database_name.clone(),
    ) else {
        return Err(Error::Validation {
            field: "database_strategy",
            message: "instance has no database placement to migrate".to_string(),
        });
    };

    state
        .registry
        .begin_operation(instance_id, "migrate-strategy")
        .await?;
    let result = run_migration(
        state,
        &instance,
        request,
        current_strategy,
        &current_cluster,
        &db_name,
    )
    .await;
    release_marker(state, instance_id).await;
    result
}

async fn run_migration(
    state: &EngineState,
    instance: &Instance,
    request: &StrategyRequest,
    current_strategy: DatabaseStrategy,
    current_cluster: &str,
    db_name: &str,
) -> Result<Instance> {
    let allocations = state.registry.list_shared_clusters().await?;
    let decision = state.policy.select(request, &allocations);

    let target_strategy = match &decision {
        PlacementDecision::Dedicated { .. } => DatabaseStrategy::Dedicated,
        PlacementDecision::Shared { .. } | PlacementDecision::SharedNeedsCluster => {
            DatabaseStrategy::Shared
        }
    };
    if target_strategy == current_strategy {
        info!(instance_id = %instance.id, strategy = %current_strategy, "placement unchanged");
        return Ok(instance.clone());
    }

    state
        .registry
        .transition(
            &instance.id,
            InstanceStatus::Stopped,
            InstanceStatus::Restoring,
            TransitionUpdate::default(),
        )
        .await?;

    let mut ctx = ProvisionContext::default();
    match move_database(
        state,
        instance,
        request,
        target_strategy,
        current_cluster,
        db_name,
        &mut ctx,
    )
    .await
    {
        Ok((placement, network)) => {
            let target_cluster = placement.cluster_ref.clone();
            let moved = state
                .registry
                .transition(
                    &instance.id,
                    InstanceStatus::Restoring,
                    InstanceStatus::Stopped,
                    TransitionUpdate {
                        last_error: None,
                        database: Some(placement),
                        network: Some(network),
                    },
                )
                .await?;

            // The old placement is released only after the new one is
            // committed.
            if current_strategy == DatabaseStrategy::Shared {
                if let Err(e) = state.registry.release_shared_slot(current_cluster).await {
                    error!(cluster_ref = %current_cluster, error = %e, "old slot release failed");
                }
            }
            if let Err(e) = state.databases.drop_database(current_cluster, db_name).await {
                error!(
                    cluster_ref = %current_cluster,
                    database = %db_name,
                    error = %e,
                    "old database drop failed"
                );
            }

            info!(
                instance_id = %instance.id,
                from = %current_cluster,
                to = %target_cluster,
                strategy = %target_strategy,
                "strategy migration complete"
            );
            Ok(moved)
        }
        Err(e) => {
            warn!(instance_id = %instance.id, error = %e, "strategy migration failed, compensating");
            compensate(state, &ctx).await;
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

/// Dump the current database, recreate it on the target cluster, and swap
/// the container over to it (left stopped, like the instance).
#[allow(clippy::too_many_arguments)]
async fn move_database(
    state: &EngineState,
    instance: &Instance,
    request: &StrategyRequest,
    target_strategy: DatabaseStrategy,
    current_cluster: &str,
    db_name: &str,
    ctx: &mut ProvisionContext,
) -> Result<(DatabasePlacement, NetworkInfo)> {
    let artifact = state
        .timed(
            "database dump",
            state.databases.dump(current_cluster, db_name),
        )
        .await?;

    let target_cluster = match target_strategy {
        DatabaseStrategy::Dedicated => pick_free_cluster(state).await?,
        DatabaseStrategy::Shared => {
            let (_, cluster_ref) = resolve_placement(state, request, ctx).await?;
            cluster_ref
        }
    };

    state
        .timed(
            "workload database creation",
            state.databases.create_database(&target_cluster, db_name),
        )
        .await?;
    ctx.created_database = Some((target_cluster.clone(), db_name.to_string()));

    state
        .timed(
            "database restore",
            state
                .databases
                .restore_dump(&target_cluster, db_name, &artifact.snapshot_ref),
        )
        .await?;
    state
        .timed(
            "ownership repair",
            state.databases.fix_ownership(&target_cluster, db_name),
        )
        .await?;

    // Swap the container so its DATABASE_URL points at the new cluster.
    if let Some(old_container) = &instance.container_ref
        && let Err(e) = state.containers.remove(old_container).await
    {
        warn!(container_ref = %old_container, error = %e, "old container removal failed");
    }
    let spec = container_spec(state, instance, &target_cluster, db_name)?;
    let handle = state
        .timed("container creation", state.containers.create(&spec))
        .await?;
    ctx.created_container = Some(handle.container_ref.clone());

    Ok((
        DatabasePlacement {
            strategy: target_strategy,
            cluster_ref: target_cluster,
            database_name: db_name.to_string(),
        },
        NetworkInfo {
            container_ref: handle.container_ref,
            address: handle.address,
        },
    ))
}

/// Wait for the instance's in-flight marker to clear, under the operation
/// timeout.
async fn wait_for_idle(state: &EngineState, instance_id: &str) -> Result<()> {
    state
        .timed("wait for in-flight operation", async {
            loop {
                let instance = require_instance(state, instance_id).await?;
                if instance.in_flight_operation.is_none() {
                    return Ok(());
                }
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        })
        .await
}

pub(crate) async fn require_instance(state: &EngineState, instance_id: &str) -> Result<Instance> {
    state
        .registry
        .get_instance(instance_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "instance",
            id: instance_id.to_string(),
        })
}

pub(crate) async fn release_marker(state: &EngineState, instance_id: &str) {
    if let Err(e) = state.registry.end_operation(instance_id).await {
        error!(instance_id = %instance_id, error = %e, "failed to release in-flight marker");
    }
}
