// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`EngineRuntime`] wires the registry, router, infrastructure seams,
//! worker pool, and reconciler together so the engine can run standalone
//! (see `main.rs`) or embedded in an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use moorage_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = EngineRuntime::builder()
//!         .registry(registry)
//!         .router(router)
//!         .containers(containers)
//!         .volumes(volumes)
//!         .databases(databases)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let instance = runtime.provision(draft).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moorage_core::model::{BackupKind, BackupRecord, Instance, InstanceDraft};
use moorage_core::registry::Registry;
use moorage_core::router::ConnectionRouter;
use moorage_core::strategy::{StrategyPolicy, StrategyRequest};
use tokio::task::JoinHandle;
use tracing::info;

use crate::dispatch::{Operation, OperationOutput, OperationPool};
use crate::infra::{ContainerApi, VolumeApi};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::state::{DEFAULT_OPERATION_TIMEOUT, EngineState};
use crate::workload::WorkloadDatabases;

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    registry: Option<Arc<dyn Registry>>,
    router: Option<Arc<ConnectionRouter>>,
    containers: Option<Arc<dyn ContainerApi>>,
    volumes: Option<Arc<dyn VolumeApi>>,
    databases: Option<Arc<dyn WorkloadDatabases>>,
    policy: StrategyPolicy,
    operation_timeout: Duration,
    reconciler: ReconcilerConfig,
    worker_concurrency: usize,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("registry", &self.registry.as_ref().map(|_| "..."))
            .field("policy", &self.policy)
            .field("operation_timeout", &self.operation_timeout)
            .field("reconciler", &self.reconciler)
            .field("worker_concurrency", &self.worker_concurrency)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            router: None,
            containers: None,
            volumes: None,
            databases: None,
            policy: StrategyPolicy::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            reconciler: ReconcilerConfig::default(),
            worker_concurrency: 8,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instance registry (required).
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the connection router (required).
    pub fn router(mut self, router: Arc<ConnectionRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Set the container runtime (required).
    pub fn containers(mut self, containers: Arc<dyn ContainerApi>) -> Self {
        self.containers = Some(containers);
        self
    }

    /// Set the volume store (required).
    pub fn volumes(mut self, volumes: Arc<dyn VolumeApi>) -> Self {
        self.volumes = Some(volumes);
        self
    }

    /// Set the workload-database operations layer (required).
    pub fn databases(mut self, databases: Arc<dyn WorkloadDatabases>) -> Self {
        self.databases = Some(databases);
        self
    }

    /// Set the placement policy.
    ///
    /// Default: [`StrategyPolicy::default`]
    pub fn policy(mut self, policy: StrategyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the budget for every external call.
    ///
    /// Default: 120 seconds
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the reconciler configuration.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler = config;
        self
    }

    /// Set the number of concurrently executing operations.
    ///
    /// Default: 8
    pub fn worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        let router = self
            .router
            .ok_or_else(|| anyhow::anyhow!("router is required"))?;
        let containers = self
            .containers
            .ok_or_else(|| anyhow::anyhow!("containers is required"))?;
        let volumes = self
            .volumes
            .ok_or_else(|| anyhow::anyhow!("volumes is required"))?;
        let databases = self
            .databases
            .ok_or_else(|| anyhow::anyhow!("databases is required"))?;

        let state = EngineState::new(registry, router, containers, volumes, databases, self.policy)
            .with_operation_timeout(self.operation_timeout);

        Ok(EngineRuntimeConfig {
            state: Arc::new(state),
            reconciler: self.reconciler,
            worker_concurrency: self.worker_concurrency,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    state: Arc<EngineState>,
    reconciler: ReconcilerConfig,
    worker_concurrency: usize,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("reconciler", &self.reconciler)
            .field("worker_concurrency", &self.worker_concurrency)
            .finish_non_exhaustive()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the worker pool and the reconciler.
    pub async fn start(self) -> Result<EngineRuntime> {
        let pool = OperationPool::start(self.state.clone(), self.worker_concurrency);

        let reconciler = Reconciler::new(self.state.clone(), self.reconciler);
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move {
            reconciler.run().await;
        });

        info!(
            worker_concurrency = self.worker_concurrency,
            "engine runtime started"
        );

        Ok(EngineRuntime {
            state: self.state,
            pool,
            reconciler_shutdown,
            reconciler_handle,
        })
    }
}

/// A running engine: worker pool plus reconciler.
///
/// Every orchestration method returns a terminal-state record or a
/// structured error; the engine never reports success with an instance left
/// in a non-terminal status.
pub struct EngineRuntime {
    state: Arc<EngineState>,
    pool: OperationPool,
    reconciler_shutdown: Arc<tokio::sync::Notify>,
    reconciler_handle: JoinHandle<()>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Shared engine state (registry access for read surfaces).
    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// The instance registry.
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.state.registry
    }

    /// Provision a new instance; resolves once it is `running` or `failed`.
    pub async fn provision(&self, draft: InstanceDraft) -> moorage_core::error::Result<Instance> {
        expect_instance(self.pool.submit(Operation::Provision(draft)).await?)
    }

    /// Re-run provisioning for a failed instance.
    pub async fn retry_provision(&self, instance_id: &str) -> moorage_core::error::Result<Instance> {
        expect_instance(
            self.pool
                .submit(Operation::RetryProvision {
                    instance_id: instance_id.to_string(),
                })
                .await?,
        )
    }

    /// Back up an instance; resolves with the terminal backup record.
    pub async fn backup(
        &self,
        instance_id: &str,
        kind: BackupKind,
    ) -> moorage_core::error::Result<BackupRecord> {
        match self
            .pool
            .submit(Operation::Backup {
                instance_id: instance_id.to_string(),
                kind,
            })
            .await?
        {
            OperationOutput::Backup(record) => Ok(record),
            OperationOutput::Instance(instance) => Err(moorage_core::error::Error::resource(
                "operation dispatch",
                format!("unexpected instance output for backup of '{}'", instance.id),
            )),
        }
    }

    /// Restore an instance from a completed backup.
    pub async fn restore(
        &self,
        instance_id: &str,
        backup_id: &str,
    ) -> moorage_core::error::Result<Instance> {
        expect_instance(
            self.pool
                .submit(Operation::Restore {
                    instance_id: instance_id.to_string(),
                    backup_id: backup_id.to_string(),
                })
                .await?,
        )
    }

    /// Delete an instance; idempotent on already-deleted instances.
    pub async fn delete(&self, instance_id: &str) -> moorage_core::error::Result<Instance> {
        expect_instance(
            self.pool
                .submit(Operation::Delete {
                    instance_id: instance_id.to_string(),
                })
                .await?,
        )
    }

    /// Stop a running instance.
    pub async fn stop_instance(&self, instance_id: &str) -> moorage_core::error::Result<Instance> {
        expect_instance(
            self.pool
                .submit(Operation::Stop {
                    instance_id: instance_id.to_string(),
                })
                .await?,
        )
    }

    /// Start a stopped instance.
    pub async fn start_instance(&self, instance_id: &str) -> moorage_core::error::Result<Instance> {
        expect_instance(
            self.pool
                .submit(Operation::Start {
                    instance_id: instance_id.to_string(),
                })
                .await?,
        )
    }

    /// Re-evaluate placement for a stopped instance and migrate if needed.
    pub async fn migrate_strategy(
        &self,
        instance_id: &str,
        request: StrategyRequest,
    ) -> moorage_core::error::Result<Instance> {
        expect_instance(
            self.pool
                .submit(Operation::MigrateStrategy {
                    instance_id: instance_id.to_string(),
                    request,
                })
                .await?,
        )
    }

    /// Gracefully shut down the runtime: stop the reconciler and drain the
    /// operation queue.
    pub async fn shutdown(self) -> Result<()> {
        info!("engine runtime shutting down...");

        self.reconciler_shutdown.notify_one();
        self.pool.shutdown().await;
        self.reconciler_handle.await?;

        info!("engine runtime shutdown complete");
        Ok(())
    }
}

fn expect_instance(output: OperationOutput) -> moorage_core::error::Result<Instance> {
    match output {
        OperationOutput::Instance(instance) => Ok(instance),
        OperationOutput::Backup(record) => Err(moorage_core::error::Error::resource(
            "operation dispatch",
            format!("unexpected backup output '{}'", record.id),
        )),
    }
}
