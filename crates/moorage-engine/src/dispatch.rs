// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation worker pool.
//!
//! Orchestration operations are independent units of work dispatched from a
//! queue and executed under a concurrency bound. Per-instance ordering is
//! the registry's job (status CAS + in-flight marker); the pool makes no
//! ordering promise across instances.

use std::sync::Arc;

use moorage_core::error::{Error, Result};
use moorage_core::model::{BackupKind, BackupRecord, Instance, InstanceDraft};
use moorage_core::strategy::StrategyRequest;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backup as backup_ops;
use crate::provision as provision_ops;
use crate::state::EngineState;

/// Queue depth for pending operations.
const QUEUE_DEPTH: usize = 256;

/// An orchestration operation.
#[derive(Debug)]
pub enum Operation {
    /// Provision a new instance from a draft.
    Provision(InstanceDraft),
    /// Re-run provisioning for a failed instance.
    RetryProvision {
        /// Target instance.
        instance_id: String,
    },
    /// Back up an instance.
    Backup {
        /// Target instance.
        instance_id: String,
        /// Manual or scheduled.
        kind: BackupKind,
    },
    /// Restore an instance from a completed backup.
    Restore {
        /// Target instance.
        instance_id: String,
        /// Source backup record.
        backup_id: String,
    },
    /// Delete an instance and its resources.
    Delete {
        /// Target instance.
        instance_id: String,
    },
    /// Stop a running instance.
    Stop {
        /// Target instance.
        instance_id: String,
    },
    /// Start a stopped instance.
    Start {
        /// Target instance.
        instance_id: String,
    },
    /// Re-evaluate placement and migrate the workload database if needed.
    MigrateStrategy {
        /// Target instance.
        instance_id: String,
        /// Re-evaluation input (tier, flags, measured performance).
        request: StrategyRequest,
    },
}

impl Operation {
    fn kind(&self) -> &'static str {
        match self {
            Operation::Provision(_) => "provision",
            Operation::RetryProvision { .. } => "retry-provision",
            Operation::Backup { .. } => "backup",
            Operation::Restore { .. } => "restore",
            Operation::Delete { .. } => "delete",
            Operation::Stop { .. } => "stop",
            Operation::Start { .. } => "start",
            Operation::MigrateStrategy { .. } => "migrate-strategy",
        }
    }
}

/// Result of a completed operation.
#[derive(Debug)]
pub enum OperationOutput {
    /// The terminal-state instance.
    Instance(Instance),
    /// The terminal-state backup record.
    Backup(BackupRecord),
}

struct Job {
    operation: Operation,
    reply: oneshot::Sender<Result<OperationOutput>>,
}

/// Worker pool executing operations from a bounded queue.
pub struct OperationPool {
    tx: mpsc::Sender<Job>,
    dispatcher: JoinHandle<()>,
}

impl OperationPool {
    /// Start the pool with the given concurrency bound.
    pub fn start(state: Arc<EngineState>, concurrency: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let dispatcher = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // Closed semaphores never happen here; treat as shutdown.
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let state = state.clone();
                tokio::spawn(async move {
                    debug!(operation = job.operation.kind(), "operation dispatched");
                    let output = execute(&state, job.operation).await;
                    // The submitter may have given up waiting; that is fine.
                    let _ = job.reply.send(output);
                    drop(permit);
                });
            }
            info!("operation pool queue closed");
        });

        Self { tx, dispatcher }
    }

    /// Submit an operation and wait for its terminal result.
    pub async fn submit(&self, operation: Operation) -> Result<OperationOutput> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                operation,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::resource("operation dispatch", "operation queue is closed"))?;

        reply_rx
            .await
            .map_err(|_| Error::resource("operation dispatch", "worker dropped the reply"))?
    }

    /// Stop accepting work and wait for the dispatcher to drain.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.dispatcher.await;
    }
}

async fn execute(state: &EngineState, operation: Operation) -> Result<OperationOutput> {
    match operation {
        Operation::Provision(draft) => provision_ops::provision(state, draft)
            .await
            .map(OperationOutput::Instance),
        Operation::RetryProvision { instance_id } => {
            provision_ops::retry_provision(state, &instance_id)
                .await
                .map(OperationOutput::Instance)
        }
        Operation::Backup { instance_id, kind } => backup_ops::backup(state, &instance_id, kind)
            .await
            .map(OperationOutput::Backup),
        Operation::Restore {
            instance_id,
            backup_id,
        } => backup_ops::restore(state, &instance_id, &backup_id)
            .await
            .map(OperationOutput::Instance),
        Operation::Delete { instance_id } => provision_ops::delete_instance(state, &instance_id)
            .await
            .map(OperationOutput::Instance),
        Operation::Stop { instance_id } => provision_ops::stop_instance(state, &instance_id)
            .await
            .map(OperationOutput::Instance),
        Operation::Start { instance_id } => provision_ops::start_instance(state, &instance_id)
            .await
            .map(OperationOutput::Instance),
        Operation::MigrateStrategy {
            instance_id,
            request,
        } => provision_ops::migrate_strategy(state, &instance_id, &request)
            .await
            .map(OperationOutput::Instance),
    }
}
