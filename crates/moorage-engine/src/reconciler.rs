// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting and correcting drift between the
//! registry and live infrastructure.
//!
//! Two drift classes are handled each pass:
//! - an instance the registry believes `running` whose container no longer
//!   exists is failed;
//! - an instance stuck mid-operation (`provisioning`, `backing_up`,
//!   `restoring`) past the staleness threshold is failed and its in-flight
//!   marker cleared.
//!
//! The reconciler never promotes an instance to `running` or `stopped` on
//! its own; recovery from `failed` is an explicit caller action, so an
//! unresolved inconsistency is never masked. The same pass purges backup
//! records whose retention has expired.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moorage_core::error::Result;
use moorage_core::model::{Instance, InstanceStatus};
use moorage_core::registry::{InstanceFilter, TransitionUpdate};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::state::EngineState;

/// Statuses that indicate an operation is mid-flight and can go stale.
const STUCK_SCAN_STATUSES: [InstanceStatus; 3] = [
    InstanceStatus::Provisioning,
    InstanceStatus::BackingUp,
    InstanceStatus::Restoring,
];

/// Instances examined per status per pass.
const SCAN_BATCH: i64 = 500;

/// Configuration for the lifecycle reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to run a reconciliation pass.
    pub interval: Duration,
    /// Age past which a mid-flight operation counts as stuck. Must comfortably
    /// exceed the operation timeout, or healthy operations get failed under it.
    pub staleness_threshold: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(900),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Running instances failed because their container is gone.
    pub failed_missing_container: usize,
    /// Instances failed because their operation went stale.
    pub failed_stale: usize,
    /// Expired backup records purged.
    pub purged_backups: u64,
}

/// Background worker that reconciles registry state against live
/// infrastructure.
pub struct Reconciler {
    state: Arc<EngineState>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(state: Arc<EngineState>, config: ReconcilerConfig) -> Self {
        Self {
            state,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            staleness_secs = self.config.staleness_threshold.as_secs(),
            "reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    match self.reconcile_once().await {
                        Ok(report) => {
                            if report != ReconcileReport::default() {
                                info!(
                                    missing_container = report.failed_missing_container,
                                    stale = report.failed_stale,
                                    purged_backups = report.purged_backups,
                                    "reconciliation pass corrected drift"
                                );
                            } else {
                                debug!("reconciliation pass found no drift");
                            }
                        }
                        Err(e) => error!(error = %e, "reconciliation pass failed"),
                    }
                }
            }
        }

        info!("reconciler stopped");
    }

    /// Run one reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        report.failed_missing_container = self.fail_missing_containers().await?;
        report.failed_stale = self.fail_stale_operations().await?;
        report.purged_backups = self.state.registry.purge_expired_backups(Utc::now()).await?;

        Ok(report)
    }

    /// Fail running instances whose container no longer exists.
    async fn fail_missing_containers(&self) -> Result<usize> {
        let running = self
            .state
            .registry
            .list_instances(
                &InstanceFilter {
                    tenant_id: None,
                    status: Some(InstanceStatus::Running),
                },
                SCAN_BATCH,
                0,
            )
            .await?;

        let mut failed = 0;
        for instance in running {
            let missing = match &instance.container_ref {
                Some(container_ref) => !self.state.containers.exists(container_ref).await?,
                None => true,
            };
            if !missing {
                continue;
            }

            warn!(
                instance_id = %instance.id,
                container_ref = ?instance.container_ref,
                "container missing while registry says running"
            );
            if self.fail_instance(&instance, "container missing").await {
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Fail instances whose mid-flight operation exceeded the staleness
    /// threshold.
    async fn fail_stale_operations(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.staleness_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(900));

        let mut failed = 0;
        for status in STUCK_SCAN_STATUSES {
            let stuck = self
                .state
                .registry
                .list_instances(
                    &InstanceFilter {
                        tenant_id: None,
                        status: Some(status),
                    },
                    SCAN_BATCH,
                    0,
                )
                .await?;

            for instance in stuck {
                if instance.updated_at >= cutoff {
                    continue;
                }

                warn!(
                    instance_id = %instance.id,
                    status = %instance.status,
                    updated_at = %instance.updated_at,
                    "stale operation detected"
                );

                let cause = format!(
                    "stale operation: stuck in '{}' since {}",
                    instance.status,
                    instance.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                if self.fail_instance(&instance, &cause).await {
                    // The stuck operation will never release its marker.
                    if let Err(e) = self.state.registry.end_operation(&instance.id).await {
                        error!(instance_id = %instance.id, error = %e, "marker clear failed");
                    }
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    /// Transition one instance to failed; a lost CAS means an orchestrator
    /// got there first, which is fine.
    async fn fail_instance(&self, instance: &Instance, cause: &str) -> bool {
        match self
            .state
            .registry
            .transition(
                &instance.id,
                instance.status,
                InstanceStatus::Failed,
                TransitionUpdate::with_error(cause.to_string()),
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(
                    instance_id = %instance.id,
                    error = %e,
                    "drift correction lost a race, skipping"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.staleness_threshold, Duration::from_secs(900));
    }

    #[test]
    fn test_config_custom() {
        let config = ReconcilerConfig {
            interval: Duration::from_secs(5),
            staleness_threshold: Duration::from_secs(60),
        };
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.staleness_threshold, Duration::from_secs(60));
    }

    #[test]
    fn test_report_default_is_clean() {
        let report = ReconcileReport::default();
        assert_eq!(report.failed_missing_container, 0);
        assert_eq!(report.failed_stale, 0);
        assert_eq!(report.purged_backups, 0);
    }
}
