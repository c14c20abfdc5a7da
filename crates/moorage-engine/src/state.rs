// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared state for the orchestrators.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moorage_core::error::{Error, Result};
use moorage_core::model::ResourceTier;
use moorage_core::registry::Registry;
use moorage_core::router::ConnectionRouter;
use moorage_core::strategy::StrategyPolicy;

use crate::infra::{ContainerApi, VolumeApi};
use crate::workload::WorkloadDatabases;

/// Default budget for external calls (container start, dump, restore...).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared state for orchestration operations: registry, router, and the
/// infrastructure seams, plus the per-call timeout budget.
pub struct EngineState {
    /// The instance registry (platform cluster).
    pub registry: Arc<dyn Registry>,
    /// Connection router across the clusters.
    pub router: Arc<ConnectionRouter>,
    /// The container runtime.
    pub containers: Arc<dyn ContainerApi>,
    /// The volume store.
    pub volumes: Arc<dyn VolumeApi>,
    /// Workload-database operations.
    pub databases: Arc<dyn WorkloadDatabases>,
    /// Placement policy.
    pub policy: StrategyPolicy,
    /// Budget applied to every external call.
    pub operation_timeout: Duration,
}

impl EngineState {
    /// Create engine state with the default operation timeout.
    pub fn new(
        registry: Arc<dyn Registry>,
        router: Arc<ConnectionRouter>,
        containers: Arc<dyn ContainerApi>,
        volumes: Arc<dyn VolumeApi>,
        databases: Arc<dyn WorkloadDatabases>,
        policy: StrategyPolicy,
    ) -> Self {
        Self {
            registry,
            router,
            containers,
            volumes,
            databases,
            policy,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Set the per-call timeout budget.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Run an external call under the operation timeout. Elapsed budgets
    /// surface as [`Error::Timeout`] and are treated like any other resource
    /// failure: terminal for the operation, never silently retried.
    pub async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                budget: self.operation_timeout,
            }),
        }
    }
}

/// Stable volume ref for an instance.
pub fn volume_ref(instance_id: &str) -> String {
    format!("moorage-data-{instance_id}")
}

/// Stable container name for an instance.
pub fn container_name(instance_id: &str) -> String {
    format!("moorage-app-{instance_id}")
}

/// Workload database name for an instance: sanitized tenant id plus a short
/// unique suffix, within PostgreSQL's identifier limit.
pub fn database_name(tenant_id: &str, instance_id: &str) -> String {
    let tenant: String = tenant_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(32)
        .collect();
    let suffix: String = instance_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("tenant_{tenant}_{suffix}")
}

/// Container limits per resource tier: (cpus, memory MB).
pub fn tier_limits(tier: ResourceTier) -> (f64, u64) {
    match tier {
        ResourceTier::Basic => (0.5, 512),
        ResourceTier::Standard => (1.0, 1024),
        ResourceTier::Premium => (2.0, 2048),
        ResourceTier::Enterprise => (4.0, 4096),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_name_sanitization() {
        let name = database_name("Acme Shop!", "3f9a17c2-aaaa-bbbb-cccc-000000000000");
        assert_eq!(name, "tenant_acme_shop__3f9a17c2");
        assert!(name.len() <= 63);

        // Long tenant ids stay within the identifier limit.
        let long = database_name(&"x".repeat(100), "3f9a17c2-dead-beef");
        assert!(long.len() <= 63);
    }

    #[test]
    fn test_tier_limits_scale_up() {
        assert_eq!(tier_limits(ResourceTier::Basic), (0.5, 512));
        assert_eq!(tier_limits(ResourceTier::Enterprise), (4.0, 4096));
    }

    #[test]
    fn test_resource_names_are_stable() {
        assert_eq!(volume_ref("abc"), "moorage-data-abc");
        assert_eq!(container_name("abc"), "moorage-app-abc");
    }
}
