// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared harness for engine integration tests: in-memory registry plus
//! mock infrastructure, wired the same way `main.rs` wires the real thing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moorage_core::config::{ClusterEndpoint, Credential, RoutingConfig};
use moorage_core::model::{DatabaseStrategy, InstanceDraft, ResourceTier};
use moorage_core::registry::MemoryRegistry;
use moorage_core::router::ConnectionRouter;
use moorage_core::strategy::StrategyPolicy;
use moorage_engine::infra::{MockContainerApi, MockVolumeApi};
use moorage_engine::state::EngineState;
use moorage_engine::workload::MockWorkloadDatabases;

/// A fully wired engine state over mocks, with handles to each mock for
/// seeding and assertions.
pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub containers: Arc<MockContainerApi>,
    pub volumes: Arc<MockVolumeApi>,
    pub databases: Arc<MockWorkloadDatabases>,
    pub state: Arc<EngineState>,
}

/// Build a harness with the given configured workload clusters and policy.
pub fn harness_with(clusters: &[&str], policy: StrategyPolicy) -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    let containers = Arc::new(MockContainerApi::new());
    let volumes = Arc::new(MockVolumeApi::new());
    let databases = Arc::new(MockWorkloadDatabases::new());

    let mut workload_clusters = HashMap::new();
    for cluster_ref in clusters {
        workload_clusters.insert(
            cluster_ref.to_string(),
            ClusterEndpoint {
                host: format!("wl-{cluster_ref}.internal"),
                port: 5432,
            },
        );
    }

    let routing = RoutingConfig {
        platform_url: "postgres://svc:pw@platform-db:5432/moorage".to_string(),
        workload_clusters,
        workload_admin: Credential {
            username: "moorage_admin".to_string(),
            password: "secret".to_string(),
        },
        maintenance_database: "postgres".to_string(),
    };
    let router = Arc::new(ConnectionRouter::new(routing).expect("router"));

    let state = EngineState::new(
        registry.clone(),
        router,
        containers.clone(),
        volumes.clone(),
        databases.clone(),
        policy,
    )
    .with_operation_timeout(Duration::from_secs(2));

    Harness {
        registry,
        containers,
        volumes,
        databases,
        state: Arc::new(state),
    }
}

/// Default two-cluster harness.
pub fn harness() -> Harness {
    harness_with(&["alpha", "beta"], StrategyPolicy::default())
}

/// A basic-tier draft with no compliance flags.
pub fn basic_draft(subdomain: &str) -> InstanceDraft {
    InstanceDraft {
        tenant_id: format!("tenant-{subdomain}"),
        subdomain: subdomain.to_string(),
        resource_tier: ResourceTier::Basic,
        image: "registry.internal/app:stable".to_string(),
        compliance_flags: vec![],
        projected_volume_gb: 1,
        strategy_override: None,
    }
}

/// A draft with custom tier/flags/volume.
pub fn draft_with(
    subdomain: &str,
    tier: ResourceTier,
    flags: &[&str],
    volume_gb: u32,
) -> InstanceDraft {
    InstanceDraft {
        tenant_id: format!("tenant-{subdomain}"),
        subdomain: subdomain.to_string(),
        resource_tier: tier,
        image: "registry.internal/app:stable".to_string(),
        compliance_flags: flags.iter().map(|f| f.to_string()).collect(),
        projected_volume_gb: volume_gb,
        strategy_override: None,
    }
}

/// Shorthand for asserting a strategy value.
pub fn strategy_of(instance: &moorage_core::model::Instance) -> DatabaseStrategy {
    instance.database_strategy.expect("placement must be set")
}
