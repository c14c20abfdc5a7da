// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement strategy selection.
//!
//! Pure policy: the selector reads the shared-cluster occupancy it is handed
//! and decides shared vs dedicated. Reserving capacity (the conditional
//! `tenant_count` increment) and creating clusters/databases belong to the
//! provisioning orchestrator so that decisions stay independently testable.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{DatabaseStrategy, InstanceDraft, ResourceTier, SharedClusterAllocation};

/// Placement policy knobs. An explicit configuration struct rather than
/// scattered conditionals, so tests can exercise every rule.
#[derive(Debug, Clone)]
pub struct StrategyPolicy {
    /// Projected volume above which a tenant gets a dedicated cluster.
    pub shared_volume_ceiling_gb: u32,
    /// Tenants per shared cluster; used when standing up new allocations.
    pub shared_cluster_capacity: i32,
    /// Compliance flags that require regulatory isolation (matched
    /// case-insensitively).
    pub isolation_flags: Vec<String>,
    /// Tiers that always get a dedicated cluster.
    pub dedicated_tiers: Vec<ResourceTier>,
    /// Measured p95 query latency above which a re-evaluated tenant is moved
    /// to a dedicated cluster.
    pub max_p95_query_ms: u64,
    /// Measured storage above which a re-evaluated tenant is moved to a
    /// dedicated cluster.
    pub max_storage_gb: u32,
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        Self {
            shared_volume_ceiling_gb: 5,
            shared_cluster_capacity: 50,
            isolation_flags: vec![
                "hipaa".to_string(),
                "pci-dss".to_string(),
                "fedramp".to_string(),
            ],
            dedicated_tiers: vec![ResourceTier::Premium, ResourceTier::Enterprise],
            max_p95_query_ms: 250,
            max_storage_gb: 8,
        }
    }
}

/// Measured workload characteristics, available only on re-evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Observed p95 query latency in milliseconds.
    pub p95_query_ms: u64,
    /// Observed storage footprint in GB.
    pub storage_gb: u32,
}

/// Input to a placement decision.
#[derive(Debug, Clone)]
pub struct StrategyRequest {
    /// Tenant resource tier.
    pub tier: ResourceTier,
    /// Compliance flags declared for the tenant.
    pub compliance_flags: Vec<String>,
    /// Projected workload volume in GB.
    pub projected_volume_gb: u32,
    /// Operator override, bypassing every other rule.
    pub custom_override: Option<DatabaseStrategy>,
    /// Measured characteristics; `None` on initial creation.
    pub measured: Option<PerformanceSample>,
}

impl StrategyRequest {
    /// Build the initial-creation request for a draft.
    pub fn from_draft(draft: &InstanceDraft) -> Self {
        Self {
            tier: draft.resource_tier,
            compliance_flags: draft.compliance_flags.clone(),
            projected_volume_gb: draft.projected_volume_gb,
            custom_override: draft.strategy_override,
            measured: None,
        }
    }
}

/// Why a tenant was placed on a dedicated cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedicatedReason {
    /// Operator override.
    Override,
    /// A compliance flag requires regulatory isolation.
    Compliance(String),
    /// Projected volume exceeds the shared-tier ceiling.
    ProjectedVolume,
    /// Tier is always dedicated.
    Tier,
    /// Measured performance thresholds exceeded on re-evaluation.
    Performance,
}

impl fmt::Display for DedicatedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedicatedReason::Override => write!(f, "operator override"),
            DedicatedReason::Compliance(flag) => write!(f, "compliance isolation ({})", flag),
            DedicatedReason::ProjectedVolume => write!(f, "projected volume over ceiling"),
            DedicatedReason::Tier => write!(f, "tier placement"),
            DedicatedReason::Performance => write!(f, "measured performance over thresholds"),
        }
    }
}

/// Outcome of a placement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementDecision {
    /// Place on a dedicated cluster; the orchestrator picks a free endpoint.
    Dedicated {
        /// Why the tenant is dedicated.
        reason: DedicatedReason,
    },
    /// Place on this shared cluster (least-loaded with free capacity at the
    /// time of the read; the reservation CAS may still lose a race).
    Shared {
        /// Chosen shared cluster.
        cluster_ref: String,
    },
    /// Shared placement, but no shared cluster has room: the orchestrator
    /// must stand up a new shared cluster before proceeding.
    SharedNeedsCluster,
}

impl StrategyPolicy {
    /// Decide placement for a tenant. First matching rule wins:
    /// override, compliance isolation, volume/tier, measured performance
    /// (re-evaluation only), otherwise shared.
    pub fn select(
        &self,
        request: &StrategyRequest,
        shared: &[SharedClusterAllocation],
    ) -> PlacementDecision {
        match request.custom_override {
            Some(DatabaseStrategy::Dedicated) => {
                return PlacementDecision::Dedicated {
                    reason: DedicatedReason::Override,
                };
            }
            Some(DatabaseStrategy::Shared) => return self.pick_shared(shared),
            None => {}
        }

        if let Some(flag) = self.isolation_flag(&request.compliance_flags) {
            return PlacementDecision::Dedicated {
                reason: DedicatedReason::Compliance(flag),
            };
        }

        if request.projected_volume_gb > self.shared_volume_ceiling_gb {
            return PlacementDecision::Dedicated {
                reason: DedicatedReason::ProjectedVolume,
            };
        }

        if self.dedicated_tiers.contains(&request.tier) {
            return PlacementDecision::Dedicated {
                reason: DedicatedReason::Tier,
            };
        }

        if let Some(measured) = request.measured
            && (measured.p95_query_ms > self.max_p95_query_ms
                || measured.storage_gb > self.max_storage_gb)
        {
            return PlacementDecision::Dedicated {
                reason: DedicatedReason::Performance,
            };
        }

        self.pick_shared(shared)
    }

    /// Least-loaded shared cluster with free capacity, or the signal to
    /// stand up a new one.
    fn pick_shared(&self, shared: &[SharedClusterAllocation]) -> PlacementDecision {
        shared
            .iter()
            .filter(|alloc| alloc.has_capacity())
            .min_by_key(|alloc| (alloc.tenant_count, alloc.cluster_ref.clone()))
            .map(|alloc| PlacementDecision::Shared {
                cluster_ref: alloc.cluster_ref.clone(),
            })
            .unwrap_or(PlacementDecision::SharedNeedsCluster)
    }

    fn isolation_flag(&self, flags: &[String]) -> Option<String> {
        flags
            .iter()
            .find(|flag| {
                self.isolation_flags
                    .iter()
                    .any(|iso| iso.eq_ignore_ascii_case(flag))
            })
            .cloned()
    }
}
