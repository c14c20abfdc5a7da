// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use moorage_core::config::{ConfigError, RoutingConfig};
use moorage_core::strategy::StrategyPolicy;

/// Engine configuration: cluster routing plus orchestration knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Platform and workload cluster routing.
    pub routing: RoutingConfig,
    /// Placement policy.
    pub policy: StrategyPolicy,
    /// Budget for every external call (container start, dump, restore...).
    pub operation_timeout: Duration,
    /// How often the reconciler scans for drift.
    pub reconciler_interval: Duration,
    /// Age past which an in-flight operation is considered stuck.
    pub staleness_threshold: Duration,
    /// Concurrent orchestration operations.
    pub worker_concurrency: usize,
    /// Directory for dump artifacts and volume snapshots.
    pub data_dir: PathBuf,
}

impl EngineConfig {
    /// Load engine configuration from environment variables.
    ///
    /// Required (see [`RoutingConfig::from_env`]):
    /// - `MOORAGE_PLATFORM_DATABASE_URL`
    /// - `MOORAGE_WORKLOAD_CLUSTERS`
    /// - `MOORAGE_WORKLOAD_ADMIN_USER` / `MOORAGE_WORKLOAD_ADMIN_PASSWORD`
    ///
    /// Optional (with defaults):
    /// - `MOORAGE_SHARED_CLUSTER_CAPACITY` (default: 50)
    /// - `MOORAGE_SHARED_VOLUME_CEILING_GB` (default: 5)
    /// - `MOORAGE_OPERATION_TIMEOUT_SECS` (default: 120)
    /// - `MOORAGE_RECONCILER_INTERVAL_SECS` (default: 30)
    /// - `MOORAGE_STALENESS_THRESHOLD_SECS` (default: 900)
    /// - `MOORAGE_WORKER_CONCURRENCY` (default: 8)
    /// - `MOORAGE_DATA_DIR` (default: `.data`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let routing = RoutingConfig::from_env()?;

        let shared_cluster_capacity: i32 = parse_or(
            "MOORAGE_SHARED_CLUSTER_CAPACITY",
            50,
            "must be a positive integer",
        )?;
        let shared_volume_ceiling_gb: u32 = parse_or(
            "MOORAGE_SHARED_VOLUME_CEILING_GB",
            5,
            "must be a positive integer",
        )?;

        let policy = StrategyPolicy {
            shared_volume_ceiling_gb,
            shared_cluster_capacity,
            ..StrategyPolicy::default()
        };

        let operation_timeout = Duration::from_secs(parse_or(
            "MOORAGE_OPERATION_TIMEOUT_SECS",
            120,
            "must be a number of seconds",
        )?);
        let reconciler_interval = Duration::from_secs(parse_or(
            "MOORAGE_RECONCILER_INTERVAL_SECS",
            30,
            "must be a number of seconds",
        )?);
        let staleness_threshold = Duration::from_secs(parse_or(
            "MOORAGE_STALENESS_THRESHOLD_SECS",
            900,
            "must be a number of seconds",
        )?);
        let worker_concurrency: usize = parse_or(
            "MOORAGE_WORKER_CONCURRENCY",
            8,
            "must be a positive integer",
        )?;

        let data_dir =
            PathBuf::from(std::env::var("MOORAGE_DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        Ok(Self {
            routing,
            policy,
            operation_timeout,
            reconciler_interval,
            staleness_threshold,
            worker_concurrency,
            data_dir,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    default: T,
    expectation: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(var, expectation)),
        Err(_) => Ok(default),
    }
}
