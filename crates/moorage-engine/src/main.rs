// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Moorage Engine - Instance Lifecycle Server
//!
//! Wires the platform-cluster registry, the connection router, and the
//! Docker-backed infrastructure into a running engine, then waits for
//! ctrl-c.

use std::sync::Arc;

use moorage_core::registry::PostgresRegistry;
use moorage_core::router::ConnectionRouter;
use moorage_engine::config::EngineConfig;
use moorage_engine::infra::{DockerContainerApi, DockerVolumeApi};
use moorage_engine::reconciler::ReconcilerConfig;
use moorage_engine::runtime::EngineRuntime;
use moorage_engine::workload::PostgresWorkloadDatabases;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "moorage_engine=info,moorage_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = EngineConfig::from_env()?;

    info!(
        workload_clusters = config.routing.workload_clusters.len(),
        data_dir = %config.data_dir.display(),
        "Starting Moorage Engine"
    );

    // Routing is validated eagerly; a broken cluster map fails here, not on
    // the first tenant request.
    let router = Arc::new(ConnectionRouter::new(config.routing.clone())?);

    // Connect to the platform cluster and apply the registry schema.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(router.platform_url())
        .await?;
    let registry = PostgresRegistry::new(pool);
    registry.migrate().await?;

    info!("Platform cluster connected, schema verified");

    // Infrastructure: Docker CLI containers/volumes, pg tools for dumps.
    let containers = Arc::new(DockerContainerApi::from_env());
    let volumes = Arc::new(DockerVolumeApi::from_env(&config.data_dir));
    let databases = Arc::new(PostgresWorkloadDatabases::new(
        router.clone(),
        &config.data_dir,
    ));

    // Start the runtime
    let runtime = EngineRuntime::builder()
        .registry(Arc::new(registry))
        .router(router)
        .containers(containers)
        .volumes(volumes)
        .databases(databases)
        .policy(config.policy.clone())
        .operation_timeout(config.operation_timeout)
        .reconciler_config(ReconcilerConfig {
            interval: config.reconciler_interval,
            staleness_threshold: config.staleness_threshold,
        })
        .worker_concurrency(config.worker_concurrency)
        .build()?
        .start()
        .await?;

    info!("Moorage Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Moorage Engine shut down");

    Ok(())
}
