// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trait definitions for the container runtime and volume store.

use std::collections::HashMap;

use async_trait::async_trait;
use moorage_core::error::Result;
use serde::{Deserialize, Serialize};

/// Specification for creating an application container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name (stable per instance).
    pub name: String,
    /// Application image.
    pub image: String,
    /// Environment variables, including the workload database URL.
    pub env: HashMap<String, String>,
    /// Persistent volume mounted into the container.
    pub volume_ref: String,
    /// CPU limit in cores, if any.
    pub cpu_limit: Option<f64>,
    /// Memory limit in MB, if any.
    pub memory_limit_mb: Option<u64>,
}

/// A created container: its runtime reference plus the address the
/// application is reachable at once started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Runtime reference used for start/stop/remove/health.
    pub container_ref: String,
    /// Address (host:port) of the application.
    pub address: String,
}

/// The external container runtime.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Create a container from a spec without starting it.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Start a created container.
    async fn start(&self, container_ref: &str) -> Result<()>;

    /// Stop a running container.
    async fn stop(&self, container_ref: &str) -> Result<()>;

    /// Remove a container (stopped or not).
    async fn remove(&self, container_ref: &str) -> Result<()>;

    /// Whether a started container is healthy.
    async fn health(&self, container_ref: &str) -> Result<bool>;

    /// Whether the container still exists in the runtime.
    async fn exists(&self, container_ref: &str) -> Result<bool>;
}

/// The external volume store.
#[async_trait]
pub trait VolumeApi: Send + Sync {
    /// Create the volume if it does not exist.
    async fn ensure(&self, volume_ref: &str) -> Result<()>;

    /// Snapshot a volume, returning an opaque snapshot ref.
    async fn snapshot(&self, volume_ref: &str) -> Result<String>;

    /// Restore a volume from a snapshot ref.
    async fn restore(&self, volume_ref: &str, snapshot_ref: &str) -> Result<()>;

    /// Current size of the volume in bytes.
    async fn size(&self, volume_ref: &str) -> Result<u64>;

    /// Remove the volume and its data.
    async fn remove(&self, volume_ref: &str) -> Result<()>;
}
