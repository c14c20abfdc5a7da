// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container and volume implementations for testing.
//!
//! Content is held in memory keyed by ref, so tests can assert round-trip
//! equality after a backup/restore without a real runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use moorage_core::error::{Error, Result};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::traits::{ContainerApi, ContainerHandle, ContainerSpec, VolumeApi};

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
    healthy: bool,
}

/// Mock container runtime.
#[derive(Default)]
pub struct MockContainerApi {
    containers: Mutex<HashMap<String, MockContainer>>,
    /// If true, `start` fails.
    pub fail_start: AtomicBool,
    /// If true, started containers report unhealthy.
    pub fail_health: AtomicBool,
}

impl MockContainerApi {
    /// Create a mock runtime where everything succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock runtime whose `start` always fails.
    pub fn failing_start() -> Self {
        let api = Self::default();
        api.fail_start.store(true, Ordering::SeqCst);
        api
    }

    /// Make a container disappear from the runtime, as if it crashed and
    /// was reaped externally.
    pub async fn vanish(&self, container_ref: &str) {
        let mut containers = self.containers.lock().await;
        containers.remove(container_ref);
    }

    /// Whether a container is currently running.
    pub async fn is_running(&self, container_ref: &str) -> bool {
        let containers = self.containers.lock().await;
        containers
            .get(container_ref)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// The spec a container was created with.
    pub async fn spec_of(&self, container_ref: &str) -> Option<ContainerSpec> {
        let containers = self.containers.lock().await;
        containers.get(container_ref).map(|c| c.spec.clone())
    }
}

#[async_trait]
impl ContainerApi for MockContainerApi {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let container_ref = format!("mock-ctr-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let handle = ContainerHandle {
            container_ref: container_ref.clone(),
            address: format!("{}:8080", spec.name),
        };

        let mut containers = self.containers.lock().await;
        containers.insert(
            container_ref,
            MockContainer {
                spec: spec.clone(),
                running: false,
                healthy: true,
            },
        );
        Ok(handle)
    }

    async fn start(&self, container_ref: &str) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::resource("container start", "mock start failure"));
        }
        let mut containers = self.containers.lock().await;
        let container = containers.get_mut(container_ref).ok_or_else(|| {
            Error::resource("container start", format!("unknown container {container_ref}"))
        })?;
        container.running = true;
        container.healthy = !self.fail_health.load(Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, container_ref: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(container_ref) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container_ref: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        containers.remove(container_ref);
        Ok(())
    }

    async fn health(&self, container_ref: &str) -> Result<bool> {
        let containers = self.containers.lock().await;
        Ok(containers
            .get(container_ref)
            .map(|c| c.running && c.healthy)
            .unwrap_or(false))
    }

    async fn exists(&self, container_ref: &str) -> Result<bool> {
        let containers = self.containers.lock().await;
        Ok(containers.contains_key(container_ref))
    }
}

/// Mock volume store with content-addressed snapshots.
#[derive(Default)]
pub struct MockVolumeApi {
    volumes: Mutex<HashMap<String, String>>,
    snapshots: Mutex<HashMap<String, String>>,
    /// If true, `snapshot` fails.
    pub fail_snapshot: AtomicBool,
}

impl MockVolumeApi {
    /// Create a mock volume store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a volume's content. Test control.
    pub async fn write(&self, volume_ref: &str, content: &str) {
        let mut volumes = self.volumes.lock().await;
        volumes.insert(volume_ref.to_string(), content.to_string());
    }

    /// Read a volume's content. Test control.
    pub async fn read(&self, volume_ref: &str) -> Option<String> {
        let volumes = self.volumes.lock().await;
        volumes.get(volume_ref).cloned()
    }
}

#[async_trait]
impl VolumeApi for MockVolumeApi {
    async fn ensure(&self, volume_ref: &str) -> Result<()> {
        let mut volumes = self.volumes.lock().await;
        volumes.entry(volume_ref.to_string()).or_default();
        Ok(())
    }

    async fn snapshot(&self, volume_ref: &str) -> Result<String> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(Error::resource("volume snapshot", "mock snapshot failure"));
        }
        let content = {
            let volumes = self.volumes.lock().await;
            volumes.get(volume_ref).cloned().ok_or_else(|| {
                Error::resource("volume snapshot", format!("unknown volume {volume_ref}"))
            })?
        };

        let snapshot_ref = format!("volsnap-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let mut snapshots = self.snapshots.lock().await;
        snapshots.insert(snapshot_ref.clone(), content);
        Ok(snapshot_ref)
    }

    async fn restore(&self, volume_ref: &str, snapshot_ref: &str) -> Result<()> {
        let content = {
            let snapshots = self.snapshots.lock().await;
            snapshots.get(snapshot_ref).cloned().ok_or_else(|| {
                Error::resource("volume restore", format!("unknown snapshot {snapshot_ref}"))
            })?
        };
        let mut volumes = self.volumes.lock().await;
        volumes.insert(volume_ref.to_string(), content);
        Ok(())
    }

    async fn size(&self, volume_ref: &str) -> Result<u64> {
        let volumes = self.volumes.lock().await;
        Ok(volumes.get(volume_ref).map(|c| c.len() as u64).unwrap_or(0))
    }

    async fn remove(&self, volume_ref: &str) -> Result<()> {
        let mut volumes = self.volumes.lock().await;
        volumes.remove(volume_ref);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "registry.internal/app:stable".to_string(),
            env: HashMap::new(),
            volume_ref: format!("vol-{name}"),
            cpu_limit: Some(1.0),
            memory_limit_mb: Some(512),
        }
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let api = MockContainerApi::new();
        let handle = api.create(&spec("acme")).await.unwrap();

        assert!(api.exists(&handle.container_ref).await.unwrap());
        assert!(!api.health(&handle.container_ref).await.unwrap());

        api.start(&handle.container_ref).await.unwrap();
        assert!(api.health(&handle.container_ref).await.unwrap());

        api.stop(&handle.container_ref).await.unwrap();
        assert!(!api.health(&handle.container_ref).await.unwrap());

        api.remove(&handle.container_ref).await.unwrap();
        assert!(!api.exists(&handle.container_ref).await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_start() {
        let api = MockContainerApi::failing_start();
        let handle = api.create(&spec("acme")).await.unwrap();
        assert!(api.start(&handle.container_ref).await.is_err());
    }

    #[tokio::test]
    async fn test_volume_snapshot_round_trip() {
        let volumes = MockVolumeApi::new();
        volumes.ensure("vol-acme").await.unwrap();
        volumes.write("vol-acme", "uploads-v1").await;

        let snap = volumes.snapshot("vol-acme").await.unwrap();
        volumes.write("vol-acme", "uploads-v2-corrupted").await;

        volumes.restore("vol-acme", &snap).await.unwrap();
        assert_eq!(volumes.read("vol-acme").await.as_deref(), Some("uploads-v1"));
        assert_eq!(volumes.size("vol-acme").await.unwrap(), "uploads-v1".len() as u64);
    }
}
