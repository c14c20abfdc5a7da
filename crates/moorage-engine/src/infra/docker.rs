// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker-CLI implementations of the container and volume APIs.
//!
//! Drives the `docker` binary via subprocesses. Volume snapshots are tar
//! archives produced by a helper container, written under the engine's data
//! directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use moorage_core::error::{Error, Result};
use tokio::process::Command;
use tracing::debug;

use super::traits::{ContainerApi, ContainerHandle, ContainerSpec, VolumeApi};

/// Port the application listens on inside its container.
const APP_PORT: u16 = 8080;

/// Image used for tar-based volume snapshot/restore.
const HELPER_IMAGE: &str = "alpine:3.20";

/// Run a docker command, returning trimmed stdout.
async fn run_docker(binary: &str, args: &[&str]) -> Result<String> {
    debug!(binary = binary, args = ?args, "running docker command");

    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::resource(format!("{binary} {}", args.first().unwrap_or(&"")), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::resource(
            format!("{binary} {}", args.first().unwrap_or(&"")),
            stderr.trim(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Container runtime backed by the Docker CLI.
pub struct DockerContainerApi {
    binary: String,
    /// Docker network containers are attached to; container names resolve as
    /// DNS names on it.
    network: Option<String>,
}

impl DockerContainerApi {
    /// Create a Docker container API.
    pub fn new(binary: impl Into<String>, network: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            network,
        }
    }

    /// Create from environment variables (`MOORAGE_DOCKER_BIN`,
    /// `MOORAGE_DOCKER_NETWORK`).
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("MOORAGE_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
            std::env::var("MOORAGE_DOCKER_NETWORK").ok(),
        )
    }
}

#[async_trait]
impl ContainerApi for DockerContainerApi {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let mut args: Vec<String> = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            "managed-by=moorage".to_string(),
            "-v".to_string(),
            format!("{}:/var/lib/app/data", spec.volume_ref),
        ];

        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(cpus) = spec.cpu_limit {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory_mb) = spec.memory_limit_mb {
            args.push("--memory".to_string());
            args.push(format!("{memory_mb}m"));
        }

        let mut env_keys: Vec<&String> = spec.env.keys().collect();
        env_keys.sort();
        for key in env_keys {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, spec.env[key]));
        }

        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let container_ref = run_docker(&self.binary, &arg_refs).await?;

        Ok(ContainerHandle {
            container_ref,
            address: format!("{}:{}", spec.name, APP_PORT),
        })
    }

    async fn start(&self, container_ref: &str) -> Result<()> {
        run_docker(&self.binary, &["start", container_ref]).await?;
        Ok(())
    }

    async fn stop(&self, container_ref: &str) -> Result<()> {
        run_docker(&self.binary, &["stop", container_ref]).await?;
        Ok(())
    }

    async fn remove(&self, container_ref: &str) -> Result<()> {
        run_docker(&self.binary, &["rm", "-f", container_ref]).await?;
        Ok(())
    }

    async fn health(&self, container_ref: &str) -> Result<bool> {
        // Prefer the image's healthcheck; fall back to the running flag for
        // images without one.
        let state = run_docker(
            &self.binary,
            &[
                "inspect",
                "-f",
                "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Running}}{{end}}",
                container_ref,
            ],
        )
        .await?;

        Ok(state == "healthy" || state == "true")
    }

    async fn exists(&self, container_ref: &str) -> Result<bool> {
        let output = Command::new(&self.binary)
            .args(["inspect", "-f", "{{.Id}}", container_ref])
            .output()
            .await
            .map_err(|e| Error::resource("docker inspect", e))?;
        Ok(output.status.success())
    }
}

/// Volume store backed by Docker volumes, with tar snapshots under the data
/// directory.
pub struct DockerVolumeApi {
    binary: String,
    snapshots_dir: PathBuf,
}

impl DockerVolumeApi {
    /// Create a Docker volume API writing snapshots under `data_dir`.
    pub fn new(binary: impl Into<String>, data_dir: &Path) -> Self {
        Self {
            binary: binary.into(),
            snapshots_dir: data_dir.join("volume-snapshots"),
        }
    }

    /// Create from environment variables plus a data directory.
    pub fn from_env(data_dir: &Path) -> Self {
        Self::new(
            std::env::var("MOORAGE_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
            data_dir,
        )
    }

    fn snapshot_path(&self, snapshot_ref: &str) -> PathBuf {
        self.snapshots_dir.join(format!("{snapshot_ref}.tar.gz"))
    }
}

#[async_trait]
impl VolumeApi for DockerVolumeApi {
    async fn ensure(&self, volume_ref: &str) -> Result<()> {
        run_docker(&self.binary, &["volume", "create", volume_ref]).await?;
        Ok(())
    }

    async fn snapshot(&self, volume_ref: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.snapshots_dir)
            .await
            .map_err(|e| Error::resource("volume snapshot", e))?;

        let snapshot_ref = format!(
            "volsnap-{}",
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        let dir = self.snapshots_dir.display().to_string();
        let archive = format!("/to/{snapshot_ref}.tar.gz");

        run_docker(
            &self.binary,
            &[
                "run",
                "--rm",
                "-v",
                &format!("{volume_ref}:/from:ro"),
                "-v",
                &format!("{dir}:/to"),
                HELPER_IMAGE,
                "tar",
                "-czf",
                &archive,
                "-C",
                "/from",
                ".",
            ],
        )
        .await?;

        Ok(snapshot_ref)
    }

    async fn restore(&self, volume_ref: &str, snapshot_ref: &str) -> Result<()> {
        let path = self.snapshot_path(snapshot_ref);
        if !path.exists() {
            return Err(Error::resource(
                "volume restore",
                format!("snapshot artifact missing: {}", path.display()),
            ));
        }

        let dir = self.snapshots_dir.display().to_string();
        let archive = format!("/from/{snapshot_ref}.tar.gz");

        // Clear the volume, then unpack the archive into it.
        run_docker(
            &self.binary,
            &[
                "run",
                "--rm",
                "-v",
                &format!("{volume_ref}:/to"),
                "-v",
                &format!("{dir}:/from:ro"),
                HELPER_IMAGE,
                "sh",
                "-c",
                &format!("rm -rf /to/* /to/..?* /to/.[!.]* 2>/dev/null; tar -xzf {archive} -C /to"),
            ],
        )
        .await?;

        Ok(())
    }

    async fn size(&self, volume_ref: &str) -> Result<u64> {
        let output = run_docker(
            &self.binary,
            &[
                "run",
                "--rm",
                "-v",
                &format!("{volume_ref}:/data:ro"),
                HELPER_IMAGE,
                "du",
                "-sb",
                "/data",
            ],
        )
        .await?;

        output
            .split_whitespace()
            .next()
            .and_then(|bytes| bytes.parse().ok())
            .ok_or_else(|| Error::resource("volume size", format!("unparseable du output: {output}")))
    }

    async fn remove(&self, volume_ref: &str) -> Result<()> {
        run_docker(&self.binary, &["volume", "rm", "-f", volume_ref]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_path_layout() {
        let api = DockerVolumeApi::new("docker", Path::new("/var/lib/moorage"));
        assert_eq!(
            api.snapshot_path("volsnap-abc123"),
            PathBuf::from("/var/lib/moorage/volume-snapshots/volsnap-abc123.tar.gz")
        );
    }

    #[test]
    fn test_from_env_defaults_to_docker_binary() {
        let api = DockerContainerApi::new("docker", None);
        assert_eq!(api.binary, "docker");
        assert!(api.network.is_none());
    }
}
