// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster routing configuration loaded from environment variables.

use std::collections::HashMap;
use std::fmt;

/// A workload cluster endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
    /// Hostname or IP of the cluster.
    pub host: String,
    /// PostgreSQL port.
    pub port: u16,
}

impl fmt::Display for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A database credential. `Debug` redacts the password.
#[derive(Clone)]
pub struct Credential {
    /// Role name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"...")
            .finish()
    }
}

/// Configuration for the connection router: the platform cluster plus one or
/// more workload clusters keyed by `cluster_ref`.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Connection URL for the platform metadata cluster, including the fixed
    /// service credential.
    pub platform_url: String,
    /// Workload cluster endpoints, keyed by `cluster_ref`.
    pub workload_clusters: HashMap<String, ClusterEndpoint>,
    /// Administrative credential used for workload-cluster operations.
    pub workload_admin: Credential,
    /// Maintenance database used for `CREATE DATABASE`/`DROP DATABASE`.
    pub maintenance_database: String,
}

/// Default maintenance database on PostgreSQL clusters.
pub const DEFAULT_MAINTENANCE_DATABASE: &str = "postgres";

impl RoutingConfig {
    /// Load routing configuration from environment variables.
    ///
    /// Required:
    /// - `MOORAGE_PLATFORM_DATABASE_URL`: platform cluster connection string
    /// - `MOORAGE_WORKLOAD_CLUSTERS`: `ref=host:port[,ref=host:port...]`
    /// - `MOORAGE_WORKLOAD_ADMIN_USER` / `MOORAGE_WORKLOAD_ADMIN_PASSWORD`
    ///
    /// Optional:
    /// - `MOORAGE_MAINTENANCE_DATABASE` (default: `postgres`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let platform_url = std::env::var("MOORAGE_PLATFORM_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("MOORAGE_PLATFORM_DATABASE_URL"))?;

        let clusters_spec = std::env::var("MOORAGE_WORKLOAD_CLUSTERS")
            .map_err(|_| ConfigError::Missing("MOORAGE_WORKLOAD_CLUSTERS"))?;
        let workload_clusters = parse_cluster_list(&clusters_spec)?;

        let username = std::env::var("MOORAGE_WORKLOAD_ADMIN_USER")
            .map_err(|_| ConfigError::Missing("MOORAGE_WORKLOAD_ADMIN_USER"))?;
        let password = std::env::var("MOORAGE_WORKLOAD_ADMIN_PASSWORD")
            .map_err(|_| ConfigError::Missing("MOORAGE_WORKLOAD_ADMIN_PASSWORD"))?;

        let maintenance_database = std::env::var("MOORAGE_MAINTENANCE_DATABASE")
            .unwrap_or_else(|_| DEFAULT_MAINTENANCE_DATABASE.to_string());

        Ok(Self {
            platform_url,
            workload_clusters,
            workload_admin: Credential { username, password },
            maintenance_database,
        })
    }
}

/// Parse a `ref=host:port[,ref=host:port...]` cluster list.
pub fn parse_cluster_list(spec: &str) -> Result<HashMap<String, ClusterEndpoint>, ConfigError> {
    let mut clusters = HashMap::new();

    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (cluster_ref, endpoint) = entry.split_once('=').ok_or(ConfigError::Invalid(
            "MOORAGE_WORKLOAD_CLUSTERS",
            "entries must be ref=host:port",
        ))?;

        let (host, port) = endpoint.rsplit_once(':').ok_or(ConfigError::Invalid(
            "MOORAGE_WORKLOAD_CLUSTERS",
            "endpoints must be host:port",
        ))?;

        let port: u16 = port.parse().map_err(|_| {
            ConfigError::Invalid("MOORAGE_WORKLOAD_CLUSTERS", "port must be a valid number")
        })?;

        if cluster_ref.is_empty() || host.is_empty() {
            return Err(ConfigError::Invalid(
                "MOORAGE_WORKLOAD_CLUSTERS",
                "cluster ref and host must be non-empty",
            ));
        }

        clusters.insert(
            cluster_ref.to_string(),
            ClusterEndpoint {
                host: host.to_string(),
                port,
            },
        );
    }

    if clusters.is_empty() {
        return Err(ConfigError::Invalid(
            "MOORAGE_WORKLOAD_CLUSTERS",
            "at least one workload cluster is required",
        ));
    }

    Ok(clusters)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_parse_cluster_list_single() {
        let clusters = parse_cluster_list("alpha=db-alpha.internal:5432").unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(
            clusters["alpha"],
            ClusterEndpoint {
                host: "db-alpha.internal".to_string(),
                port: 5432,
            }
        );
    }

    #[test]
    fn test_parse_cluster_list_multiple() {
        let clusters =
            parse_cluster_list("alpha=10.0.1.5:5432, beta=10.0.1.6:5432,gamma=db-g:6432").unwrap();
        assert_eq!(clusters.len(), 3);
        assert_eq!(clusters["gamma"].port, 6432);
    }

    #[test]
    fn test_parse_cluster_list_rejects_bad_entries() {
        assert!(parse_cluster_list("").is_err());
        assert!(parse_cluster_list("alpha").is_err());
        assert!(parse_cluster_list("alpha=nohost").is_err());
        assert!(parse_cluster_list("alpha=host:notaport").is_err());
        assert!(parse_cluster_list("=host:5432").is_err());
    }

    #[test]
    fn test_from_env_complete() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set(
            "MOORAGE_PLATFORM_DATABASE_URL",
            "postgres://moorage:pw@platform-db:5432/moorage",
        );
        guard.set("MOORAGE_WORKLOAD_CLUSTERS", "alpha=wl-alpha:5432");
        guard.set("MOORAGE_WORKLOAD_ADMIN_USER", "moorage_admin");
        guard.set("MOORAGE_WORKLOAD_ADMIN_PASSWORD", "secret");
        guard.remove("MOORAGE_MAINTENANCE_DATABASE");

        let config = RoutingConfig::from_env().unwrap();
        assert_eq!(
            config.platform_url,
            "postgres://moorage:pw@platform-db:5432/moorage"
        );
        assert_eq!(config.workload_clusters.len(), 1);
        assert_eq!(config.workload_admin.username, "moorage_admin");
        assert_eq!(config.maintenance_database, "postgres");
    }

    #[test]
    fn test_from_env_missing_platform_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("MOORAGE_PLATFORM_DATABASE_URL");

        let err = RoutingConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing("MOORAGE_PLATFORM_DATABASE_URL")
        ));
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let cred = Credential {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{:?}", cred);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }
}
