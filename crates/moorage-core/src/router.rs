// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection routing across the platform and workload clusters.
//!
//! The router resolves a logical database purpose to a concrete cluster,
//! credential, and database name. It never opens connections itself:
//! [`ConnectionHandle::connect`] is called by the owner of the operation,
//! immediately before use, and the connection is dropped on every exit path.

use std::str::FromStr;

use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgConnection};

use crate::config::{ClusterEndpoint, Credential, RoutingConfig};
use crate::error::{Error, Result};

/// Cluster ref used for the platform metadata cluster in handles and logs.
pub const PLATFORM_CLUSTER_REF: &str = "platform";

/// A logical database operation to be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabasePurpose {
    /// Read/write platform metadata (registry state). Always the platform
    /// cluster with the fixed service credential.
    PlatformMetadata,
    /// Administer a workload cluster (create/drop databases, ownership
    /// repair) via its maintenance database.
    WorkloadAdmin {
        /// Target workload cluster.
        cluster_ref: String,
    },
    /// Operate on a named tenant database on a workload cluster. Isolation
    /// is at the database level; the administrative credential is shared.
    WorkloadInstance {
        /// Target workload cluster.
        cluster_ref: String,
        /// Tenant database name.
        database_name: String,
    },
}

/// A resolved connection target: cluster, credential, and database name.
///
/// Construction has no side effects; establishment and teardown belong to
/// the caller (acquire right before use, release unconditionally after).
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    cluster_ref: String,
    database: String,
    options: PgConnectOptions,
}

impl ConnectionHandle {
    /// Cluster this handle points at.
    pub fn cluster_ref(&self) -> &str {
        &self.cluster_ref
    }

    /// Database this handle points at.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Open a connection. Dropping the returned connection releases it.
    pub async fn connect(&self) -> Result<PgConnection> {
        self.options.connect().await.map_err(|e| {
            Error::resource(
                format!("connect to '{}/{}'", self.cluster_ref, self.database),
                e,
            )
        })
    }
}

/// Resolves logical database purposes to connection handles.
#[derive(Debug, Clone)]
pub struct ConnectionRouter {
    config: RoutingConfig,
}

impl ConnectionRouter {
    /// Create a router from validated routing configuration.
    ///
    /// Fails with [`Error::Routing`] if the configuration is unusable; this
    /// is a fatal startup-time condition for the owning orchestrator.
    pub fn new(config: RoutingConfig) -> Result<Self> {
        if config.workload_clusters.is_empty() {
            return Err(Error::Routing {
                target: "workload".to_string(),
                reason: "no workload clusters configured".to_string(),
            });
        }
        // Validate the platform URL eagerly so a typo fails at startup, not
        // at first registry access.
        PgConnectOptions::from_str(&config.platform_url).map_err(|e| Error::Routing {
            target: PLATFORM_CLUSTER_REF.to_string(),
            reason: format!("invalid platform database URL: {}", e),
        })?;

        Ok(Self { config })
    }

    /// Resolve a purpose to a connection handle.
    pub fn resolve(&self, purpose: &DatabasePurpose) -> Result<ConnectionHandle> {
        match purpose {
            DatabasePurpose::PlatformMetadata => {
                let options =
                    PgConnectOptions::from_str(&self.config.platform_url).map_err(|e| {
                        Error::Routing {
                            target: PLATFORM_CLUSTER_REF.to_string(),
                            reason: format!("invalid platform database URL: {}", e),
                        }
                    })?;
                let database = options.get_database().unwrap_or("postgres").to_string();
                Ok(ConnectionHandle {
                    cluster_ref: PLATFORM_CLUSTER_REF.to_string(),
                    database,
                    options,
                })
            }
            DatabasePurpose::WorkloadAdmin { cluster_ref } => {
                self.workload_handle(cluster_ref, &self.config.maintenance_database)
            }
            DatabasePurpose::WorkloadInstance {
                cluster_ref,
                database_name,
            } => self.workload_handle(cluster_ref, database_name),
        }
    }

    /// The endpoint for a workload cluster, or a routing error if it is not
    /// configured.
    pub fn endpoint(&self, cluster_ref: &str) -> Result<&ClusterEndpoint> {
        self.config
            .workload_clusters
            .get(cluster_ref)
            .ok_or_else(|| Error::Routing {
                target: cluster_ref.to_string(),
                reason: "no endpoint configured for this cluster".to_string(),
            })
    }

    /// The administrative credential for workload clusters.
    pub fn admin_credential(&self) -> &Credential {
        &self.config.workload_admin
    }

    /// Platform cluster connection URL (for pool construction at startup).
    pub fn platform_url(&self) -> &str {
        &self.config.platform_url
    }

    /// All configured workload cluster refs, sorted for determinism.
    pub fn cluster_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.config.workload_clusters.keys().cloned().collect();
        refs.sort();
        refs
    }

    fn workload_handle(&self, cluster_ref: &str, database: &str) -> Result<ConnectionHandle> {
        let endpoint = self.endpoint(cluster_ref)?;
        let admin = &self.config.workload_admin;

        let options = PgConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&admin.username)
            .password(&admin.password)
            .database(database);

        Ok(ConnectionHandle {
            cluster_ref: cluster_ref.to_string(),
            database: database.to_string(),
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> RoutingConfig {
        let mut workload_clusters = HashMap::new();
        workload_clusters.insert(
            "alpha".to_string(),
            ClusterEndpoint {
                host: "wl-alpha.internal".to_string(),
                port: 5432,
            },
        );
        workload_clusters.insert(
            "beta".to_string(),
            ClusterEndpoint {
                host: "wl-beta.internal".to_string(),
                port: 6432,
            },
        );
        RoutingConfig {
            platform_url: "postgres://svc:pw@platform-db:5432/moorage".to_string(),
            workload_clusters,
            workload_admin: Credential {
                username: "moorage_admin".to_string(),
                password: "secret".to_string(),
            },
            maintenance_database: "postgres".to_string(),
        }
    }

    #[test]
    fn test_platform_resolution() {
        let router = ConnectionRouter::new(test_config()).unwrap();
        let handle = router.resolve(&DatabasePurpose::PlatformMetadata).unwrap();
        assert_eq!(handle.cluster_ref(), PLATFORM_CLUSTER_REF);
        assert_eq!(handle.database(), "moorage");
    }

    #[test]
    fn test_workload_admin_resolution() {
        let router = ConnectionRouter::new(test_config()).unwrap();
        let handle = router
            .resolve(&DatabasePurpose::WorkloadAdmin {
                cluster_ref: "alpha".to_string(),
            })
            .unwrap();
        assert_eq!(handle.cluster_ref(), "alpha");
        assert_eq!(handle.database(), "postgres");
    }

    #[test]
    fn test_workload_instance_resolution() {
        let router = ConnectionRouter::new(test_config()).unwrap();
        let handle = router
            .resolve(&DatabasePurpose::WorkloadInstance {
                cluster_ref: "beta".to_string(),
                database_name: "tenant_acme_1a2b3c4d".to_string(),
            })
            .unwrap();
        assert_eq!(handle.cluster_ref(), "beta");
        assert_eq!(handle.database(), "tenant_acme_1a2b3c4d");
    }

    #[test]
    fn test_unknown_cluster_is_routing_error() {
        let router = ConnectionRouter::new(test_config()).unwrap();
        let err = router
            .resolve(&DatabasePurpose::WorkloadAdmin {
                cluster_ref: "gamma".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.error_code(), "ROUTING_ERROR");
    }

    #[test]
    fn test_empty_workload_config_rejected_at_startup() {
        let mut config = test_config();
        config.workload_clusters.clear();
        let err = ConnectionRouter::new(config).unwrap_err();
        assert_eq!(err.error_code(), "ROUTING_ERROR");
    }

    #[test]
    fn test_invalid_platform_url_rejected_at_startup() {
        let mut config = test_config();
        config.platform_url = "not a url".to_string();
        let err = ConnectionRouter::new(config).unwrap_err();
        assert_eq!(err.error_code(), "ROUTING_ERROR");
    }

    #[test]
    fn test_cluster_refs_sorted() {
        let router = ConnectionRouter::new(test_config()).unwrap();
        assert_eq!(router.cluster_refs(), vec!["alpha", "beta"]);
    }
}
