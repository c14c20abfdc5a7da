// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload-cluster database operations.
//!
//! Everything the orchestrators do to tenant databases goes through
//! [`WorkloadDatabases`]: create/drop via the router's admin handles, dump
//! and restore via the cluster's archive tooling, and ownership repair after
//! a restore.

pub mod mock;
pub mod postgres;

pub use self::mock::MockWorkloadDatabases;
pub use self::postgres::PostgresWorkloadDatabases;

use async_trait::async_trait;
use moorage_core::error::{Error, Result};

/// A produced database dump artifact.
#[derive(Debug, Clone)]
pub struct DumpArtifact {
    /// Opaque reference resolvable by [`WorkloadDatabases::restore_dump`].
    pub snapshot_ref: String,
    /// Artifact size in bytes.
    pub size_bytes: u64,
}

/// Administrative operations on workload-cluster databases.
#[async_trait]
pub trait WorkloadDatabases: Send + Sync {
    /// Create an empty tenant database on a cluster.
    async fn create_database(&self, cluster_ref: &str, database_name: &str) -> Result<()>;

    /// Drop a tenant database, severing open connections.
    async fn drop_database(&self, cluster_ref: &str, database_name: &str) -> Result<()>;

    /// Whether the database exists on the cluster.
    async fn database_exists(&self, cluster_ref: &str, database_name: &str) -> Result<bool>;

    /// Dump a tenant database into an opaque archive artifact.
    async fn dump(&self, cluster_ref: &str, database_name: &str) -> Result<DumpArtifact>;

    /// Restore a previously dumped artifact into an (empty) database.
    async fn restore_dump(
        &self,
        cluster_ref: &str,
        database_name: &str,
        snapshot_ref: &str,
    ) -> Result<()>;

    /// Reset ownership of the restored default schema to the operating
    /// credential. Without this, schema-modifying statements after a restore
    /// fail with permission errors.
    async fn fix_ownership(&self, cluster_ref: &str, database_name: &str) -> Result<()>;
}

/// Validate a tenant database name before it is spliced into DDL.
///
/// Identifiers cannot be bound as statement parameters, so names are
/// restricted to `[a-z_][a-z0-9_]*` and at most 63 bytes.
pub fn validate_database_name(database_name: &str) -> Result<()> {
    let mut chars = database_name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };

    if !valid || database_name.len() > 63 {
        return Err(Error::Validation {
            field: "database_name",
            message: format!("'{database_name}' is not a safe identifier"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_database_name() {
        assert!(validate_database_name("tenant_acme_1a2b3c4d").is_ok());
        assert!(validate_database_name("_scratch").is_ok());

        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("1tenant").is_err());
        assert!(validate_database_name("tenant-acme").is_err());
        assert!(validate_database_name("Tenant").is_err());
        assert!(validate_database_name("tenant;drop").is_err());
        assert!(validate_database_name(&"a".repeat(64)).is_err());
    }
}
