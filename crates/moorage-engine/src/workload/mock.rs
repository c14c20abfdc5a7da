// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock workload-database operations for testing.
//!
//! Databases are content strings keyed by (cluster, name); dump artifacts
//! capture the content so restore round-trips can be asserted for equality.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use moorage_core::error::{Error, Result};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DumpArtifact, WorkloadDatabases, validate_database_name};

/// Bytes a dump artifact carries beyond raw content (format header).
const DUMP_OVERHEAD_BYTES: u64 = 64;

/// Mock workload-database layer.
#[derive(Default)]
pub struct MockWorkloadDatabases {
    databases: Mutex<HashMap<(String, String), String>>,
    dumps: Mutex<HashMap<String, String>>,
    /// If true, `dump` fails.
    pub fail_dump: AtomicBool,
    /// If true, `create_database` fails.
    pub fail_create: AtomicBool,
}

impl MockWorkloadDatabases {
    /// Create a mock layer where everything succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a database's content. Test control.
    pub async fn seed(&self, cluster_ref: &str, database_name: &str, content: &str) {
        let mut databases = self.databases.lock().await;
        databases.insert(
            (cluster_ref.to_string(), database_name.to_string()),
            content.to_string(),
        );
    }

    /// Read a database's content. Test control.
    pub async fn content_of(&self, cluster_ref: &str, database_name: &str) -> Option<String> {
        let databases = self.databases.lock().await;
        databases
            .get(&(cluster_ref.to_string(), database_name.to_string()))
            .cloned()
    }

    /// Number of databases on a cluster. Test control.
    pub async fn database_count(&self, cluster_ref: &str) -> usize {
        let databases = self.databases.lock().await;
        databases
            .keys()
            .filter(|(cluster, _)| cluster == cluster_ref)
            .count()
    }
}

#[async_trait]
impl WorkloadDatabases for MockWorkloadDatabases {
    async fn create_database(&self, cluster_ref: &str, database_name: &str) -> Result<()> {
        validate_database_name(database_name)?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::resource("create database", "mock create failure"));
        }

        let mut databases = self.databases.lock().await;
        let key = (cluster_ref.to_string(), database_name.to_string());
        if databases.contains_key(&key) {
            return Err(Error::resource(
                "create database",
                format!("database '{database_name}' already exists"),
            ));
        }
        databases.insert(key, String::new());
        Ok(())
    }

    async fn drop_database(&self, cluster_ref: &str, database_name: &str) -> Result<()> {
        validate_database_name(database_name)?;
        let mut databases = self.databases.lock().await;
        databases.remove(&(cluster_ref.to_string(), database_name.to_string()));
        Ok(())
    }

    async fn database_exists(&self, cluster_ref: &str, database_name: &str) -> Result<bool> {
        let databases = self.databases.lock().await;
        Ok(databases.contains_key(&(cluster_ref.to_string(), database_name.to_string())))
    }

    async fn dump(&self, cluster_ref: &str, database_name: &str) -> Result<DumpArtifact> {
        if self.fail_dump.load(Ordering::SeqCst) {
            return Err(Error::resource("database dump", "mock dump failure"));
        }

        let content = self
            .content_of(cluster_ref, database_name)
            .await
            .ok_or_else(|| {
                Error::resource(
                    "database dump",
                    format!("database '{database_name}' does not exist"),
                )
            })?;

        let snapshot_ref = format!("dbdump-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let size_bytes = content.len() as u64 + DUMP_OVERHEAD_BYTES;

        let mut dumps = self.dumps.lock().await;
        dumps.insert(snapshot_ref.clone(), content);
        Ok(DumpArtifact {
            snapshot_ref,
            size_bytes,
        })
    }

    async fn restore_dump(
        &self,
        cluster_ref: &str,
        database_name: &str,
        snapshot_ref: &str,
    ) -> Result<()> {
        let content = {
            let dumps = self.dumps.lock().await;
            dumps.get(snapshot_ref).cloned().ok_or_else(|| {
                Error::resource(
                    "database restore",
                    format!("dump artifact missing: {snapshot_ref}"),
                )
            })?
        };

        let mut databases = self.databases.lock().await;
        let key = (cluster_ref.to_string(), database_name.to_string());
        if !databases.contains_key(&key) {
            return Err(Error::resource(
                "database restore",
                format!("database '{database_name}' does not exist"),
            ));
        }
        databases.insert(key, content);
        Ok(())
    }

    async fn fix_ownership(&self, _cluster_ref: &str, _database_name: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dump_restore_round_trip() {
        let databases = MockWorkloadDatabases::new();
        databases.create_database("alpha", "tenant_acme").await.unwrap();
        databases.seed("alpha", "tenant_acme", "orders=17").await;

        let artifact = databases.dump("alpha", "tenant_acme").await.unwrap();
        assert!(artifact.size_bytes > 0);

        // Clobber, recreate, and restore.
        databases.drop_database("alpha", "tenant_acme").await.unwrap();
        databases.create_database("alpha", "tenant_acme").await.unwrap();
        databases
            .restore_dump("alpha", "tenant_acme", &artifact.snapshot_ref)
            .await
            .unwrap();

        assert_eq!(
            databases.content_of("alpha", "tenant_acme").await.as_deref(),
            Some("orders=17")
        );
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let databases = MockWorkloadDatabases::new();
        databases.create_database("alpha", "tenant_acme").await.unwrap();
        assert!(databases.create_database("alpha", "tenant_acme").await.is_err());
    }

    #[tokio::test]
    async fn test_dump_of_missing_database_fails() {
        let databases = MockWorkloadDatabases::new();
        assert!(databases.dump("alpha", "tenant_ghost").await.is_err());
    }
}
