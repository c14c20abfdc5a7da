// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL workload-database operations.
//!
//! DDL runs over short-lived connections resolved through the router
//! (acquired right before use, dropped on every exit path); dump/restore
//! shells out to `pg_dump`/`pg_restore` with artifacts under the data
//! directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use moorage_core::error::{Error, Result};
use moorage_core::router::{ConnectionRouter, DatabasePurpose};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DumpArtifact, WorkloadDatabases, validate_database_name};

/// Workload-database operations against real PostgreSQL clusters.
pub struct PostgresWorkloadDatabases {
    router: Arc<ConnectionRouter>,
    dumps_dir: PathBuf,
    pg_dump_bin: String,
    pg_restore_bin: String,
}

impl PostgresWorkloadDatabases {
    /// Create the operations layer with dump artifacts under `data_dir`.
    pub fn new(router: Arc<ConnectionRouter>, data_dir: &Path) -> Self {
        Self {
            router,
            dumps_dir: data_dir.join("database-dumps"),
            pg_dump_bin: std::env::var("MOORAGE_PG_DUMP_BIN")
                .unwrap_or_else(|_| "pg_dump".to_string()),
            pg_restore_bin: std::env::var("MOORAGE_PG_RESTORE_BIN")
                .unwrap_or_else(|_| "pg_restore".to_string()),
        }
    }

    fn dump_path(&self, snapshot_ref: &str) -> PathBuf {
        self.dumps_dir.join(format!("{snapshot_ref}.dump"))
    }

    /// Common connection args for the pg tools.
    fn tool_args(&self, cluster_ref: &str, database_name: &str) -> Result<Vec<String>> {
        let endpoint = self.router.endpoint(cluster_ref)?;
        let admin = self.router.admin_credential();
        Ok(vec![
            "-h".to_string(),
            endpoint.host.clone(),
            "-p".to_string(),
            endpoint.port.to_string(),
            "-U".to_string(),
            admin.username.clone(),
            "-d".to_string(),
            database_name.to_string(),
        ])
    }

    async fn run_tool(&self, binary: &str, args: &[String]) -> Result<()> {
        debug!(binary = binary, "running database tool");

        let output = Command::new(binary)
            .args(args)
            .env("PGPASSWORD", &self.router.admin_credential().password)
            .output()
            .await
            .map_err(|e| Error::resource(binary.to_string(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::resource(binary.to_string(), stderr.trim()));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadDatabases for PostgresWorkloadDatabases {
    async fn create_database(&self, cluster_ref: &str, database_name: &str) -> Result<()> {
        validate_database_name(database_name)?;

        let handle = self.router.resolve(&DatabasePurpose::WorkloadAdmin {
            cluster_ref: cluster_ref.to_string(),
        })?;
        let mut conn = handle.connect().await?;

        sqlx::query(&format!(r#"CREATE DATABASE "{database_name}""#))
            .execute(&mut conn)
            .await
            .map_err(|e| Error::resource(format!("create database '{database_name}'"), e))?;

        debug!(cluster_ref = cluster_ref, database = database_name, "created workload database");
        Ok(())
    }

    async fn drop_database(&self, cluster_ref: &str, database_name: &str) -> Result<()> {
        validate_database_name(database_name)?;

        let handle = self.router.resolve(&DatabasePurpose::WorkloadAdmin {
            cluster_ref: cluster_ref.to_string(),
        })?;
        let mut conn = handle.connect().await?;

        sqlx::query(&format!(
            r#"DROP DATABASE IF EXISTS "{database_name}" WITH (FORCE)"#
        ))
        .execute(&mut conn)
        .await
        .map_err(|e| Error::resource(format!("drop database '{database_name}'"), e))?;

        debug!(cluster_ref = cluster_ref, database = database_name, "dropped workload database");
        Ok(())
    }

    async fn database_exists(&self, cluster_ref: &str, database_name: &str) -> Result<bool> {
        let handle = self.router.resolve(&DatabasePurpose::WorkloadAdmin {
            cluster_ref: cluster_ref.to_string(),
        })?;
        let mut conn = handle.connect().await?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(database_name)
                .fetch_one(&mut conn)
                .await
                .map_err(|e| Error::resource("query pg_database", e))?;
        Ok(exists)
    }

    async fn dump(&self, cluster_ref: &str, database_name: &str) -> Result<DumpArtifact> {
        validate_database_name(database_name)?;

        tokio::fs::create_dir_all(&self.dumps_dir)
            .await
            .map_err(|e| Error::resource("prepare dump directory", e))?;

        let snapshot_ref = format!("dbdump-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let path = self.dump_path(&snapshot_ref);

        let mut args = self.tool_args(cluster_ref, database_name)?;
        args.extend([
            "-Fc".to_string(),
            "-f".to_string(),
            path.display().to_string(),
        ]);
        self.run_tool(&self.pg_dump_bin, &args).await?;

        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::resource("stat dump artifact", e))?
            .len();

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
        validate_database_name(database_name)?;

        let path = self.dump_path(snapshot_ref);
        if !path.exists() {
            return Err(Error::resource(
                "database restore",
                format!("dump artifact missing: {}", path.display()),
            ));
        }

        let mut args = self.tool_args(cluster_ref, database_name)?;
        // The dump may carry roles from another cluster; ownership is
        // repaired afterwards via fix_ownership.
        args.extend(["--no-owner".to_string(), path.display().to_string()]);
        self.run_tool(&self.pg_restore_bin, &args).await
    }

    async fn fix_ownership(&self, cluster_ref: &str, database_name: &str) -> Result<()> {
        validate_database_name(database_name)?;

        let handle = self.router.resolve(&DatabasePurpose::WorkloadInstance {
            cluster_ref: cluster_ref.to_string(),
            database_name: database_name.to_string(),
        })?;
        let mut conn = handle.connect().await?;
        let owner = self.router.admin_credential().username.clone();

        sqlx::query(&format!(r#"ALTER SCHEMA public OWNER TO "{owner}""#))
            .execute(&mut conn)
            .await
            .map_err(|e| Error::resource("alter schema owner", e))?;

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT tablename FROM pg_tables WHERE schemaname = 'public'",
        )
        .fetch_all(&mut conn)
        .await
        .map_err(|e| Error::resource("list restored tables", e))?;

        for table in &tables {
            if validate_database_name(table).is_err() {
                warn!(table = %table, "skipping ownership repair for unusual table name");
                continue;
            }
            sqlx::query(&format!(r#"ALTER TABLE public."{table}" OWNER TO "{owner}""#))
                .execute(&mut conn)
                .await
                .map_err(|e| Error::resource(format!("alter table '{table}' owner"), e))?;
        }

        let sequences: Vec<String> = sqlx::query_scalar(
            "SELECT sequencename FROM pg_sequences WHERE schemaname = 'public'",
        )
        .fetch_all(&mut conn)
        .await
        .map_err(|e| Error::resource("list restored sequences", e))?;

        for sequence in &sequences {
            if validate_database_name(sequence).is_err() {
                continue;
            }
            sqlx::query(&format!(
                r#"ALTER SEQUENCE public."{sequence}" OWNER TO "{owner}""#
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| Error::resource(format!("alter sequence '{sequence}' owner"), e))?;
        }

        debug!(
            cluster_ref = cluster_ref,
            database = database_name,
            tables = tables.len(),
            "ownership repaired on restored database"
        );
        Ok(())
    }
}
