use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::migrate::Migrate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use super::Db;
use crate::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<i64>,
    pub latest: Option<i64>,
}

/// Opens the controller database.
///
/// `sqlite::memory:` is redirected to a unique temp file with a single shared
/// connection; separate in-memory connections would each see an empty
/// database.
pub async fn init_pool(database_url: &str) -> Result<Db> {
    let in_memory = database_url.starts_with("sqlite::memory");
    let url = if in_memory {
        let path = std::env::temp_dir().join(format!("netlab-controller-{}.sqlite", Uuid::new_v4()));
        format!("sqlite://{}", path.display())
    } else {
        database_url.to_string()
    };
    ensure_db_dir(&url)?;

    let mut opts = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool_opts = if in_memory {
        opts = opts.shared_cache(true);
        SqlitePoolOptions::new().max_connections(1)
    } else {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_opts
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await?;
    Ok(pool)
}

fn ensure_db_dir(database_url: &str) -> Result<()> {
    if let Some(path) = database_url.strip_prefix("sqlite://")
        && let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }
    Ok(())
}

/// Applies pending migrations after refusing databases written by a newer
/// binary or with edited migration files.
pub async fn run_migrations(pool: &Db) -> Result<MigrationReport> {
    let before = applied_versions(pool).await?;
    MIGRATOR
        .run(pool)
        .await
        .context("applying database migrations failed")?;
    let after = applied_versions(pool).await?;

    let mut applied: Vec<i64> = after.difference(&before).copied().collect();
    applied.sort_unstable();
    Ok(MigrationReport {
        applied,
        latest: after.iter().copied().max(),
    })
}

async fn applied_versions(pool: &Db) -> Result<HashSet<i64>> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table()
        .await
        .context("ensure migrations table exists")?;
    if let Some(version) = conn.dirty_version().await? {
        anyhow::bail!("database is in a dirty migration state at version {version}");
    }

    let mut versions = HashSet::new();
    for migration in conn.list_applied_migrations().await? {
        let Some(known) = MIGRATOR.iter().find(|m| m.version == migration.version) else {
            anyhow::bail!(
                "database has unknown migration version {}",
                migration.version
            );
        };
        if known.checksum != migration.checksum {
            anyhow::bail!(
                "migration {} checksum mismatch between database and binary",
                migration.version
            );
        }
        versions.insert(migration.version);
    }
    Ok(versions)
}
