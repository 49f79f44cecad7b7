use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Create titles table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS titles (
            number INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            latest_amended_on TEXT,
            latest_issue_date TEXT,
            up_to_date_as_of TEXT,
            reserved INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create agencies table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agencies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            short_name TEXT,
            display_name TEXT NOT NULL,
            sortable_name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            parent_id INTEGER,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (parent_id) REFERENCES agencies(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create cfr_references table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cfr_references (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            chapter TEXT,
            part TEXT,
            subchapter TEXT,
            content TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // SQLite UNIQUE treats NULLs as distinct, so the natural key is
    // enforced over NULL-folded columns instead.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_cfr_references_key ON cfr_references(
            title,
            IFNULL(chapter, ''),
            IFNULL(part, ''),
            IFNULL(subchapter, '')
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create association table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agency_cfr_references (
            agency_id INTEGER NOT NULL,
            cfr_reference_id INTEGER NOT NULL,
            PRIMARY KEY (agency_id, cfr_reference_id),
            FOREIGN KEY (agency_id) REFERENCES agencies(id) ON DELETE CASCADE,
            FOREIGN KEY (cfr_reference_id) REFERENCES cfr_references(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='cfr_references_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE cfr_references_fts USING fts5(
                reference_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_agencies_parent_id ON agencies(parent_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_agency_cfr_reference ON agency_cfr_references(cfr_reference_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
