//! Database module for SQLite persistence using SeaORM

pub mod entities;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::path::Path;

/// Initialize database connection and create tables
pub async fn init_database(db_path: &Path) -> Result<DatabaseConnection, DbErr> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DbErr::Custom(format!("{}: {}", parent.display(), e)))?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    tracing::info!("Connecting to database: {}", db_url);

    // One connection: SQLite has a single writer anyway, and deferred
    // transactions on separate connections fail with SQLITE_BUSY on upgrade
    let mut options = ConnectOptions::new(db_url);
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);

    let db = Database::connect(options).await?;

    create_tables(&db).await?;

    Ok(db)
}

async fn exec(db: &DatabaseConnection, sql: &str) -> Result<(), DbErr> {
    db.execute(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await
        .map(|_| ())
}

/// Create all tables if they don't exist
async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    // WAL lets list()/publication readers run while a worker commits
    if let Err(e) = exec(db, "PRAGMA journal_mode=WAL").await {
        tracing::warn!("Could not enable WAL journal mode, using the default: {}", e);
    }

    // Images table (mirrored and custom)
    exec(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id TEXT NOT NULL,
            stream_id TEXT NOT NULL,
            name TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            status_detail TEXT,
            origin_index_url TEXT,
            os TEXT,
            release TEXT,
            release_title TEXT,
            release_codename TEXT,
            version TEXT,
            arch TEXT,
            subarch TEXT,
            subarches TEXT,
            label TEXT,
            kflavor TEXT,
            krel TEXT,
            build_id TEXT,
            product_meta TEXT,
            version_meta TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .await?;

    exec(db, r#"CREATE INDEX IF NOT EXISTS idx_images_product ON images(product_id)"#).await?;
    exec(db, r#"CREATE INDEX IF NOT EXISTS idx_images_status ON images(status)"#).await?;

    // Artifacts table (files owned by an image)
    exec(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            ftype TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            size INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            source_url TEXT,
            item_meta TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
        )
        "#,
    )
    .await?;

    exec(db, r#"CREATE INDEX IF NOT EXISTS idx_artifacts_image ON artifacts(image_id)"#).await?;

    // Mirror jobs table (audit trail, never deleted)
    exec(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS mirror_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id TEXT NOT NULL,
            index_url TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            progress INTEGER,
            message TEXT,
            version TEXT,
            image_id INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER
        )
        "#,
    )
    .await?;

    exec(db, r#"CREATE INDEX IF NOT EXISTS idx_jobs_product ON mirror_jobs(product_id)"#).await?;

    // At most one non-terminal job per product, enforced by the store itself
    exec(
        db,
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_product
        ON mirror_jobs(product_id)
        WHERE status IN ('queued', 'running')
        "#,
    )
    .await?;

    tracing::info!("Database tables initialized");
    Ok(())
}

/// Current unix time in seconds
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_enables_wal_and_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("library.db");

        let db = init_database(&path).await.unwrap();
        let row = db
            .query_one(Statement::from_string(
                db.get_database_backend(),
                "PRAGMA journal_mode".to_string(),
            ))
            .await
            .unwrap()
            .unwrap();
        let mode: String = row.try_get("", "journal_mode").unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        drop(db);

        // Schema creation is idempotent
        init_database(&path).await.unwrap();
    }
}
