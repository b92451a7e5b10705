//! JSON snapshots of the application tables.
//!
//! Rows are exported with `row_to_json` and restored with
//! `jsonb_populate_recordset`, so values never pass through hand-built SQL
//! literals in either direction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use village_health_common::AppError;

/// Tables in foreign-key order: parents before children.
pub const BACKUP_TABLES: [&str; 7] = [
    "users",
    "problems",
    "problem_updates",
    "medical_responses",
    "notifications",
    "admin_logs",
    "system_settings",
];

const FORMAT_NAME: &str = "village-health-backup";
const FORMAT_VERSION: u32 = 1;
const FILE_PREFIX: &str = "backup_";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupDocument {
    pub format: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub tables: Vec<TableDump>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TableDump {
    pub name: String,
    pub rows: serde_json::Value,
}

impl TableDump {
    pub fn row_count(&self) -> usize {
        self.rows.as_array().map(Vec::len).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Read-only transaction in which every query sees the same snapshot, so
/// child rows never outrun their parents in a dump.
pub async fn begin_snapshot(pool: &PgPool) -> Result<Transaction<'static, Postgres>, AppError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

pub async fn dump_tables(conn: &mut PgConnection) -> Result<Vec<TableDump>, AppError> {
    let mut tables = Vec::with_capacity(BACKUP_TABLES.len());
    for table in BACKUP_TABLES {
        // table names come from the fixed list above
        let rows: serde_json::Value = sqlx::query_scalar(&format!(
            "SELECT COALESCE(json_agg(row_to_json(t)), '[]'::json) FROM {} t",
            table
        ))
        .fetch_one(&mut *conn)
        .await?;

        tables.push(TableDump {
            name: table.to_string(),
            rows,
        });
    }
    Ok(tables)
}

#[derive(Clone)]
pub struct BackupService {
    db_pool: PgPool,
    backup_dir: PathBuf,
}

impl BackupService {
    pub fn new(db_pool: PgPool, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_pool,
            backup_dir: backup_dir.into(),
        }
    }

    pub async fn create_backup(&self) -> Result<BackupFile, AppError> {
        let mut snapshot = begin_snapshot(&self.db_pool).await?;
        let tables = dump_tables(&mut *snapshot).await?;
        snapshot.commit().await?;

        let created_at = Utc::now();
        let document = BackupDocument {
            format: FORMAT_NAME.to_string(),
            version: FORMAT_VERSION,
            created_at,
            tables,
        };

        let body = serde_json::to_vec_pretty(&document)
            .map_err(|e| AppError::Internal(format!("Failed to serialize backup: {}", e)))?;

        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let name = backup_file_name(created_at);
        let path = self.backup_dir.join(&name);
        tokio::fs::write(&path, &body).await?;

        tracing::info!("Backup written to {}", path.display());
        Ok(BackupFile {
            name,
            size_bytes: body.len() as u64,
            modified_at: Some(created_at),
        })
    }

    /// Backups on disk, newest first. Files that do not look like backups are skipped.
    pub async fn list_backups(&self) -> Result<Vec<BackupFile>, AppError> {
        let mut files = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_backup_name(&name).is_err() {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            files.push(BackupFile {
                name,
                size_bytes: metadata.len(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        files.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(files)
    }

    pub async fn read_backup(&self, name: &str) -> Result<Vec<u8>, AppError> {
        let path = self.resolve(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("Backup '{}' not found", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_backup(&self, name: &str) -> Result<(), AppError> {
        let path = self.resolve(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("Backup deleted: {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("Backup '{}' not found", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces every application table with the contents of a backup file, in
    /// one transaction.
    pub async fn restore_backup(&self, path: &Path) -> Result<usize, AppError> {
        let bytes = tokio::fs::read(path).await?;
        let document = parse_backup(&bytes)?;

        let mut tx = self.db_pool.begin().await?;

        sqlx::query(&format!(
            "TRUNCATE {} RESTART IDENTITY CASCADE",
            BACKUP_TABLES.join(", ")
        ))
        .execute(&mut *tx)
        .await?;

        let mut restored = 0;
        for table in BACKUP_TABLES {
            let Some(dump) = document.tables.iter().find(|t| t.name == table) else {
                tracing::warn!("Backup has no data for table {}", table);
                continue;
            };

            sqlx::query(&format!(
                "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)"
            ))
            .bind(&dump.rows)
            .execute(&mut *tx)
            .await?;
            restored += dump.row_count();

            if table != "system_settings" {
                sqlx::query(&format!(
                    "SELECT setval(pg_get_serial_sequence('{table}', 'id'), COALESCE(MAX(id), 1), MAX(id) IS NOT NULL) FROM {table}"
                ))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        tracing::info!("Restored {} rows from {}", restored, path.display());
        Ok(restored)
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, AppError> {
        validate_backup_name(name)?;
        Ok(self.backup_dir.join(name))
    }
}

pub fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("{}{}{}", FILE_PREFIX, at.format("%Y%m%d_%H%M%S_%3f"), FILE_SUFFIX)
}

/// Accepts only names this service generates, which rules out separators and
/// parent-directory components.
pub fn validate_backup_name(name: &str) -> Result<(), AppError> {
    let valid = name.starts_with(FILE_PREFIX)
        && name.ends_with(FILE_SUFFIX)
        && name.len() <= 64
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid backup file name '{}'", name)))
    }
}

pub fn parse_backup(bytes: &[u8]) -> Result<BackupDocument, AppError> {
    let document: BackupDocument = serde_json::from_slice(bytes)
        .map_err(|e| AppError::Validation(format!("Not a valid backup file: {}", e)))?;

    if document.format != FORMAT_NAME || document.version != FORMAT_VERSION {
        return Err(AppError::Validation(format!(
            "Unsupported backup format {} v{}",
            document.format, document.version
        )));
    }
    if let Some(bad) = document.tables.iter().find(|t| !t.rows.is_array()) {
        return Err(AppError::Validation(format!("Table {} is not a row list", bad.name)));
    }

    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generated_names_pass_validation() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap();
        let name = backup_file_name(at);
        assert_eq!(name, "backup_20261019_083005_000.json");
        assert!(validate_backup_name(&name).is_ok());
    }

    #[test]
    fn traversal_and_foreign_names_are_rejected() {
        for name in [
            "../backup_1.json",
            "backup_../../etc/passwd.json",
            "backup_1.sql",
            "notes.json",
            "backup_1/evil.json",
            "backup_1\\evil.json",
            "",
        ] {
            assert!(validate_backup_name(name).is_err(), "{} should be rejected", name);
        }
    }

    #[test]
    fn parse_checks_format_marker() {
        let good = serde_json::json!({
            "format": "village-health-backup",
            "version": 1,
            "created_at": "2026-10-19T08:30:05Z",
            "tables": [{"name": "users", "rows": [{"id": 1}, {"id": 2}]}]
        });
        let document = parse_backup(good.to_string().as_bytes()).unwrap();
        assert_eq!(document.tables[0].row_count(), 2);

        let mut wrong = good.clone();
        wrong["format"] = serde_json::json!("mysqldump");
        assert!(parse_backup(wrong.to_string().as_bytes()).is_err());

        let mut not_rows = good;
        not_rows["tables"][0]["rows"] = serde_json::json!({"id": 1});
        assert!(parse_backup(not_rows.to_string().as_bytes()).is_err());

        assert!(parse_backup(b"INSERT INTO users VALUES (1);").is_err());
    }

    #[tokio::test]
    async fn files_on_disk_are_listed_read_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("backup_20260101_000000_000.json"), b"{}").await.unwrap();
        tokio::fs::write(dir.path().join("backup_20260201_000000_000.json"), b"{}").await.unwrap();
        tokio::fs::write(dir.path().join("readme.txt"), b"ignore me").await.unwrap();

        let pool = crate::create_lazy_pool("postgresql://localhost/unused").unwrap();
        let service = BackupService::new(pool, dir.path());

        let files = service.list_backups().await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["backup_20260201_000000_000.json", "backup_20260101_000000_000.json"]
        );

        assert_eq!(service.read_backup("backup_20260101_000000_000.json").await.unwrap(), b"{}");
        service.delete_backup("backup_20260101_000000_000.json").await.unwrap();
        assert!(matches!(
            service.read_backup("backup_20260101_000000_000.json").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.delete_backup("../readme.txt").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::create_lazy_pool("postgresql://localhost/unused").unwrap();
        let service = BackupService::new(pool, dir.path().join("not-created-yet"));
        assert!(service.list_backups().await.unwrap().is_empty());
    }
}
