use village_health_database::{
    begin_snapshot, create_lazy_pool, dump_tables, AdminSeed, BackupService, MigrationRunner, User,
};
use sqlx::Row;

async fn test_pool() -> Option<sqlx::PgPool> {
    // Skip test if no database is available
    let Ok(url) = std::env::var("DATABASE_URL") else {
        println!("Skipping database test - DATABASE_URL not set");
        return None;
    };

    let pool = create_lazy_pool(&url).expect("Invalid DATABASE_URL");
    MigrationRunner::new(pool.clone())
        .run_all_migrations()
        .await
        .expect("Failed to run migrations");
    Some(pool)
}

#[tokio::test]
async fn test_migrations_and_seed() {
    let Some(pool) = test_pool().await else { return };

    let runner = MigrationRunner::new(pool.clone());
    let status = runner.check_migration_status().await.expect("Failed to read status");
    assert!(status.is_up_to_date, "{}", status);

    let seed = AdminSeed {
        name: "Seed Admin".to_string(),
        email: format!("seed-admin-{}@example.org", std::process::id()),
        password: "admin12345".to_string(),
    };
    runner.seed_initial_data(&seed).await.expect("Failed to seed");
    // seeding twice must not fail or duplicate settings
    runner.seed_initial_data(&seed).await.expect("Failed to re-seed");

    let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'admin'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(admins >= 1);

    let settings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM system_settings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(settings >= 4);
}

#[tokio::test]
async fn test_legacy_null_status_is_readable() {
    let Some(pool) = test_pool().await else { return };

    let email = format!("legacy-{}@example.org", std::process::id());
    let row = sqlx::query("INSERT INTO users (name, email, password, role, status) VALUES ($1, $2, 'x', 'doctor', NULL) RETURNING id")
        .bind("Legacy Doctor")
        .bind(&email)
        .fetch_one(&pool)
        .await
        .expect("Failed to insert legacy user");
    let id: i64 = row.get("id");

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(user.status(), village_health_common::UserStatus::Pending);

    sqlx::query("DELETE FROM users WHERE id = $1").bind(id).execute(&pool).await.unwrap();
}

#[tokio::test]
async fn test_assignee_requires_non_pending_status() {
    let Some(pool) = test_pool().await else { return };

    let email = format!("check-{}@example.org", std::process::id());
    let user_id: i64 = sqlx::query_scalar(
        "INSERT INTO users (name, email, password, role, status) VALUES ('Check', $1, 'x', 'avms', 'active') RETURNING id",
    )
    .bind(&email)
    .fetch_one(&pool)
    .await
    .unwrap();

    let result = sqlx::query(
        "INSERT INTO problems (villager_id, title, description, status, assigned_to) VALUES ($1, 't', 'd', 'pending', $1)",
    )
    .bind(user_id)
    .execute(&pool)
    .await;
    assert!(result.is_err(), "schema must reject a pending problem with an assignee");

    sqlx::query("DELETE FROM users WHERE id = $1").bind(user_id).execute(&pool).await.unwrap();
}

#[tokio::test]
async fn test_backup_file_round_trip() {
    let Some(pool) = test_pool().await else { return };

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let service = BackupService::new(pool, dir.path());

    let file = service.create_backup().await.expect("Failed to create backup");
    assert!(file.size_bytes > 0);

    let listed = service.list_backups().await.unwrap();
    assert!(listed.iter().any(|f| f.name == file.name));

    let bytes = service.read_backup(&file.name).await.unwrap();
    let document = village_health_database::parse_backup(&bytes).unwrap();
    assert_eq!(document.tables.len(), village_health_database::BACKUP_TABLES.len());

    service.delete_backup(&file.name).await.unwrap();
    assert!(service.list_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dump_reads_one_snapshot() {
    let Some(pool) = test_pool().await else { return };

    let mut snapshot = begin_snapshot(&pool).await.expect("Failed to open snapshot");
    let before = dump_tables(&mut *snapshot).await.unwrap();

    // written after the snapshot started, on another connection
    let villager: i64 = sqlx::query_scalar(
        "INSERT INTO users (name, email, password, role, status) VALUES ('Late Villager', $1, 'x', 'villager', 'active') RETURNING id",
    )
    .bind(format!("late-{}@example.org", chrono::Utc::now().timestamp_micros()))
    .fetch_one(&pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO problems (villager_id, title, description) VALUES ($1, 'Late problem', 'Written mid-backup')")
        .bind(villager)
        .execute(&pool)
        .await
        .unwrap();

    let after = dump_tables(&mut *snapshot).await.unwrap();
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.row_count(), new.row_count(), "table {}", old.name);
    }
    let problems = after.iter().find(|t| t.name == "problems").unwrap();
    assert!(!problems.rows.to_string().contains("Late problem"));

    // the snapshot is read only
    let write = sqlx::query("DELETE FROM system_settings").execute(&mut *snapshot).await;
    assert!(write.is_err());
    snapshot.rollback().await.unwrap();
}
