use sqlx::PgPool;
use village_health_common::{AppError, SettingKey};

pub struct MigrationRunner {
    pool: PgPool,
}

/// Credentials for the first administrator account.
#[derive(Debug, Clone)]
pub struct AdminSeed {
    pub name: String,
    pub email: String,
    pub password: String,
}

impl AdminSeed {
    pub fn from_env() -> Self {
        Self {
            name: std::env::var("ADMIN_NAME").unwrap_or_else(|_| "Administrator".to_string()),
            email: std::env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@villagehealth.local".to_string()),
            password: std::env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin12345".to_string()),
        }
    }
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_migrations(&self) -> Result<(), AppError> {
        tracing::info!("Starting database migrations...");

        let migrator = sqlx::migrate!("./migrations");
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.into()))?;

        tracing::info!("All migrations completed successfully");
        Ok(())
    }

    pub async fn check_migration_status(&self) -> Result<MigrationStatus, AppError> {
        let migrator = sqlx::migrate!("./migrations");

        let applied_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM _sqlx_migrations WHERE success",
        )
        .fetch_one(&self.pool)
        .await
        .unwrap_or(0) as usize;

        let total_migrations = migrator.migrations.len();
        let pending_count = total_migrations.saturating_sub(applied_count);

        Ok(MigrationStatus {
            total: total_migrations,
            applied: applied_count,
            pending: pending_count,
            is_up_to_date: pending_count == 0,
        })
    }

    /// Creates the first admin if no admin exists and fills in any missing
    /// system settings with their defaults. Safe to run repeatedly.
    pub async fn seed_initial_data(&self, admin: &AdminSeed) -> Result<(), AppError> {
        let admin_exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM users WHERE role = 'admin')",
        )
        .fetch_one(&self.pool)
        .await?;

        if !admin_exists {
            let admin_password = village_health_auth::PasswordService::hash_password(&admin.password)?;

            sqlx::query(
                r#"
                INSERT INTO users (name, email, password, role, status)
                VALUES ($1, $2, $3, 'admin', 'active')
                ON CONFLICT (email) DO NOTHING
                "#,
            )
            .bind(&admin.name)
            .bind(&admin.email)
            .bind(admin_password)
            .execute(&self.pool)
            .await?;

            tracing::info!("Admin user created: {}", admin.email);
        }

        for key in SettingKey::ALL {
            sqlx::query(
                r#"
                INSERT INTO system_settings (setting_key, setting_value)
                VALUES ($1, $2)
                ON CONFLICT (setting_key) DO NOTHING
                "#,
            )
            .bind(key.as_str())
            .bind(key.default_value())
            .execute(&self.pool)
            .await?;
        }

        tracing::info!("Default system settings ensured");
        Ok(())
    }
}

#[derive(Debug)]
pub struct MigrationStatus {
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
    pub is_up_to_date: bool,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Migrations: {}/{} applied, {} pending",
            self.applied, self.total, self.pending
        )
    }
}
