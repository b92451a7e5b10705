use sqlx::PgPool;

use village_health_common::{AppError, Page, Pagination};
use village_health_database::AdminLog;

use crate::services::AppState;

/// Append-only record of administrator actions.
pub struct AuditService {
    db_pool: PgPool,
}

impl AuditService {
    pub fn new(state: &AppState) -> Self {
        Self {
            db_pool: state.db_pool.clone(),
        }
    }

    /// Writes one log row. A failed write is logged and swallowed; it never
    /// fails the admin action that triggered it.
    pub async fn record(
        &self,
        admin_id: i64,
        action: &str,
        target_type: &str,
        target_id: Option<i64>,
        details: impl Into<String>,
    ) {
        let details = details.into();
        let result = sqlx::query(
            r#"
            INSERT INTO admin_logs (admin_id, action, target_type, target_id, details)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(admin_id)
        .bind(action)
        .bind(target_type)
        .bind(target_id)
        .bind(&details)
        .execute(&self.db_pool)
        .await;

        if let Err(err) = result {
            tracing::warn!(
                "Admin log skipped ({} {} {:?} by {}): {}",
                action, target_type, target_id, admin_id, err
            );
        }
    }

    pub async fn list(&self, pagination: Pagination) -> Result<Page<AdminLog>, AppError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM admin_logs")
            .fetch_one(&self.db_pool)
            .await?;

        let logs = sqlx::query_as::<_, AdminLog>(
            r#"
            SELECT l.id, l.admin_id, u.name AS admin_name, l.action, l.target_type,
                   l.target_id, l.details, l.created_at
            FROM admin_logs l
            LEFT JOIN users u ON u.id = l.admin_id
            ORDER BY l.created_at DESC, l.id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(pagination.limit())
        .bind(pagination.offset())
        .fetch_all(&self.db_pool)
        .await?;

        Ok(Page::new(logs, pagination, total))
    }
}
