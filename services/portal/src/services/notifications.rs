use sqlx::PgPool;

use village_health_common::{AppError, NotificationType, Page, Pagination, UserRole};
use village_health_database::Notification;

use crate::services::{AppState, SettingsService};

/// Content of one notification, independent of who receives it.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub problem_id: Option<i64>,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
}

impl NotificationDraft {
    pub fn new(title: impl Into<String>, message: impl Into<String>, notification_type: NotificationType) -> Self {
        Self {
            problem_id: None,
            title: title.into(),
            message: message.into(),
            notification_type,
        }
    }

    pub fn for_problem(mut self, problem_id: i64) -> Self {
        self.problem_id = Some(problem_id);
        self
    }
}

pub struct NotificationService {
    db_pool: PgPool,
    settings: SettingsService,
}

impl NotificationService {
    pub fn new(state: &AppState) -> Self {
        Self {
            db_pool: state.db_pool.clone(),
            settings: SettingsService::new(state),
        }
    }

    /// Delivers to one user. Returns whether a row was written; notifications
    /// are advisory, so failures are logged instead of propagated.
    pub async fn notify(&self, user_id: i64, draft: &NotificationDraft) -> bool {
        if !self.enabled().await {
            return false;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO notifications (user_id, problem_id, title, message, type)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_id)
        .bind(draft.problem_id)
        .bind(&draft.title)
        .bind(&draft.message)
        .bind(draft.notification_type.as_str())
        .execute(&self.db_pool)
        .await;

        match result {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("Failed to notify user {}: {}", user_id, err);
                false
            }
        }
    }

    /// Delivers to every active user holding `role`. Returns how many rows were written.
    pub async fn notify_role(&self, role: UserRole, draft: &NotificationDraft) -> u64 {
        if !self.enabled().await {
            return 0;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO notifications (user_id, problem_id, title, message, type)
            SELECT id, $2, $3, $4, $5 FROM users WHERE role = $1 AND status = 'active'
            "#,
        )
        .bind(role.as_str())
        .bind(draft.problem_id)
        .bind(&draft.title)
        .bind(&draft.message)
        .bind(draft.notification_type.as_str())
        .execute(&self.db_pool)
        .await;

        match result {
            Ok(done) => done.rows_affected(),
            Err(err) => {
                tracing::warn!("Failed to notify {} users: {}", role, err);
                0
            }
        }
    }

    async fn enabled(&self) -> bool {
        self.settings.notifications_enabled().await.unwrap_or_else(|err| {
            tracing::warn!("Could not read notification setting, assuming enabled: {}", err);
            true
        })
    }

    pub async fn list_for_user(&self, user_id: i64, pagination: Pagination) -> Result<Page<Notification>, AppError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.db_pool)
            .await?;

        let items = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(pagination.limit())
        .bind(pagination.offset())
        .fetch_all(&self.db_pool)
        .await?;

        Ok(Page::new(items, pagination, total))
    }

    pub async fn unread_count(&self, user_id: i64) -> Result<i64, AppError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND NOT is_read",
        )
        .bind(user_id)
        .fetch_one(&self.db_pool)
        .await?)
    }

    pub async fn mark_read(&self, user_id: i64, notification_id: i64) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2")
            .bind(notification_id)
            .bind(user_id)
            .execute(&self.db_pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Notification not found".to_string()));
        }
        Ok(())
    }

    pub async fn mark_all_read(&self, user_id: i64) -> Result<u64, AppError> {
        let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND NOT is_read")
            .bind(user_id)
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected())
    }
}
