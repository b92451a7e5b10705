use sqlx::{PgPool, Postgres, QueryBuilder};

use village_health_auth::PasswordService;
use village_health_common::{
    AppError, NotificationType, Page, Pagination, RedisKeys, RedisService, UserRole, UserStatus,
};
use village_health_database::User;

use crate::config::SessionConfig;
use crate::models::{PasswordForm, ProfileForm, RegisterForm, UserFilter};
use crate::services::audit::AuditService;
use crate::services::notifications::{NotificationDraft, NotificationService};
use crate::services::{AppState, SettingsService};

/// Matches accounts awaiting review, including legacy rows whose status was
/// never set.
pub const PENDING_STATUS_SQL: &str = "(status IS NULL OR status = '' OR status = 'pending')";

const INVALID_LOGIN: &str = "Invalid email or password";

pub struct UserService {
    db_pool: PgPool,
    redis_service: RedisService,
    session: SessionConfig,
    settings: SettingsService,
    notifications: NotificationService,
    audit: AuditService,
}

impl UserService {
    pub fn new(state: &AppState) -> Self {
        Self {
            db_pool: state.db_pool.clone(),
            redis_service: state.redis_service.clone(),
            session: state.config.session.clone(),
            settings: SettingsService::new(state),
            notifications: NotificationService::new(state),
            audit: AuditService::new(state),
        }
    }

    // Registration
    pub async fn register_user(&self, form: &RegisterForm) -> Result<User, AppError> {
        let role: UserRole = form.role.parse()?;
        if !role.is_self_registrable() {
            return Err(AppError::Validation("That role cannot be chosen at registration".to_string()));
        }
        if form.password != form.confirm_password {
            return Err(AppError::Validation("Passwords do not match".to_string()));
        }
        let min_length = self.settings.password_min_length().await?;
        PasswordService::validate_password_strength(&form.password, min_length)?;

        let email = normalize_email(&form.email);
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
            .bind(&email)
            .fetch_one(&self.db_pool)
            .await?;
        if exists {
            return Err(AppError::Conflict("An account with this email already exists".to_string()));
        }

        let hashed_password = PasswordService::hash_password(&form.password)?;
        let status = role.initial_status();

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (name, email, password, role, status, phone, village)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(form.name.trim())
        .bind(&email)
        .bind(&hashed_password)
        .bind(role.as_str())
        .bind(status.as_str())
        .bind(trimmed(&form.phone))
        .bind(trimmed(&form.village))
        .fetch_one(&self.db_pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict("An account with this email already exists".to_string())
            }
            other => AppError::Database(other),
        })?;

        let message = match status {
            UserStatus::Pending => format!("{} registered as {} and is awaiting approval.", user.name, role),
            _ => format!("{} registered as {}.", user.name, role),
        };
        self.notifications
            .notify_role(
                UserRole::Admin,
                &NotificationDraft::new("New user registration", message, NotificationType::Info),
            )
            .await;

        tracing::info!("User registered: {} ({}) as {}", user.email, user.id, role);
        Ok(user)
    }

    // Login
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User, AppError> {
        let email = normalize_email(email);
        let attempts_key = RedisKeys::login_attempts(&email);

        let allowed = self
            .redis_service
            .check_rate_limit(&attempts_key, self.session.max_login_attempts, self.session.login_window_seconds)
            .await
            .unwrap_or(true); // Allow on Redis error
        if !allowed {
            tracing::warn!("Login throttled for {}", email);
            return Err(AppError::Authentication(
                "Too many login attempts. Please wait a few minutes and try again.".to_string(),
            ));
        }

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1 AND status = 'active'")
            .bind(&email)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| AppError::Authentication(INVALID_LOGIN.to_string()))?;

        if !PasswordService::verify_password(password, &user.password) {
            return Err(AppError::Authentication(INVALID_LOGIN.to_string()));
        }

        sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(user.id)
            .execute(&self.db_pool)
            .await?;

        if let Err(err) = self.redis_service.reset_rate_limit(&attempts_key).await {
            tracing::warn!("Could not reset login attempts for {}: {}", email, err);
        }

        tracing::info!("User logged in: {} ({})", user.email, user.id);
        Ok(user)
    }

    pub async fn find_user(&self, user_id: i64) -> Result<Option<User>, AppError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.db_pool)
            .await?)
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User, AppError> {
        self.find_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))
    }

    /// An active user holding `role`; used to validate assignment targets.
    pub async fn get_active_with_role(&self, user_id: i64, role: UserRole) -> Result<User, AppError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND role = $2 AND status = 'active'")
            .bind(user_id)
            .bind(role.as_str())
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| AppError::InvalidArgument(format!("No active {} with id {}", role, user_id)))
    }

    pub async fn list_active_by_role(&self, role: UserRole) -> Result<Vec<User>, AppError> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE role = $1 AND status = 'active' ORDER BY name",
        )
        .bind(role.as_str())
        .fetch_all(&self.db_pool)
        .await?)
    }

    // Profile
    pub async fn update_profile(&self, user_id: i64, form: &ProfileForm) -> Result<User, AppError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET name = $2, phone = $3, village = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(form.name.trim())
        .bind(trimmed(&form.phone))
        .bind(trimmed(&form.village))
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        tracing::info!("Profile updated for user {}", user_id);
        Ok(user)
    }

    pub async fn change_password(&self, user: &User, form: &PasswordForm) -> Result<(), AppError> {
        if !PasswordService::verify_password(&form.current_password, &user.password) {
            return Err(AppError::Validation("Current password is incorrect".to_string()));
        }
        if form.new_password != form.confirm_password {
            return Err(AppError::Validation("Passwords do not match".to_string()));
        }
        let min_length = self.settings.password_min_length().await?;
        PasswordService::validate_password_strength(&form.new_password, min_length)?;

        let hashed_password = PasswordService::hash_password(&form.new_password)?;
        sqlx::query("UPDATE users SET password = $2 WHERE id = $1")
            .bind(user.id)
            .bind(hashed_password)
            .execute(&self.db_pool)
            .await?;

        tracing::info!("Password changed for user {}", user.id);
        Ok(())
    }

    // Approval workflow
    pub async fn pending_approvals(&self, pagination: Pagination) -> Result<Page<User>, AppError> {
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM users WHERE {}", PENDING_STATUS_SQL))
            .fetch_one(&self.db_pool)
            .await?;

        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT * FROM users WHERE {} ORDER BY registered_at ASC, id ASC LIMIT $1 OFFSET $2",
            PENDING_STATUS_SQL
        ))
        .bind(pagination.limit())
        .bind(pagination.offset())
        .fetch_all(&self.db_pool)
        .await?;

        Ok(Page::new(users, pagination, total))
    }

    pub async fn pending_count(&self) -> Result<i64, AppError> {
        Ok(sqlx::query_scalar(&format!("SELECT COUNT(*) FROM users WHERE {}", PENDING_STATUS_SQL))
            .fetch_one(&self.db_pool)
            .await?)
    }

    pub async fn approve_user(&self, admin_id: i64, user_id: i64) -> Result<User, AppError> {
        let user = self.set_pending_status(user_id, UserStatus::Active).await?;

        self.notifications
            .notify(
                user.id,
                &NotificationDraft::new(
                    "Account approved",
                    "Your account has been approved. You can now log in.",
                    NotificationType::Success,
                ),
            )
            .await;
        self.audit
            .record(admin_id, "approve_user", "user", Some(user.id), format!("Approved {} ({})", user.email, user.role))
            .await;

        tracing::info!("User {} approved by admin {}", user.id, admin_id);
        Ok(user)
    }

    /// Approves several pending users atomically: either all are approved or
    /// none are.
    pub async fn bulk_approve(&self, admin_id: i64, user_ids: &[i64]) -> Result<Vec<User>, AppError> {
        if user_ids.is_empty() {
            return Err(AppError::Validation("Select at least one user to approve".to_string()));
        }

        let mut tx = self.db_pool.begin().await?;
        let mut approved = Vec::with_capacity(user_ids.len());
        for &user_id in user_ids {
            let user = sqlx::query_as::<_, User>(&format!(
                "UPDATE users SET status = 'active' WHERE id = $1 AND {} RETURNING *",
                PENDING_STATUS_SQL
            ))
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} is not awaiting approval", user_id)))?;
            approved.push(user);
        }
        tx.commit().await?;

        for user in &approved {
            self.notifications
                .notify(
                    user.id,
                    &NotificationDraft::new(
                        "Account approved",
                        "Your account has been approved. You can now log in.",
                        NotificationType::Success,
                    ),
                )
                .await;
        }
        let ids: Vec<String> = approved.iter().map(|u| u.id.to_string()).collect();
        self.audit
            .record(admin_id, "bulk_approve_users", "user", None, format!("Approved users {}", ids.join(", ")))
            .await;

        tracing::info!("Admin {} approved {} users", admin_id, approved.len());
        Ok(approved)
    }

    /// Rejects a pending registration but keeps the row with status `rejected`.
    pub async fn reject_and_retain(&self, admin_id: i64, user_id: i64) -> Result<User, AppError> {
        let user = self.set_pending_status(user_id, UserStatus::Rejected).await?;

        self.notifications
            .notify(
                user.id,
                &NotificationDraft::new(
                    "Registration rejected",
                    "Your registration was not approved. Contact the administrator for details.",
                    NotificationType::Error,
                ),
            )
            .await;
        self.audit
            .record(admin_id, "reject_user", "user", Some(user.id), format!("Rejected {} (retained)", user.email))
            .await;

        tracing::info!("User {} rejected (retained) by admin {}", user.id, admin_id);
        Ok(user)
    }

    /// Rejects a pending registration by deleting the row. Accounts that
    /// already own problem records can only be rejected and retained.
    pub async fn reject_and_purge(&self, admin_id: i64, user_id: i64) -> Result<User, AppError> {
        let mut tx = self.db_pool.begin().await?;
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT * FROM users WHERE id = $1 AND {} FOR UPDATE",
            PENDING_STATUS_SQL
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("User is not awaiting approval".to_string()))?;

        let has_records: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM problems WHERE villager_id = $1 OR assigned_to = $1 OR escalated_to = $1)
                OR EXISTS (SELECT 1 FROM problem_updates WHERE updated_by = $1)
                OR EXISTS (SELECT 1 FROM medical_responses WHERE doctor_id = $1)
                OR EXISTS (SELECT 1 FROM admin_logs WHERE admin_id = $1)
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        if has_records {
            return Err(AppError::Conflict(format!(
                "{} has problem records and cannot be deleted; reject and retain the account instead",
                user.name
            )));
        }

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.audit
            .record(admin_id, "purge_user", "user", Some(user.id), format!("Rejected and deleted {}", user.email))
            .await;

        tracing::info!("User {} rejected (purged) by admin {}", user.id, admin_id);
        Ok(user)
    }

    async fn set_pending_status(&self, user_id: i64, status: UserStatus) -> Result<User, AppError> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET status = $2 WHERE id = $1 AND {} RETURNING *",
            PENDING_STATUS_SQL
        ))
        .bind(user_id)
        .bind(status.as_str())
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| AppError::NotFound("User is not awaiting approval".to_string()))
    }

    // User management
    pub async fn list_users(&self, filter: &UserFilter, pagination: Pagination) -> Result<Page<User>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM users WHERE 1=1");
        push_user_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.db_pool).await?;

        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM users WHERE 1=1");
        push_user_filters(&mut query, filter);
        query
            .push(" ORDER BY registered_at DESC, id DESC LIMIT ")
            .push_bind(pagination.limit())
            .push(" OFFSET ")
            .push_bind(pagination.offset());
        let users = query.build_query_as::<User>().fetch_all(&self.db_pool).await?;

        Ok(Page::new(users, pagination, total))
    }

    /// Activate, deactivate or soft-delete an account.
    pub async fn set_status(&self, admin_id: i64, user_id: i64, status: UserStatus) -> Result<User, AppError> {
        if admin_id == user_id {
            return Err(AppError::Authorization("You cannot change your own account status".to_string()));
        }
        if status == UserStatus::Pending {
            return Err(AppError::InvalidArgument("Accounts cannot be moved back to pending".to_string()));
        }

        let user = sqlx::query_as::<_, User>("UPDATE users SET status = $2 WHERE id = $1 RETURNING *")
            .bind(user_id)
            .bind(status.as_str())
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        if status == UserStatus::Active {
            self.notifications
                .notify(
                    user.id,
                    &NotificationDraft::new("Account activated", "Your account is active.", NotificationType::Success),
                )
                .await;
        }
        self.audit
            .record(admin_id, &format!("set_user_{}", status), "user", Some(user.id), format!("{} is now {}", user.email, status))
            .await;

        tracing::info!("User {} set to {} by admin {}", user.id, status, admin_id);
        Ok(user)
    }

    pub async fn change_role(&self, admin_id: i64, user_id: i64, role: UserRole) -> Result<User, AppError> {
        if admin_id == user_id {
            return Err(AppError::Authorization("You cannot change your own role".to_string()));
        }

        let previous = self.get_user(user_id).await?;
        let user = sqlx::query_as::<_, User>("UPDATE users SET role = $2 WHERE id = $1 RETURNING *")
            .bind(user_id)
            .bind(role.as_str())
            .fetch_one(&self.db_pool)
            .await?;

        self.notifications
            .notify(
                user.id,
                &NotificationDraft::new(
                    "Role changed",
                    format!("Your role is now {}.", role),
                    NotificationType::Info,
                ),
            )
            .await;
        self.audit
            .record(admin_id, "change_role", "user", Some(user.id), format!("{}: {} -> {}", user.email, previous.role, role))
            .await;

        tracing::info!("User {} role changed to {} by admin {}", user.id, role, admin_id);
        Ok(user)
    }

    pub async fn count_by_role(&self) -> Result<Vec<(String, i64)>, AppError> {
        Ok(sqlx::query_as::<_, (String, i64)>(
            "SELECT role, COUNT(*) FROM users WHERE status = 'active' GROUP BY role ORDER BY role",
        )
        .fetch_all(&self.db_pool)
        .await?)
    }
}

fn push_user_filters(query: &mut QueryBuilder<'_, Postgres>, filter: &UserFilter) {
    if let Some(role) = filter.role {
        query.push(" AND role = ").push_bind(role.as_str().to_string());
    }
    match filter.status {
        Some(UserStatus::Pending) => {
            query.push(" AND ").push(PENDING_STATUS_SQL);
        }
        Some(status) => {
            query.push(" AND status = ").push_bind(status.as_str().to_string());
        }
        None => {}
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", escape_like(search));
        query
            .push(" AND (name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR email ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR village ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Escapes LIKE wildcards so user input matches literally.
pub fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.trim().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
