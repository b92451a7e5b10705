use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};

use village_health_common::{
    AppError, NotificationType, Page, Pagination, Priority, ProblemStatus, UserRole, PRIORITY_RANK_SQL,
};
use village_health_database::{MedicalResponse, Problem, ProblemUpdate, User};

use crate::models::{
    AdminProblemForm, EscalateForm, NewProblem, ProblemDetail, RespondForm, StatusForm,
};
use crate::services::audit::AuditService;
use crate::services::notifications::{NotificationDraft, NotificationService};
use crate::services::users::{escape_like, trimmed, UserService};
use crate::services::{AppState, PhotoStorage};

/// Problem row plus the display names of everyone involved.
const PROBLEM_SELECT: &str = r#"
    SELECT p.id, p.villager_id, p.title, p.description, p.photo, p.category, p.priority,
           p.status, p.assigned_to, p.escalated_to, p.location, p.created_at, p.updated_at,
           p.resolved_at,
           v.name AS villager_name, v.village AS village,
           a.name AS assigned_to_name, d.name AS escalated_to_name
    FROM problems p
    JOIN users v ON v.id = p.villager_id
    LEFT JOIN users a ON a.id = p.assigned_to
    LEFT JOIN users d ON d.id = p.escalated_to
"#;

/// Keeps `resolved_at` in step with the status bound at `$status_param`:
/// stamped on first resolution, kept for other terminal statuses, cleared when
/// the problem is reopened.
fn resolved_at_sql(status_param: &str) -> String {
    format!(
        "CASE WHEN {s} = 'resolved' THEN COALESCE(resolved_at, NOW()) \
              WHEN {s} IN ('completed', 'closed') THEN resolved_at \
              ELSE NULL END",
        s = status_param
    )
}

const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct ProblemFilter {
    pub status: Option<ProblemStatus>,
    pub priority: Option<Priority>,
    pub village: Option<String>,
    pub villager_id: Option<i64>,
    pub assigned_to: Option<i64>,
    pub escalated_to: Option<i64>,
    pub unassigned_only: bool,
    pub open_only: bool,
    pub search: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemOrder {
    /// Priority rank, then oldest first. Used for the unassigned queue.
    QueueFifo,
    /// Priority rank, then most recently updated first.
    RecentlyUpdated,
}

impl ProblemOrder {
    fn sql(&self) -> String {
        match self {
            ProblemOrder::QueueFifo => format!(" ORDER BY {}, p.created_at ASC, p.id ASC", PRIORITY_RANK_SQL),
            ProblemOrder::RecentlyUpdated => format!(" ORDER BY {}, p.updated_at DESC, p.id DESC", PRIORITY_RANK_SQL),
        }
    }
}

/// How an admin edit treats an assignee field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssigneeChange {
    Unchanged,
    Clear,
    Set(i64),
}

impl AssigneeChange {
    /// Empty keeps the current value, `none` clears it, a number sets it.
    pub fn parse(raw: Option<&str>, field: &str) -> Result<Self, AppError> {
        match raw.map(str::trim) {
            None | Some("") => Ok(AssigneeChange::Unchanged),
            Some(value) if value.eq_ignore_ascii_case("none") => Ok(AssigneeChange::Clear),
            Some(value) => value
                .parse::<i64>()
                .ok()
                .filter(|id| *id > 0)
                .map(AssigneeChange::Set)
                .ok_or_else(|| AppError::InvalidArgument(format!("Invalid {} '{}'", field, value))),
        }
    }
}

pub struct ProblemService {
    db_pool: PgPool,
    photos: PhotoStorage,
    users: UserService,
    notifications: NotificationService,
    audit: AuditService,
}

impl ProblemService {
    pub fn new(state: &AppState) -> Self {
        Self {
            db_pool: state.db_pool.clone(),
            photos: PhotoStorage::new(state),
            users: UserService::new(state),
            notifications: NotificationService::new(state),
            audit: AuditService::new(state),
        }
    }

    pub async fn create_problem(&self, villager: &User, input: NewProblem) -> Result<Problem, AppError> {
        let title = input.title.trim();
        let description = input.description.trim();
        if title.is_empty() || description.is_empty() {
            return Err(AppError::Validation("Title and description are required".to_string()));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(AppError::Validation(format!(
                "Title must be at most {} characters",
                MAX_TITLE_CHARS
            )));
        }
        let priority = match input.priority.as_deref().map(str::trim) {
            None | Some("") => Priority::default(),
            Some(value) => value.parse()?,
        };

        let photo = match &input.photo {
            Some(upload) => Some(self.photos.save(&upload.file_name, &upload.bytes).await?),
            None => None,
        };

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO problems (villager_id, title, description, photo, category, priority, location, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            RETURNING id
            "#,
        )
        .bind(villager.id)
        .bind(title)
        .bind(description)
        .bind(&photo)
        .bind(trimmed(&input.category).map(|c| c.to_lowercase()))
        .bind(priority.as_str())
        .bind(trimmed(&input.location))
        .fetch_one(&self.db_pool)
        .await;

        let problem_id = match inserted {
            Ok(id) => id,
            Err(err) => {
                if let Some(stored) = &photo {
                    self.photos.remove(stored).await;
                }
                return Err(err.into());
            }
        };

        self.notifications
            .notify_role(
                UserRole::Avms,
                &NotificationDraft::new(
                    "New problem reported",
                    format!("{} reported '{}' ({} priority).", villager.name, title, priority),
                    NotificationType::Info,
                )
                .for_problem(problem_id),
            )
            .await;

        tracing::info!("Problem {} reported by villager {}", problem_id, villager.id);
        self.get_problem(problem_id).await
    }

    pub async fn get_problem(&self, problem_id: i64) -> Result<Problem, AppError> {
        sqlx::query_as::<_, Problem>(&format!("{} WHERE p.id = $1", PROBLEM_SELECT))
            .bind(problem_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Problem not found".to_string()))
    }

    pub async fn find_by_photo(&self, stored: &str) -> Result<Option<Problem>, AppError> {
        Ok(sqlx::query_as::<_, Problem>(&format!("{} WHERE p.photo = $1", PROBLEM_SELECT))
            .bind(stored)
            .fetch_optional(&self.db_pool)
            .await?)
    }

    /// Problem with its history and doctor responses, if `viewer` may see it.
    pub async fn problem_detail(&self, viewer: &User, role: UserRole, problem_id: i64) -> Result<ProblemDetail, AppError> {
        let problem = self.get_problem(problem_id).await?;
        if !can_view(viewer.id, role, &problem) {
            return Err(AppError::Authorization("You do not have access to this problem".to_string()));
        }

        let updates = sqlx::query_as::<_, ProblemUpdate>(
            r#"
            SELECT pu.id, pu.problem_id, pu.updated_by, u.name AS updated_by_name,
                   pu.new_status, pu.notes, pu.created_at
            FROM problem_updates pu
            LEFT JOIN users u ON u.id = pu.updated_by
            WHERE pu.problem_id = $1
            ORDER BY pu.created_at ASC, pu.id ASC
            "#,
        )
        .bind(problem_id)
        .fetch_all(&self.db_pool)
        .await?;

        let responses = sqlx::query_as::<_, MedicalResponse>(
            r#"
            SELECT mr.id, mr.problem_id, mr.doctor_id, u.name AS doctor_name, mr.response, mr.created_at
            FROM medical_responses mr
            LEFT JOIN users u ON u.id = mr.doctor_id
            WHERE mr.problem_id = $1
            ORDER BY mr.created_at ASC, mr.id ASC
            "#,
        )
        .bind(problem_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(ProblemDetail {
            problem,
            updates,
            responses,
        })
    }

    // Listings
    pub async fn list_problems(
        &self,
        filter: &ProblemFilter,
        order: ProblemOrder,
        pagination: Pagination,
    ) -> Result<Page<Problem>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM problems p JOIN users v ON v.id = p.villager_id WHERE 1=1",
        );
        push_problem_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.db_pool).await?;

        let mut query = QueryBuilder::<Postgres>::new(PROBLEM_SELECT);
        query.push(" WHERE 1=1");
        push_problem_filters(&mut query, filter);
        query
            .push(order.sql())
            .push(" LIMIT ")
            .push_bind(pagination.limit())
            .push(" OFFSET ")
            .push_bind(pagination.offset());
        let problems = query.build_query_as::<Problem>().fetch_all(&self.db_pool).await?;

        Ok(Page::new(problems, pagination, total))
    }

    pub async fn villager_problems(&self, villager_id: i64, pagination: Pagination) -> Result<Page<Problem>, AppError> {
        let filter = ProblemFilter {
            villager_id: Some(villager_id),
            ..Default::default()
        };
        self.list_problems(&filter, ProblemOrder::RecentlyUpdated, pagination).await
    }

    pub async fn unassigned_queue(&self, pagination: Pagination) -> Result<Page<Problem>, AppError> {
        let filter = ProblemFilter {
            unassigned_only: true,
            open_only: true,
            ..Default::default()
        };
        self.list_problems(&filter, ProblemOrder::QueueFifo, pagination).await
    }

    pub async fn assigned_to(&self, avms_id: i64, pagination: Pagination) -> Result<Page<Problem>, AppError> {
        let filter = ProblemFilter {
            assigned_to: Some(avms_id),
            ..Default::default()
        };
        self.list_problems(&filter, ProblemOrder::RecentlyUpdated, pagination).await
    }

    pub async fn escalated_to(&self, doctor_id: i64, pagination: Pagination) -> Result<Page<Problem>, AppError> {
        let filter = ProblemFilter {
            escalated_to: Some(doctor_id),
            ..Default::default()
        };
        self.list_problems(&filter, ProblemOrder::RecentlyUpdated, pagination).await
    }

    /// Every problem, unfiltered, for export.
    pub async fn export_all(&self) -> Result<Vec<Problem>, AppError> {
        Ok(sqlx::query_as::<_, Problem>(&format!("{} ORDER BY p.id ASC", PROBLEM_SELECT))
            .fetch_all(&self.db_pool)
            .await?)
    }

    pub async fn count_all(&self) -> Result<i64, AppError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM problems")
            .fetch_one(&self.db_pool)
            .await?)
    }

    // Workflow transitions
    /// Claims an unassigned problem. The conditional UPDATE settles concurrent
    /// claims: only one of them can match `assigned_to IS NULL`.
    pub async fn claim_problem(&self, avms: &User, problem_id: i64) -> Result<Problem, AppError> {
        let mut tx = self.db_pool.begin().await?;

        let claimed = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE problems
            SET assigned_to = $1,
                status = CASE WHEN status = 'escalated' THEN 'escalated' ELSE 'assigned' END,
                updated_at = NOW()
            WHERE id = $2
              AND assigned_to IS NULL
              AND status NOT IN ('resolved', 'completed', 'closed')
            RETURNING status
            "#,
        )
        .bind(avms.id)
        .bind(problem_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(new_status) = claimed else {
            tx.rollback().await?;
            return Err(self.claim_failure(problem_id).await?);
        };

        record_update(&mut tx, problem_id, avms.id, &new_status, Some(&format!("Claimed by {}", avms.name))).await?;
        tx.commit().await?;

        let problem = self.get_problem(problem_id).await?;
        self.notifications
            .notify(
                problem.villager_id,
                &NotificationDraft::new(
                    "Problem assigned",
                    format!("'{}' has been assigned to {}.", problem.title, avms.name),
                    NotificationType::Info,
                )
                .for_problem(problem_id),
            )
            .await;

        tracing::info!("Problem {} claimed by AVMS {}", problem_id, avms.id);
        Ok(problem)
    }

    async fn claim_failure(&self, problem_id: i64) -> Result<AppError, AppError> {
        let current = sqlx::query_as::<_, (Option<i64>, String)>(
            "SELECT assigned_to, status FROM problems WHERE id = $1",
        )
        .bind(problem_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(match current {
            None => AppError::NotFound("Problem not found".to_string()),
            Some((Some(_), _)) => AppError::Conflict("Problem is already assigned".to_string()),
            Some((None, _)) => AppError::Conflict("Problem is already closed".to_string()),
        })
    }

    pub async fn update_status(&self, avms: &User, problem_id: i64, form: &StatusForm) -> Result<Problem, AppError> {
        let status: ProblemStatus = form.status.parse()?;
        if !status.is_avms_update_target() {
            return Err(AppError::InvalidArgument(format!(
                "Status cannot be set to '{}' here",
                status
            )));
        }
        let notes = required_text(&form.notes, "Notes are required")?;

        let mut tx = self.db_pool.begin().await?;
        let (assigned_to, _) = lock_problem(&mut tx, problem_id).await?;
        if assigned_to != Some(avms.id) {
            return Err(AppError::Authorization("This problem is not assigned to you".to_string()));
        }

        sqlx::query(&format!(
            "UPDATE problems SET status = $2, resolved_at = {}, updated_at = NOW() WHERE id = $1",
            resolved_at_sql("$2")
        ))
        .bind(problem_id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        record_update(&mut tx, problem_id, avms.id, status.as_str(), Some(notes)).await?;
        tx.commit().await?;

        let problem = self.get_problem(problem_id).await?;
        let kind = if status == ProblemStatus::Resolved {
            NotificationType::Success
        } else {
            NotificationType::Info
        };
        self.notifications
            .notify(
                problem.villager_id,
                &NotificationDraft::new(
                    "Problem status updated",
                    format!("'{}' is now {}: {}", problem.title, status, notes),
                    kind,
                )
                .for_problem(problem_id),
            )
            .await;

        tracing::info!("Problem {} moved to {} by AVMS {}", problem_id, status, avms.id);
        Ok(problem)
    }

    pub async fn escalate(&self, avms: &User, problem_id: i64, form: &EscalateForm) -> Result<Problem, AppError> {
        let notes = required_text(&form.notes, "Notes are required when escalating")?;
        let doctor = self.users.get_active_with_role(form.doctor_id()?, UserRole::Doctor).await?;

        let mut tx = self.db_pool.begin().await?;
        let (assigned_to, status) = lock_problem(&mut tx, problem_id).await?;
        if assigned_to != Some(avms.id) {
            return Err(AppError::Authorization("This problem is not assigned to you".to_string()));
        }
        if status.is_terminal() {
            return Err(AppError::Conflict("Closed problems cannot be escalated".to_string()));
        }

        sqlx::query(
            r#"
            UPDATE problems
            SET escalated_to = $2, status = 'escalated', resolved_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(problem_id)
        .bind(doctor.id)
        .execute(&mut *tx)
        .await?;

        record_update(&mut tx, problem_id, avms.id, ProblemStatus::Escalated.as_str(), Some(notes)).await?;
        tx.commit().await?;

        let problem = self.get_problem(problem_id).await?;
        self.notifications
            .notify(
                doctor.id,
                &NotificationDraft::new(
                    "Problem escalated to you",
                    format!("{} escalated '{}': {}", avms.name, problem.title, notes),
                    NotificationType::Warning,
                )
                .for_problem(problem_id),
            )
            .await;
        self.notifications
            .notify(
                problem.villager_id,
                &NotificationDraft::new(
                    "Problem escalated",
                    format!("'{}' has been referred to Dr. {}.", problem.title, doctor.name),
                    NotificationType::Info,
                )
                .for_problem(problem_id),
            )
            .await;

        tracing::info!("Problem {} escalated to doctor {} by AVMS {}", problem_id, doctor.id, avms.id);
        Ok(problem)
    }

    pub async fn respond(&self, doctor: &User, problem_id: i64, form: &RespondForm) -> Result<Problem, AppError> {
        let response = required_text(&form.response, "A response is required")?;
        let mark_resolved = form.mark_resolved();

        let mut tx = self.db_pool.begin().await?;
        let escalated_to = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT escalated_to FROM problems WHERE id = $1 FOR UPDATE",
        )
        .bind(problem_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Problem not found".to_string()))?;
        if escalated_to != Some(doctor.id) {
            return Err(AppError::Authorization("This problem was not escalated to you".to_string()));
        }

        sqlx::query("INSERT INTO medical_responses (problem_id, doctor_id, response) VALUES ($1, $2, $3)")
            .bind(problem_id)
            .bind(doctor.id)
            .bind(response)
            .execute(&mut *tx)
            .await?;

        if mark_resolved {
            sqlx::query(
                r#"
                UPDATE problems
                SET status = 'resolved', resolved_at = COALESCE(resolved_at, NOW()), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(problem_id)
            .execute(&mut *tx)
            .await?;
            record_update(
                &mut tx,
                problem_id,
                doctor.id,
                ProblemStatus::Resolved.as_str(),
                Some(&format!("Resolved by doctor: {}", response)),
            )
            .await?;
        } else {
            sqlx::query("UPDATE problems SET updated_at = NOW() WHERE id = $1")
                .bind(problem_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let problem = self.get_problem(problem_id).await?;
        let draft = NotificationDraft::new(
            "Doctor responded",
            format!("Dr. {} responded to '{}'.", doctor.name, problem.title),
            if mark_resolved { NotificationType::Success } else { NotificationType::Info },
        )
        .for_problem(problem_id);
        self.notifications.notify(problem.villager_id, &draft).await;
        if let Some(avms_id) = problem.assigned_to {
            self.notifications.notify(avms_id, &draft).await;
        }

        tracing::info!("Doctor {} responded to problem {} (resolved: {})", doctor.id, problem_id, mark_resolved);
        Ok(problem)
    }

    /// Privileged edit of status, priority and both assignees. Writes exactly
    /// one history row describing everything that changed.
    pub async fn admin_update(&self, admin: &User, problem_id: i64, form: &AdminProblemForm) -> Result<Problem, AppError> {
        let requested_status = parse_optional::<ProblemStatus>(form.status.as_deref())?;
        let requested_priority = parse_optional::<Priority>(form.priority.as_deref())?;
        let assignee_change = AssigneeChange::parse(form.assigned_to.as_deref(), "assignee")?;
        let doctor_change = AssigneeChange::parse(form.escalated_to.as_deref(), "doctor")?;

        let new_assignee = match assignee_change {
            AssigneeChange::Set(id) => Some(self.users.get_active_with_role(id, UserRole::Avms).await?),
            _ => None,
        };
        let new_doctor = match doctor_change {
            AssigneeChange::Set(id) => Some(self.users.get_active_with_role(id, UserRole::Doctor).await?),
            _ => None,
        };

        let mut tx = self.db_pool.begin().await?;
        let current = sqlx::query_as::<_, Problem>(&format!("{} WHERE p.id = $1 FOR UPDATE OF p", PROBLEM_SELECT))
            .bind(problem_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound("Problem not found".to_string()))?;
        let current_status = current.status()?;

        let assigned_to = match assignee_change {
            AssigneeChange::Unchanged => current.assigned_to,
            AssigneeChange::Clear => None,
            AssigneeChange::Set(id) => Some(id),
        };
        let escalated_to = match doctor_change {
            AssigneeChange::Unchanged => current.escalated_to,
            AssigneeChange::Clear => None,
            AssigneeChange::Set(id) => Some(id),
        };
        let status = resolve_admin_status(current_status, requested_status, current.assigned_to, assigned_to)?;
        let priority = requested_priority.unwrap_or_else(|| current.priority());

        let mut changes = Vec::new();
        if status != current_status {
            changes.push(format!("status {} -> {}", current_status, status));
        }
        if priority != current.priority() {
            changes.push(format!("priority {} -> {}", current.priority(), priority));
        }
        if assigned_to != current.assigned_to {
            changes.push(format!(
                "assignee {} -> {}",
                current.assigned_to_name.as_deref().unwrap_or("none"),
                new_assignee.as_ref().map(|u| u.name.as_str()).unwrap_or("none")
            ));
        }
        if escalated_to != current.escalated_to {
            changes.push(format!(
                "doctor {} -> {}",
                current.escalated_to_name.as_deref().unwrap_or("none"),
                new_doctor.as_ref().map(|u| u.name.as_str()).unwrap_or("none")
            ));
        }
        if changes.is_empty() {
            return Err(AppError::Validation("No changes were submitted".to_string()));
        }

        sqlx::query(&format!(
            r#"
            UPDATE problems
            SET status = $2, priority = $3, assigned_to = $4, escalated_to = $5,
                resolved_at = {}, updated_at = NOW()
            WHERE id = $1
            "#,
            resolved_at_sql("$2")
        ))
        .bind(problem_id)
        .bind(status.as_str())
        .bind(priority.as_str())
        .bind(assigned_to)
        .bind(escalated_to)
        .execute(&mut *tx)
        .await?;

        let summary = changes.join("; ");
        let notes = match trimmed(&form.notes) {
            Some(extra) => format!("Admin update: {}. {}", summary, extra),
            None => format!("Admin update: {}", summary),
        };
        record_update(&mut tx, problem_id, admin.id, status.as_str(), Some(&notes)).await?;
        tx.commit().await?;

        self.audit
            .record(admin.id, "update_problem", "problem", Some(problem_id), summary.clone())
            .await;

        let problem = self.get_problem(problem_id).await?;
        if status != current_status {
            self.notifications
                .notify(
                    problem.villager_id,
                    &NotificationDraft::new(
                        "Problem status updated",
                        format!("'{}' is now {}.", problem.title, status),
                        NotificationType::Info,
                    )
                    .for_problem(problem_id),
                )
                .await;
        }
        if let Some(avms) = &new_assignee {
            self.notifications
                .notify(
                    avms.id,
                    &NotificationDraft::new(
                        "Problem assigned to you",
                        format!("An administrator assigned '{}' to you.", problem.title),
                        NotificationType::Info,
                    )
                    .for_problem(problem_id),
                )
                .await;
        }
        if let Some(doctor) = &new_doctor {
            self.notifications
                .notify(
                    doctor.id,
                    &NotificationDraft::new(
                        "Problem escalated to you",
                        format!("An administrator referred '{}' to you.", problem.title),
                        NotificationType::Warning,
                    )
                    .for_problem(problem_id),
                )
                .await;
        }

        tracing::info!("Problem {} updated by admin {}: {}", problem_id, admin.id, summary);
        Ok(problem)
    }

    // Dashboard counters
    pub async fn stats_for(&self, user_id: i64, role: UserRole) -> Result<BTreeMap<String, i64>, AppError> {
        let (labels, query): (&[&str], _) = match role {
            UserRole::Villager => (
                &["total", "pending", "in_progress", "resolved"][..],
                sqlx::query(
                    r#"
                    SELECT COUNT(*),
                           COUNT(*) FILTER (WHERE status = 'pending'),
                           COUNT(*) FILTER (WHERE status IN ('assigned', 'in_progress', 'escalated')),
                           COUNT(*) FILTER (WHERE status IN ('resolved', 'completed', 'closed'))
                    FROM problems WHERE villager_id = $1
                    "#,
                )
                .bind(user_id),
            ),
            UserRole::Avms => (
                &["unassigned", "my_open", "my_escalated", "my_resolved"][..],
                sqlx::query(
                    r#"
                    SELECT COUNT(*) FILTER (WHERE assigned_to IS NULL AND status NOT IN ('resolved', 'completed', 'closed')),
                           COUNT(*) FILTER (WHERE assigned_to = $1 AND status IN ('assigned', 'in_progress')),
                           COUNT(*) FILTER (WHERE assigned_to = $1 AND status = 'escalated'),
                           COUNT(*) FILTER (WHERE assigned_to = $1 AND status IN ('resolved', 'completed', 'closed'))
                    FROM problems
                    "#,
                )
                .bind(user_id),
            ),
            UserRole::Doctor => (
                &["escalated", "awaiting_response", "resolved", "responses"][..],
                sqlx::query(
                    r#"
                    SELECT COUNT(*) FILTER (WHERE escalated_to = $1),
                           COUNT(*) FILTER (WHERE escalated_to = $1 AND status = 'escalated'),
                           COUNT(*) FILTER (WHERE escalated_to = $1 AND status IN ('resolved', 'completed', 'closed')),
                           (SELECT COUNT(*) FROM medical_responses WHERE doctor_id = $1)
                    FROM problems
                    "#,
                )
                .bind(user_id),
            ),
            UserRole::Admin => (
                &["total", "pending", "active", "escalated", "resolved"][..],
                sqlx::query(
                    r#"
                    SELECT COUNT(*),
                           COUNT(*) FILTER (WHERE status = 'pending'),
                           COUNT(*) FILTER (WHERE status IN ('assigned', 'in_progress')),
                           COUNT(*) FILTER (WHERE status = 'escalated'),
                           COUNT(*) FILTER (WHERE status IN ('resolved', 'completed', 'closed'))
                    FROM problems
                    "#,
                ),
            ),
        };

        let row = query.fetch_one(&self.db_pool).await?;
        let mut stats = BTreeMap::new();
        for (index, label) in labels.iter().enumerate() {
            let value: i64 = row.try_get(index)?;
            stats.insert(label.to_string(), value);
        }
        Ok(stats)
    }

    /// Counts of items that appeared for `role` after `since`; polled by dashboards.
    pub async fn counts_since(&self, user_id: i64, role: UserRole, since: DateTime<Utc>) -> Result<BTreeMap<String, i64>, AppError> {
        let (label, query) = match role {
            UserRole::Avms => (
                "new_problems",
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM problems WHERE assigned_to IS NULL AND status = 'pending' AND created_at > $1",
                )
                .bind(since),
            ),
            UserRole::Doctor => (
                "new_escalations",
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM problems WHERE status = 'escalated' AND updated_at > $1 AND escalated_to = $2",
                )
                .bind(since)
                .bind(user_id),
            ),
            UserRole::Admin => (
                "new_problems",
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM problems WHERE created_at > $1").bind(since),
            ),
            UserRole::Villager => (
                "updated_problems",
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM problems WHERE updated_at > $1 AND villager_id = $2",
                )
                .bind(since)
                .bind(user_id),
            ),
        };

        let count = query.fetch_one(&self.db_pool).await?;
        let mut counts = BTreeMap::new();
        counts.insert(label.to_string(), count);
        Ok(counts)
    }
}

/// Locks the problem row for the rest of the transaction.
async fn lock_problem(conn: &mut PgConnection, problem_id: i64) -> Result<(Option<i64>, ProblemStatus), AppError> {
    let (assigned_to, status) = sqlx::query_as::<_, (Option<i64>, String)>(
        "SELECT assigned_to, status FROM problems WHERE id = $1 FOR UPDATE",
    )
    .bind(problem_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::NotFound("Problem not found".to_string()))?;

    let status = status
        .parse()
        .map_err(|_| AppError::Internal(format!("Problem {} has unknown status '{}'", problem_id, status)))?;
    Ok((assigned_to, status))
}

async fn record_update(
    conn: &mut PgConnection,
    problem_id: i64,
    updated_by: i64,
    new_status: &str,
    notes: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query("INSERT INTO problem_updates (problem_id, updated_by, new_status, notes) VALUES ($1, $2, $3, $4)")
        .bind(problem_id)
        .bind(updated_by)
        .bind(new_status)
        .bind(notes)
        .execute(conn)
        .await?;
    Ok(())
}

fn push_problem_filters(query: &mut QueryBuilder<'_, Postgres>, filter: &ProblemFilter) {
    if let Some(status) = filter.status {
        query.push(" AND p.status = ").push_bind(status.as_str().to_string());
    }
    if let Some(priority) = filter.priority {
        query.push(" AND p.priority = ").push_bind(priority.as_str().to_string());
    }
    if let Some(village) = &filter.village {
        query.push(" AND v.village ILIKE ").push_bind(escape_like(village));
    }
    if let Some(villager_id) = filter.villager_id {
        query.push(" AND p.villager_id = ").push_bind(villager_id);
    }
    if let Some(assigned_to) = filter.assigned_to {
        query.push(" AND p.assigned_to = ").push_bind(assigned_to);
    }
    if let Some(escalated_to) = filter.escalated_to {
        query.push(" AND p.escalated_to = ").push_bind(escalated_to);
    }
    if filter.unassigned_only {
        query.push(" AND p.assigned_to IS NULL");
    }
    if filter.open_only {
        query.push(" AND p.status NOT IN ('resolved', 'completed', 'closed')");
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", escape_like(search));
        query
            .push(" AND (p.title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR p.description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(from) = filter.created_from {
        query.push(" AND p.created_at >= ").push_bind(from);
    }
    if let Some(before) = filter.created_before {
        query.push(" AND p.created_at < ").push_bind(before);
    }
}

/// Who may open a problem's detail page.
pub fn can_view(viewer_id: i64, role: UserRole, problem: &Problem) -> bool {
    match role {
        UserRole::Admin => true,
        UserRole::Villager => problem.villager_id == viewer_id,
        UserRole::Avms => problem.assigned_to.map_or(true, |id| id == viewer_id),
        UserRole::Doctor => problem.escalated_to == Some(viewer_id),
    }
}

/// Status that an admin edit ends in. Assigning a pending problem moves it to
/// `assigned`; clearing the assignee of an assigned or in-progress problem
/// returns it to `pending`. A pending problem can never keep an assignee, and
/// an explicit `assigned`/`in_progress` needs one.
pub fn resolve_admin_status(
    current: ProblemStatus,
    requested: Option<ProblemStatus>,
    current_assignee: Option<i64>,
    new_assignee: Option<i64>,
) -> Result<ProblemStatus, AppError> {
    let status = match requested {
        Some(status) => status,
        None if current == ProblemStatus::Pending && new_assignee.is_some() => ProblemStatus::Assigned,
        None if matches!(current, ProblemStatus::Assigned | ProblemStatus::InProgress)
            && current_assignee.is_some()
            && new_assignee.is_none() =>
        {
            ProblemStatus::Pending
        }
        None => current,
    };

    if matches!(requested, Some(ProblemStatus::Assigned | ProblemStatus::InProgress)) && new_assignee.is_none() {
        return Err(AppError::InvalidArgument(format!(
            "A problem that is {} needs an assigned officer",
            status
        )));
    }

    if status == ProblemStatus::Pending && new_assignee.is_some() {
        return Err(AppError::InvalidArgument(
            "A pending problem cannot have an assignee".to_string(),
        ));
    }
    Ok(status)
}

fn parse_optional<T>(raw: Option<&str>) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr<Err = AppError>,
{
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some),
    }
}

fn required_text<'a>(value: &'a str, message: &str) -> Result<&'a str, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(message.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(villager_id: i64, assigned_to: Option<i64>, escalated_to: Option<i64>) -> Problem {
        Problem {
            id: 1,
            villager_id,
            title: "No clean water".to_string(),
            description: "The hand pump is broken".to_string(),
            photo: None,
            category: None,
            priority: "high".to_string(),
            status: "pending".to_string(),
            assigned_to,
            escalated_to,
            location: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            resolved_at: None,
            villager_name: Some("Asha".to_string()),
            village: Some("Rampur".to_string()),
            assigned_to_name: None,
            escalated_to_name: None,
        }
    }

    #[test]
    fn assignee_field_is_tri_state() {
        assert_eq!(AssigneeChange::parse(None, "assignee").unwrap(), AssigneeChange::Unchanged);
        assert_eq!(AssigneeChange::parse(Some(" "), "assignee").unwrap(), AssigneeChange::Unchanged);
        assert_eq!(AssigneeChange::parse(Some("None"), "assignee").unwrap(), AssigneeChange::Clear);
        assert_eq!(AssigneeChange::parse(Some("42"), "assignee").unwrap(), AssigneeChange::Set(42));
        assert!(matches!(
            AssigneeChange::parse(Some("ravi"), "assignee"),
            Err(AppError::InvalidArgument(_))
        ));
        assert!(AssigneeChange::parse(Some("-4"), "assignee").is_err());
    }

    #[test]
    fn assigning_a_pending_problem_moves_it_to_assigned() {
        let status = resolve_admin_status(ProblemStatus::Pending, None, None, Some(7)).unwrap();
        assert_eq!(status, ProblemStatus::Assigned);
    }

    #[test]
    fn pending_with_assignee_is_rejected() {
        let result = resolve_admin_status(
            ProblemStatus::Assigned,
            Some(ProblemStatus::Pending),
            Some(7),
            Some(7),
        );
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    }

    #[test]
    fn unassigning_returns_problem_to_the_queue() {
        let status = resolve_admin_status(ProblemStatus::Assigned, None, Some(7), None).unwrap();
        assert_eq!(status, ProblemStatus::Pending);

        let status = resolve_admin_status(ProblemStatus::InProgress, None, Some(7), None).unwrap();
        assert_eq!(status, ProblemStatus::Pending);

        // explicit status always wins
        let status = resolve_admin_status(ProblemStatus::Assigned, Some(ProblemStatus::Resolved), Some(7), None).unwrap();
        assert_eq!(status, ProblemStatus::Resolved);
    }

    #[test]
    fn working_statuses_need_an_assignee() {
        let result = resolve_admin_status(ProblemStatus::Assigned, Some(ProblemStatus::InProgress), Some(7), None);
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
        let result = resolve_admin_status(ProblemStatus::Pending, Some(ProblemStatus::Assigned), None, None);
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));

        let status = resolve_admin_status(ProblemStatus::Assigned, Some(ProblemStatus::InProgress), Some(7), Some(7)).unwrap();
        assert_eq!(status, ProblemStatus::InProgress);
    }

    #[test]
    fn invalid_enum_input_is_an_error_not_a_no_op() {
        assert!(matches!(parse_optional::<ProblemStatus>(Some("done")), Err(AppError::InvalidArgument(_))));
        assert!(matches!(parse_optional::<Priority>(Some("critical")), Err(AppError::InvalidArgument(_))));
        assert_eq!(parse_optional::<Priority>(Some("")).unwrap(), None);
        assert_eq!(parse_optional::<Priority>(Some("URGENT")).unwrap(), Some(Priority::Urgent));
    }

    #[test]
    fn visibility_by_role() {
        let unassigned = problem(10, None, None);
        assert!(can_view(10, UserRole::Villager, &unassigned));
        assert!(!can_view(11, UserRole::Villager, &unassigned));
        assert!(can_view(20, UserRole::Avms, &unassigned));
        assert!(!can_view(30, UserRole::Doctor, &unassigned));
        assert!(can_view(99, UserRole::Admin, &unassigned));

        let escalated = problem(10, Some(20), Some(30));
        assert!(can_view(20, UserRole::Avms, &escalated));
        assert!(!can_view(21, UserRole::Avms, &escalated));
        assert!(can_view(30, UserRole::Doctor, &escalated));
    }

    #[test]
    fn queue_orders_by_rank_then_age() {
        let sql = ProblemOrder::QueueFifo.sql();
        assert!(sql.contains(PRIORITY_RANK_SQL));
        assert!(sql.contains("p.created_at ASC"));
        assert!(ProblemOrder::RecentlyUpdated.sql().contains("p.updated_at DESC"));
    }

    #[test]
    fn resolved_at_tracks_status() {
        let sql = resolved_at_sql("$2");
        assert!(sql.contains("$2 = 'resolved' THEN COALESCE(resolved_at, NOW())"));
        assert!(sql.ends_with("ELSE NULL END"));
    }

    #[test]
    fn notes_must_not_be_blank() {
        assert!(required_text("   ", "Notes are required").is_err());
        assert_eq!(required_text(" needs antibiotics ", "x").unwrap(), "needs antibiotics");
    }
}
