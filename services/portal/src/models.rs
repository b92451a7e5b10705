use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

use village_health_common::{AppError, Page, Pagination, UserRole, UserStatus};
use village_health_database::{AdminLog, MedicalResponse, Notification, Problem, ProblemUpdate, User};

use crate::services::problems::ProblemFilter;
use crate::services::reports::DateRange;

// Forms
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct LoginForm {
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RegisterForm {
    #[validate(length(min = 1, max = 100, message = "Name is required"))]
    pub name: String,
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default, skip_serializing)]
    pub confirm_password: String,
    pub role: String,
    #[validate(length(max = 20, message = "Phone number is too long"))]
    pub phone: Option<String>,
    #[validate(length(max = 100, message = "Village name is too long"))]
    pub village: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ProfileForm {
    #[validate(length(min = 1, max = 100, message = "Name is required"))]
    pub name: String,
    #[validate(length(max = 20, message = "Phone number is too long"))]
    pub phone: Option<String>,
    #[validate(length(max = 100, message = "Village name is too long"))]
    pub village: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// A problem report as submitted by a villager (multipart form).
#[derive(Debug, Default)]
pub struct NewProblem {
    pub title: String,
    pub description: String,
    pub priority: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub photo: Option<UploadedPhoto>,
}

impl NewProblem {
    /// Text fields echoed back into the form after a failed submission.
    pub fn old_input(&self) -> serde_json::Value {
        serde_json::json!({
            "title": self.title,
            "description": self.description,
            "priority": self.priority,
            "category": self.category,
            "location": self.location,
        })
    }
}

#[derive(Debug)]
pub struct UploadedPhoto {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusForm {
    pub status: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EscalateForm {
    #[serde(default)]
    pub doctor_id: String,
    #[serde(default)]
    pub notes: String,
}

impl EscalateForm {
    pub fn doctor_id(&self) -> Result<i64, AppError> {
        self.doctor_id
            .trim()
            .parse()
            .map_err(|_| AppError::Validation("Choose a doctor to escalate to".to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RespondForm {
    #[serde(default)]
    pub response: String,
    pub mark_resolved: Option<String>,
}

impl RespondForm {
    /// Checkbox semantics: present and not explicitly false.
    pub fn mark_resolved(&self) -> bool {
        match self.mark_resolved.as_deref().map(str::trim) {
            None | Some("") => false,
            Some(value) => !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AdminProblemForm {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assigned_to: Option<String>,
    pub escalated_to: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RoleForm {
    pub role: String,
}

/// `user_ids` (or `user_ids[]`) from a repeated checkbox field.
pub fn collect_user_ids(pairs: &[(String, String)]) -> Result<Vec<i64>, AppError> {
    let mut ids = Vec::new();
    for (key, value) in pairs {
        if key != "user_ids" && key != "user_ids[]" {
            continue;
        }
        let id = value
            .trim()
            .parse::<i64>()
            .map_err(|_| AppError::InvalidArgument(format!("Invalid user id '{}'", value)))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Runs `validator` rules and folds failures into one readable message.
pub fn validate_form<T: Validate>(form: &T) -> Result<(), AppError> {
    form.validate().map_err(|errors| AppError::Validation(validation_message(&errors)))
}

fn validation_message(errors: &ValidationErrors) -> String {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by_key(|(field, _)| *field);

    let messages: Vec<String> = fields
        .into_iter()
        .filter_map(|(field, errs)| {
            errs.first().map(|err| match &err.message {
                Some(message) => message.to_string(),
                None => format!("{} is invalid", field),
            })
        })
        .collect();
    messages.join(". ")
}

// Query strings
fn parse_number(raw: &Option<String>, field: &str) -> Result<Option<i64>, AppError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| AppError::InvalidArgument(format!("{} must be a whole number", field))),
    }
}

pub fn parse_date(raw: &Option<String>, field: &str) -> Result<Option<NaiveDate>, AppError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .filter(|date| (1..=9999).contains(&date.year()))
            .map(Some)
            .ok_or_else(|| AppError::InvalidArgument(format!("{} must be a date (YYYY-MM-DD)", field))),
    }
}

fn non_empty(raw: &Option<String>) -> Option<String> {
    raw.as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PageQuery {
    pub page: Option<String>,
    pub per_page: Option<String>,
}

impl PageQuery {
    pub fn pagination(&self) -> Result<Pagination, AppError> {
        Pagination::new(parse_number(&self.page, "page")?, parse_number(&self.per_page, "per_page")?)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProblemQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub village: Option<String>,
    pub assigned_to: Option<String>,
    pub q: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
}

impl ProblemQuery {
    pub fn pagination(&self) -> Result<Pagination, AppError> {
        Pagination::new(parse_number(&self.page, "page")?, parse_number(&self.per_page, "per_page")?)
    }

    pub fn to_filter(&self) -> Result<ProblemFilter, AppError> {
        let start = parse_date(&self.start_date, "start_date")?;
        let end = parse_date(&self.end_date, "end_date")?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(AppError::Validation("Start date must not be after end date".to_string()));
            }
        }

        Ok(ProblemFilter {
            status: non_empty(&self.status).map(|s| s.parse()).transpose()?,
            priority: non_empty(&self.priority).map(|s| s.parse()).transpose()?,
            village: non_empty(&self.village),
            assigned_to: parse_number(&self.assigned_to, "assigned_to")?,
            search: non_empty(&self.q),
            created_from: start.map(|d| DateRange { start_date: d, end_date: d }.starts_at()),
            created_before: end.map(|d| DateRange { start_date: d, end_date: d }.ends_before()),
            ..Default::default()
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct UserFilter {
    pub role: Option<UserRole>,
    pub status: Option<UserStatus>,
    pub search: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UserQuery {
    pub role: Option<String>,
    pub status: Option<String>,
    pub q: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
}

impl UserQuery {
    pub fn pagination(&self) -> Result<Pagination, AppError> {
        Pagination::new(parse_number(&self.page, "page")?, parse_number(&self.per_page, "per_page")?)
    }

    pub fn to_filter(&self) -> Result<UserFilter, AppError> {
        Ok(UserFilter {
            role: non_empty(&self.role).map(|s| s.parse()).transpose()?,
            status: non_empty(&self.status).map(|s| s.parse()).transpose()?,
            search: non_empty(&self.q),
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReportQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl ReportQuery {
    pub fn range(&self, today: NaiveDate) -> Result<DateRange, AppError> {
        DateRange::new(
            parse_date(&self.start_date, "start_date")?,
            parse_date(&self.end_date, "end_date")?,
            today,
        )
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SinceQuery {
    pub since: Option<String>,
}

impl SinceQuery {
    pub const DEFAULT_WINDOW_SECONDS: i64 = 60;

    /// RFC 3339 timestamp; defaults to one polling window before `now`.
    pub fn since(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        match self.since.as_deref().map(str::trim) {
            None | Some("") => Ok(now - Duration::seconds(Self::DEFAULT_WINDOW_SECONDS)),
            Some(value) => DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| AppError::InvalidArgument("since must be an RFC 3339 timestamp".to_string())),
        }
    }
}

// View models
#[derive(Debug, Serialize)]
pub struct ProblemDetail {
    pub problem: Problem,
    pub updates: Vec<ProblemUpdate>,
    pub responses: Vec<MedicalResponse>,
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub site_name: String,
    pub user: User,
    pub stats: BTreeMap<String, i64>,
    pub unread_notifications: i64,
    pub problems: Vec<Problem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approvals: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users_by_role: Option<BTreeMap<String, i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_activity: Option<Vec<AdminLog>>,
}

#[derive(Debug, Serialize)]
pub struct ProblemListView {
    pub problems: Page<Problem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctors: Option<Vec<User>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub officers: Option<Vec<User>>,
}

#[derive(Debug, Serialize)]
pub struct NotificationsView {
    pub notifications: Page<Notification>,
    pub unread: i64,
}

/// Data for the public login and registration forms. Built without touching
/// the database so the forms stay reachable when it is down.
#[derive(Debug, Serialize)]
pub struct FormView {
    pub form: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<&'static str>>,
}

#[derive(Debug, Serialize)]
pub struct ProfileView {
    pub user: User,
    pub password_min_length: usize,
}
