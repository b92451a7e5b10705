use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Villager,
    Avms,
    Doctor,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Villager => "villager",
            UserRole::Avms => "avms",
            UserRole::Doctor => "doctor",
            UserRole::Admin => "admin",
        }
    }

    /// Roles that may be chosen on the public registration form.
    pub fn is_self_registrable(&self) -> bool {
        !matches!(self, UserRole::Admin)
    }

    /// Status a freshly registered account starts in.
    pub fn initial_status(&self) -> UserStatus {
        match self {
            UserRole::Villager => UserStatus::Active,
            _ => UserStatus::Pending,
        }
    }

    pub fn dashboard_path(&self) -> &'static str {
        match self {
            UserRole::Villager => "/villager",
            UserRole::Avms => "/avms",
            UserRole::Doctor => "/doctor",
            UserRole::Admin => "/admin",
        }
    }
}

impl FromStr for UserRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "villager" => Ok(UserRole::Villager),
            // ANMS is the older name of the same officer role
            "avms" | "anms" => Ok(UserRole::Avms),
            "doctor" => Ok(UserRole::Doctor),
            "admin" => Ok(UserRole::Admin),
            other => Err(AppError::InvalidArgument(format!("Unknown role '{}'", other))),
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Pending,
    Active,
    Inactive,
    Rejected,
    Deleted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Pending => "pending",
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Rejected => "rejected",
            UserStatus::Deleted => "deleted",
        }
    }

    /// Reads the nullable `users.status` column. Legacy rows carry NULL or an
    /// empty string for accounts that were never reviewed; both mean pending.
    pub fn from_db(raw: Option<&str>) -> UserStatus {
        match raw.map(str::trim) {
            None | Some("") => UserStatus::Pending,
            Some(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!("Unrecognised user status '{}', treating as inactive", value);
                UserStatus::Inactive
            }),
        }
    }
}

impl FromStr for UserStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(UserStatus::Pending),
            "active" => Ok(UserStatus::Active),
            "inactive" => Ok(UserStatus::Inactive),
            "rejected" => Ok(UserStatus::Rejected),
            "deleted" => Ok(UserStatus::Deleted),
            other => Err(AppError::InvalidArgument(format!("Unknown user status '{}'", other))),
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProblemStatus {
    Pending,
    Assigned,
    InProgress,
    Escalated,
    Resolved,
    Completed,
    Closed,
}

impl ProblemStatus {
    pub const ALL: [ProblemStatus; 7] = [
        ProblemStatus::Pending,
        ProblemStatus::Assigned,
        ProblemStatus::InProgress,
        ProblemStatus::Escalated,
        ProblemStatus::Resolved,
        ProblemStatus::Completed,
        ProblemStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemStatus::Pending => "pending",
            ProblemStatus::Assigned => "assigned",
            ProblemStatus::InProgress => "in_progress",
            ProblemStatus::Escalated => "escalated",
            ProblemStatus::Resolved => "resolved",
            ProblemStatus::Completed => "completed",
            ProblemStatus::Closed => "closed",
        }
    }

    /// No further work is expected on the problem.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProblemStatus::Resolved | ProblemStatus::Completed | ProblemStatus::Closed
        )
    }

    /// Statuses an assigned AVMS officer may move their own problem to.
    pub fn is_avms_update_target(&self) -> bool {
        matches!(
            self,
            ProblemStatus::InProgress | ProblemStatus::Resolved | ProblemStatus::Closed
        )
    }
}

impl FromStr for ProblemStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ProblemStatus::Pending),
            "assigned" => Ok(ProblemStatus::Assigned),
            "in_progress" | "in-progress" => Ok(ProblemStatus::InProgress),
            "escalated" => Ok(ProblemStatus::Escalated),
            "resolved" => Ok(ProblemStatus::Resolved),
            "completed" => Ok(ProblemStatus::Completed),
            "closed" => Ok(ProblemStatus::Closed),
            other => Err(AppError::InvalidArgument(format!("Unknown problem status '{}'", other))),
        }
    }
}

impl fmt::Display for ProblemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Listing order: urgent first. Anything unknown sorts with low.
    pub fn rank(&self) -> i32 {
        match self {
            Priority::Urgent => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(AppError::InvalidArgument(format!("Unknown priority '{}'", other))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQL expression ordering problems by priority rank; mirrors `Priority::rank`.
pub const PRIORITY_RANK_SQL: &str =
    "CASE p.priority WHEN 'urgent' THEN 1 WHEN 'high' THEN 2 WHEN 'medium' THEN 3 ELSE 4 END";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Info,
    Warning,
    Error,
    Success,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Info => "info",
            NotificationType::Warning => "warning",
            NotificationType::Error => "error",
            NotificationType::Success => "success",
        }
    }
}

/// Validated pagination window. Values are bound as query parameters and never
/// interpolated into SQL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Pagination {
    pub const DEFAULT_PER_PAGE: u32 = 20;
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(page: Option<i64>, per_page: Option<i64>) -> Result<Self, AppError> {
        let page = page.unwrap_or(1);
        let per_page = per_page.unwrap_or(Self::DEFAULT_PER_PAGE as i64);

        if page < 1 {
            return Err(AppError::InvalidArgument("page must be a positive integer".to_string()));
        }
        if per_page < 1 || per_page > Self::MAX_PER_PAGE as i64 {
            return Err(AppError::InvalidArgument(format!(
                "per_page must be between 1 and {}",
                Self::MAX_PER_PAGE
            )));
        }
        if page > u32::MAX as i64 {
            return Err(AppError::InvalidArgument("page is out of range".to_string()));
        }

        Ok(Self {
            page: page as u32,
            per_page: per_page as u32,
        })
    }

    pub fn limit(&self) -> i64 {
        self.per_page as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.per_page as i64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: Self::DEFAULT_PER_PAGE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, pagination: Pagination, total: i64) -> Self {
        let per_page = pagination.per_page as i64;
        Self {
            items,
            page: pagination.page,
            per_page: pagination.per_page,
            total,
            total_pages: (total + per_page - 1) / per_page,
        }
    }
}

// Common response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_pending_statuses_collapse() {
        assert_eq!(UserStatus::from_db(None), UserStatus::Pending);
        assert_eq!(UserStatus::from_db(Some("")), UserStatus::Pending);
        assert_eq!(UserStatus::from_db(Some("  ")), UserStatus::Pending);
        assert_eq!(UserStatus::from_db(Some("pending")), UserStatus::Pending);
        assert_eq!(UserStatus::from_db(Some("active")), UserStatus::Active);
        assert_eq!(UserStatus::from_db(Some("banished")), UserStatus::Inactive);
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        assert!(matches!("done".parse::<ProblemStatus>(), Err(AppError::InvalidArgument(_))));
        assert!(matches!("critical".parse::<Priority>(), Err(AppError::InvalidArgument(_))));
        assert!(matches!("nurse".parse::<UserRole>(), Err(AppError::InvalidArgument(_))));
    }

    #[test]
    fn anms_is_an_alias_for_avms() {
        assert_eq!("ANMS".parse::<UserRole>().unwrap(), UserRole::Avms);
        assert_eq!("avms".parse::<UserRole>().unwrap(), UserRole::Avms);
    }

    #[test]
    fn problem_status_round_trips_through_text() {
        for status in ProblemStatus::ALL {
            assert_eq!(status.as_str().parse::<ProblemStatus>().unwrap(), status);
        }
        assert_eq!("in-progress".parse::<ProblemStatus>().unwrap(), ProblemStatus::InProgress);
    }

    #[test]
    fn priority_rank_orders_urgent_first() {
        let mut priorities = vec![Priority::Low, Priority::Urgent, Priority::Medium, Priority::High];
        priorities.sort_by_key(Priority::rank);
        assert_eq!(
            priorities,
            vec![Priority::Urgent, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn only_villagers_start_active() {
        assert_eq!(UserRole::Villager.initial_status(), UserStatus::Active);
        assert_eq!(UserRole::Avms.initial_status(), UserStatus::Pending);
        assert_eq!(UserRole::Doctor.initial_status(), UserStatus::Pending);
        assert!(!UserRole::Admin.is_self_registrable());
    }

    #[test]
    fn avms_can_only_move_to_work_statuses() {
        assert!(ProblemStatus::InProgress.is_avms_update_target());
        assert!(ProblemStatus::Resolved.is_avms_update_target());
        assert!(ProblemStatus::Closed.is_avms_update_target());
        assert!(!ProblemStatus::Escalated.is_avms_update_target());
        assert!(!ProblemStatus::Pending.is_avms_update_target());
    }

    #[test]
    fn pagination_rejects_non_positive_values() {
        assert!(Pagination::new(Some(0), None).is_err());
        assert!(Pagination::new(Some(-3), None).is_err());
        assert!(Pagination::new(None, Some(0)).is_err());
        assert!(Pagination::new(None, Some(101)).is_err());

        let p = Pagination::new(Some(3), Some(25)).unwrap();
        assert_eq!(p.limit(), 25);
        assert_eq!(p.offset(), 50);
        assert_eq!(Pagination::new(None, None).unwrap(), Pagination::default());
    }

    #[test]
    fn page_counts_partial_pages() {
        let page: Page<u8> = Page::new(vec![], Pagination::default(), 41);
        assert_eq!(page.total_pages, 3);
        let empty: Page<u8> = Page::new(vec![], Pagination::default(), 0);
        assert_eq!(empty.total_pages, 0);
    }
}
