use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use chrono::{DateTime, Utc};
use village_health_common::*;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub role: String,
    pub status: Option<String>,
    pub phone: Option<String>,
    pub village: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn role(&self) -> Result<UserRole, AppError> {
        self.role
            .parse()
            .map_err(|_| AppError::Internal(format!("User {} has unknown role '{}'", self.id, self.role)))
    }

    pub fn status(&self) -> UserStatus {
        UserStatus::from_db(self.status.as_deref())
    }

    pub fn is_active(&self) -> bool {
        self.status() == UserStatus::Active
    }
}

/// A problem row joined with the display names of the people involved.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Problem {
    pub id: i64,
    pub villager_id: i64,
    pub title: String,
    pub description: String,
    pub photo: Option<String>,
    pub category: Option<String>,
    pub priority: String,
    pub status: String,
    pub assigned_to: Option<i64>,
    pub escalated_to: Option<i64>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub villager_name: Option<String>,
    pub village: Option<String>,
    pub assigned_to_name: Option<String>,
    pub escalated_to_name: Option<String>,
}

impl Problem {
    pub fn status(&self) -> Result<ProblemStatus, AppError> {
        self.status
            .parse()
            .map_err(|_| AppError::Internal(format!("Problem {} has unknown status '{}'", self.id, self.status)))
    }

    pub fn priority(&self) -> Priority {
        self.priority.parse().unwrap_or(Priority::Low)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProblemUpdate {
    pub id: i64,
    pub problem_id: i64,
    pub updated_by: i64,
    pub updated_by_name: Option<String>,
    pub new_status: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MedicalResponse {
    pub id: i64,
    pub problem_id: i64,
    pub doctor_id: i64,
    pub doctor_name: Option<String>,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: Option<i64>,
    pub problem_id: Option<i64>,
    pub title: String,
    pub message: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub notification_type: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AdminLog {
    pub id: i64,
    pub admin_id: i64,
    pub admin_name: Option<String>,
    pub action: String,
    pub target_type: String,
    pub target_id: Option<i64>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemSetting {
    pub setting_key: String,
    pub setting_value: String,
    pub updated_by: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(status: Option<&str>) -> User {
        User {
            id: 1,
            name: "Asha".to_string(),
            email: "asha@example.org".to_string(),
            password: "$2b$12$hash".to_string(),
            role: "villager".to_string(),
            status: status.map(str::to_string),
            phone: None,
            village: Some("Rampur".to_string()),
            registered_at: Utc::now(),
            last_login: None,
        }
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let json = serde_json::to_value(user(Some("active"))).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["village"], "Rampur");
    }

    #[test]
    fn null_status_reads_as_pending() {
        assert_eq!(user(None).status(), UserStatus::Pending);
        assert_eq!(user(Some("")).status(), UserStatus::Pending);
        assert!(user(Some("active")).is_active());
    }
}
