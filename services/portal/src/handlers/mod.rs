pub mod admin;
pub mod api;
pub mod auth;
pub mod avms;
pub mod doctor;
pub mod notifications;
pub mod problems;
pub mod reports;
pub mod villager;

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json, Redirect, Response},
};

use village_health_common::{ApiResponse, AppError, Pagination};
use village_health_database::Problem;

use crate::models::Dashboard;
use crate::services::{AppState, NotificationService, ProblemService, SettingsService};
use crate::session::{current_session, AuthContext, PageError};

/// Problems shown on a dashboard card.
const DASHBOARD_PROBLEMS: i64 = 5;

pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("Village Health Connect portal is healthy".to_string()))
}

/// Sends signed-in users to their role's dashboard and everyone else to login.
pub async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match current_session(&state, &headers).await {
        Ok(Some(auth)) => Redirect::to(auth.role.dashboard_path()).into_response(),
        Ok(None) => Redirect::to("/login").into_response(),
        Err(err) => PageError::new(err, "/login").into_response(),
    }
}

pub(crate) fn dashboard_window() -> Result<Pagination, AppError> {
    Pagination::new(Some(1), Some(DASHBOARD_PROBLEMS))
}

/// Fields every dashboard shares; role handlers fill in the rest.
pub(crate) async fn base_dashboard(
    state: &AppState,
    auth: &AuthContext,
    problems: Vec<Problem>,
) -> Result<Dashboard, AppError> {
    let stats = ProblemService::new(state).stats_for(auth.user.id, auth.role).await?;
    let unread_notifications = NotificationService::new(state).unread_count(auth.user.id).await?;
    let site_name = SettingsService::new(state).site_name().await?;

    Ok(Dashboard {
        site_name,
        user: auth.user.clone(),
        stats,
        unread_notifications,
        problems,
        pending_approvals: None,
        users_by_role: None,
        recent_activity: None,
    })
}
