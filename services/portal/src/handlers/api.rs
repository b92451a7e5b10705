use axum::{
    extract::{Extension, Query, State},
    response::Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use village_health_common::{AppError, UserRole};

use crate::models::SinceQuery;
use crate::services::{AppState, ProblemService, UserService};
use crate::session::AuthContext;

/// Dashboard counters for the signed-in user's role.
pub async fn stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Value>, AppError> {
    let mut stats = ProblemService::new(&state).stats_for(auth.user.id, auth.role).await?;
    if auth.role == UserRole::Admin {
        let pending = UserService::new(&state).pending_count().await?;
        stats.insert("pending_approvals".to_string(), pending);
    }
    Ok(Json(json!({ "success": true, "stats": stats })))
}

/// Activity since `since` (RFC 3339) for polling clients.
pub async fn new_problems(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Value>, AppError> {
    let now = Utc::now();
    let since = query.since(now)?;
    let counts = ProblemService::new(&state)
        .counts_since(auth.user.id, auth.role, since)
        .await?;
    Ok(Json(json!({
        "success": true,
        "counts": counts,
        "checked_at": now.to_rfc3339(),
    })))
}
