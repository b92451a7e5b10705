use axum::{
    extract::{Extension, Path, State},
    http::header,
    response::{IntoResponse, Response},
};

use village_health_common::AppError;

use crate::models::ProblemDetail;
use crate::services::problems::can_view;
use crate::services::uploads::{content_type_for, UPLOAD_URL_PREFIX};
use crate::services::{AppState, PhotoStorage, ProblemService};
use crate::session::{AuthContext, CurrentFlash, OrRedirect, PageError, View};

/// Full history of one problem for anyone allowed to see it.
pub async fn detail(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(problem_id): Path<i64>,
    flash: CurrentFlash,
) -> Result<View<ProblemDetail>, PageError> {
    let detail = ProblemService::new(&state)
        .problem_detail(&auth.user, auth.role, problem_id)
        .await
        .or_redirect(auth.role.dashboard_path())?;
    Ok(View::new(flash, detail))
}

/// Serves an uploaded photo to users who can view the problem it belongs to.
pub async fn photo(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let stored = format!("{}{}", UPLOAD_URL_PREFIX, name);
    let problem = ProblemService::new(&state)
        .find_by_photo(&stored)
        .await?
        .ok_or_else(|| AppError::NotFound("Photo not found".to_string()))?;

    if !can_view(auth.user.id, auth.role, &problem) {
        // Same answer as a missing photo
        return Err(AppError::NotFound("Photo not found".to_string()));
    }

    let bytes = PhotoStorage::new(&state).read(&name).await?;
    Ok(([(header::CONTENT_TYPE, content_type_for(&name))], bytes).into_response())
}
