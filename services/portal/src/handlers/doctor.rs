use axum::{
    extract::{Extension, Path, Query, State},
    Form,
};

use crate::handlers::{base_dashboard, dashboard_window};
use crate::models::{Dashboard, PageQuery, ProblemListView, RespondForm};
use crate::services::{AppState, ProblemService};
use crate::session::{AuthContext, CurrentFlash, FlashRedirect, OrRedirect, PageError, View};

pub async fn dashboard(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    flash: CurrentFlash,
) -> Result<View<Dashboard>, PageError> {
    let escalated = ProblemService::new(&state)
        .escalated_to(auth.user.id, dashboard_window()?)
        .await?;
    let dashboard = base_dashboard(&state, &auth, escalated.items).await?;
    Ok(View::new(flash, dashboard))
}

pub async fn problems(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<PageQuery>,
    flash: CurrentFlash,
) -> Result<View<ProblemListView>, PageError> {
    let pagination = query.pagination().or_redirect("/doctor")?;
    let problems = ProblemService::new(&state).escalated_to(auth.user.id, pagination).await?;
    Ok(View::new(flash, ProblemListView { problems, doctors: None, officers: None }))
}

pub async fn respond(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(problem_id): Path<i64>,
    Form(form): Form<RespondForm>,
) -> Result<FlashRedirect, PageError> {
    let problem = ProblemService::new(&state)
        .respond(&auth.user, problem_id, &form)
        .await
        .or_redirect("/doctor/problems")?;

    let message = if form.mark_resolved() {
        format!("Response sent and '{}' marked resolved", problem.title)
    } else {
        format!("Response sent for '{}'", problem.title)
    };
    Ok(FlashRedirect::success("/doctor/problems", message))
}
