use axum::{
    extract::{Extension, Path, Query, State},
    Form,
};

use village_health_common::UserRole;
use village_health_database::User;

use crate::handlers::{base_dashboard, dashboard_window};
use crate::models::{Dashboard, EscalateForm, PageQuery, ProblemListView, StatusForm};
use crate::services::{AppState, ProblemService, UserService};
use crate::session::{AuthContext, CurrentFlash, FlashRedirect, OrRedirect, PageError, View};

pub async fn dashboard(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    flash: CurrentFlash,
) -> Result<View<Dashboard>, PageError> {
    let queue = ProblemService::new(&state).unassigned_queue(dashboard_window()?).await?;
    let dashboard = base_dashboard(&state, &auth, queue.items).await?;
    Ok(View::new(flash, dashboard))
}

/// Unassigned problems, most urgent and oldest first.
pub async fn queue(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
    flash: CurrentFlash,
) -> Result<View<ProblemListView>, PageError> {
    let pagination = query.pagination().or_redirect("/avms")?;
    let problems = ProblemService::new(&state).unassigned_queue(pagination).await?;
    Ok(View::new(flash, ProblemListView { problems, doctors: None, officers: None }))
}

pub async fn my_problems(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<PageQuery>,
    flash: CurrentFlash,
) -> Result<View<ProblemListView>, PageError> {
    let pagination = query.pagination().or_redirect("/avms")?;
    let problems = ProblemService::new(&state).assigned_to(auth.user.id, pagination).await?;
    let doctors = UserService::new(&state).list_active_by_role(UserRole::Doctor).await?;
    Ok(View::new(flash, ProblemListView { problems, doctors: Some(doctors), officers: None }))
}

pub async fn doctors(
    State(state): State<AppState>,
    flash: CurrentFlash,
) -> Result<View<Vec<User>>, PageError> {
    let doctors = UserService::new(&state).list_active_by_role(UserRole::Doctor).await?;
    Ok(View::new(flash, doctors))
}

pub async fn claim(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(problem_id): Path<i64>,
) -> Result<FlashRedirect, PageError> {
    let problem = ProblemService::new(&state)
        .claim_problem(&auth.user, problem_id)
        .await
        .or_redirect("/avms/queue")?;
    Ok(FlashRedirect::success(
        "/avms/problems",
        format!("You are now handling '{}'", problem.title),
    ))
}

pub async fn update_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(problem_id): Path<i64>,
    Form(form): Form<StatusForm>,
) -> Result<FlashRedirect, PageError> {
    let problem = ProblemService::new(&state)
        .update_status(&auth.user, problem_id, &form)
        .await
        .or_redirect("/avms/problems")?;
    Ok(FlashRedirect::success(
        "/avms/problems",
        format!("'{}' is now {}", problem.title, problem.status),
    ))
}

pub async fn escalate(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(problem_id): Path<i64>,
    Form(form): Form<EscalateForm>,
) -> Result<FlashRedirect, PageError> {
    let problem = ProblemService::new(&state)
        .escalate(&auth.user, problem_id, &form)
        .await
        .or_redirect("/avms/problems")?;
    Ok(FlashRedirect::success(
        "/avms/problems",
        format!(
            "'{}' escalated to Dr. {}",
            problem.title,
            problem.escalated_to_name.as_deref().unwrap_or("unknown")
        ),
    ))
}
