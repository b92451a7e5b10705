use std::collections::BTreeMap;

use axum::{
    extract::{Extension, Path, Query, State},
    Form,
};

use village_health_common::{Page, Pagination, UserRole, UserStatus};
use village_health_database::{AdminLog, User};

use crate::handlers::{base_dashboard, dashboard_window};
use crate::models::{
    collect_user_ids, AdminProblemForm, Dashboard, PageQuery, ProblemListView, ProblemQuery, RoleForm, UserQuery,
};
use crate::services::problems::{ProblemFilter, ProblemOrder};
use crate::services::{AppState, AuditService, ProblemService, SettingsService, UserService};
use crate::session::{AuthContext, CurrentFlash, FlashRedirect, OrRedirect, PageError, View};

const RECENT_ACTIVITY: i64 = 10;

pub async fn dashboard(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    flash: CurrentFlash,
) -> Result<View<Dashboard>, PageError> {
    let users = UserService::new(&state);
    let recent = ProblemService::new(&state)
        .list_problems(&ProblemFilter::default(), ProblemOrder::RecentlyUpdated, dashboard_window()?)
        .await?;

    let mut dashboard = base_dashboard(&state, &auth, recent.items).await?;
    dashboard.pending_approvals = Some(users.pending_count().await?);
    dashboard.users_by_role = Some(users.count_by_role().await?.into_iter().collect());
    dashboard.recent_activity = Some(
        AuditService::new(&state)
            .list(Pagination::new(Some(1), Some(RECENT_ACTIVITY))?)
            .await?
            .items,
    );
    Ok(View::new(flash, dashboard))
}

// Approvals
pub async fn approvals(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
    flash: CurrentFlash,
) -> Result<View<Page<User>>, PageError> {
    let pagination = query.pagination().or_redirect("/admin")?;
    let pending = UserService::new(&state).pending_approvals(pagination).await?;
    Ok(View::new(flash, pending))
}

pub async fn approve(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<i64>,
) -> Result<FlashRedirect, PageError> {
    let user = UserService::new(&state)
        .approve_user(auth.user.id, user_id)
        .await
        .or_redirect("/admin/approvals")?;
    Ok(FlashRedirect::success("/admin/approvals", format!("{} has been approved", user.name)))
}

pub async fn bulk_approve(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> Result<FlashRedirect, PageError> {
    let user_ids = collect_user_ids(&pairs).or_redirect("/admin/approvals")?;
    let approved = UserService::new(&state)
        .bulk_approve(auth.user.id, &user_ids)
        .await
        .or_redirect("/admin/approvals")?;
    Ok(FlashRedirect::success("/admin/approvals", format!("{} users approved", approved.len())))
}

/// Rejects but keeps the account row with status `rejected`.
pub async fn reject(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<i64>,
) -> Result<FlashRedirect, PageError> {
    let user = UserService::new(&state)
        .reject_and_retain(auth.user.id, user_id)
        .await
        .or_redirect("/admin/approvals")?;
    Ok(FlashRedirect::success("/admin/approvals", format!("{} has been rejected", user.name)))
}

/// Rejects and deletes the registration.
pub async fn purge(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<i64>,
) -> Result<FlashRedirect, PageError> {
    let user = UserService::new(&state)
        .reject_and_purge(auth.user.id, user_id)
        .await
        .or_redirect("/admin/approvals")?;
    Ok(FlashRedirect::success(
        "/admin/approvals",
        format!("{}'s registration has been rejected and removed", user.name),
    ))
}

// User management
pub async fn users(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    flash: CurrentFlash,
) -> Result<View<Page<User>>, PageError> {
    let filter = query.to_filter().or_redirect("/admin")?;
    let pagination = query.pagination().or_redirect("/admin")?;
    let users = UserService::new(&state).list_users(&filter, pagination).await?;
    Ok(View::new(flash, users))
}

async fn set_user_status(
    state: &AppState,
    auth: &AuthContext,
    user_id: i64,
    status: UserStatus,
) -> Result<FlashRedirect, PageError> {
    let user = UserService::new(state)
        .set_status(auth.user.id, user_id, status)
        .await
        .or_redirect("/admin/users")?;
    Ok(FlashRedirect::success("/admin/users", format!("{} is now {}", user.name, status)))
}

pub async fn activate_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<i64>,
) -> Result<FlashRedirect, PageError> {
    set_user_status(&state, &auth, user_id, UserStatus::Active).await
}

pub async fn deactivate_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<i64>,
) -> Result<FlashRedirect, PageError> {
    set_user_status(&state, &auth, user_id, UserStatus::Inactive).await
}

/// Soft delete: the row stays with status `deleted`.
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<i64>,
) -> Result<FlashRedirect, PageError> {
    set_user_status(&state, &auth, user_id, UserStatus::Deleted).await
}

pub async fn change_role(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<i64>,
    Form(form): Form<RoleForm>,
) -> Result<FlashRedirect, PageError> {
    let role: UserRole = form.role.parse().or_redirect("/admin/users")?;
    let user = UserService::new(&state)
        .change_role(auth.user.id, user_id, role)
        .await
        .or_redirect("/admin/users")?;
    Ok(FlashRedirect::success("/admin/users", format!("{} is now {}", user.name, role)))
}

// Problem oversight
pub async fn problems(
    State(state): State<AppState>,
    Query(query): Query<ProblemQuery>,
    flash: CurrentFlash,
) -> Result<View<ProblemListView>, PageError> {
    let filter = query.to_filter().or_redirect("/admin")?;
    let pagination = query.pagination().or_redirect("/admin")?;

    let problems = ProblemService::new(&state)
        .list_problems(&filter, ProblemOrder::RecentlyUpdated, pagination)
        .await?;
    let users = UserService::new(&state);
    let officers = users.list_active_by_role(UserRole::Avms).await?;
    let doctors = users.list_active_by_role(UserRole::Doctor).await?;

    Ok(View::new(
        flash,
        ProblemListView {
            problems,
            doctors: Some(doctors),
            officers: Some(officers),
        },
    ))
}

pub async fn update_problem(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(problem_id): Path<i64>,
    Form(form): Form<AdminProblemForm>,
) -> Result<FlashRedirect, PageError> {
    let problem = ProblemService::new(&state)
        .admin_update(&auth.user, problem_id, &form)
        .await
        .or_redirect("/admin/problems")?;
    Ok(FlashRedirect::success("/admin/problems", format!("'{}' updated", problem.title)))
}

// Settings and logs
pub async fn settings_page(
    State(state): State<AppState>,
    flash: CurrentFlash,
) -> Result<View<BTreeMap<String, String>>, PageError> {
    let settings = SettingsService::new(&state).get_all().await?;
    Ok(View::new(flash, settings))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> Result<FlashRedirect, PageError> {
    let keys = SettingsService::new(&state)
        .update(auth.user.id, &pairs)
        .await
        .or_redirect("/admin/settings")?;

    let names: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
    AuditService::new(&state)
        .record(auth.user.id, "update_settings", "settings", None, format!("Updated {}", names.join(", ")))
        .await;
    Ok(FlashRedirect::success("/admin/settings", "Settings saved"))
}

pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
    flash: CurrentFlash,
) -> Result<View<Page<AdminLog>>, PageError> {
    let pagination = query.pagination().or_redirect("/admin")?;
    let logs = AuditService::new(&state).list(pagination).await?;
    Ok(View::new(flash, logs))
}
