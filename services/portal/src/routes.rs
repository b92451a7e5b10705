use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};

use village_health_common::UserRole;

use crate::handlers::{self, admin, api, auth, avms, doctor, notifications, problems, reports, villager};
use crate::services::AppState;
use crate::session::{require_api_session, require_login, require_role, PageError};

pub fn create_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health_check))
        // Authentication
        .route("/login", get(auth::login_page).post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/register", get(auth::register_page).post(auth::register))
        .merge(account_routes(state.clone()))
        .merge(villager_routes(state.clone()))
        .merge(avms_routes(state.clone()))
        .merge(doctor_routes(state.clone()))
        .merge(admin_routes(state.clone()))
        .merge(api_routes(state))
}

/// Pages open to every signed-in user.
fn account_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/profile", get(auth::profile_page).post(auth::update_profile))
        .route("/profile/password", post(auth::change_password))
        .route("/notifications", get(notifications::list))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/problems/:id", get(problems::detail))
        .route("/uploads/:name", get(problems::photo))
        .route_layer(middleware::from_fn_with_state(state, require_login))
}

fn villager_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/villager", get(villager::dashboard))
        .route("/villager/problems", get(villager::my_problems).post(villager::create_problem))
        .route_layer(middleware::from_fn_with_state(state, villager_only))
}

fn avms_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/avms", get(avms::dashboard))
        .route("/avms/queue", get(avms::queue))
        .route("/avms/problems", get(avms::my_problems))
        .route("/avms/doctors", get(avms::doctors))
        .route("/avms/problems/:id/claim", post(avms::claim))
        .route("/avms/problems/:id/status", post(avms::update_status))
        .route("/avms/problems/:id/escalate", post(avms::escalate))
        .route_layer(middleware::from_fn_with_state(state, avms_only))
}

fn doctor_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/doctor", get(doctor::dashboard))
        .route("/doctor/problems", get(doctor::problems))
        .route("/doctor/problems/:id/respond", post(doctor::respond))
        .route_layer(middleware::from_fn_with_state(state, doctor_only))
}

fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin", get(admin::dashboard))
        // Approvals
        .route("/admin/approvals", get(admin::approvals))
        .route("/admin/approvals/bulk", post(admin::bulk_approve))
        .route("/admin/approvals/:id/approve", post(admin::approve))
        .route("/admin/approvals/:id/reject", post(admin::reject))
        .route("/admin/approvals/:id/purge", post(admin::purge))
        // Users
        .route("/admin/users", get(admin::users))
        .route("/admin/users/:id/activate", post(admin::activate_user))
        .route("/admin/users/:id/deactivate", post(admin::deactivate_user))
        .route("/admin/users/:id/delete", post(admin::delete_user))
        .route("/admin/users/:id/role", post(admin::change_role))
        // Problems
        .route("/admin/problems", get(admin::problems))
        .route("/admin/problems/:id", post(admin::update_problem))
        // Settings and logs
        .route("/admin/settings", get(admin::settings_page).post(admin::update_settings))
        .route("/admin/logs", get(admin::logs))
        // Reports
        .route("/admin/reports", get(reports::reports))
        .route("/admin/reports/export.csv", get(reports::export_csv))
        .route("/admin/reports/printable", get(reports::printable))
        // Backups
        .route("/admin/backups", get(reports::list_backups).post(reports::create_backup))
        .route("/admin/backups/:name", get(reports::download_backup))
        .route("/admin/backups/:name/delete", post(reports::delete_backup))
        .route_layer(middleware::from_fn_with_state(state, admin_only))
}

fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/stats", get(api::stats))
        .route("/api/problems/new", get(api::new_problems))
        .route_layer(middleware::from_fn_with_state(state, require_api_session))
}

async fn villager_only(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, PageError> {
    require_role(UserRole::Villager, state, request, next).await
}

async fn avms_only(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, PageError> {
    require_role(UserRole::Avms, state, request, next).await
}

async fn doctor_only(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, PageError> {
    require_role(UserRole::Doctor, state, request, next).await
}

async fn admin_only(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, PageError> {
    require_role(UserRole::Admin, state, request, next).await
}
