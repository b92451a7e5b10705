use axum::{
    extract::{Extension, Path, Query, State},
    http::header,
    response::{Html, IntoResponse, Response},
};
use chrono::Utc;

use village_health_database::{BackupFile, BackupService};

use crate::models::ReportQuery;
use crate::services::reports::{render_printable, ReportSummary};
use crate::services::{AppState, AuditService, ReportService, SettingsService};
use crate::session::{AuthContext, CurrentFlash, FlashRedirect, OrRedirect, PageError, View};

pub async fn reports(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
    flash: CurrentFlash,
) -> Result<View<ReportSummary>, PageError> {
    let range = query.range(Utc::now().date_naive()).or_redirect("/admin/reports")?;
    let summary = ReportService::new(&state).summary(range).await?;
    Ok(View::new(flash, summary))
}

pub async fn export_csv(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, PageError> {
    let (body, rows) = ReportService::new(&state)
        .export_csv()
        .await
        .or_redirect("/admin/reports")?;

    AuditService::new(&state)
        .record(auth.user.id, "export_csv", "report", None, format!("Exported {} problems", rows))
        .await;

    let disposition = format!(
        "attachment; filename=\"problems_{}.csv\"",
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

pub async fn printable(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> Result<Html<String>, PageError> {
    let range = query.range(Utc::now().date_naive()).or_redirect("/admin/reports")?;
    let summary = ReportService::new(&state).summary(range).await?;
    let site_name = SettingsService::new(&state).site_name().await?;
    Ok(Html(render_printable(&site_name, &summary, Utc::now())))
}

// Backups
fn backups(state: &AppState) -> BackupService {
    BackupService::new(state.db_pool.clone(), &state.config.storage.backups_dir)
}

pub async fn list_backups(
    State(state): State<AppState>,
    flash: CurrentFlash,
) -> Result<View<Vec<BackupFile>>, PageError> {
    let files = backups(&state).list_backups().await?;
    Ok(View::new(flash, files))
}

pub async fn create_backup(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<FlashRedirect, PageError> {
    let file = backups(&state).create_backup().await.or_redirect("/admin/backups")?;
    AuditService::new(&state)
        .record(auth.user.id, "create_backup", "backup", None, file.name.clone())
        .await;
    Ok(FlashRedirect::success("/admin/backups", format!("Backup {} created", file.name)))
}

pub async fn download_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, PageError> {
    let body = backups(&state).read_backup(&name).await.or_redirect("/admin/backups")?;
    let disposition = format!("attachment; filename=\"{}\"", name);
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

pub async fn delete_backup(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<FlashRedirect, PageError> {
    backups(&state).delete_backup(&name).await.or_redirect("/admin/backups")?;
    AuditService::new(&state)
        .record(auth.user.id, "delete_backup", "backup", None, name.clone())
        .await;
    Ok(FlashRedirect::success("/admin/backups", format!("Backup {} deleted", name)))
}
