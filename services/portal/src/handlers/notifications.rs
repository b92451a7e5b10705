use axum::extract::{Extension, Path, Query, State};

use crate::models::{NotificationsView, PageQuery};
use crate::services::{AppState, NotificationService};
use crate::session::{AuthContext, CurrentFlash, FlashRedirect, OrRedirect, PageError, View};

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<PageQuery>,
    flash: CurrentFlash,
) -> Result<View<NotificationsView>, PageError> {
    let pagination = query.pagination().or_redirect(auth.role.dashboard_path())?;
    let service = NotificationService::new(&state);
    let notifications = service.list_for_user(auth.user.id, pagination).await?;
    let unread = service.unread_count(auth.user.id).await?;
    Ok(View::new(flash, NotificationsView { notifications, unread }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(notification_id): Path<i64>,
) -> Result<FlashRedirect, PageError> {
    NotificationService::new(&state)
        .mark_read(auth.user.id, notification_id)
        .await
        .or_redirect("/notifications")?;
    Ok(FlashRedirect::success("/notifications", "Notification marked as read"))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<FlashRedirect, PageError> {
    let updated = NotificationService::new(&state)
        .mark_all_read(auth.user.id)
        .await
        .or_redirect("/notifications")?;
    Ok(FlashRedirect::success(
        "/notifications",
        format!("{} notifications marked as read", updated),
    ))
}
