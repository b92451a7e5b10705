use axum::extract::{Extension, Multipart, Query, State};

use village_health_common::AppError;

use crate::handlers::{base_dashboard, dashboard_window};
use crate::models::{Dashboard, NewProblem, PageQuery, ProblemListView, UploadedPhoto};
use crate::services::{AppState, ProblemService};
use crate::session::{AuthContext, CurrentFlash, FlashRedirect, OrRedirect, PageError, View};

pub async fn dashboard(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    flash: CurrentFlash,
) -> Result<View<Dashboard>, PageError> {
    let recent = ProblemService::new(&state)
        .villager_problems(auth.user.id, dashboard_window()?)
        .await?;
    let dashboard = base_dashboard(&state, &auth, recent.items).await?;
    Ok(View::new(flash, dashboard))
}

pub async fn my_problems(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<PageQuery>,
    flash: CurrentFlash,
) -> Result<View<ProblemListView>, PageError> {
    let pagination = query.pagination().or_redirect("/villager")?;
    let problems = ProblemService::new(&state)
        .villager_problems(auth.user.id, pagination)
        .await?;
    Ok(View::new(flash, ProblemListView { problems, doctors: None, officers: None }))
}

pub async fn create_problem(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    multipart: Multipart,
) -> Result<FlashRedirect, PageError> {
    let input = read_problem_form(multipart).await.or_redirect("/villager/problems")?;
    let old_input = input.old_input();

    let problem = ProblemService::new(&state)
        .create_problem(&auth.user, input)
        .await
        .or_redirect_with("/villager/problems", old_input)?;

    Ok(FlashRedirect::success(
        "/villager/problems",
        format!("Your problem '{}' has been reported", problem.title),
    ))
}

async fn read_problem_form(mut multipart: Multipart) -> Result<NewProblem, AppError> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        AppError::Validation(format!("Could not read the submitted form: {}", e))
    };

    let mut input = NewProblem::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "photo" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(invalid)?;
                // An empty file input still submits a part
                if !file_name.is_empty() && !bytes.is_empty() {
                    input.photo = Some(UploadedPhoto { file_name, bytes: bytes.to_vec() });
                }
            }
            "title" => input.title = field.text().await.map_err(invalid)?,
            "description" => input.description = field.text().await.map_err(invalid)?,
            "priority" => input.priority = Some(field.text().await.map_err(invalid)?),
            "category" => input.category = Some(field.text().await.map_err(invalid)?),
            "location" => input.location = Some(field.text().await.map_err(invalid)?),
            _ => {}
        }
    }
    Ok(input)
}
