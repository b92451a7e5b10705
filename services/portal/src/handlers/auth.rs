use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    response::IntoResponse,
    Form,
};
use serde_json::json;

use village_health_auth::extract_token;
use village_health_common::{UserRole, UserStatus};

use crate::models::{validate_form, FormView, LoginForm, PasswordForm, ProfileForm, ProfileView, RegisterForm};
use crate::services::{AppState, SettingsService, UserService};
use crate::session::{end_session, start_session, AuthContext, CurrentFlash, FlashRedirect, OrRedirect, PageError, View};

pub async fn login_page(flash: CurrentFlash) -> View<FormView> {
    View::new(flash, FormView { form: "login", roles: None })
}

pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<FlashRedirect, PageError> {
    let old_input = json!({ "email": form.email });
    validate_form(&form).or_redirect_with("/login", old_input.clone())?;

    let user = UserService::new(&state)
        .authenticate(&form.email, &form.password)
        .await
        .or_redirect_with("/login", old_input)?;
    let role = user.role()?;
    let token = start_session(&state, &user).await.or_redirect("/login")?;

    Ok(FlashRedirect::success(role.dashboard_path(), format!("Welcome back, {}", user.name)).with_session(token))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let token = extract_token(&headers, &state.config.session.cookie_name);
    if let Some(claims) = token.and_then(|t| state.jwt_service.validate_token(&t).ok()) {
        end_session(&state, &claims.sid).await;
        tracing::info!("User {} logged out", claims.sub);
    }
    FlashRedirect::success("/login", "You have been logged out").ending_session()
}

pub async fn register_page(flash: CurrentFlash) -> View<FormView> {
    let roles = [UserRole::Villager, UserRole::Avms, UserRole::Doctor]
        .iter()
        .filter(|role| role.is_self_registrable())
        .map(UserRole::as_str)
        .collect();
    View::new(flash, FormView { form: "register", roles: Some(roles) })
}

pub async fn register(
    State(state): State<AppState>,
    Form(form): Form<RegisterForm>,
) -> Result<FlashRedirect, PageError> {
    let old_input = json!({
        "name": form.name,
        "email": form.email,
        "role": form.role,
        "phone": form.phone,
        "village": form.village,
    });
    validate_form(&form).or_redirect_with("/register", old_input.clone())?;

    let user = UserService::new(&state)
        .register_user(&form)
        .await
        .or_redirect_with("/register", old_input)?;

    let message = match user.status() {
        UserStatus::Active => "Registration successful. You can now log in.",
        _ => "Registration received. An administrator will review your account before you can log in.",
    };
    Ok(FlashRedirect::success("/login", message))
}

pub async fn profile_page(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    flash: CurrentFlash,
) -> Result<View<ProfileView>, PageError> {
    let password_min_length = SettingsService::new(&state).password_min_length().await?;
    Ok(View::new(flash, ProfileView { user: auth.user, password_min_length }))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Form(form): Form<ProfileForm>,
) -> Result<FlashRedirect, PageError> {
    let old_input = json!({ "name": form.name, "phone": form.phone, "village": form.village });
    validate_form(&form).or_redirect_with("/profile", old_input.clone())?;

    UserService::new(&state)
        .update_profile(auth.user.id, &form)
        .await
        .or_redirect_with("/profile", old_input)?;
    Ok(FlashRedirect::success("/profile", "Profile updated"))
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Form(form): Form<PasswordForm>,
) -> Result<FlashRedirect, PageError> {
    UserService::new(&state)
        .change_password(&auth.user, &form)
        .await
        .or_redirect("/profile")?;
    Ok(FlashRedirect::success("/profile", "Password changed"))
}
