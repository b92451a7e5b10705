use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Json, Redirect, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};

use village_health_auth::{build_cookie, clear_cookie, extract_token, read_cookie, Claims};
use village_health_common::{AppError, UserRole};
use village_health_database::User;

use crate::services::{AppState, SettingsService, UserService};

/// Old form input is dropped from the flash cookie beyond this size so the
/// cookie stays well under browser limits.
const MAX_FLASH_COOKIE_BYTES: usize = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// One-time message shown on the next page view, then cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flash {
    pub level: FlashLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_input: Option<serde_json::Value>,
}

impl Flash {
    pub fn new(level: FlashLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            old_input: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(FlashLevel::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FlashLevel::Error, message)
    }

    pub fn with_old_input(mut self, old_input: Option<serde_json::Value>) -> Self {
        self.old_input = old_input;
        self
    }

    pub fn encode(&self) -> String {
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).unwrap_or_default());
        if encoded.len() > MAX_FLASH_COOKIE_BYTES && self.old_input.is_some() {
            let trimmed = Flash {
                old_input: None,
                ..self.clone()
            };
            return trimmed.encode();
        }
        encoded
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

// Cookie changes requested by a handler; applied by `session_cookies`.
#[derive(Debug, Clone)]
struct SetFlash(Flash);

#[derive(Debug, Clone, Copy)]
struct ClearFlash;

#[derive(Debug, Clone)]
struct SetSession(String);

#[derive(Debug, Clone, Copy)]
struct ClearSession;

/// Turns the cookie markers handlers leave in response extensions into
/// `Set-Cookie` headers, using the configured names and flags.
pub async fn session_cookies(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let config = &state.config.session;
    let mut cookies = Vec::new();

    if let Some(SetSession(token)) = response.extensions_mut().remove::<SetSession>() {
        cookies.push(build_cookie(
            &config.cookie_name,
            &token,
            Some(state.config.jwt.expiration_seconds()),
            config.secure_cookies,
        ));
    }
    if response.extensions_mut().remove::<ClearSession>().is_some() {
        cookies.push(clear_cookie(&config.cookie_name));
    }
    if let Some(SetFlash(flash)) = response.extensions_mut().remove::<SetFlash>() {
        cookies.push(build_cookie(&config.flash_cookie_name, &flash.encode(), None, config.secure_cookies));
    } else if response.extensions_mut().remove::<ClearFlash>().is_some() {
        cookies.push(clear_cookie(&config.flash_cookie_name));
    }

    for cookie in cookies {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

/// Pending flash message of the current request, if any.
pub struct CurrentFlash(pub Option<Flash>);

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentFlash {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(CurrentFlash(
            read_cookie(&parts.headers, &state.config.session.flash_cookie_name)
                .and_then(|raw| Flash::decode(&raw)),
        ))
    }
}

/// JSON view model for a page: the pending flash message plus page data.
/// Rendering a view consumes the flash.
#[derive(Debug, Serialize)]
pub struct View<T: Serialize> {
    pub flash: Option<Flash>,
    pub data: T,
}

impl<T: Serialize> View<T> {
    pub fn new(flash: CurrentFlash, data: T) -> Self {
        Self { flash: flash.0, data }
    }
}

impl<T: Serialize> IntoResponse for View<T> {
    fn into_response(self) -> Response {
        let had_flash = self.flash.is_some();
        let mut response = Json(self).into_response();
        if had_flash {
            response.extensions_mut().insert(ClearFlash);
        }
        response
    }
}

/// 303 redirect after a form post, carrying a flash message.
pub struct FlashRedirect {
    to: String,
    flash: Flash,
    session: Option<SessionChange>,
}

enum SessionChange {
    Start(String),
    End,
}

impl FlashRedirect {
    pub fn new(to: impl Into<String>, flash: Flash) -> Self {
        Self {
            to: to.into(),
            flash,
            session: None,
        }
    }

    pub fn success(to: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(to, Flash::success(message))
    }

    /// Also sets the session cookie (login).
    pub fn with_session(mut self, token: String) -> Self {
        self.session = Some(SessionChange::Start(token));
        self
    }

    /// Also clears the session cookie (logout).
    pub fn ending_session(mut self) -> Self {
        self.session = Some(SessionChange::End);
        self
    }
}

impl IntoResponse for FlashRedirect {
    fn into_response(self) -> Response {
        let mut response = Redirect::to(&self.to).into_response();
        response.extensions_mut().insert(SetFlash(self.flash));
        match self.session {
            Some(SessionChange::Start(token)) => {
                response.extensions_mut().insert(SetSession(token));
            }
            Some(SessionChange::End) => {
                response.extensions_mut().insert(ClearSession);
            }
            None => {}
        }
        response
    }
}

/// Error raised while serving a page or form post. Becomes a redirect with an
/// error flash instead of an error page.
#[derive(Debug)]
pub struct PageError {
    pub error: AppError,
    pub redirect_to: String,
    pub old_input: Option<serde_json::Value>,
}

impl PageError {
    pub fn new(error: AppError, redirect_to: impl Into<String>) -> Self {
        Self {
            error,
            redirect_to: redirect_to.into(),
            old_input: None,
        }
    }
}

impl From<AppError> for PageError {
    fn from(error: AppError) -> Self {
        PageError::new(error, "/")
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        match self.error {
            AppError::Authentication(message) => {
                let mut response = Redirect::to("/login").into_response();
                response.extensions_mut().insert(SetFlash(Flash::error(message)));
                response.extensions_mut().insert(ClearSession);
                response
            }
            unavailable @ AppError::Unavailable(_) => unavailable.into_response(),
            error => {
                if error.is_system() {
                    tracing::error!("Page request failed ({}): {:?}", self.redirect_to, error);
                }
                let keeps_input = matches!(
                    error,
                    AppError::Validation(_) | AppError::InvalidArgument(_) | AppError::Conflict(_)
                );
                let flash = Flash::error(error.public_message())
                    .with_old_input(if keeps_input { self.old_input } else { None });
                FlashRedirect::new(self.redirect_to, flash).into_response()
            }
        }
    }
}

pub trait OrRedirect<T> {
    /// On error, redirect to `to` with the error as a flash message.
    fn or_redirect(self, to: &str) -> Result<T, PageError>;

    /// Like `or_redirect`, also carrying the submitted input back to the form.
    fn or_redirect_with(self, to: &str, old_input: serde_json::Value) -> Result<T, PageError>;
}

impl<T> OrRedirect<T> for Result<T, AppError> {
    fn or_redirect(self, to: &str) -> Result<T, PageError> {
        self.map_err(|error| PageError::new(error, to))
    }

    fn or_redirect_with(self, to: &str, old_input: serde_json::Value) -> Result<T, PageError> {
        self.map_err(|error| PageError {
            error,
            redirect_to: to.to_string(),
            old_input: Some(old_input),
        })
    }
}

/// The signed-in user for this request, loaded fresh from the database.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub role: UserRole,
    pub session_id: String,
}

impl AuthContext {
    pub fn require(&self, role: UserRole) -> Result<(), AppError> {
        if self.role != role {
            return Err(AppError::Authorization(
                "You do not have permission to access that page".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolves the session carried by `headers`. `Ok(None)` when no token was sent.
pub async fn current_session(state: &AppState, headers: &HeaderMap) -> Result<Option<AuthContext>, AppError> {
    let Some(token) = extract_token(headers, &state.config.session.cookie_name) else {
        return Ok(None);
    };

    let expired = || AppError::Authentication("Your session has expired. Please log in again.".to_string());

    let claims = state.jwt_service.validate_token(&token).map_err(|_| expired())?;
    let user_id = claims.user_id()?;

    match state.redis_service.get_session(&claims.sid).await? {
        Some(session_user) if session_user == user_id => {}
        _ => return Err(expired()),
    }

    let user = UserService::new(state).find_user(user_id).await?.ok_or_else(expired)?;
    if !user.is_active() {
        end_session(state, &claims.sid).await;
        return Err(AppError::Authentication("Your account is not active".to_string()));
    }

    let role = user.role()?;
    if role != UserRole::Admin && SettingsService::new(state).maintenance_mode().await? {
        return Err(AppError::Unavailable(
            "The site is under maintenance. Please try again later.".to_string(),
        ));
    }

    Ok(Some(AuthContext {
        user,
        role,
        session_id: claims.sid,
    }))
}

pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, AppError> {
    current_session(state, headers)
        .await?
        .ok_or_else(|| AppError::Authentication("Please log in to continue".to_string()))
}

/// Registers a new session for `user` and returns the signed token.
pub async fn start_session(state: &AppState, user: &User) -> Result<String, AppError> {
    let claims = Claims::new(user.id, &state.config.jwt);
    let token = state.jwt_service.generate_token(&claims)?;
    state
        .redis_service
        .set_session(&claims.sid, user.id, state.config.jwt.expiration_seconds())
        .await?;
    Ok(token)
}

pub async fn end_session(state: &AppState, session_id: &str) {
    if let Err(err) = state.redis_service.delete_session(session_id).await {
        tracing::warn!("Failed to remove session {}: {}", session_id, err);
    }
}

// Route guards. Each stores the `AuthContext` in request extensions for
// handlers to pick up with `Extension<AuthContext>`.

/// Any signed-in user; failures redirect to the login page.
pub async fn require_login(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response, PageError> {
    let auth = authenticate(&state, request.headers()).await?;
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

/// A signed-in user holding `role`.
pub async fn require_role(role: UserRole, state: AppState, mut request: Request, next: Next) -> Result<Response, PageError> {
    let auth = authenticate(&state, request.headers()).await?;
    auth.require(role)?;
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

/// Same checks for JSON endpoints: failures are JSON errors, not redirects.
pub async fn require_api_session(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response, AppError> {
    let auth = authenticate(&state, request.headers()).await?;
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

pub async fn not_found() -> AppError {
    AppError::NotFound("Page not found".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn flash_cookie_round_trip() {
        let flash = Flash::error("Notes are required").with_old_input(Some(serde_json::json!({"title": "Fever"})));
        let decoded = Flash::decode(&flash.encode()).unwrap();
        assert_eq!(decoded, flash);
    }

    #[test]
    fn oversized_old_input_is_dropped() {
        let long = "x".repeat(MAX_FLASH_COOKIE_BYTES * 2);
        let flash = Flash::error("Title must be at most 200 characters")
            .with_old_input(Some(serde_json::json!({ "title": long })));
        let encoded = flash.encode();
        assert!(encoded.len() <= MAX_FLASH_COOKIE_BYTES);

        let decoded = Flash::decode(&encoded).unwrap();
        assert_eq!(decoded.message, flash.message);
        assert!(decoded.old_input.is_none());
    }

    #[test]
    fn garbage_flash_cookie_is_ignored() {
        assert!(Flash::decode("%%%not-base64").is_none());
        assert!(Flash::decode(&URL_SAFE_NO_PAD.encode(b"not json")).is_none());
    }

    #[test]
    fn page_errors_redirect_with_flash() {
        let response = PageError::new(AppError::Conflict("Problem is already assigned".to_string()), "/avms/queue")
            .into_response();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/avms/queue");
        let SetFlash(flash) = response.extensions().get::<SetFlash>().cloned().unwrap();
        assert_eq!(flash.message, "Problem is already assigned");
        assert_eq!(flash.level, FlashLevel::Error);
    }

    #[test]
    fn authentication_errors_go_to_login() {
        let response = PageError::from(AppError::Authentication("Please log in to continue".to_string())).into_response();
        assert_eq!(response.headers()[header::LOCATION], "/login");
        assert!(response.extensions().get::<ClearSession>().is_some());
    }

    #[test]
    fn system_errors_show_generic_message() {
        let response = PageError::from(AppError::Internal("pool timed out".to_string())).into_response();
        let SetFlash(flash) = response.extensions().get::<SetFlash>().cloned().unwrap();
        assert!(!flash.message.contains("pool"));
    }

    #[test]
    fn maintenance_is_a_503() {
        let response = PageError::from(AppError::Unavailable("maintenance".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn old_input_only_survives_validation_errors() {
        let err: Result<(), AppError> = Err(AppError::Validation("Title and description are required".to_string()));
        let response = err
            .or_redirect_with("/villager/problems", serde_json::json!({"title": ""}))
            .unwrap_err()
            .into_response();
        let SetFlash(flash) = response.extensions().get::<SetFlash>().cloned().unwrap();
        assert!(flash.old_input.is_some());

        let err: Result<(), AppError> = Err(AppError::Authorization("no".to_string()));
        let response = err
            .or_redirect_with("/", serde_json::json!({"title": ""}))
            .unwrap_err()
            .into_response();
        let SetFlash(flash) = response.extensions().get::<SetFlash>().cloned().unwrap();
        assert!(flash.old_input.is_none());
    }
}
