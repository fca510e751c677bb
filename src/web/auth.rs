//! Session tokens and the account routes that issue them.

use crate::db::DBError;
use crate::jwt::{new_token, validate_token};
use crate::models::users::{NewUser, User, UserError, UserType};
use crate::{ApiError, AppState, ErrorType, Surface};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;
use validator::Validate;

/// The authenticated caller, inserted into request extensions by
/// [`attach_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: Uuid,
    pub user_type: UserType,
    pub email: String,
}

impl From<&User> for Session {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            user_type: user.user_type,
            email: user.email.clone(),
        }
    }
}

/// Resolves `Authorization: Bearer <jwt>` into a [`Session`].
///
/// Requests without a valid token pass through unauthenticated; each handler
/// decides whether it needs a session.
pub async fn attach_session(
    State(data): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer ").map(ToString::to_string));

    if let Some(token) = token {
        match session_from_token(&data, &token) {
            Ok(session) => {
                req.extensions_mut().insert(session);
            }
            Err(e) => debug!("Ignoring bearer token: {}", e),
        }
    }

    next.run(req).await
}

fn session_from_token(data: &AppState, token: &str) -> Result<Session, ApiError> {
    let claims = validate_token(token, &data.config.jwt_secret)?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|e| {
        error!("Error parsing user uuid: {:?}", e);
        ApiError::new(ErrorType::Unauthorized, Surface::Auth)
    })?;
    let user = data.db.get_user_by_id(user_id).map_err(|e| {
        debug!("Token subject {} not usable: {:?}", user_id, e);
        ApiError::new(ErrorType::Unauthorized, Surface::Auth)
    })?;
    Ok(Session::from(&user))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 6))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            user_type: user.user_type,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: UserSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/token", post(token))
        .route("/api/auth/guest", post(guest))
        .with_state(app_state)
}

async fn register(
    State(data): State<Arc<AppState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|e| {
        ApiError::new(ErrorType::BadRequest, Surface::Auth).with_cause(e.body_text())
    })?;
    body.validate().map_err(|e| {
        ApiError::new(ErrorType::BadRequest, Surface::Auth).with_cause(e.to_string())
    })?;

    if data.db.get_user_by_email(&body.email)?.is_some() {
        return Err(ApiError::new(ErrorType::Conflict, Surface::Auth));
    }

    let password = body.password;
    let password_hash = tokio::task::spawn_blocking(move || password_auth::generate_hash(password))
        .await
        .map_err(|e| {
            error!("Password hashing task failed: {:?}", e);
            ApiError::new(ErrorType::Internal, Surface::Auth)
        })?;

    let user = match data.db.create_user(NewUser::regular(body.email, password_hash)) {
        Ok(user) => user,
        Err(DBError::UserError(UserError::DuplicateEmail)) => {
            return Err(ApiError::new(ErrorType::Conflict, Surface::Auth));
        }
        Err(e) => return Err(e.into()),
    };
    info!("Registered user {}", user.id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user: UserSummary::from(&user),
            token: None,
        }),
    ))
}

async fn token(
    State(data): State<Arc<AppState>>,
    body: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let Json(body) = body.map_err(|e| {
        ApiError::new(ErrorType::BadRequest, Surface::Auth).with_cause(e.body_text())
    })?;
    let invalid = || ApiError::new(ErrorType::Unauthorized, Surface::Auth);

    let user = data.db.get_user_by_email(&body.email)?.ok_or_else(invalid)?;
    let hash = user.password_hash.clone().ok_or_else(invalid)?;
    let password = body.password;
    let verified =
        tokio::task::spawn_blocking(move || password_auth::verify_password(password, &hash).is_ok())
            .await
            .map_err(|e| {
                error!("Password verification task failed: {:?}", e);
                ApiError::new(ErrorType::Internal, Surface::Auth)
            })?;
    if !verified {
        return Err(invalid());
    }

    let token = new_token(&user, &data.config.jwt_secret, data.config.token_ttl_hours)?;
    debug!("Issued token for user {}", user.id);
    Ok(Json(AuthResponse {
        user: UserSummary::from(&user),
        token: Some(token),
    }))
}

async fn guest(State(data): State<Arc<AppState>>) -> Result<Json<AuthResponse>, ApiError> {
    let user = data.db.create_user(NewUser::guest())?;
    let token = new_token(&user, &data.config.jwt_secret, data.config.token_ttl_hours)?;
    info!("Created guest user {}", user.id);
    Ok(Json(AuthResponse {
        user: UserSummary::from(&user),
        token: Some(token),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_state, FakeProvider, MemoryDb};
    use axum::body::to_bytes;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<AppState>) {
        let state = test_state(Arc::new(MemoryDb::new()), Arc::new(FakeProvider::default()));
        (crate::web::router(state.clone()), state)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let (app, state) = app();
        let creds = json!({"email": "ada@example.com", "password": "hunter22"});

        let response = app
            .clone()
            .oneshot(post_json("/api/auth/register", creds.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(post_json("/api/auth/register", creds.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(post_json("/api/auth/token", creds))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let token = body["token"].as_str().unwrap();
        let claims = validate_token(token, &state.config.jwt_secret).unwrap();
        assert_eq!(claims.sub, body["user"]["id"].as_str().unwrap());
    }

    #[tokio::test]
    async fn test_register_rejects_short_password() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json(
                "/api/auth/register",
                json!({"email": "ada@example.com", "password": "abc"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "bad_request:auth");
    }

    #[tokio::test]
    async fn test_wrong_password_is_unauthorized() {
        let (app, _) = app();
        app.clone()
            .oneshot(post_json(
                "/api/auth/register",
                json!({"email": "ada@example.com", "password": "hunter22"}),
            ))
            .await
            .unwrap();
        let response = app
            .oneshot(post_json(
                "/api/auth/token",
                json!({"email": "ada@example.com", "password": "hunter23"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_guest_token_carries_guest_type() {
        let (app, state) = app();
        let response = app
            .oneshot(post_json("/api/auth/guest", json!({})))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["user"]["type"], "guest");
        let claims = validate_token(body["token"].as_str().unwrap(), &state.config.jwt_secret).unwrap();
        assert_eq!(claims.user_type, UserType::Guest);
    }
}
