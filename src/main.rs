use crate::config::AppConfig;
use crate::db::{setup_db, DBConnection, DBError};
use crate::provider::{CompletionProvider, OpenAiProvider};
use crate::web::chat::delivery::DeliveryController;
use crate::web::chat::entitlements::Entitlements;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod db;
mod jwt;
mod models;
mod provider;
mod resumable;
#[cfg(test)]
mod test_utils;
mod web;

/// Error category; the first half of a `type:surface` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimit,
    Conflict,
    Internal,
}

impl ErrorType {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorType::BadRequest => "bad_request",
            ErrorType::Unauthorized => "unauthorized",
            ErrorType::Forbidden => "forbidden",
            ErrorType::NotFound => "not_found",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Conflict => "conflict",
            ErrorType::Internal => "internal",
        }
    }
}

/// The entity an error is about; the second half of a `type:surface` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Api,
    Auth,
    Chat,
    Stream,
    Database,
}

impl Surface {
    fn as_str(&self) -> &'static str {
        match self {
            Surface::Api => "api",
            Surface::Auth => "auth",
            Surface::Chat => "chat",
            Surface::Stream => "stream",
            Surface::Database => "database",
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub error_type: ErrorType,
    pub surface: Surface,
    pub cause: Option<String>,
}

impl ApiError {
    pub fn new(error_type: ErrorType, surface: Surface) -> Self {
        Self {
            error_type,
            surface,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn code(&self) -> String {
        format!("{}:{}", self.error_type.as_str(), self.surface.as_str())
    }

    pub fn status(&self) -> StatusCode {
        match self.error_type {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorType::Forbidden => StatusCode::FORBIDDEN,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::Conflict => StatusCode::CONFLICT,
            ErrorType::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &'static str {
        match (self.error_type, self.surface) {
            (ErrorType::Internal, Surface::Database) => {
                "An error occurred while executing a database query."
            }
            (ErrorType::Internal, _) => "Something went wrong. Please try again later.",
            (ErrorType::BadRequest, _) => {
                "The request couldn't be processed. Please check your input and try again."
            }
            (ErrorType::Unauthorized, Surface::Auth) => "Invalid email or password.",
            (ErrorType::Unauthorized, _) => "You need to sign in before continuing.",
            (ErrorType::Forbidden, Surface::Chat) => {
                "This chat belongs to another user. Please check the chat ID and try again."
            }
            (ErrorType::Forbidden, _) => "You don't have access to this resource.",
            (ErrorType::NotFound, Surface::Chat) => {
                "The requested chat was not found. Please check the chat ID and try again."
            }
            (ErrorType::NotFound, Surface::Stream) => "No stream was found for this chat.",
            (ErrorType::NotFound, _) => "The requested resource was not found.",
            (ErrorType::RateLimit, _) => {
                "You have exceeded your maximum number of messages for the day. Please try again later."
            }
            (ErrorType::Conflict, Surface::Auth) => "An account with this email already exists.",
            (ErrorType::Conflict, _) => {
                "A response is already being generated for this chat. Please wait for it to finish."
            }
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} ({})", self.code(), cause),
            None => write!(f, "{}", self.code()),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        // Internal failures never expose their detail.
        let cause = match self.error_type {
            ErrorType::Internal => None,
            _ => self.cause.clone(),
        };
        (
            status,
            Json(ErrorResponse {
                code: self.code(),
                message: self.message().to_string(),
                cause,
            }),
        )
            .into_response()
    }
}

impl From<DBError> for ApiError {
    fn from(err: DBError) -> Self {
        web::chat::error_mapping::map_generic_db_error(err)
    }
}

pub struct AppState {
    pub db: Arc<dyn DBConnection + Send + Sync>,
    pub config: AppConfig,
    pub provider: Arc<dyn CompletionProvider>,
    pub delivery: Arc<DeliveryController>,
    pub entitlements: Entitlements,
    pub http: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Database error: {0}")]
    Db(#[from] DBError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!("Server failed to start: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn run() -> Result<(), StartupError> {
    let config = AppConfig::from_env()?;
    info!("Starting chat server on port {}", config.port);

    let db = setup_db(&config.database_url)?;
    let registry = resumable::init(&config.resumable_backend).await;
    let delivery = Arc::new(DeliveryController::new(db.clone(), registry));
    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAiProvider::new(
        &config.openai_api_base,
        &config.openai_api_key,
    ));

    let cors = cors_layer(&config.cors_origins);
    let port = config.port;
    let app_state = Arc::new(AppState {
        db,
        entitlements: Entitlements::from_config(&config),
        config,
        provider,
        delivery,
        http: reqwest::Client::new(),
    });

    let app = web::router(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    layer.allow_origin(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_code_joins_type_and_surface() {
        let err = ApiError::new(ErrorType::RateLimit, Surface::Chat);
        assert_eq!(err.code(), "rate_limit:chat");
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::new(ErrorType::Conflict, Surface::Chat).code(),
            "conflict:chat"
        );
    }

    #[tokio::test]
    async fn test_response_body_shape() {
        let response = ApiError::new(ErrorType::BadRequest, Surface::Api)
            .with_cause("missing parts")
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.code, "bad_request:api");
        assert_eq!(parsed.cause.as_deref(), Some("missing parts"));
    }

    #[tokio::test]
    async fn test_internal_error_hides_cause() {
        let response = ApiError::new(ErrorType::Internal, Surface::Chat)
            .with_cause("connection refused at 10.0.0.3")
            .into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(parsed.cause.is_none());
        assert_eq!(parsed.message, "Something went wrong. Please try again later.");
    }
}
