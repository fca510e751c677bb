use crate::models::users::{User, UserType};
use crate::{ApiError, ErrorType, Surface};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
    pub iat: i64,
    pub exp: i64,
}

pub fn new_token(user: &User, secret: &str, ttl_hours: i64) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id.to_string(),
        user_type: user.user_type,
        iat: now.timestamp(),
        exp: (now + Duration::hours(ttl_hours)).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Failed to sign token: {:?}", e);
        ApiError::new(ErrorType::Internal, Surface::Auth)
    })
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("Rejected token: {:?}", e);
        ApiError::new(ErrorType::Unauthorized, Surface::Auth)
    })
}
