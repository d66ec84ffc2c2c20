use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity: the user's email.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Validate an HS256 bearer token and return its claims.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::default();

    let token_data =
        jsonwebtoken::decode::<Claims>(token, &key, &validation).map_err(|_| ApiError::Unauthorized)?;

    let claims = token_data.claims;
    if claims.exp < Utc::now().timestamp() || claims.sub.trim().is_empty() {
        return Err(ApiError::Unauthorized);
    }
    Ok(claims)
}

/// Issue a token for `email` valid for `ttl`.
pub fn issue_token(email: &str, secret: &str, ttl: Duration) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: email.trim().to_lowercase(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(e.to_string()))
}
