use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    InvalidToken,
    #[error("not an access token")]
    WrongTokenType,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Claims carried by the access tokens the account service issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: usize,
    pub iat: usize,
    #[serde(rename = "type")]
    pub token_type: String,
}

pub fn create_access_token(
    user_id: &str,
    email: Option<&str>,
    secret: &str,
    expiry_secs: u64,
) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = AccessClaims {
        user_id: user_id.to_string(),
        email: email.map(str::to_string),
        iat: now,
        exp: now + expiry_secs as usize,
        token_type: ACCESS_TOKEN_TYPE.to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Internal(e.to_string()))
}

pub fn validate_access_token(token: &str, secret: &str) -> Result<AccessClaims, AuthError> {
    let claims = decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })?;

    if claims.token_type != ACCESS_TOKEN_TYPE {
        return Err(AuthError::WrongTokenType);
    }
    if claims.user_id.trim().is_empty() {
        return Err(AuthError::InvalidToken);
    }
    Ok(claims)
}
