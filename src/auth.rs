use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::JwtConfig;
use crate::error::AuthError;

/// Identity bound to an authenticated connection.
///
/// Derived once from a validated token at connect time and immutable for the
/// connection's life; rebinding is forbidden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Token validation capability. Issuance lives in another service; this is
/// the only seam the authenticator consumes.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// HS256 JWT validator with issuer check.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.clone()]);
        Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        Ok(Principal {
            name: data.claims.sub,
            scopes: data.claims.scopes,
        })
    }
}

/// Extract the bearer token from an `Authorization` header value.
fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::Missing)?;
    let token = value.strip_prefix("Bearer ").ok_or(AuthError::Missing)?;
    if token.trim().is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}

/// Authenticate a connection from its connect-time headers.
///
/// On success the resolved principal is logged and returned for binding; the
/// caller decides what a failure means (anonymous fallback for public
/// destinations, or a structured error frame).
pub fn authenticate(
    authorization: Option<&str>,
    validator: &dyn TokenValidator,
) -> Result<Principal, AuthError> {
    let token = extract_bearer(authorization)?;
    let principal = validator.validate(token)?;
    tracing::info!(user = %principal.name, "connection authenticated");
    Ok(principal)
}
