//! Session token verification.
//!
//! Tokens are minted elsewhere (the identity service shares `JWT_SECRET`
//! with us). The relay only verifies them and extracts the user identity.
//! A missing or bad token never fails the caller: it yields `None` and the
//! connection stays unbound.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parley_shared::constants::SESSION_COOKIE_NAME;
use parley_shared::Identity;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// JWT claims payload as issued by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Checked when present. Tokens without expiry are accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

pub trait SessionVerifier: Send + Sync + 'static {
    /// Verify `token` and extract the identity it was issued for.
    fn verify(&self, token: &str) -> Option<Identity>;
}

/// HS256 verifier for session JWTs.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = true;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl SessionVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Option<Identity> {
        match decode::<SessionClaims>(token, &self.key, &self.validation) {
            Ok(data) if !data.claims.user_id.trim().is_empty() => {
                Some(Identity::new(data.claims.user_id, data.claims.username))
            }
            Ok(_) => {
                debug!("session token has an empty userId");
                None
            }
            Err(e) => {
                debug!(error = %e, "session token rejected");
                None
            }
        }
    }
}

/// Extract the session token from the `Cookie` header.
pub fn token_from_cookie(headers: &HeaderMap) -> Option<String> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let trimmed = part.trim();
        if let Some(value) = trimmed.strip_prefix(&format!("{}=", SESSION_COOKIE_NAME)) {
            let token = value.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Cookie first, then the query-string fallback.
pub fn session_token(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    token_from_cookie(headers).or_else(|| query_token.filter(|t| !t.is_empty()))
}

#[cfg(test)]
pub(crate) fn issue_token(secret: &str, user_id: &str, username: &str, exp: Option<i64>) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = SessionClaims {
        user_id: user_id.to_string(),
        username: username.to_string(),
        iat: Some(chrono::Utc::now().timestamp()),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
