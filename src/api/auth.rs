//! Token issuance and the authenticated-principal extractor.
//!
//! Login verifies the submitted password against the argon2 PHC hash from
//! the environment and issues an HS256 JWT with `{sub, role, exp}` claims.
//! Handlers receive a [`Principal`] through the extractor; internal callers
//! may instead present the shared-secret header, which is equivalent to
//! admin.

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::settings::Settings;
use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use axum::extract::{FromRef, FromRequestParts, State};
use axum::http::request::Parts;
use axum::{Form, Json};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

struct Account {
    username: String,
    password_hash: String,
    role: Role,
}

pub struct AuthContext {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    algorithm: Algorithm,
    expire_minutes: u64,
    accounts: Vec<Account>,
    internal_token: Option<String>,
}

impl AuthContext {
    pub fn from_settings(settings: &Settings) -> crate::error::AppResult<Arc<Self>> {
        let algorithm = Algorithm::from_str(&settings.algorithm).map_err(|_| {
            crate::error::ControlError::Validation(format!(
                "unsupported JWT algorithm '{}'",
                settings.algorithm
            ))
        })?;
        Ok(Arc::new(Self {
            encoding: EncodingKey::from_secret(settings.secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(settings.secret_key.as_bytes()),
            validation: Validation::new(algorithm),
            algorithm,
            expire_minutes: settings.access_token_expire_minutes,
            accounts: vec![
                Account {
                    username: settings.user_username.clone(),
                    password_hash: settings.hashed_user_password.clone(),
                    role: Role::User,
                },
                Account {
                    username: settings.admin_username.clone(),
                    password_hash: settings.hashed_admin_password.clone(),
                    role: Role::Admin,
                },
            ],
            internal_token: settings.internal_token.clone(),
        }))
    }

    fn verify_credentials(&self, username: &str, password: &str) -> Option<Role> {
        let account = self
            .accounts
            .iter()
            .find(|a| a.username == username && !a.password_hash.is_empty())?;
        let parsed = PasswordHash::new(&account.password_hash).ok()?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .ok()?;
        Some(account.role)
    }

    pub fn issue_token(&self, username: &str, role: Role) -> crate::error::AppResult<String> {
        let exp = chrono::Utc::now() + chrono::Duration::minutes(self.expire_minutes as i64);
        let claims = Claims {
            sub: username.to_string(),
            role,
            exp: exp.timestamp() as usize,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(self.algorithm),
            &claims,
            &self.encoding,
        )
        .map_err(|e| crate::error::ControlError::Internal(format!("token encoding: {e}")))
    }

    /// Decode and validate a bearer token.
    pub fn verify_token(&self, token: &str) -> Result<Principal, ApiError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| {
                warn!("token validation failed: {e}");
                ApiError::unauthorized("invalid or expired token")
            })?;
        Ok(Principal {
            username: data.claims.sub,
            role: data.claims.role,
        })
    }

    fn verify_internal(&self, presented: &str) -> bool {
        self.internal_token
            .as_deref()
            .is_some_and(|expected| expected == presented)
    }
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub username: String,
    pub role: Role,
}

impl Principal {
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            Err(ApiError::forbidden("admin role required"))
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);

        if let Some(internal) = parts
            .headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if state.auth.verify_internal(internal) {
                return Ok(Principal {
                    username: "internal".to_string(),
                    role: Role::Admin,
                });
            }
            return Err(ApiError::unauthorized("invalid internal token"));
        }

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;
        state.auth.verify_token(token)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

/// `POST /auth/login`: verify credentials, return a bearer token.
pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    let role = state
        .auth
        .verify_credentials(&form.username, &form.password)
        .ok_or_else(|| {
            info!(username = %form.username, "login rejected");
            ApiError::unauthorized("incorrect username or password")
        })?;
    info!(username = %form.username, ?role, "login successful");
    let access_token = state.auth.issue_token(&form.username, role)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}

/// `POST /auth/logout`: stateless acknowledgement; tokens expire on their
/// own.
pub async fn logout() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Logout successful" }))
}
