// Authentication: JWT bearer tokens, the AuthUser extractor and local login.

use axum::{
    extract::{FromRequestParts, State},
    http::request::Parts,
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::db::to_ms;
use crate::error::{ApiError, ApiResult};

pub const ROLE_PLAYER: &str = "player";
pub const ROLE_ADMIN: &str = "admin";

// ── JWT ──────────────────────────────────────────────────────────────

/// Shared with the bot gateway that mints production tokens.
fn jwt_secret() -> Vec<u8> {
    std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "trivia-dev-secret-change-in-production".to_string())
        .into_bytes()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: i64, // user id
    pub username: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

pub fn create_token(user_id: i64, username: &str, role: &str) -> Result<String, String> {
    let expiration = (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp() as usize;

    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role: role.to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&jwt_secret()),
    )
    .map_err(|e| format!("Failed to create token: {e}"))
}

pub fn verify_token(token: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(&jwt_secret()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Invalid token: {e}"))
}

// ── Axum extractor: AuthUser ─────────────────────────────────────────

/// Extracts the authenticated user from the Authorization header.
/// Usage: `AuthUser(claims)` in handler parameters.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        verify_token(token).map(AuthUser).map_err(|e| {
            tracing::debug!("Rejected bearer token: {e}");
            ApiError::Unauthorized
        })
    }
}

// ── Local login ──────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalLoginRequest {
    pub telegram_id: i64,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub user_id: i64,
    pub username: String,
}

/// `POST /api/auth/local`: upsert a user by Telegram id and issue a token.
/// Only mounted in local mode; production tokens come from the bot gateway.
pub async fn local_login(
    State(state): State<AppState>,
    Json(req): Json<LocalLoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let username = req.username.trim();
    if username.is_empty() || username.len() > 64 {
        return Err(ApiError::BadRequest("username must be 1-64 characters".into()));
    }

    let user = state
        .db
        .upsert_user(req.telegram_id, username, to_ms(chrono::Utc::now()))
        .await?;
    let role = if req.admin { ROLE_ADMIN } else { ROLE_PLAYER };
    let token = create_token(user.id, &user.username, role).map_err(ApiError::Internal)?;

    tracing::info!(user_id = user.id, "Local login");
    Ok(Json(AuthResponse {
        token,
        user_id: user.id,
        username: user.username,
    }))
}
