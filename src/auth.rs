//! Account registration, credential checks and bearer tokens.
//!
//! Passwords are stored as argon2id PHC strings. Tokens are HS256 JWTs that
//! carry the user id, email and username; there is no refresh flow, a client
//! logs in again once `exp` passes.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm as ArgonAlgorithm, Argon2, Params, Version};
use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::{
    config::Config,
    id::new_uuid_v7,
    state::AppState,
    time::now_ms,
    users::{self, User, USER_COLUMNS},
    util::ApiJson,
    AppError, AppResult,
};

pub const EMAIL_TAKEN: &str = "AUTH/EMAIL_TAKEN";
pub const USERNAME_TAKEN: &str = "AUTH/USERNAME_TAKEN";
pub const INVALID_CREDENTIALS: &str = "AUTH/INVALID_CREDENTIALS";

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
        .expect("email validation pattern to compile")
});

static USERNAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_]{3,20}$").expect("username validation pattern to compile")
});

pub struct AuthSettings {
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl_secs: i64,
    hash_memory_kib: u32,
    hash_iterations: u32,
}

impl AuthSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            token_ttl_secs: config.token_ttl_hours * 3600,
            hash_memory_kib: config.password_hash_memory_kib,
            hash_iterations: config.password_hash_iterations,
        }
    }

    fn hasher(&self) -> AppResult<Argon2<'static>> {
        let params = Params::new(self.hash_memory_kib, self.hash_iterations, 1, None)
            .map_err(|err| AppError::new("AUTH_CONFIG/HASH_PARAMS", err.to_string()))?;
        Ok(Argon2::new(ArgonAlgorithm::Argon2id, Version::V0x13, params))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInput {
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginInput {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: i64,
    pub user: User,
}

/// The authenticated caller, resolved from the `Authorization: Bearer` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub username: String,
}

pub fn validate_email(email: &str) -> AppResult<()> {
    if email.len() <= 254 && EMAIL_PATTERN.is_match(email) {
        Ok(())
    } else {
        Err(AppError::validation("email", "Please provide a valid email address."))
    }
}

pub fn validate_username(username: &str) -> AppResult<()> {
    if USERNAME_PATTERN.is_match(username) {
        Ok(())
    } else {
        Err(AppError::validation(
            "username",
            "Usernames are 3-20 letters, digits or underscores.",
        ))
    }
}

pub fn validate_password(password: &str) -> AppResult<()> {
    let len = password.chars().count();
    if !(8..=128).contains(&len) {
        return Err(AppError::validation(
            "password",
            "Passwords must be between 8 and 128 characters.",
        ));
    }
    let has_letter = password.chars().any(char::is_alphabetic);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_letter && has_digit) {
        return Err(AppError::validation(
            "password",
            "Passwords need at least one letter and one digit.",
        ));
    }
    Ok(())
}

pub async fn hash_password(settings: &AuthSettings, password: &str) -> AppResult<String> {
    let hasher = settings.hasher()?;
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        hasher
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| AppError::new("AUTH_HASH/FAILED", err.to_string()))
    })
    .await
    .map_err(|err| AppError::new("RUNTIME/JOIN", err.to_string()))?
}

pub async fn verify_password(hash: &str, password: &str) -> AppResult<bool> {
    let hash = hash.to_owned();
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|err| AppError::new("AUTH_HASH/CORRUPT", err.to_string()))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|err| AppError::new("RUNTIME/JOIN", err.to_string()))?
}

/// Sign a token for `user` issued at `issued_at` (seconds since the epoch).
pub fn issue_token_at(settings: &AuthSettings, user: &User, issued_at: i64) -> AppResult<(String, i64)> {
    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        username: user.username.clone(),
        iat: issued_at,
        exp: issued_at + settings.token_ttl_secs,
    };
    let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &settings.encoding)
        .map_err(|err| AppError::new("AUTH_TOKEN/ENCODE", err.to_string()))?;
    Ok((token, claims.exp * 1000))
}

pub fn issue_token(settings: &AuthSettings, user: &User) -> AppResult<(String, i64)> {
    issue_token_at(settings, user, now_ms() / 1000)
}

pub fn decode_token(settings: &AuthSettings, token: &str) -> AppResult<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    jsonwebtoken::decode::<Claims>(token, &settings.decoding, &validation)
        .map(|data| data.claims)
        .map_err(|err| {
            AppError::unauthorized("Your session is invalid or has expired.")
                .with_context("reason", err.to_string())
        })
}

async fn taken_code(pool: &SqlitePool, email: &str, username: &str) -> AppResult<Option<&'static str>> {
    let email_taken: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    if email_taken.is_some() {
        return Ok(Some(EMAIL_TAKEN));
    }
    let username_taken: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM users WHERE lower(username) = lower(?)")
            .bind(username)
            .fetch_optional(pool)
            .await?;
    Ok(username_taken.map(|_| USERNAME_TAKEN))
}

fn conflict(code: &'static str) -> AppError {
    match code {
        EMAIL_TAKEN => AppError::new(EMAIL_TAKEN, "An account with this email already exists."),
        _ => AppError::new(USERNAME_TAKEN, "This username is already taken."),
    }
}

pub async fn register(
    pool: &SqlitePool,
    settings: &AuthSettings,
    input: RegisterInput,
) -> AppResult<AuthResponse> {
    let email = input.email.trim().to_ascii_lowercase();
    let username = input.username.trim().to_string();
    validate_email(&email)?;
    validate_username(&username)?;
    validate_password(&input.password)?;

    if let Some(code) = taken_code(pool, &email, &username).await? {
        return Err(conflict(code));
    }

    let password_hash = hash_password(settings, &input.password).await?;
    let id = new_uuid_v7();
    let now = now_ms();
    let display_name = input
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&username)
        .to_string();

    let inserted = sqlx::query(
        "INSERT INTO users (id, email, username, password_hash, display_name, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&email)
    .bind(&username)
    .bind(&password_hash)
    .bind(&display_name)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await;

    if let Err(err) = inserted {
        let app_err = AppError::from(err);
        // A concurrent registration can still win the unique index race.
        if app_err.code() == "Sqlite/2067" {
            let code = if app_err.message().contains("users.email") {
                EMAIL_TAKEN
            } else {
                USERNAME_TAKEN
            };
            return Err(conflict(code));
        }
        return Err(app_err);
    }

    let user = users::get_user(pool, &id).await?;
    let (access_token, expires_at) = issue_token(settings, &user)?;
    info!(target: "kamehouse", event = "user_registered", user_id = %user.id);
    Ok(AuthResponse {
        access_token,
        token_type: "Bearer",
        expires_at,
        user,
    })
}

pub async fn login(
    pool: &SqlitePool,
    settings: &AuthSettings,
    input: LoginInput,
) -> AppResult<AuthResponse> {
    let email = input.email.trim().to_ascii_lowercase();
    let invalid = || AppError::new(INVALID_CREDENTIALS, "Invalid email or password.");

    let sql = format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = ?");
    let row = sqlx::query(&sql)
        .bind(&email)
        .fetch_optional(pool)
        .await?
        .ok_or_else(invalid)?;
    let password_hash: String = row.try_get("password_hash")?;
    if !verify_password(&password_hash, &input.password).await? {
        return Err(invalid());
    }

    let user = User::try_from(&row)?;
    let (access_token, expires_at) = issue_token(settings, &user)?;
    info!(target: "kamehouse", event = "user_login", user_id = %user.id);
    Ok(AuthResponse {
        access_token,
        token_type: "Bearer",
        expires_at,
        user,
    })
}

fn bearer_token(parts: &Parts) -> AppResult<&str> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::unauthorized("Missing bearer token."))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Malformed authorization header."))?;
    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Malformed authorization header."))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AppError::unauthorized("Missing bearer token."));
    }
    Ok(token.trim())
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = decode_token(&state.auth, token)?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
            .bind(&claims.sub)
            .fetch_optional(&state.pool)
            .await?;
        if exists.is_none() {
            return Err(AppError::unauthorized("This account no longer exists."));
        }

        Ok(AuthUser {
            id: claims.sub,
            email: claims.email,
            username: claims.username,
        })
    }
}

pub async fn register_handler(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<RegisterInput>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    let response = register(&state.pool, &state.auth, input).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn login_handler(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<LoginInput>,
) -> AppResult<Json<AuthResponse>> {
    Ok(Json(login(&state.pool, &state.auth, input).await?))
}
