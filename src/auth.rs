use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cascade::delete_user_cascade;
use crate::crypto::{hash_password, verify_password};
use crate::error::{unique_conflict, ApiError};
use crate::models::User;
use crate::utils::{normalize_email, validate_input_string, validate_username};
use crate::AppState;

/// Opaque bearer token -> user id. Sessions are process-local; restarting the
/// server logs everyone out.
pub type Sessions = Arc<RwLock<HashMap<String, Uuid>>>;

pub async fn create_session(user_id: Uuid, sessions: &Sessions) -> String {
    let token = Uuid::new_v4().to_string();
    sessions.write().await.insert(token.clone(), user_id);
    token
}

pub async fn verify_session(headers: &HeaderMap, sessions: &Sessions) -> Result<Uuid, ApiError> {
    let token = extract_bearer(headers).ok_or(ApiError::Unauthorized)?;
    let sessions_read = sessions.read().await;
    sessions_read
        .get(&token)
        .copied()
        .ok_or(ApiError::Unauthorized)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

/// Resolves a human-entered identifier to a user. Exact lowercased email
/// first, then exact username; first match wins.
pub async fn find_user_by_identifier(
    db: &PgPool,
    identifier: &str,
) -> Result<Option<User>, ApiError> {
    let by_email = sqlx::query("SELECT * FROM users WHERE email = $1")
        .bind(identifier.trim().to_lowercase())
        .fetch_optional(db)
        .await?;
    if let Some(row) = by_email {
        return Ok(Some(User::from_row(&row)?));
    }

    let by_username = sqlx::query("SELECT * FROM users WHERE username = $1")
        .bind(identifier.trim())
        .fetch_optional(db)
        .await?;
    match by_username {
        Some(row) => Ok(Some(User::from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn fetch_user(db: &PgPool, user_id: Uuid) -> Result<Option<User>, ApiError> {
    let row = sqlx::query("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(db)
        .await?;
    match row {
        Some(row) => Ok(Some(User::from_row(&row)?)),
        None => Ok(None),
    }
}

fn user_json(user: &User) -> serde_json::Value {
    json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
        "profileImage": user.profile_image,
    })
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_username(&req.username)?;
    let email = normalize_email(&req.email)?;
    if req.password.len() < 6 {
        return Err(ApiError::InvalidInput("Password too short (min 6)".into()));
    }
    validate_input_string(&req.password, 200)?;

    let password_hash = hash_password(&req.password).await?;

    // The unique indexes are the real guard; these pre-checks only exist to
    // answer with a precise message.
    let email_taken = sqlx::query("SELECT id FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.db)
        .await?;
    if email_taken.is_some() {
        return Err(ApiError::Conflict("Email already used"));
    }
    let username_taken = sqlx::query("SELECT id FROM users WHERE username = $1")
        .bind(&req.username)
        .fetch_optional(&state.db)
        .await?;
    if username_taken.is_some() {
        return Err(ApiError::Conflict("Username already used"));
    }

    let user_id: Uuid = sqlx::query_scalar(
        "INSERT INTO users (username, email, password_hash) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(&req.username)
    .bind(&email)
    .bind(&password_hash)
    .fetch_one(&state.db)
    .await
    .map_err(|e| unique_conflict(e, "Username or email already used"))?;

    let token = create_session(user_id, &state.sessions).await;
    Ok(Json(json!({ "token": token })))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    identifier: String,
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Verify against a dummy hash when the user does not exist so the
    // response time does not leak which identifiers are registered.
    let dummy_hash = "$2b$12$dummy.hash.for.timing.protection.with.enough.length.here.ok";

    let user = find_user_by_identifier(&state.db, &req.identifier).await?;
    let hash = user
        .as_ref()
        .map(|u| u.password_hash.clone())
        .unwrap_or_else(|| dummy_hash.to_string());

    let password_valid = verify_password(&req.password, &hash).await.unwrap_or(false);

    match user {
        Some(user) if password_valid => {
            let token = create_session(user.id, &state.sessions).await;
            Ok(Json(json!({ "token": token })))
        }
        _ => Err(ApiError::Unauthorized),
    }
}

pub async fn logout(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_session(&headers, &state.sessions).await?;
    if let Some(token) = extract_bearer(&headers) {
        state.sessions.write().await.remove(&token);
    }
    Ok(Json(json!({ "ok": true })))
}

pub async fn get_me(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    let user = fetch_user(&state.db, user_id)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok(Json(user_json(&user)))
}

#[derive(Deserialize)]
pub struct UpdateMeRequest {
    username: Option<String>,
    email: Option<String>,
    #[serde(rename = "profileImage")]
    profile_image: Option<String>,
}

pub async fn update_me(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UpdateMeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    let mut user = fetch_user(&state.db, user_id)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;

    let mut changed = false;

    if let Some(username) = req.username.as_deref().map(str::trim) {
        if !username.is_empty() && username != user.username {
            validate_username(username)?;
            let taken = sqlx::query("SELECT id FROM users WHERE username = $1 AND id <> $2")
                .bind(username)
                .bind(user_id)
                .fetch_optional(&state.db)
                .await?;
            if taken.is_some() {
                return Err(ApiError::Conflict("Username already used"));
            }
            user.username = username.to_string();
            changed = true;
        }
    }

    if let Some(email) = req.email.as_deref() {
        if !email.trim().is_empty() {
            let email = normalize_email(email)?;
            if email != user.email {
                let taken = sqlx::query("SELECT id FROM users WHERE email = $1 AND id <> $2")
                    .bind(&email)
                    .bind(user_id)
                    .fetch_optional(&state.db)
                    .await?;
                if taken.is_some() {
                    return Err(ApiError::Conflict("Email already used"));
                }
                user.email = email;
                changed = true;
            }
        }
    }

    if let Some(profile_image) = req.profile_image {
        validate_input_string(&profile_image, 2000)?;
        user.profile_image = Some(profile_image);
        changed = true;
    }

    if !changed {
        return Err(ApiError::InvalidInput("No valid fields to update".into()));
    }

    sqlx::query("UPDATE users SET username = $1, email = $2, profile_image = $3 WHERE id = $4")
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.profile_image)
        .bind(user_id)
        .execute(&state.db)
        .await
        .map_err(|e| unique_conflict(e, "Username or email already used"))?;

    Ok(Json(user_json(&user)))
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(rename = "oldPassword")]
    old_password: String,
    #[serde(rename = "newPassword")]
    new_password: String,
}

pub async fn change_password(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    if req.new_password.len() < 6 {
        return Err(ApiError::InvalidInput(
            "New password too short (min 6)".into(),
        ));
    }

    let user = fetch_user(&state.db, user_id)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;

    let ok = verify_password(&req.old_password, &user.password_hash)
        .await
        .unwrap_or(false);
    if !ok {
        return Err(ApiError::Unauthorized);
    }

    let password_hash = hash_password(&req.new_password).await?;
    sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
        .bind(&password_hash)
        .bind(user_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

/// Full account deletion: run the ordered cascade, then drop every live
/// session for the user.
pub async fn delete_me(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    delete_user_cascade(&state.db, user_id).await?;

    let mut sessions = state.sessions.write().await;
    sessions.retain(|_, session_user| *session_user != user_id);

    Ok(Json(json!({ "ok": true })))
}
