use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{find_user_by_identifier, verify_session};
use crate::error::{unique_conflict, ApiError};
use crate::models::{Board, Role};
use crate::sharing::{add_grant, board_role, member_filter, remove_grant, require_owner, require_role};
use crate::utils::{validate_input_string, validate_slug};
use crate::AppState;

pub async fn fetch_board(db: &PgPool, board_id: Uuid) -> Result<Option<Board>, ApiError> {
    let row = sqlx::query("SELECT * FROM boards WHERE id = $1")
        .bind(board_id)
        .fetch_optional(db)
        .await?;
    match row {
        Some(row) => Ok(Some(Board::from_row(&row)?)),
        None => Ok(None),
    }
}

/// Locks the board row for the rest of the transaction. Every members
/// mutation goes through this, so concurrent grant/revoke requests
/// serialize on the row instead of overwriting each other's list.
pub async fn fetch_board_for_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    board_id: Uuid,
) -> Result<Option<Board>, ApiError> {
    let row = sqlx::query("SELECT * FROM boards WHERE id = $1 FOR UPDATE")
        .bind(board_id)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(row) => Ok(Some(Board::from_row(&row)?)),
        None => Ok(None),
    }
}

fn board_json(board: &Board) -> serde_json::Value {
    json!({
        "id": board.id,
        "slug": board.slug,
        "title": board.title,
        "ownerId": board.owner_id,
        "members": board.members,
        "columns": board.columns,
    })
}

pub async fn list_boards(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let rows = sqlx::query(
        "SELECT * FROM boards WHERE owner_id = $1 OR members @> $2 ORDER BY updated_at DESC",
    )
    .bind(user_id)
    .bind(member_filter(user_id))
    .fetch_all(&state.db)
    .await?;

    let mut boards = Vec::with_capacity(rows.len());
    for row in &rows {
        boards.push(board_json(&Board::from_row(row)?));
    }
    Ok(Json(boards))
}

#[derive(Deserialize)]
pub struct CreateBoardRequest {
    title: String,
    slug: String,
}

pub async fn create_board(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateBoardRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    if req.title.trim().is_empty() || req.slug.trim().is_empty() {
        return Err(ApiError::InvalidInput("Missing title or slug".into()));
    }
    validate_input_string(&req.title, 200)?;
    validate_slug(req.slug.trim())?;

    // The creator becomes the immutable owner; the members list starts empty
    // because owner authority is derived from owner_id, never a member row.
    let row = sqlx::query(
        "INSERT INTO boards (title, slug, owner_id) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(req.title.trim())
    .bind(req.slug.trim())
    .bind(user_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| unique_conflict(e, "Slug already in use"))?;

    Ok(Json(board_json(&Board::from_row(&row)?)))
}

#[derive(Deserialize)]
pub struct UpdateBoardRequest {
    title: String,
    slug: String,
    columns: serde_json::Value,
}

pub async fn update_board(
    headers: HeaderMap,
    Path(board_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<UpdateBoardRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    let board = fetch_board(&state.db, board_id)
        .await?
        .ok_or(ApiError::NotFound("Board not found"))?;
    require_role(board_role(&board, user_id), Role::Editor)?;

    if req.title.trim().is_empty() || req.slug.trim().is_empty() || !req.columns.is_array() {
        return Err(ApiError::InvalidInput("Invalid payload".into()));
    }
    validate_input_string(&req.title, 200)?;
    validate_slug(req.slug.trim())?;

    let row = sqlx::query(
        "UPDATE boards SET title = $1, slug = $2, columns = $3, updated_at = NOW() WHERE id = $4 RETURNING *",
    )
    .bind(req.title.trim())
    .bind(req.slug.trim())
    .bind(&req.columns)
    .bind(board_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| unique_conflict(e, "Slug already in use"))?;

    Ok(Json(board_json(&Board::from_row(&row)?)))
}

pub async fn delete_board(
    headers: HeaderMap,
    Path(board_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    let board = fetch_board(&state.db, board_id)
        .await?
        .ok_or(ApiError::NotFound("Board not found"))?;
    require_owner(board_role(&board, user_id))?;

    // Member links live inside the board document and vanish with it.
    sqlx::query("DELETE FROM boards WHERE id = $1")
        .bind(board_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    identifier: String,
    role: String,
}

pub async fn add_member(
    headers: HeaderMap,
    Path(board_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let role = Role::parse_grantable(&req.role)
        .ok_or_else(|| ApiError::InvalidInput("Role must be editor or viewer".into()))?;

    let member = find_user_by_identifier(&state.db, &req.identifier)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;

    let mut tx = state.db.begin().await?;
    let mut board = fetch_board_for_update(&mut tx, board_id)
        .await?
        .ok_or(ApiError::NotFound("Board not found"))?;
    require_role(board_role(&board, user_id), Role::Editor)?;

    if member.id == board.owner_id {
        return Err(ApiError::InvalidInput(
            "The owner is already on this board".into(),
        ));
    }

    if add_grant(&mut board.members, member.id, role) {
        sqlx::query("UPDATE boards SET members = $1, updated_at = NOW() WHERE id = $2")
            .bind(serde_json::to_value(&board.members)?)
            .bind(board_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(Json(json!({ "ok": true })))
}

pub async fn remove_member(
    headers: HeaderMap,
    Path((board_id, member_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let mut tx = state.db.begin().await?;
    let mut board = fetch_board_for_update(&mut tx, board_id)
        .await?
        .ok_or(ApiError::NotFound("Board not found"))?;
    require_owner(board_role(&board, user_id))?;

    if remove_grant(&mut board.members, member_id) {
        sqlx::query("UPDATE boards SET members = $1, updated_at = NOW() WHERE id = $2")
            .bind(serde_json::to_value(&board.members)?)
            .bind(board_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(Json(json!({ "ok": true })))
}
