use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{fetch_user, find_user_by_identifier, verify_session};
use crate::boards::{fetch_board, fetch_board_for_update};
use crate::calendar::{fetch_tag, fetch_tag_for_update};
use crate::error::ApiError;
use crate::models::{Invite, InviteStatus, ItemType, Role};
use crate::sharing::{add_grant, board_role, check_pending, require_role, tag_role};
use crate::AppState;

async fn fetch_invite(db: &PgPool, invite_id: Uuid) -> Result<Option<Invite>, ApiError> {
    let row = sqlx::query("SELECT * FROM invites WHERE id = $1")
        .bind(invite_id)
        .fetch_optional(db)
        .await?;
    match row {
        Some(row) => Ok(Some(Invite::from_row(&row)?)),
        None => Ok(None),
    }
}

fn invite_json(invite: &Invite) -> serde_json::Value {
    json!({
        "id": invite.id,
        "type": invite.item_type,
        "itemId": invite.item_id,
        "itemName": invite.item_name,
        "senderId": invite.sender_id,
        "senderName": invite.sender_name,
        "role": invite.role,
        "createdAt": invite.created_at,
    })
}

pub async fn list_invites(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let rows = sqlx::query(
        "SELECT * FROM invites WHERE recipient_id = $1 AND status = 'pending' ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await?;

    let mut invites = Vec::with_capacity(rows.len());
    for row in &rows {
        invites.push(invite_json(&Invite::from_row(row)?));
    }
    Ok(Json(invites))
}

#[derive(Deserialize)]
pub struct CreateInviteRequest {
    #[serde(rename = "type")]
    item_type: ItemType,
    #[serde(rename = "itemId")]
    item_id: Uuid,
    identifier: String,
    role: Option<String>,
}

pub async fn create_invite(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateInviteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let role = match req.role.as_deref() {
        None => None,
        Some(value) => Some(
            Role::parse_grantable(value)
                .ok_or_else(|| ApiError::InvalidInput("Role must be editor or viewer".into()))?,
        ),
    };

    // The sender must hold write access over the item being shared, and the
    // item's display name is captured now; later renames do not rewrite
    // pending invite text.
    let item_name = match req.item_type {
        ItemType::Board => {
            let board = fetch_board(&state.db, req.item_id)
                .await?
                .ok_or(ApiError::NotFound("Board not found"))?;
            require_role(board_role(&board, user_id), Role::Editor)?;
            board.title
        }
        ItemType::Tag => {
            let tag = fetch_tag(&state.db, req.item_id)
                .await?
                .ok_or(ApiError::NotFound("Tag not found"))?;
            require_role(tag_role(&tag, user_id), Role::Editor)?;
            tag.name
        }
    };

    let recipient = find_user_by_identifier(&state.db, &req.identifier)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;
    let sender = fetch_user(&state.db, user_id)
        .await?
        .ok_or(ApiError::NotFound("Sender not found"))?;

    if recipient.id == sender.id {
        return Err(ApiError::InvalidInput("Cannot invite yourself".into()));
    }

    let invite_id: Uuid = sqlx::query_scalar(
        "INSERT INTO invites (item_type, item_id, item_name, sender_id, sender_name, recipient_id, role)
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
    )
    .bind(req.item_type.as_str())
    .bind(req.item_id)
    .bind(&item_name)
    .bind(sender.id)
    .bind(&sender.username)
    .bind(recipient.id)
    .bind(role.map(|r| match r {
        Role::Viewer => "viewer",
        _ => "editor",
    }))
    .fetch_one(&state.db)
    .await?;

    Ok(Json(json!({ "ok": true, "inviteId": invite_id })))
}

pub async fn accept_invite(
    headers: HeaderMap,
    Path(invite_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    let invite = fetch_invite(&state.db, invite_id)
        .await?
        .ok_or(ApiError::NotFound("Invite not found"))?;

    if invite.recipient_id != user_id {
        return Err(ApiError::Forbidden("Not your invite"));
    }
    check_pending(invite.status)?;

    // Grant first, then mark the invite resolved. If the grant commit lands
    // and the status write does not, a retried accept re-applies an
    // add-if-absent no-op, so the pair is safe without spanning one
    // transaction. The item row is locked so a concurrent direct share
    // cannot interleave with the write-back.
    let role = invite.role.unwrap_or(Role::Editor);
    let mut tx = state.db.begin().await?;
    match invite.item_type {
        ItemType::Board => {
            let mut board = fetch_board_for_update(&mut tx, invite.item_id)
                .await?
                .ok_or(ApiError::NotFound("Board not found"))?;
            if invite.recipient_id != board.owner_id
                && add_grant(&mut board.members, invite.recipient_id, role)
            {
                sqlx::query("UPDATE boards SET members = $1, updated_at = NOW() WHERE id = $2")
                    .bind(serde_json::to_value(&board.members)?)
                    .bind(board.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        ItemType::Tag => {
            let mut tag = fetch_tag_for_update(&mut tx, invite.item_id)
                .await?
                .ok_or(ApiError::NotFound("Tag not found"))?;
            if invite.recipient_id != tag.owner_id
                && add_grant(&mut tag.shared_with, invite.recipient_id, role)
            {
                sqlx::query("UPDATE tags SET shared_with = $1 WHERE id = $2")
                    .bind(serde_json::to_value(&tag.shared_with)?)
                    .bind(tag.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
    }
    tx.commit().await?;

    sqlx::query("UPDATE invites SET status = $1 WHERE id = $2")
        .bind(InviteStatus::Accepted.as_str())
        .bind(invite_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

pub async fn reject_invite(
    headers: HeaderMap,
    Path(invite_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    let invite = fetch_invite(&state.db, invite_id)
        .await?
        .ok_or(ApiError::NotFound("Invite not found"))?;

    if invite.recipient_id != user_id {
        return Err(ApiError::Forbidden("Not your invite"));
    }
    check_pending(invite.status)?;

    sqlx::query("UPDATE invites SET status = $1 WHERE id = $2")
        .bind(InviteStatus::Rejected.as_str())
        .bind(invite_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}
