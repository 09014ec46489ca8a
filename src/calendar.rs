use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::auth::{find_user_by_identifier, verify_session};
use crate::cascade::detach_events_for_tags;
use crate::error::ApiError;
use crate::models::{Role, Tag};
use crate::sharing::{
    add_grant, bare_filter, member_filter, remove_grant, require_owner, require_role, tag_role,
};
use crate::utils::validate_input_string;
use crate::AppState;

pub async fn fetch_tag(db: &PgPool, tag_id: Uuid) -> Result<Option<Tag>, ApiError> {
    let row = sqlx::query("SELECT * FROM tags WHERE id = $1")
        .bind(tag_id)
        .fetch_optional(db)
        .await?;
    match row {
        Some(row) => Ok(Some(Tag::from_row(&row)?)),
        None => Ok(None),
    }
}

/// Locks the tag row for the rest of the transaction, serializing
/// concurrent shared_with mutations the same way board members are.
pub async fn fetch_tag_for_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    tag_id: Uuid,
) -> Result<Option<Tag>, ApiError> {
    let row = sqlx::query("SELECT * FROM tags WHERE id = $1 FOR UPDATE")
        .bind(tag_id)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(row) => Ok(Some(Tag::from_row(&row)?)),
        None => Ok(None),
    }
}

fn tag_json(tag: &Tag) -> serde_json::Value {
    json!({
        "id": tag.id,
        "name": tag.name,
        "color": tag.color,
        "visible": tag.visible,
        "ownerId": tag.owner_id,
        "sharedWith": tag.shared_with,
    })
}

fn event_json(row: &PgRow) -> Result<serde_json::Value, ApiError> {
    Ok(json!({
        "id": row.try_get::<Uuid, _>("id")?,
        "title": row.try_get::<String, _>("title")?,
        "datetime": row.try_get::<DateTime<Utc>, _>("start_at")?,
        "endDatetime": row.try_get::<Option<DateTime<Utc>>, _>("end_at")?,
        "type": row.try_get::<String, _>("kind")?,
        "description": row.try_get::<String, _>("description")?,
        "tag": row.try_get::<Option<Uuid>, _>("tag_id")?,
        "allDay": row.try_get::<bool, _>("all_day")?,
    }))
}

pub async fn list_tags(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let rows = sqlx::query(
        "SELECT * FROM tags WHERE owner_id = $1 OR shared_with @> $2 OR shared_with @> $3",
    )
    .bind(user_id)
    .bind(member_filter(user_id))
    .bind(bare_filter(user_id))
    .fetch_all(&state.db)
    .await?;

    let mut tags = Vec::with_capacity(rows.len());
    for row in &rows {
        tags.push(tag_json(&Tag::from_row(row)?));
    }
    Ok(Json(tags))
}

#[derive(Deserialize)]
pub struct CreateTagRequest {
    name: String,
    color: String,
}

pub async fn create_tag(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateTagRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    if req.name.trim().is_empty() || req.color.trim().is_empty() {
        return Err(ApiError::InvalidInput("Missing name or color".into()));
    }
    validate_input_string(&req.name, 100)?;
    validate_input_string(&req.color, 30)?;

    let row = sqlx::query("INSERT INTO tags (name, color, owner_id) VALUES ($1, $2, $3) RETURNING *")
        .bind(req.name.trim())
        .bind(req.color.trim())
        .bind(user_id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(tag_json(&Tag::from_row(&row)?)))
}

#[derive(Deserialize)]
pub struct UpdateTagRequest {
    name: Option<String>,
    color: Option<String>,
    visible: Option<bool>,
}

pub async fn update_tag(
    headers: HeaderMap,
    Path(tag_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<UpdateTagRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    let mut tag = fetch_tag(&state.db, tag_id)
        .await?
        .ok_or(ApiError::NotFound("Tag not found"))?;
    require_role(tag_role(&tag, user_id), Role::Editor)?;

    if let Some(name) = req.name.as_deref().map(str::trim) {
        if !name.is_empty() {
            validate_input_string(name, 100)?;
            tag.name = name.to_string();
        }
    }
    if let Some(color) = req.color.as_deref().map(str::trim) {
        if !color.is_empty() {
            validate_input_string(color, 30)?;
            tag.color = color.to_string();
        }
    }
    if let Some(visible) = req.visible {
        tag.visible = visible;
    }

    sqlx::query("UPDATE tags SET name = $1, color = $2, visible = $3 WHERE id = $4")
        .bind(&tag.name)
        .bind(&tag.color)
        .bind(tag.visible)
        .bind(tag_id)
        .execute(&state.db)
        .await?;

    Ok(Json(tag_json(&tag)))
}

pub async fn delete_tag(
    headers: HeaderMap,
    Path(tag_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;
    let tag = fetch_tag(&state.db, tag_id)
        .await?
        .ok_or(ApiError::NotFound("Tag not found"))?;
    require_owner(tag_role(&tag, user_id))?;

    // Detach first: events referencing this tag survive with the reference
    // cleared, they are never deleted alongside it.
    detach_events_for_tags(&state.db, &[tag_id]).await?;
    sqlx::query("DELETE FROM tags WHERE id = $1")
        .bind(tag_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct ShareTagRequest {
    identifier: String,
    role: Option<String>,
}

pub async fn share_tag(
    headers: HeaderMap,
    Path(tag_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<ShareTagRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let role = match req.role.as_deref() {
        None => Role::Editor,
        Some(value) => Role::parse_grantable(value)
            .ok_or_else(|| ApiError::InvalidInput("Role must be editor or viewer".into()))?,
    };

    let grantee = find_user_by_identifier(&state.db, &req.identifier)
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;

    let mut tx = state.db.begin().await?;
    let mut tag = fetch_tag_for_update(&mut tx, tag_id)
        .await?
        .ok_or(ApiError::NotFound("Tag not found"))?;
    require_role(tag_role(&tag, user_id), Role::Editor)?;

    if grantee.id == tag.owner_id {
        return Err(ApiError::InvalidInput(
            "The owner already has access to this tag".into(),
        ));
    }

    if add_grant(&mut tag.shared_with, grantee.id, role) {
        sqlx::query("UPDATE tags SET shared_with = $1 WHERE id = $2")
            .bind(serde_json::to_value(&tag.shared_with)?)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(Json(json!({ "ok": true })))
}

pub async fn unshare_tag(
    headers: HeaderMap,
    Path((tag_id, grantee_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let mut tx = state.db.begin().await?;
    let mut tag = fetch_tag_for_update(&mut tx, tag_id)
        .await?
        .ok_or(ApiError::NotFound("Tag not found"))?;
    require_owner(tag_role(&tag, user_id))?;

    // The normalized write-back also prunes any legacy bare-id entry for the
    // same user, so neither stored shape can linger.
    if remove_grant(&mut tag.shared_with, grantee_id) {
        sqlx::query("UPDATE tags SET shared_with = $1 WHERE id = $2")
            .bind(serde_json::to_value(&tag.shared_with)?)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(Json(json!({ "ok": true })))
}

pub async fn list_events(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    // Anyone with access to a tag sees the events carrying it, including the
    // tag's owner when someone else authored the event.
    let tag_rows = sqlx::query(
        "SELECT id FROM tags WHERE owner_id = $1 OR shared_with @> $2 OR shared_with @> $3",
    )
    .bind(user_id)
    .bind(member_filter(user_id))
    .bind(bare_filter(user_id))
    .fetch_all(&state.db)
    .await?;
    let accessible_tags: Vec<Uuid> = tag_rows
        .iter()
        .map(|row| row.try_get("id"))
        .collect::<Result<_, _>>()?;

    let rows = sqlx::query(
        "SELECT * FROM events WHERE user_id = $1 OR tag_id = ANY($2) ORDER BY start_at ASC",
    )
    .bind(user_id)
    .bind(&accessible_tags)
    .fetch_all(&state.db)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in &rows {
        events.push(event_json(row)?);
    }
    Ok(Json(events))
}

#[derive(Deserialize)]
pub struct CreateEventRequest {
    title: String,
    datetime: DateTime<Utc>,
    #[serde(rename = "endDatetime")]
    end_datetime: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    kind: String,
    description: Option<String>,
    tag: Option<Uuid>,
    #[serde(rename = "allDay")]
    all_day: Option<bool>,
}

pub async fn create_event(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateEventRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    if req.title.trim().is_empty() || req.kind.trim().is_empty() {
        return Err(ApiError::InvalidInput("Missing title or type".into()));
    }
    validate_input_string(&req.title, 200)?;
    validate_input_string(&req.kind, 50)?;
    let description = req.description.unwrap_or_default();
    validate_input_string(&description, 5000)?;

    let row = sqlx::query(
        "INSERT INTO events (user_id, title, kind, description, start_at, end_at, all_day, tag_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
    )
    .bind(user_id)
    .bind(req.title.trim())
    .bind(req.kind.trim())
    .bind(&description)
    .bind(req.datetime)
    .bind(req.end_datetime)
    .bind(req.all_day.unwrap_or(false))
    .bind(req.tag)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(event_json(&row)?))
}

#[derive(Deserialize)]
pub struct UpdateEventRequest {
    title: Option<String>,
    datetime: Option<DateTime<Utc>>,
    // Double options distinguish "field absent" from an explicit null that
    // clears the value.
    #[serde(
        rename = "endDatetime",
        default,
        deserialize_with = "crate::utils::deserialize_some"
    )]
    end_datetime: Option<Option<DateTime<Utc>>>,
    #[serde(rename = "type")]
    kind: Option<String>,
    description: Option<String>,
    #[serde(default, deserialize_with = "crate::utils::deserialize_some")]
    tag: Option<Option<Uuid>>,
    #[serde(rename = "allDay")]
    all_day: Option<bool>,
}

pub async fn update_event(
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<UpdateEventRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let existing = sqlx::query("SELECT * FROM events WHERE id = $1")
        .bind(event_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(ApiError::NotFound("Event not found"))?;
    let owner: Uuid = existing.try_get("user_id")?;
    if owner != user_id {
        return Err(ApiError::Forbidden("Not your event"));
    }

    let title = match req.title.as_deref().map(str::trim) {
        Some(title) if !title.is_empty() => {
            validate_input_string(title, 200)?;
            title.to_string()
        }
        _ => existing.try_get("title")?,
    };
    let kind = match req.kind.as_deref().map(str::trim) {
        Some(kind) if !kind.is_empty() => {
            validate_input_string(kind, 50)?;
            kind.to_string()
        }
        _ => existing.try_get("kind")?,
    };
    let description = match req.description {
        Some(description) => {
            validate_input_string(&description, 5000)?;
            description
        }
        None => existing.try_get("description")?,
    };
    let start_at = req
        .datetime
        .unwrap_or(existing.try_get::<DateTime<Utc>, _>("start_at")?);
    let end_at = match req.end_datetime {
        Some(value) => value,
        None => existing.try_get("end_at")?,
    };
    let tag_id = match req.tag {
        Some(value) => value,
        None => existing.try_get("tag_id")?,
    };
    let all_day = req.all_day.unwrap_or(existing.try_get("all_day")?);

    let row = sqlx::query(
        "UPDATE events SET title = $1, kind = $2, description = $3, start_at = $4, end_at = $5,
         tag_id = $6, all_day = $7 WHERE id = $8 RETURNING *",
    )
    .bind(&title)
    .bind(&kind)
    .bind(&description)
    .bind(start_at)
    .bind(end_at)
    .bind(tag_id)
    .bind(all_day)
    .bind(event_id)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(event_json(&row)?))
}

pub async fn delete_event(
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let existing = sqlx::query("SELECT user_id FROM events WHERE id = $1")
        .bind(event_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(ApiError::NotFound("Event not found"))?;
    let owner: Uuid = existing.try_get("user_id")?;
    if owner != user_id {
        return Err(ApiError::Forbidden("Not your event"));
    }

    sqlx::query("DELETE FROM events WHERE id = $1")
        .bind(event_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}
