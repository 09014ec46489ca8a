use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::auth::verify_session;
use crate::error::ApiError;
use crate::utils::validate_input_string;
use crate::AppState;

/// Notice windows the client derives notifications from. The discriminator
/// suffix makes the notification id stable per (event, window) pair, so a
/// re-sync upserts instead of duplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Event starts within 30 minutes.
    Warning,
    /// Event starts within 7 days.
    Info,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Warning => "warning",
            Urgency::Info => "info",
        }
    }

    pub fn parse(value: &str) -> Option<Urgency> {
        match value {
            "warning" => Some(Urgency::Warning),
            "info" => Some(Urgency::Info),
            _ => None,
        }
    }

    fn id_suffix(self) -> &'static str {
        match self {
            Urgency::Warning => "-30min",
            Urgency::Info => "-7days",
        }
    }
}

/// Stable notification id for an event and notice window.
pub fn notice_id(event_id: Uuid, urgency: Urgency) -> String {
    format!("{}{}", event_id, urgency.id_suffix())
}

fn notification_json(row: &PgRow) -> Result<serde_json::Value, ApiError> {
    Ok(json!({
        "id": row.try_get::<String, _>("id")?,
        "eventId": row.try_get::<Uuid, _>("event_id")?,
        "title": row.try_get::<String, _>("title")?,
        "message": row.try_get::<String, _>("message")?,
        "datetime": row.try_get::<DateTime<Utc>, _>("datetime")?,
        "type": row.try_get::<String, _>("urgency")?,
        "read": row.try_get::<bool, _>("read")?,
        "createdAt": row.try_get::<DateTime<Utc>, _>("created_at")?,
    }))
}

pub async fn list_notifications(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let rows =
        sqlx::query("SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC")
            .bind(user_id)
            .fetch_all(&state.db)
            .await?;

    let mut notifications = Vec::with_capacity(rows.len());
    for row in &rows {
        notifications.push(notification_json(row)?);
    }
    Ok(Json(notifications))
}

pub async fn mark_read(
    headers: HeaderMap,
    Path(notification_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    sqlx::query("UPDATE notifications SET read = TRUE WHERE user_id = $1 AND id = $2")
        .bind(user_id)
        .bind(&notification_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

pub async fn mark_all_read(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    sqlx::query("UPDATE notifications SET read = TRUE WHERE user_id = $1 AND read = FALSE")
        .bind(user_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

pub async fn delete_notification(
    headers: HeaderMap,
    Path(notification_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    sqlx::query("DELETE FROM notifications WHERE user_id = $1 AND id = $2")
        .bind(user_id)
        .bind(&notification_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

pub async fn delete_all_notifications(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    sqlx::query("DELETE FROM notifications WHERE user_id = $1")
        .bind(user_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct SyncedNotification {
    id: String,
    #[serde(rename = "eventId")]
    event_id: Uuid,
    title: String,
    message: String,
    datetime: DateTime<Utc>,
    #[serde(rename = "type")]
    urgency: String,
    read: bool,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct SyncRequest {
    notifications: Vec<SyncedNotification>,
}

/// Notifications are derived, regenerable state: the client recomputes its
/// set from upcoming events and replaces the stored set wholesale.
pub async fn sync_notifications(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    for notification in &req.notifications {
        let urgency = Urgency::parse(&notification.urgency).ok_or_else(|| {
            ApiError::InvalidInput("Notification type must be warning or info".into())
        })?;
        if notification.id != notice_id(notification.event_id, urgency) {
            return Err(ApiError::InvalidInput(
                "Notification id does not match its event and notice window".into(),
            ));
        }
        validate_input_string(&notification.title, 200)?;
        validate_input_string(&notification.message, 1000)?;
    }

    sqlx::query("DELETE FROM notifications WHERE user_id = $1")
        .bind(user_id)
        .execute(&state.db)
        .await?;

    for notification in &req.notifications {
        sqlx::query(
            "INSERT INTO notifications (user_id, id, event_id, title, message, datetime, urgency, read, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (user_id, id) DO NOTHING",
        )
        .bind(user_id)
        .bind(&notification.id)
        .bind(notification.event_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.datetime)
        .bind(&notification.urgency)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&state.db)
        .await?;
    }

    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_ids_carry_the_window_discriminator() {
        let event_id = Uuid::new_v4();
        assert_eq!(
            notice_id(event_id, Urgency::Warning),
            format!("{}-30min", event_id)
        );
        assert_eq!(
            notice_id(event_id, Urgency::Info),
            format!("{}-7days", event_id)
        );
    }

    #[test]
    fn urgency_round_trips_its_wire_name() {
        assert_eq!(Urgency::parse("warning"), Some(Urgency::Warning));
        assert_eq!(Urgency::parse("info"), Some(Urgency::Info));
        assert_eq!(Urgency::parse("urgent"), None);
        assert_eq!(Urgency::Warning.as_str(), "warning");
    }

    #[test]
    fn ids_for_different_windows_never_collide() {
        let event_id = Uuid::new_v4();
        assert_ne!(
            notice_id(event_id, Urgency::Warning),
            notice_id(event_id, Urgency::Info)
        );
    }
}
