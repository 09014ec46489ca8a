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

fn transaction_json(row: &PgRow) -> Result<serde_json::Value, ApiError> {
    Ok(json!({
        "id": row.try_get::<Uuid, _>("id")?,
        "type": row.try_get::<String, _>("kind")?,
        "description": row.try_get::<String, _>("description")?,
        "amount": row.try_get::<f64, _>("amount")?,
        "date": row.try_get::<DateTime<Utc>, _>("date")?,
    }))
}

fn validate_amount(amount: f64) -> Result<(), ApiError> {
    if !amount.is_finite() {
        return Err(ApiError::InvalidInput("Amount must be a finite number".into()));
    }
    Ok(())
}

pub async fn list_transactions(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let rows = sqlx::query("SELECT * FROM transactions WHERE user_id = $1 ORDER BY date DESC")
        .bind(user_id)
        .fetch_all(&state.db)
        .await?;

    let mut transactions = Vec::with_capacity(rows.len());
    for row in &rows {
        transactions.push(transaction_json(row)?);
    }
    Ok(Json(transactions))
}

#[derive(Deserialize)]
pub struct CreateTransactionRequest {
    #[serde(rename = "type")]
    kind: String,
    description: String,
    amount: f64,
    date: DateTime<Utc>,
}

pub async fn create_transaction(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    if req.kind != "income" && req.kind != "expense" {
        return Err(ApiError::InvalidInput(
            "Type must be income or expense".into(),
        ));
    }
    if req.description.trim().is_empty() {
        return Err(ApiError::InvalidInput("Missing description".into()));
    }
    validate_input_string(&req.description, 500)?;
    validate_amount(req.amount)?;

    let row = sqlx::query(
        "INSERT INTO transactions (user_id, kind, description, amount, date)
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(user_id)
    .bind(&req.kind)
    .bind(req.description.trim())
    .bind(req.amount)
    .bind(req.date)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(transaction_json(&row)?))
}

#[derive(Deserialize)]
pub struct UpdateTransactionRequest {
    description: String,
    amount: f64,
    date: DateTime<Utc>,
}

pub async fn update_transaction(
    headers: HeaderMap,
    Path(transaction_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<UpdateTransactionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    if req.description.trim().is_empty() {
        return Err(ApiError::InvalidInput("Missing description".into()));
    }
    validate_input_string(&req.description, 500)?;
    validate_amount(req.amount)?;

    // The kind is immutable after creation; only the ledger details change.
    let row = sqlx::query(
        "UPDATE transactions SET description = $1, amount = $2, date = $3
         WHERE id = $4 AND user_id = $5 RETURNING *",
    )
    .bind(req.description.trim())
    .bind(req.amount)
    .bind(req.date)
    .bind(transaction_id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(ApiError::NotFound("Transaction not found"))?;

    Ok(Json(transaction_json(&row)?))
}

pub async fn delete_transaction(
    headers: HeaderMap,
    Path(transaction_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = verify_session(&headers, &state.sessions).await?;

    let deleted = sqlx::query("DELETE FROM transactions WHERE id = $1 AND user_id = $2")
        .bind(transaction_id)
        .bind(user_id)
        .execute(&state.db)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(ApiError::NotFound("Transaction not found"));
    }

    Ok(Json(json!({ "ok": true })))
}
