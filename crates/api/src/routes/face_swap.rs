//! Face swap endpoint
//!
//! Charge ordering: the external call happens first and credits are only
//! consumed after a confirmed result. A pre-flight balance check rejects
//! obviously-broke users before we pay for an upstream call; the ledger
//! check inside `consume` remains the authoritative one.

use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use swapdeck_ledger::ConsumeOutcome;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::faceswap::FaceSwapError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FaceSwapRequest {
    pub source_url: String,
    pub target_url: String,
}

/// POST /face-swap
pub async fn create_face_swap(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<FaceSwapRequest>,
) -> ApiResult<Json<Value>> {
    validate_image_url("source_url", &request.source_url)?;
    validate_image_url("target_url", &request.target_url)?;

    let cost = state.config.face_swap_credit_cost;

    // Pre-flight check so we don't pay for an upstream call the user
    // cannot cover
    let summary = state.balance.get_balance(user.user_id).await?;
    if summary.balance < cost {
        return Err(ApiError::InsufficientCredits {
            required: cost,
            available: summary.balance,
        });
    }

    let result_url = state
        .face_swap
        .swap(&request.source_url, &request.target_url)
        .await
        .map_err(|err| match err {
            FaceSwapError::Rejected(detail) => ApiError::BadRequest(detail),
            other => ApiError::Upstream(other.to_string()),
        })?;

    let (transaction_id, balance_after) = match state
        .consume
        .consume(user.user_id, cost, "Face swap")
        .await?
    {
        ConsumeOutcome::Consumed {
            transaction_id,
            balance_after,
            ..
        } => (transaction_id, balance_after),
        ConsumeOutcome::InsufficientFunds { balance, required } => {
            // Balance drained between pre-flight and charge. The upstream
            // call is sunk cost; the ledger still refuses a free swap.
            tracing::warn!(
                user_id = %user.user_id,
                balance,
                required,
                "balance drained during face swap"
            );
            return Err(ApiError::InsufficientCredits {
                required,
                available: balance,
            });
        }
        ConsumeOutcome::InvalidAmount { amount } => {
            return Err(ApiError::Internal(format!(
                "configured face swap cost is invalid: {amount}"
            )));
        }
    };

    let job_id = match record_job(&state, user.user_id, &request, &result_url, transaction_id).await
    {
        Ok(id) => id,
        Err(err) => {
            // Charged but could not persist the job: give the credits back
            tracing::error!(
                user_id = %user.user_id,
                error = %err,
                "face swap job persistence failed, refunding"
            );
            state
                .recharge
                .refund(
                    user.user_id,
                    cost,
                    "Face swap result could not be saved",
                    Some(transaction_id),
                )
                .await?;
            return Err(err.into());
        }
    };

    Ok(Json(json!({
        "job_id": job_id,
        "result_url": result_url,
        "credits_charged": cost,
        "balance_after": balance_after,
    })))
}

async fn record_job(
    state: &AppState,
    user_id: Uuid,
    request: &FaceSwapRequest,
    result_url: &str,
    transaction_id: Uuid,
) -> Result<Uuid, sqlx::Error> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO face_swap_jobs
            (user_id, source_url, target_url, result_url, status, credit_transaction_id)
        VALUES ($1, $2, $3, $4, 'completed', $5)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(&request.source_url)
    .bind(&request.target_url)
    .bind(result_url)
    .bind(transaction_id)
    .fetch_one(&state.pool)
    .await?;
    Ok(id)
}

fn validate_image_url(field: &str, url: &str) -> Result<(), ApiError> {
    if url.is_empty() {
        return Err(ApiError::Validation(format!("{field} is required")));
    }
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(ApiError::Validation(format!(
            "{field} must be an http(s) URL"
        )));
    }
    if url.len() > 2048 {
        return Err(ApiError::Validation(format!("{field} is too long")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(validate_image_url("source_url", "https://cdn.example.com/a.jpg").is_ok());
        assert!(validate_image_url("source_url", "").is_err());
        assert!(validate_image_url("source_url", "ftp://example.com/a.jpg").is_err());
        assert!(validate_image_url("source_url", &format!("https://{}", "x".repeat(2048))).is_err());
    }
}
