//! Credit balance and history endpoints

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use swapdeck_ledger::BalanceSummary;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /credits/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<BalanceSummary>> {
    let summary = state.balance.get_balance(user.user_id).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /credits/transactions?limit=&offset=
pub async fn get_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let transactions = state
        .history
        .get_transactions(user.user_id, query.limit, query.offset)
        .await?;
    let total = state.history.count_transactions(user.user_id).await?;

    Ok(Json(json!({
        "transactions": transactions,
        "total": total,
    })))
}
