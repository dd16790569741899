//! Authentication middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated user, injected as a request extension by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Require a valid Bearer token on the request
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

    let claims = state
        .jwt_manager
        .validate(token)
        .map_err(|err| ApiError::InvalidToken(err.to_string()))?;

    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| ApiError::InvalidToken("Subject is not a user id".to_string()))?;

    let user = AuthUser {
        user_id,
        email: claims.email,
    };

    // Keep the email directory fresh so webhook user resolution can fall
    // back to email matching. Failures here must not block the request.
    if let Some(email) = &user.email {
        if let Err(err) = upsert_app_user(&state, user_id, email).await {
            tracing::warn!(user_id = %user_id, error = %err, "app_users upsert failed");
        }
    }

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn upsert_app_user(state: &AppState, user_id: Uuid, email: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO app_users (user_id, email)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE SET email = EXCLUDED.email
        WHERE app_users.email IS DISTINCT FROM EXCLUDED.email
        "#,
    )
    .bind(user_id)
    .bind(email)
    .execute(&state.pool)
    .await?;
    Ok(())
}
