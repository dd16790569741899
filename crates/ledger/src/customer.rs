//! Stripe customer to user resolution
//!
//! Webhook payloads never carry our user id directly, so every inbound
//! event has to be mapped back to a user. Resolution is a strict cascade:
//! the mapping table first, then metadata the checkout flow stamped on the
//! Stripe object, then an exact email match. No fuzzy matching; anything
//! the cascade cannot resolve is flagged for manual reconciliation rather
//! than guessed.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

/// How confidently a webhook event was mapped to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionConfidence {
    /// stripe_customers mapping table hit
    Direct,
    /// user_id metadata stamped on the Stripe object at checkout
    Metadata,
    /// Exact (case-insensitive) email match against app_users
    Email,
}

impl ResolutionConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionConfidence::Direct => "direct",
            ResolutionConfidence::Metadata => "metadata",
            ResolutionConfidence::Email => "email",
        }
    }
}

/// A resolved user plus how the resolution happened
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResolvedUser {
    pub user_id: Uuid,
    pub confidence: ResolutionConfidence,
}

/// Directory over the stripe_customers mapping table
#[derive(Clone)]
pub struct CustomerDirectory {
    pool: PgPool,
}

impl CustomerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record (or refresh) the mapping from a Stripe customer to a user.
    /// Called from checkout completion so later subscription and invoice
    /// events resolve at direct confidence.
    pub async fn link(&self, stripe_customer_id: &str, user_id: Uuid) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_customers (stripe_customer_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (stripe_customer_id)
            DO UPDATE SET user_id = EXCLUDED.user_id, updated_at = NOW()
            "#,
        )
        .bind(stripe_customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            stripe_customer_id = %stripe_customer_id,
            user_id = %user_id,
            "Linked Stripe customer to user"
        );
        Ok(())
    }

    pub async fn lookup(&self, stripe_customer_id: &str) -> LedgerResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM stripe_customers WHERE stripe_customer_id = $1")
                .bind(stripe_customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Resolve a webhook event to a user.
    ///
    /// `metadata_user_id` and `email` come from the Stripe object in the
    /// event payload. A successful metadata or email resolution backfills
    /// the mapping table so the next event for this customer is direct.
    pub async fn resolve(
        &self,
        stripe_customer_id: Option<&str>,
        metadata_user_id: Option<&str>,
        email: Option<&str>,
    ) -> LedgerResult<ResolvedUser> {
        if let Some(customer_id) = stripe_customer_id {
            if let Some(user_id) = self.lookup(customer_id).await? {
                return Ok(ResolvedUser {
                    user_id,
                    confidence: ResolutionConfidence::Direct,
                });
            }
        }

        if let Some(raw) = metadata_user_id {
            match Uuid::parse_str(raw) {
                Ok(user_id) => {
                    if let Some(customer_id) = stripe_customer_id {
                        self.link(customer_id, user_id).await?;
                    }
                    return Ok(ResolvedUser {
                        user_id,
                        confidence: ResolutionConfidence::Metadata,
                    });
                }
                Err(_) => {
                    tracing::warn!(
                        metadata_user_id = %raw,
                        "Ignoring malformed user_id metadata on Stripe object"
                    );
                }
            }
        }

        if let Some(email) = email {
            let row: Option<(Uuid,)> =
                sqlx::query_as("SELECT user_id FROM app_users WHERE lower(email) = lower($1)")
                    .bind(email)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((user_id,)) = row {
                if let Some(customer_id) = stripe_customer_id {
                    self.link(customer_id, user_id).await?;
                }
                return Ok(ResolvedUser {
                    user_id,
                    confidence: ResolutionConfidence::Email,
                });
            }
        }

        Err(LedgerError::UserResolutionFailed(format!(
            "customer={} metadata_user_id={} email={}",
            stripe_customer_id.unwrap_or("-"),
            metadata_user_id.unwrap_or("-"),
            email.map(|_| "present").unwrap_or("-"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_resolution_cascade_and_backfill() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let directory = CustomerDirectory::new(pool.clone());

        let user_id = Uuid::new_v4();
        let customer_id = format!("cus_test_{}", Uuid::new_v4());

        // Unknown customer, no hints: unresolved
        let miss = directory.resolve(Some(&customer_id), None, None).await;
        assert!(matches!(miss, Err(LedgerError::UserResolutionFailed(_))));

        // Metadata resolves and backfills the mapping
        let via_metadata = directory
            .resolve(Some(&customer_id), Some(&user_id.to_string()), None)
            .await
            .expect("metadata resolution");
        assert_eq!(via_metadata.confidence, ResolutionConfidence::Metadata);
        assert_eq!(via_metadata.user_id, user_id);

        // Next event for the same customer is direct
        let direct = directory
            .resolve(Some(&customer_id), None, None)
            .await
            .expect("direct resolution");
        assert_eq!(direct.confidence, ResolutionConfidence::Direct);
        assert_eq!(direct.user_id, user_id);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_email_fallback_is_exact_match_only() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let directory = CustomerDirectory::new(pool.clone());

        let user_id = Uuid::new_v4();
        let email = format!("user-{}@example.com", Uuid::new_v4());
        sqlx::query("INSERT INTO app_users (user_id, email) VALUES ($1, $2)")
            .bind(user_id)
            .bind(&email)
            .execute(&pool)
            .await
            .expect("seed user");

        let via_email = directory
            .resolve(None, None, Some(&email.to_uppercase()))
            .await
            .expect("email resolution");
        assert_eq!(via_email.confidence, ResolutionConfidence::Email);
        assert_eq!(via_email.user_id, user_id);

        let near_miss = directory
            .resolve(None, None, Some("other@example.com"))
            .await;
        assert!(near_miss.is_err());
    }
}
