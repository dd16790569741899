//! Stripe webhook handling
//!
//! Verifies inbound events, maps them to users, and applies ledger effects.
//! Redelivery is harmless by construction: recharges are keyed on the
//! payment reference and period grants on (subscription, period), so this
//! layer never gates on the event id. Every event still lands in the audit
//! table; unresolved ones are acked to Stripe and queued for manual review.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{
    Event, EventObject, EventType, Invoice, PaymentIntent, Subscription, SubscriptionStatus,
    Webhook,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::{CustomerDirectory, ResolutionConfidence};
use crate::error::{LedgerError, LedgerResult};
use crate::recharge::{RechargeOutcome, RechargeService};
use crate::subscription::{GrantOutcome, SubscriptionCreditService};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What handling a verified event did to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Ledger state changed
    Applied,
    /// Redelivery of an already-applied event; state unchanged
    Duplicate,
    /// Event type carries no ledger effect, or the payload had nothing to do
    Ignored,
    /// Could not map the event to a user; acked and flagged for review
    Unresolved,
}

impl WebhookDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookDisposition::Applied => "applied",
            WebhookDisposition::Duplicate => "duplicate",
            WebhookDisposition::Ignored => "ignored",
            WebhookDisposition::Unresolved => "unresolved",
        }
    }
}

/// Parse Stripe's signature header: `t=<unix>,v1=<hex>[,v0=...]`
fn parse_signature_header(header: &str) -> Option<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<String> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1 = Some(value.to_string()),
            _ => {}
        }
    }
    Some((timestamp?, v1?))
}

/// Manual HMAC-SHA256 verification of the signed payload. Fallback for
/// payloads whose API version the stripe crate's own verifier rejects.
fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> LedgerResult<()> {
    let (timestamp, v1) =
        parse_signature_header(header).ok_or(LedgerError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(LedgerError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| LedgerError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1 {
        return Err(LedgerError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    customers: CustomerDirectory,
    recharge: RechargeService,
    subscriptions: SubscriptionCreditService,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let customers = CustomerDirectory::new(pool.clone());
        let recharge = RechargeService::new(pool.clone());
        let subscriptions = SubscriptionCreditService::new(pool.clone());
        Self {
            stripe,
            pool,
            customers,
            recharge,
            subscriptions,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the stripe crate's verifier first, then falls back to manual
    /// signature verification for newer API versions it cannot parse.
    pub fn verify_event(&self, payload: &str, signature: &str) -> LedgerResult<Event> {
        let secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            LedgerError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );
        Ok(event)
    }

    /// Apply a verified event to the ledger.
    ///
    /// Errors mean the event must be redelivered (the HTTP layer returns
    /// 5xx); every non-error disposition acks the event.
    pub async fn handle_event(&self, event: Event) -> LedgerResult<WebhookDisposition> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        tracing::info!(
            event_type = %event_type,
            event_id = %event_id,
            "Processing Stripe webhook event"
        );

        let result = self.apply_event(&event).await;

        match result {
            Ok((disposition, confidence)) => {
                self.record_event(&event_id, &event_type, &disposition, confidence, None)
                    .await;
                Ok(disposition)
            }
            Err(LedgerError::UserResolutionFailed(detail)) => {
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %event_type,
                    detail = %detail,
                    "Webhook event could not be resolved to a user; flagged for review"
                );
                self.record_event(
                    &event_id,
                    &event_type,
                    &WebhookDisposition::Unresolved,
                    None,
                    Some(&detail),
                )
                .await;
                Ok(WebhookDisposition::Unresolved)
            }
            Err(e) => {
                sqlx::query(
                    r#"
                    INSERT INTO stripe_webhook_events
                        (stripe_event_id, event_type, processing_result, error_message)
                    VALUES ($1, $2, 'error', $3)
                    ON CONFLICT (stripe_event_id) DO UPDATE SET
                        processing_result = 'error',
                        error_message = EXCLUDED.error_message
                    "#,
                )
                .bind(&event_id)
                .bind(&event_type)
                .bind(e.to_string())
                .execute(&self.pool)
                .await
                .ok();
                Err(e)
            }
        }
    }

    async fn apply_event(
        &self,
        event: &Event,
    ) -> LedgerResult<(WebhookDisposition, Option<ResolutionConfidence>)> {
        match event.type_ {
            EventType::PaymentIntentSucceeded => {
                let intent = Self::extract_payment_intent(event.data.object.clone())?;
                self.handle_payment_succeeded(intent).await
            }
            EventType::CheckoutSessionCompleted => {
                let session = match event.data.object.clone() {
                    EventObject::CheckoutSession(session) => session,
                    _ => {
                        return Err(LedgerError::InvalidInput(
                            "Expected CheckoutSession".to_string(),
                        ))
                    }
                };
                self.handle_checkout_completed(session).await
            }
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                let subscription = Self::extract_subscription(event.data.object.clone())?;
                self.handle_subscription_active(subscription).await
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = Self::extract_subscription(event.data.object.clone())?;
                self.handle_subscription_deleted(subscription).await
            }
            EventType::InvoicePaid => {
                let invoice = match event.data.object.clone() {
                    EventObject::Invoice(invoice) => invoice,
                    _ => return Err(LedgerError::InvalidInput("Expected Invoice".to_string())),
                };
                self.handle_invoice_paid(invoice).await
            }
            _ => {
                tracing::debug!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "No handler for Stripe event type"
                );
                Ok((WebhookDisposition::Ignored, None))
            }
        }
    }

    /// One-time credit pack purchase. Credits come from the intent's
    /// `credits` metadata, falling back to the configured pack table keyed
    /// on the charge amount. The intent id is the idempotency key.
    async fn handle_payment_succeeded(
        &self,
        intent: PaymentIntent,
    ) -> LedgerResult<(WebhookDisposition, Option<ResolutionConfidence>)> {
        let customer_id = Self::expandable_customer_id(&intent.customer);
        let resolved = self
            .customers
            .resolve(
                customer_id.as_deref(),
                intent.metadata.get("user_id").map(String::as_str),
                intent.receipt_email.as_deref(),
            )
            .await?;

        let credits = match intent
            .metadata
            .get("credits")
            .and_then(|raw| raw.parse::<i32>().ok())
            .filter(|c| *c > 0)
        {
            Some(credits) => credits,
            None => match self
                .stripe
                .config()
                .credit_packs
                .credits_for_amount(intent.amount)
            {
                Some(credits) => credits,
                None => {
                    tracing::warn!(
                        payment_intent_id = %intent.id,
                        amount_cents = intent.amount,
                        "Payment intent matches no credit pack and carries no credits metadata"
                    );
                    return Ok((WebhookDisposition::Ignored, Some(resolved.confidence)));
                }
            },
        };

        let payment_ref = intent.id.to_string();
        let outcome = self
            .recharge
            .recharge(
                resolved.user_id,
                credits,
                Some(&payment_ref),
                &format!("Credit pack purchase ({} credits)", credits),
            )
            .await?;

        let disposition = match outcome {
            RechargeOutcome::Recharged { .. } => WebhookDisposition::Applied,
            RechargeOutcome::Duplicate { .. } => WebhookDisposition::Duplicate,
            RechargeOutcome::InvalidAmount { amount } => {
                return Err(LedgerError::InvalidInput(format!(
                    "non-positive recharge amount {} from webhook",
                    amount
                )))
            }
        };
        Ok((disposition, Some(resolved.confidence)))
    }

    /// Checkout completion only links the Stripe customer to the user.
    /// Crediting happens on payment_intent.succeeded / invoice.paid, so a
    /// session and its payment event never double-apply.
    async fn handle_checkout_completed(
        &self,
        session: stripe::CheckoutSession,
    ) -> LedgerResult<(WebhookDisposition, Option<ResolutionConfidence>)> {
        let Some(customer_id) = Self::expandable_customer_id(&session.customer) else {
            tracing::debug!(session_id = %session.id, "Checkout session has no customer");
            return Ok((WebhookDisposition::Ignored, None));
        };

        let metadata_user_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .map(String::as_str);
        let email = session
            .customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref());

        let resolved = self
            .customers
            .resolve(Some(&customer_id), metadata_user_id, email)
            .await?;
        // resolve() backfills the mapping when it came from metadata/email;
        // a direct hit means the link already exists
        if resolved.confidence == ResolutionConfidence::Direct {
            return Ok((WebhookDisposition::Duplicate, Some(resolved.confidence)));
        }

        Ok((WebhookDisposition::Applied, Some(resolved.confidence)))
    }

    /// Active subscription: grant the current period's credits
    async fn handle_subscription_active(
        &self,
        subscription: Subscription,
    ) -> LedgerResult<(WebhookDisposition, Option<ResolutionConfidence>)> {
        if !matches!(
            subscription.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) {
            tracing::debug!(
                subscription_id = %subscription.id,
                status = ?subscription.status,
                "Subscription not in a credit-granting status"
            );
            return Ok((WebhookDisposition::Ignored, None));
        }

        let customer_id = subscription.customer.id().to_string();
        let resolved = self
            .customers
            .resolve(
                Some(&customer_id),
                subscription.metadata.get("user_id").map(String::as_str),
                None,
            )
            .await?;

        self.grant_subscription_period(resolved.user_id, &subscription)
            .await
            .map(|disposition| (disposition, Some(resolved.confidence)))
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: Subscription,
    ) -> LedgerResult<(WebhookDisposition, Option<ResolutionConfidence>)> {
        let customer_id = subscription.customer.id().to_string();
        let resolved = self
            .customers
            .resolve(
                Some(&customer_id),
                subscription.metadata.get("user_id").map(String::as_str),
                None,
            )
            .await?;

        let cancelled = self
            .subscriptions
            .cancel_subscription(resolved.user_id, subscription.id.as_str())
            .await?;

        let disposition = if cancelled > 0 {
            WebhookDisposition::Applied
        } else {
            WebhookDisposition::Duplicate
        };
        Ok((disposition, Some(resolved.confidence)))
    }

    /// Renewal invoice: grant the new period. The invoice's own period
    /// fields describe the previous cycle for subscription invoices, so the
    /// subscription is retrieved for the authoritative current period.
    async fn handle_invoice_paid(
        &self,
        invoice: Invoice,
    ) -> LedgerResult<(WebhookDisposition, Option<ResolutionConfidence>)> {
        let Some(subscription_ref) = &invoice.subscription else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice not tied to a subscription");
            return Ok((WebhookDisposition::Ignored, None));
        };

        let subscription_id = subscription_ref.id().to_string();
        let parsed_id = subscription_id.parse().map_err(|_| {
            LedgerError::StripeApi(format!("invalid subscription id {}", subscription_id))
        })?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &parsed_id, &[]).await?;

        let customer_id = Self::expandable_customer_id(&invoice.customer)
            .unwrap_or_else(|| subscription.customer.id().to_string());
        let resolved = self
            .customers
            .resolve(
                Some(&customer_id),
                subscription.metadata.get("user_id").map(String::as_str),
                invoice.customer_email.as_deref(),
            )
            .await?;

        self.grant_subscription_period(resolved.user_id, &subscription)
            .await
            .map(|disposition| (disposition, Some(resolved.confidence)))
    }

    async fn grant_subscription_period(
        &self,
        user_id: Uuid,
        subscription: &Subscription,
    ) -> LedgerResult<WebhookDisposition> {
        let period_start = OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
            .map_err(|_| {
            LedgerError::StripeApi("subscription period start out of range".to_string())
        })?;
        let period_end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
            .map_err(|_| {
                LedgerError::StripeApi("subscription period end out of range".to_string())
            })?;

        let credits = subscription
            .metadata
            .get("period_credits")
            .and_then(|raw| raw.parse::<i32>().ok())
            .filter(|c| *c > 0)
            .unwrap_or(self.stripe.config().subscription_period_credits);

        let outcome = self
            .subscriptions
            .grant_period(
                user_id,
                subscription.id.as_str(),
                credits,
                period_start,
                period_end,
            )
            .await?;

        Ok(match outcome {
            GrantOutcome::Granted(_) => WebhookDisposition::Applied,
            GrantOutcome::AlreadyGranted(_) => WebhookDisposition::Duplicate,
        })
    }

    /// Upsert the audit row for an event. Audit only; a failure here never
    /// fails the webhook response.
    async fn record_event(
        &self,
        event_id: &str,
        event_type: &str,
        disposition: &WebhookDisposition,
        confidence: Option<ResolutionConfidence>,
        error_message: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, resolution_confidence, error_message)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = EXCLUDED.processing_result,
                resolution_confidence = EXCLUDED.resolution_confidence,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(disposition.as_str())
        .bind(confidence.map(|c| c.as_str()))
        .bind(error_message)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to write webhook audit record"
            );
        }
    }

    fn extract_subscription(object: EventObject) -> LedgerResult<Subscription> {
        match object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(LedgerError::InvalidInput(
                "Expected Subscription".to_string(),
            )),
        }
    }

    fn extract_payment_intent(object: EventObject) -> LedgerResult<PaymentIntent> {
        match object {
            EventObject::PaymentIntent(intent) => Ok(intent),
            _ => Err(LedgerError::InvalidInput(
                "Expected PaymentIntent".to_string(),
            )),
        }
    }

    fn expandable_customer_id(
        customer: &Option<stripe::Expandable<stripe::Customer>>,
    ) -> Option<String> {
        match customer {
            Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
            Some(stripe::Expandable::Object(c)) => Some(c.id.to_string()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature_header() {
        let parsed = parse_signature_header("t=1700000000,v1=abc123,v0=legacy");
        assert_eq!(parsed, Some((1_700_000_000, "abc123".to_string())));
    }

    #[test]
    fn test_parse_signature_header_missing_parts() {
        assert_eq!(parse_signature_header("t=1700000000"), None);
        assert_eq!(parse_signature_header("v1=abc123"), None);
        assert_eq!(parse_signature_header("garbage"), None);
    }

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("key");
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature_accepts_valid() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "test_secret";
        let now = 1_700_000_000;
        let header = sign(payload, secret, now);
        assert!(verify_signature(payload, &header, secret, now).is_ok());
    }

    #[test]
    fn test_verify_signature_rejects_tampered_payload() {
        let secret = "test_secret";
        let now = 1_700_000_000;
        let header = sign(r#"{"id":"evt_1"}"#, secret, now);
        let result = verify_signature(r#"{"id":"evt_2"}"#, &header, secret, now);
        assert!(matches!(result, Err(LedgerError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_verify_signature_rejects_stale_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "test_secret";
        let signed_at = 1_700_000_000;
        let header = sign(payload, secret, signed_at);
        let result =
            verify_signature(payload, &header, secret, signed_at + SIGNATURE_TOLERANCE_SECS + 1);
        assert!(matches!(result, Err(LedgerError::WebhookSignatureInvalid)));
    }
}
