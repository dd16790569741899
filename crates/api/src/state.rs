//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use swapdeck_ledger::{
    BalanceService, ConsumeService, RechargeService, StripeClient, TransactionHistoryService,
    WebhookHandler,
};

use crate::auth::JwtManager;
use crate::config::Config;
use crate::faceswap::FaceSwapClient;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt_manager: Arc<JwtManager>,
    pub balance: BalanceService,
    pub consume: ConsumeService,
    pub history: TransactionHistoryService,
    pub recharge: RechargeService,
    pub face_swap: FaceSwapClient,
    /// Stripe webhook handling; None when Stripe env vars are not set, in
    /// which case the webhook route answers 503 and everything else works
    pub webhooks: Option<Arc<WebhookHandler>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let jwt_manager = Arc::new(JwtManager::new(&config.jwt_secret));
        let face_swap = FaceSwapClient::new(&config)?;

        let webhooks = match StripeClient::from_env() {
            Ok(stripe) => Some(Arc::new(WebhookHandler::new(stripe, pool.clone()))),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "Stripe not configured; payment webhooks disabled"
                );
                None
            }
        };

        Ok(Self {
            balance: BalanceService::new(pool.clone()),
            consume: ConsumeService::new(pool.clone()),
            history: TransactionHistoryService::new(pool.clone()),
            recharge: RechargeService::new(pool.clone()),
            face_swap,
            webhooks,
            jwt_manager,
            config: Arc::new(config),
            pool,
        })
    }
}
