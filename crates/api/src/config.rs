//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_direct_url: Option<String>,

    // Authentication (provider-issued JWTs, HS256 shared secret)
    pub jwt_secret: String,

    // Face swap upstream
    pub face_swap_api_url: String,
    pub face_swap_api_key: String,
    pub face_swap_timeout_ms: u64,
    pub face_swap_credit_cost: i32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_direct_url: env::var("DATABASE_DIRECT_URL").ok(),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Face swap upstream
            face_swap_api_url: env::var("FACE_SWAP_API_URL")
                .map_err(|_| ConfigError::Missing("FACE_SWAP_API_URL"))?,
            face_swap_api_key: env::var("FACE_SWAP_API_KEY").unwrap_or_default(),
            face_swap_timeout_ms: env::var("FACE_SWAP_TIMEOUT_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .unwrap_or(30000),
            face_swap_credit_cost: env::var("FACE_SWAP_CREDIT_COST")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config tests run serially (they modify shared env vars)
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        env::set_var("FACE_SWAP_API_URL", "https://faceswap.test/api");
    }

    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("JWT_SECRET");
        env::remove_var("FACE_SWAP_API_URL");
        env::remove_var("FACE_SWAP_CREDIT_COST");
    }

    #[test]
    fn test_config_validation() {
        let _lock = CONFIG_TEST_MUTEX.lock().expect("mutex");

        // Missing DATABASE_URL fails
        cleanup_config();
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        env::set_var("FACE_SWAP_API_URL", "https://faceswap.test/api");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        // Short JWT secret rejected
        setup_minimal_config();
        env::set_var("JWT_SECRET", "too-short");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::WeakSecret(_))
        ));

        // Valid config parses with defaults
        setup_minimal_config();
        env::set_var("FACE_SWAP_CREDIT_COST", "2");
        let config = Config::from_env().expect("valid config");
        assert_eq!(config.face_swap_credit_cost, 2);
        assert_eq!(config.face_swap_timeout_ms, 30000);
        assert_eq!(config.bind_address, "0.0.0.0:3000");

        cleanup_config();
    }
}
