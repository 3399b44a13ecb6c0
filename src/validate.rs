//! Stored-session validation
//!
//! Answers "is this account's persisted session still authenticated"
//! without driving any platform UI: check out a session seeded from the
//! account's cookie file and run the single-shot cookie validation, with
//! caller-side retries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::browser::{cookie_config, BrowserPool, PoolError};

/// Retry policy for one validation run.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub retry_count: usize,
    pub retry_interval: Duration,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Validates stored sessions for one platform against the shared pool.
pub struct SessionValidator {
    platform: String,
    pool: Arc<BrowserPool>,
    options: ValidationOptions,
}

impl SessionValidator {
    pub fn new(platform: impl Into<String>, pool: Arc<BrowserPool>) -> Self {
        Self {
            platform: platform.into(),
            pool,
            options: ValidationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ValidationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Whether the account's persisted session still satisfies the
    /// platform's login cookie requirements.
    ///
    /// Retries are the caller-side policy layered on the pool's fail-fast
    /// behavior: each attempt is a fresh checkout/validate/release cycle.
    pub async fn validate_account(&self, account_id: i64) -> Result<bool, PoolError> {
        let config = cookie_config(&self.platform).ok_or_else(|| {
            PoolError::ValidationFailed(format!(
                "no cookie configuration for platform {}",
                self.platform
            ))
        })?;

        let mut last_error: Option<PoolError> = None;

        for attempt in 0..=self.options.retry_count {
            if attempt > 0 {
                info!(
                    "[{}] Session validation retry {}/{} for account {}",
                    self.platform, attempt, self.options.retry_count, account_id
                );
                tokio::time::sleep(self.options.retry_interval).await;
            }

            let session = match self
                .pool
                .get_context_for_account(&self.platform, account_id, None)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    warn!(
                        "[{}] Failed to get session for validation: {}",
                        self.platform, e
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            if let Err(e) = session.get_page().await {
                warn!("[{}] Failed to get page for validation: {}", self.platform, e);
                last_error = Some(e);
                let _ = session.release().await;
                continue;
            }

            let verdict = session.validate_login_cookies(&config).await;
            // A forced-close release error does not change the verdict
            if let Err(e) = session.release().await {
                warn!("[{}] Release after validation: {}", self.platform, e);
            }

            match verdict {
                Ok(valid) => {
                    info!(
                        "[{}] Account {} session is {}",
                        self.platform,
                        account_id,
                        if valid { "valid" } else { "expired" }
                    );
                    return Ok(valid);
                }
                Err(e) => {
                    warn!("[{}] Cookie validation failed: {}", self.platform, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(error) => Err(error),
            None => Ok(false),
        }
    }
}
