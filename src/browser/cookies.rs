//! Login cookie detection
//!
//! Polls a session page's cookie jar until every configured domain carries
//! all of its required cookies, or validates the same condition once. This
//! is how login success and stored-session validity are decided without any
//! platform API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::cookie_config::{CookieDomainConfig, PlatformCookieConfig};
use crate::browser::errors::PoolError;
use crate::engine::{EngineError, PageHandle};

/// Default gap between cookie polls.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// Default hard ceiling on one login wait.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Polls and validates login cookies against a platform configuration.
pub struct CookieChecker {
    check_interval: Duration,
    timeout: Duration,
}

impl Default for CookieChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieChecker {
    pub fn new() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Checker with a custom hard timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            timeout,
        }
    }

    /// Checker with custom poll interval and timeout.
    pub fn with_intervals(check_interval: Duration, timeout: Duration) -> Self {
        Self {
            check_interval,
            timeout,
        }
    }

    /// Wait until every configured domain carries all required cookies on
    /// the same poll tick.
    ///
    /// Returns `LoginTimeout` when the hard timeout elapses,
    /// `LoginCancelled` as soon as `cancel` fires, and
    /// `SessionClosedExternally` when a cookie fetch reports that the
    /// browser/context/page is gone.
    pub async fn wait_for_login_cookies(
        &self,
        cancel: &CancellationToken,
        page: &Arc<dyn PageHandle>,
        config: &PlatformCookieConfig,
    ) -> Result<(), PoolError> {
        let domains = config.check_domains();
        info!(
            "Waiting for login cookies, domains: {:?}, required: {:?}",
            config.all_domains(),
            config.all_cookie_names()
        );

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.check_interval,
            self.check_interval,
        );

        let mut check_count: u64 = 0;
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(PoolError::LoginTimeout(self.timeout));
                }
                _ = cancel.cancelled() => {
                    return Err(PoolError::LoginCancelled);
                }
                _ = ticker.tick() => {
                    check_count += 1;
                    // All domains must be satisfied on this same tick;
                    // satisfaction never accumulates across ticks.
                    let mut all_valid = true;
                    for domain_config in &domains {
                        match self.check_domain_cookies(page, domain_config, check_count).await {
                            Ok(valid) => {
                                if !valid {
                                    all_valid = false;
                                    break;
                                }
                            }
                            Err(e) if e.is_closed() => {
                                warn!("Browser closed during cookie wait: {}", e);
                                return Err(PoolError::SessionClosedExternally);
                            }
                            Err(e) => {
                                warn!(
                                    "Cookie check for domain [{}] failed: {}",
                                    domain_label(domain_config),
                                    e
                                );
                                all_valid = false;
                                break;
                            }
                        }
                    }

                    if all_valid {
                        info!("All required login cookies detected (check #{})", check_count);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Single-shot check of the same per-domain satisfaction logic, with
    /// no polling and no timeout. Answers "is this session still
    /// authenticated" immediately.
    pub async fn validate_login_cookies(
        &self,
        page: &Arc<dyn PageHandle>,
        config: &PlatformCookieConfig,
    ) -> Result<bool, PoolError> {
        for domain_config in &config.check_domains() {
            match self.check_domain_cookies(page, domain_config, 0).await {
                Ok(valid) => {
                    if !valid {
                        return Ok(false);
                    }
                }
                Err(e) if e.is_closed() => return Err(PoolError::SessionClosedExternally),
                Err(e) => {
                    return Err(PoolError::ValidationFailed(format!(
                        "domain [{}]: {}",
                        domain_label(domain_config),
                        e
                    )));
                }
            }
        }
        Ok(true)
    }

    /// Current values of the named cookies on `domain`; absent names are
    /// simply missing from the result.
    pub async fn get_cookie_values(
        &self,
        page: &Arc<dyn PageHandle>,
        domain: &str,
        names: &[String],
    ) -> Result<HashMap<String, String>, PoolError> {
        let cookies = page
            .cookies(if domain.is_empty() { None } else { Some(domain) })
            .await
            .map_err(|e| {
                if e.is_closed() {
                    PoolError::SessionClosedExternally
                } else {
                    PoolError::ValidationFailed(e.to_string())
                }
            })?;

        let jar: HashMap<&str, &str> = cookies
            .iter()
            .map(|c| (c.name.as_str(), c.value.as_str()))
            .collect();

        let mut values = HashMap::new();
        for name in names {
            if let Some(value) = jar.get(name.as_str()) {
                values.insert(name.clone(), value.to_string());
            }
        }
        Ok(values)
    }

    /// Check one domain: every required cookie name present, either exactly
    /// or case-insensitively. Cookie-name casing has been observed to vary
    /// across engine/browser versions for the same logical cookie.
    async fn check_domain_cookies(
        &self,
        page: &Arc<dyn PageHandle>,
        config: &CookieDomainConfig,
        check_count: u64,
    ) -> Result<bool, EngineError> {
        let label = domain_label(config);

        let cookies = page
            .cookies(if config.domain.is_empty() {
                None
            } else {
                Some(&config.domain)
            })
            .await?;

        debug!(
            "Domain [{}] has {} cookies (check #{})",
            label,
            cookies.len(),
            check_count
        );

        let mut jar: HashMap<String, String> = HashMap::with_capacity(cookies.len());
        let mut jar_lower: HashMap<String, String> = HashMap::with_capacity(cookies.len());
        for cookie in &cookies {
            jar.insert(cookie.name.clone(), cookie.value.clone());
            jar_lower.insert(cookie.name.to_lowercase(), cookie.value.clone());
        }

        let mut all_required_exist = true;
        for name in &config.required_cookies {
            if jar.contains_key(name) {
                debug!("  required {}: present", name);
            } else if jar_lower.contains_key(&name.to_lowercase()) {
                debug!("  required {}: present (case differs)", name);
            } else {
                debug!("  required {}: missing", name);
                all_required_exist = false;
            }
        }

        for name in &config.extended_cookies {
            let present =
                jar.contains_key(name) || jar_lower.contains_key(&name.to_lowercase());
            debug!(
                "  extended {}: {}",
                name,
                if present { "present" } else { "missing" }
            );
        }

        Ok(all_required_exist)
    }
}

fn domain_label(config: &CookieDomainConfig) -> &str {
    if config.domain.is_empty() {
        "current page"
    } else {
        &config.domain
    }
}
