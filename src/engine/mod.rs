//! Browser automation engine abstraction
//!
//! The pool never talks to a concrete browser library directly. It consumes
//! the trait contract defined here, so the production CDP binding and the
//! in-memory test engine are interchangeable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod cdp;
#[cfg(test)]
pub(crate) mod mock;

pub use cdp::CdpEngine;

/// Error signatures that indicate the browser, context or page behind a
/// handle is gone. Matched as lowercase substrings against engine errors.
const CLOSED_SIGNATURES: &[&str] = &[
    "target closed",
    "browser has been closed",
    "context or browser has been closed",
    "page has been closed",
    "connection closed",
    "session closed",
    "browser connection lost",
];

/// Errors surfaced by the engine binding layer.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("failed to create browsing context: {0}")]
    ContextCreationFailed(String),

    #[error("failed to create page: {0}")]
    PageCreationFailed(String),

    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("cookie query failed: {0}")]
    CookieQueryFailed(String),

    #[error("storage state unavailable: {0}")]
    StorageStateFailed(String),

    #[error("close failed: {0}")]
    CloseFailed(String),

    #[error("browser connection lost: {0}")]
    ConnectionLost(String),
}

impl EngineError {
    /// Whether this error means the underlying browser/context/page was
    /// closed, so retrying against the same handle is pointless.
    pub fn is_closed(&self) -> bool {
        if matches!(self, EngineError::ConnectionLost(_)) {
            return true;
        }
        let msg = self.to_string().to_lowercase();
        CLOSED_SIGNATURES.iter().any(|sig| msg.contains(sig))
    }
}

/// A single cookie as observed by the engine.
///
/// Serialized field names follow the common storage-state convention
/// (`httpOnly`, `sameSite`) so existing per-account cookie files stay
/// loadable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Unix timestamp in seconds; `None` for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// One `name=value` entry of an origin's local storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalStorageEntry {
    pub name: String,
    pub value: String,
}

/// Local storage snapshot for a single origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginState {
    pub origin: String,
    #[serde(rename = "localStorage", default)]
    pub local_storage: Vec<LocalStorageEntry>,
}

/// Serializable snapshot of a context's cookies and per-origin local
/// storage. One JSON file per account/platform identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

/// Browser process launch options.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Run without a visible window.
    pub headless: bool,
    /// Explicit Chrome/Chromium executable; auto-detected when `None`.
    pub chrome_path: Option<String>,
    /// Extra command-line arguments appended after the built-in set.
    pub extra_args: Vec<String>,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: false,
            chrome_path: None,
            extra_args: Vec::new(),
            window_width: 1920,
            window_height: 1080,
        }
    }
}

/// Viewport dimensions for a browsing context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

/// Geographic coordinates reported to pages requesting geolocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Options for one isolated browsing context. Immutable once passed to
/// context creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<ViewportSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<Geolocation>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    /// Randomize the fingerprint and inject the stealth script.
    pub enable_anti_detect: bool,
    /// Insert randomized delays between driven actions.
    pub enable_random_delay: bool,
    /// Simulate human scrolling/typing cadence in driven actions.
    pub human_like_behavior: bool,
    /// Cookie/localStorage snapshot to seed the context with.
    #[serde(skip)]
    pub storage_state: Option<StorageState>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            viewport: None,
            locale: None,
            timezone_id: None,
            geolocation: None,
            extra_headers: HashMap::new(),
            enable_anti_detect: true,
            enable_random_delay: true,
            human_like_behavior: true,
            storage_state: None,
        }
    }
}

/// Handle returned by [`PageHandle::on_close`]. Purely an acknowledgement of
/// the registration; observers stay registered for the page's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct CloseSubscription(pub u64);

/// Launches browser processes.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn BrowserHandle>, EngineError>;
}

/// One running browser process.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Create an isolated browsing context (separate cookies/storage).
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Arc<dyn ContextHandle>, EngineError>;

    /// Shut the browser process down.
    async fn close(&self) -> Result<(), EngineError>;
}

/// One isolated browsing context within a browser process.
#[async_trait]
pub trait ContextHandle: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, EngineError>;

    /// All cookies observable in this context, optionally scoped to a
    /// domain (a bare host or a full URL).
    async fn cookies(&self, domain: Option<&str>) -> Result<Vec<Cookie>, EngineError>;

    /// Snapshot cookies plus per-origin local storage.
    async fn storage_state(&self) -> Result<StorageState, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// One page (tab) within a context.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Evaluate a script in the page, returning its JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, EngineError>;

    /// Cookies observable by this page, optionally domain-scoped.
    async fn cookies(&self, domain: Option<&str>) -> Result<Vec<Cookie>, EngineError>;

    /// Register an observer invoked synchronously when the page closes,
    /// whether programmatically or by a human closing the window.
    fn on_close(&self, observer: Box<dyn Fn() + Send + Sync>) -> CloseSubscription;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Whether a cookie set for `cookie_domain` is visible on `host`.
/// Handles the leading-dot form (`.example.com`) and subdomains.
pub(crate) fn domain_matches(cookie_domain: &str, host: &str) -> bool {
    let cd = cookie_domain.trim_start_matches('.');
    if cd.is_empty() {
        return false;
    }
    host == cd || host.ends_with(&format!(".{cd}"))
}

/// Extract the host from a domain spec that may be a bare host or a URL.
pub(crate) fn host_of(domain: &str) -> String {
    if domain.contains("://") {
        if let Ok(parsed) = url::Url::parse(domain) {
            if let Some(host) = parsed.host_str() {
                return host.to_string();
            }
        }
    }
    domain.trim_start_matches('.').to_string()
}
