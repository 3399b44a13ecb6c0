//! Browser pool
//!
//! Bounds the number of browser processes and sessions per process, serves
//! checkout/release of pooled sessions keyed by cookie-file identity, and
//! aggregates statistics. Two-level locking: the pool lock serializes
//! allocation decisions, each browser's own lock serializes that browser's
//! session list.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::errors::PoolError;
use crate::browser::fingerprint;
use crate::browser::session::PooledSession;
use crate::config::PoolConfig;
use crate::engine::{BrowserEngine, BrowserHandle, ContextOptions, LaunchOptions, StorageState};

/// Minimum idle time before a session is reused for the same identity.
/// Gives a platform's asynchronous cookie propagation time to settle after
/// release before the session is handed to a new caller.
pub(crate) const REUSE_COOLDOWN: Duration = Duration::from_secs(30);

/// Point-in-time pool statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub browser_count: usize,
    pub context_count: usize,
    /// Sessions idle past the reuse cooldown, i.e. eligible for matching.
    pub idle_context_count: usize,
    pub in_use_context_count: usize,
    /// Callers queued for capacity. Allocation is fail-fast, so this stays
    /// 0; the field keeps the snapshot shape stable for dashboards.
    pub wait_queue_length: usize,
    pub max_browsers: usize,
    pub max_contexts: usize,
    pub timestamp: DateTime<Utc>,
}

impl PoolStats {
    fn empty(max_browsers: usize, max_contexts: usize) -> Self {
        Self {
            browser_count: 0,
            context_count: 0,
            idle_context_count: 0,
            in_use_context_count: 0,
            wait_queue_length: 0,
            max_browsers,
            max_contexts,
            timestamp: Utc::now(),
        }
    }
}

pub(crate) struct BrowserState {
    pub(crate) sessions: Vec<Arc<PooledSession>>,
    pub(crate) in_use: usize,
    pub(crate) last_used: Instant,
}

impl BrowserState {
    /// Drop a dead session from the list and give back its in-use slot.
    pub(crate) fn remove_session(&mut self, session: &Arc<PooledSession>) {
        self.sessions.retain(|s| !Arc::ptr_eq(s, session));
        self.in_use = self.in_use.saturating_sub(1);
    }

    /// Give back an in-use slot after a normal release.
    pub(crate) fn release_one(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
        self.last_used = Instant::now();
    }
}

/// One pooled browser process hosting up to `max_contexts` sessions.
pub struct PooledBrowser {
    handle: Arc<dyn BrowserHandle>,
    state: Mutex<BrowserState>,
}

impl PooledBrowser {
    fn new(handle: Arc<dyn BrowserHandle>) -> Self {
        Self {
            handle,
            state: Mutex::new(BrowserState {
                sessions: Vec::new(),
                in_use: 0,
                last_used: Instant::now(),
            }),
        }
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, BrowserState> {
        self.state.lock().await
    }

    async fn can_create_context(&self, max_contexts: usize) -> bool {
        self.state.lock().await.sessions.len() < max_contexts
    }

    /// Scan for an idle session matching `identity` past the reuse
    /// cooldown; on match, mark it checked out.
    async fn get_idle_context(&self, identity: &str) -> Option<Arc<PooledSession>> {
        let mut state = self.state.lock().await;
        let index = state
            .sessions
            .iter()
            .position(|session| session.try_checkout(identity, REUSE_COOLDOWN));
        if let Some(index) = index {
            state.in_use += 1;
            state.last_used = Instant::now();
            return Some(state.sessions[index].clone());
        }
        None
    }

    /// Create a new session on this browser.
    async fn create_context(
        self: &Arc<Self>,
        identity: &str,
        platform: Option<&str>,
        options: &ContextOptions,
    ) -> Result<Arc<PooledSession>, PoolError> {
        let mut state = self.state.lock().await;

        let context = self
            .handle
            .new_context(options)
            .await
            .map_err(|e| PoolError::ContextCreationFailed(e.to_string()))?;

        let session = Arc::new(PooledSession::new(
            context,
            identity.to_string(),
            platform,
            Arc::downgrade(self),
        ));
        state.sessions.push(session.clone());
        state.in_use += 1;
        state.last_used = Instant::now();

        Ok(session)
    }

    /// Close every session then the browser process itself.
    async fn close(&self) {
        let sessions: Vec<Arc<PooledSession>> = {
            let mut state = self.state.lock().await;
            state.in_use = 0;
            state.sessions.drain(..).collect()
        };
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!("Failed to close session {}: {}", session.id(), e);
            }
        }
        if let Err(e) = self.handle.close().await {
            warn!("Failed to close browser: {}", e);
        }
    }
}

/// Bounded pool of browser processes and their pooled sessions.
pub struct BrowserPool {
    engine: Arc<dyn BrowserEngine>,
    max_browsers: usize,
    max_contexts: usize,
    launch_options: LaunchOptions,
    cookie_dir: PathBuf,
    browsers: RwLock<Vec<Arc<PooledBrowser>>>,
    stats: RwLock<PoolStats>,
}

impl BrowserPool {
    /// Pool bounded to `max_browsers` processes with `max_contexts`
    /// sessions each.
    pub fn new(engine: Arc<dyn BrowserEngine>, max_browsers: usize, max_contexts: usize) -> Self {
        Self {
            engine,
            max_browsers,
            max_contexts,
            launch_options: LaunchOptions::default(),
            cookie_dir: PathBuf::from("cookies"),
            browsers: RwLock::new(Vec::new()),
            stats: RwLock::new(PoolStats::empty(max_browsers, max_contexts)),
        }
    }

    /// Pool configured from a [`PoolConfig`].
    pub fn from_config(engine: Arc<dyn BrowserEngine>, config: &PoolConfig) -> Self {
        let launch_options = LaunchOptions {
            headless: config.headless,
            chrome_path: config.chrome_path.clone(),
            ..Default::default()
        };
        Self {
            cookie_dir: config.cookie_dir.clone(),
            launch_options,
            ..Self::new(engine, config.max_browsers, config.max_contexts_per_browser)
        }
    }

    /// Override the browser launch options.
    pub fn with_launch_options(mut self, launch_options: LaunchOptions) -> Self {
        self.launch_options = launch_options;
        self
    }

    /// Check out a session for the given cookie-file identity.
    ///
    /// Reuses an idle matching session past the reuse cooldown when one
    /// exists, otherwise allocates a browser/session pair within the pool
    /// bounds. The returned session is exclusively the caller's until
    /// [`PooledSession::release`].
    pub async fn get_context(
        &self,
        cookie_path: &str,
        options: Option<ContextOptions>,
    ) -> Result<Arc<PooledSession>, PoolError> {
        self.get_context_tagged(cookie_path, None, options).await
    }

    /// Check out a session for a platform account, deriving the identity
    /// path `<cookie_dir>/<platform>_<account_id>.json` and tagging the
    /// session with the platform for logging.
    pub async fn get_context_for_account(
        &self,
        platform: &str,
        account_id: i64,
        options: Option<ContextOptions>,
    ) -> Result<Arc<PooledSession>, PoolError> {
        let cookie_path = self
            .cookie_dir
            .join(format!("{platform}_{account_id}.json"));
        self.get_context_tagged(&cookie_path.to_string_lossy(), Some(platform), options)
            .await
    }

    async fn get_context_tagged(
        &self,
        cookie_path: &str,
        platform: Option<&str>,
        options: Option<ContextOptions>,
    ) -> Result<Arc<PooledSession>, PoolError> {
        let mut options = options.unwrap_or_default();
        if options.enable_anti_detect {
            options = fingerprint::randomize(&options);
        }

        // Seed from the persisted identity file when one exists
        if options.storage_state.is_none() && !cookie_path.is_empty() {
            if let Some(state) = load_storage_state(cookie_path) {
                options.storage_state = Some(state);
            }
        }

        let mut browsers = self.browsers.write().await;

        // 1. Reuse an idle matching session
        for browser in browsers.iter() {
            if let Some(session) = browser.get_idle_context(cookie_path).await {
                info!(
                    "Reusing idle session {} for identity {}",
                    session.id(),
                    cookie_path
                );
                self.update_stats(&browsers).await;
                return Ok(session);
            }
        }

        // 2. Create a new session on a browser with spare capacity
        let browser = self.find_or_create_browser(&mut browsers).await?;
        let session = browser.create_context(cookie_path, platform, &options).await?;
        info!(
            "Created session {} for identity {}",
            session.id(),
            cookie_path
        );

        self.update_stats(&browsers).await;
        Ok(session)
    }

    async fn find_or_create_browser(
        &self,
        browsers: &mut Vec<Arc<PooledBrowser>>,
    ) -> Result<Arc<PooledBrowser>, PoolError> {
        for browser in browsers.iter() {
            if browser.can_create_context(self.max_contexts).await {
                return Ok(browser.clone());
            }
        }

        if browsers.len() < self.max_browsers {
            let handle = self
                .engine
                .launch(&self.launch_options)
                .await
                .map_err(|e| PoolError::LaunchFailed(e.to_string()))?;
            let pooled = Arc::new(PooledBrowser::new(handle));
            browsers.push(pooled.clone());
            info!("Launched browser {}/{}", browsers.len(), self.max_browsers);
            return Ok(pooled);
        }

        Err(PoolError::CapacityExceeded {
            max_browsers: self.max_browsers,
            max_contexts: self.max_contexts,
        })
    }

    /// The latest statistics snapshot.
    pub async fn stats(&self) -> PoolStats {
        self.stats.read().await.clone()
    }

    async fn update_stats(&self, browsers: &[Arc<PooledBrowser>]) {
        let mut stats = PoolStats::empty(self.max_browsers, self.max_contexts);
        stats.browser_count = browsers.len();

        for browser in browsers {
            let state = browser.lock_state().await;
            stats.context_count += state.sessions.len();
            stats.in_use_context_count += state.in_use;
            for session in &state.sessions {
                if !session.is_checked_out() && session.idle_elapsed() >= REUSE_COOLDOWN {
                    stats.idle_context_count += 1;
                }
            }
        }

        *self.stats.write().await = stats;
    }

    /// Close every session and browser and empty the pool.
    ///
    /// Idempotent. Best effort with respect to sessions currently checked
    /// out by other callers; not safe to call concurrently with in-flight
    /// checkouts.
    pub async fn close(&self) -> Result<(), PoolError> {
        let mut browsers = self.browsers.write().await;
        for browser in browsers.iter() {
            browser.close().await;
        }
        browsers.clear();
        self.update_stats(&browsers).await;
        info!("Browser pool closed");
        Ok(())
    }
}

/// Best-effort load of a persisted storage-state file.
fn load_storage_state(cookie_path: &str) -> Option<StorageState> {
    if !Path::new(cookie_path).exists() {
        return None;
    }
    match std::fs::read_to_string(cookie_path) {
        Ok(raw) => match serde_json::from_str::<StorageState>(&raw) {
            Ok(state) => {
                debug!(
                    "Loaded {} cookies from {}",
                    state.cookies.len(),
                    cookie_path
                );
                Some(state)
            }
            Err(e) => {
                warn!("Ignoring malformed cookie file {}: {}", cookie_path, e);
                None
            }
        },
        Err(e) => {
            warn!("Failed to read cookie file {}: {}", cookie_path, e);
            None
        }
    }
}
