//! Pooled browsing sessions
//!
//! A session wraps one isolated browsing context with at most one active
//! page. Sessions are checked out of the pool, driven by exactly one caller,
//! and released back. Release persists cookies and either parks the session
//! idle or discards it when the page/context was closed externally.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::cookie_config::PlatformCookieConfig;
use crate::browser::cookies::CookieChecker;
use crate::browser::errors::PoolError;
use crate::browser::pool::PooledBrowser;
use crate::engine::{ContextHandle, PageHandle};

/// Liveness probe attempts before a page is declared closed.
const LIVENESS_RETRIES: usize = 3;
/// Gap between liveness probe attempts.
const LIVENESS_RETRY_DELAY: Duration = Duration::from_millis(500);

struct SessionState {
    checked_out: bool,
    last_used: Instant,
}

/// One pooled browsing session.
pub struct PooledSession {
    id: String,
    platform: String,
    cookie_path: String,
    context: Arc<dyn ContextHandle>,
    /// The single active page. Cleared by the close observer under this
    /// lock, so it cannot race a concurrent `is_page_closed`.
    page: Mutex<Option<Arc<dyn PageHandle>>>,
    created_at: Instant,
    state: Mutex<SessionState>,
    parent: Weak<PooledBrowser>,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("cookie_path", &self.cookie_path)
            .finish_non_exhaustive()
    }
}

impl PooledSession {
    pub(crate) fn new(
        context: Arc<dyn ContextHandle>,
        cookie_path: String,
        platform: Option<&str>,
        parent: Weak<PooledBrowser>,
    ) -> Self {
        let platform = match platform {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => "browser".to_string(),
        };
        Self {
            id: Uuid::new_v4().to_string()[..8].to_string(),
            platform,
            cookie_path,
            context,
            page: Mutex::new(None),
            created_at: Instant::now(),
            state: Mutex::new(SessionState {
                // Sessions are born checked out by their creator
                checked_out: true,
                last_used: Instant::now(),
            }),
            parent,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn cookie_path(&self) -> &str {
        &self.cookie_path
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn is_checked_out(&self) -> bool {
        self.state.lock().checked_out
    }

    pub(crate) fn idle_elapsed(&self) -> Duration {
        self.state.lock().last_used.elapsed()
    }

    /// Claim this session for `identity` if it is idle and past the reuse
    /// cooldown. Called under the owning browser's lock.
    pub(crate) fn try_checkout(&self, identity: &str, cooldown: Duration) -> bool {
        if self.cookie_path != identity {
            return false;
        }
        let mut state = self.state.lock();
        if state.checked_out || state.last_used.elapsed() < cooldown {
            return false;
        }
        state.checked_out = true;
        state.last_used = Instant::now();
        true
    }

    /// Get the active page, creating it lazily. A close observer clears the
    /// page slot whenever the page closes, whether programmatically or by a
    /// human closing the window.
    pub async fn get_page(self: &Arc<Self>) -> Result<Arc<dyn PageHandle>, PoolError> {
        if let Some(page) = self.page.lock().clone() {
            return Ok(page);
        }

        info!("[{}] Creating page for session {}", self.platform, self.id);
        let page = self
            .context
            .new_page()
            .await
            .map_err(|e| PoolError::PageCreationFailed(e.to_string()))?;

        let session = Arc::downgrade(self);
        let platform = self.platform.clone();
        let session_id = self.id.clone();
        page.on_close(Box::new(move || {
            info!("[{}] Page of session {} was closed", platform, session_id);
            if let Some(session) = session.upgrade() {
                session.page.lock().take();
            }
        }));

        *self.page.lock() = Some(page.clone());
        Ok(page)
    }

    /// Liveness probe. A single failed evaluation is not proof of closure
    /// (a frame navigation mid-flight also fails); only three consecutive
    /// failed attempts, spaced by the retry delay, count as closed.
    pub async fn is_page_closed(&self) -> bool {
        let page = match self.page.lock().clone() {
            Some(page) => page,
            None => return true,
        };

        for attempt in 0..LIVENESS_RETRIES {
            if Self::check_page_alive(&page).await {
                return false;
            }
            if attempt < LIVENESS_RETRIES - 1 {
                tokio::time::sleep(LIVENESS_RETRY_DELAY).await;
            }
        }

        true
    }

    /// One probe attempt: trivial evaluation, location read, title read.
    async fn check_page_alive(page: &Arc<dyn PageHandle>) -> bool {
        if page.evaluate("1").await.is_err() {
            return false;
        }
        if page.evaluate("window.location.href").await.is_err() {
            return false;
        }
        page.evaluate("document.title").await.is_ok()
    }

    /// Release the session back to the pool.
    ///
    /// Normal path: cookies are persisted, only the page is closed (the
    /// context stays warm for reuse) and the session goes idle.
    ///
    /// Forced-close path: when the liveness probe says the page is gone,
    /// cookies are saved best effort, the context is force-closed, the
    /// session is removed from its browser and `SessionClosedExternally`
    /// is returned so the caller knows not to expect reuse.
    pub async fn release(self: &Arc<Self>) -> Result<(), PoolError> {
        let parent = self.parent.upgrade();
        let mut parent_state = match parent.as_ref() {
            Some(browser) => Some(browser.lock_state().await),
            None => None,
        };

        if self.is_page_closed().await {
            info!(
                "[{}] Browser was closed externally, cleaning up session {}",
                self.platform, self.id
            );

            if !self.cookie_path.is_empty() {
                match self.save_cookies_to(&self.cookie_path).await {
                    Ok(()) => info!("[{}] Cookies saved", self.platform),
                    Err(e) => warn!(
                        "[{}] Failed to save cookies (page already closed): {}",
                        self.platform, e
                    ),
                }
            }

            if let Err(e) = self.context.close().await {
                warn!("[{}] Failed to close context: {}", self.platform, e);
            }

            if let Some(state) = parent_state.as_mut() {
                state.remove_session(self);
            }

            info!("[{}] Session {} cleaned up", self.platform, self.id);
            return Err(PoolError::SessionClosedExternally);
        }

        info!("[{}] Releasing session {}", self.platform, self.id);

        match self.save_cookies().await {
            Ok(()) => info!("[{}] Cookies saved", self.platform),
            Err(e) => warn!("[{}] Failed to save cookies: {}", self.platform, e),
        }

        // Close only the page; the context keeps cookies/storage warm.
        let page = self.page.lock().take();
        if let Some(page) = page {
            if let Err(e) = page.close().await {
                warn!("[{}] Failed to close page: {}", self.platform, e);
            }
        }

        if let Some(state) = parent_state.as_mut() {
            state.release_one();
        }
        {
            let mut state = self.state.lock();
            state.checked_out = false;
            state.last_used = Instant::now();
        }

        debug!("[{}] Session {} is idle", self.platform, self.id);
        Ok(())
    }

    /// Persist the session's storage state to its identity path.
    pub async fn save_cookies(&self) -> Result<(), PoolError> {
        if self.cookie_path.is_empty() {
            return Err(PoolError::EmptyCookiePath);
        }
        let path = self.cookie_path.clone();
        self.save_cookies_to(&path).await
    }

    /// Serialize the full storage state (cookies + per-origin local
    /// storage) as JSON at `path`, creating parent directories as needed.
    pub async fn save_cookies_to(&self, path: &str) -> Result<(), PoolError> {
        let storage = self
            .context
            .storage_state()
            .await
            .map_err(|e| PoolError::CookiePersistence(e.to_string()))?;

        let data = serde_json::to_vec(&storage)?;

        if let Some(dir) = Path::new(path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    PoolError::CookiePersistence(format!("create cookie directory: {e}"))
                })?;
            }
        }

        std::fs::write(path, data)?;
        Ok(())
    }

    /// Unconditional forced shutdown, used by `BrowserPool::close`.
    pub async fn close(&self) -> Result<(), PoolError> {
        info!("[{}] Force closing session {}", self.platform, self.id);

        let page = self.page.lock().take();
        if let Some(page) = page {
            if let Err(e) = page.close().await {
                warn!("[{}] Failed to close page: {}", self.platform, e);
            }
        }

        self.context
            .close()
            .await
            .map_err(|e| PoolError::CloseFailed(e.to_string()))
    }

    /// Wait for this session's page to carry all required login cookies.
    pub async fn wait_for_login_cookies(
        &self,
        config: &PlatformCookieConfig,
    ) -> Result<(), PoolError> {
        self.wait_for_login_cookies_with_cancel(&CancellationToken::new(), config)
            .await
    }

    /// Same as [`wait_for_login_cookies`](Self::wait_for_login_cookies)
    /// but observing the caller's cancellation token.
    pub async fn wait_for_login_cookies_with_cancel(
        &self,
        cancel: &CancellationToken,
        config: &PlatformCookieConfig,
    ) -> Result<(), PoolError> {
        let page = self.page.lock().clone().ok_or(PoolError::PageNotCreated)?;
        CookieChecker::new()
            .wait_for_login_cookies(cancel, &page, config)
            .await
    }

    /// Single-shot check whether the session currently satisfies the
    /// platform's login cookie requirements.
    pub async fn validate_login_cookies(
        &self,
        config: &PlatformCookieConfig,
    ) -> Result<bool, PoolError> {
        let page = self.page.lock().clone().ok_or(PoolError::PageNotCreated)?;
        CookieChecker::new()
            .validate_login_cookies(&page, config)
            .await
    }

    /// Values of the named cookies on `domain`.
    pub async fn get_cookie_values(
        &self,
        domain: &str,
        names: &[String],
    ) -> Result<HashMap<String, String>, PoolError> {
        let page = self.page.lock().clone().ok_or(PoolError::PageNotCreated)?;
        CookieChecker::new()
            .get_cookie_values(&page, domain, names)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBrowser, MockContext};
    use crate::engine::{BrowserHandle, ContextOptions, StorageState};

    async fn make_session(cookie_path: &str) -> (Arc<MockContext>, Arc<PooledSession>) {
        make_session_with_options(cookie_path, &ContextOptions::default()).await
    }

    async fn make_session_with_options(
        cookie_path: &str,
        options: &ContextOptions,
    ) -> (Arc<MockContext>, Arc<PooledSession>) {
        let browser = MockBrowser::default();
        let context = browser.new_context(options).await.unwrap();
        let mock_context = browser.context(0);
        let session = Arc::new(PooledSession::new(
            context,
            cookie_path.to_string(),
            None,
            Weak::new(),
        ));
        (mock_context, session)
    }

    #[tokio::test]
    async fn test_get_page_is_idempotent() {
        let (context, session) = make_session("").await;

        let first = session.get_page().await.unwrap();
        let second = session.get_page().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(context.page_count(), 1);
    }

    #[tokio::test]
    async fn test_page_slot_cleared_by_close_observer() {
        let (context, session) = make_session("").await;

        session.get_page().await.unwrap();
        context.page(0).simulate_external_close();

        // The observer nulled the slot, so the next call creates a page
        session.get_page().await.unwrap();
        assert_eq!(context.page_count(), 2);
    }

    #[tokio::test]
    async fn test_is_page_closed_without_page() {
        let (_context, session) = make_session("").await;
        assert!(session.is_page_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_page_closed_needs_three_consecutive_failures() {
        let (context, session) = make_session("").await;
        session.get_page().await.unwrap();
        let page = context.page(0);

        // First attempt fails, second succeeds on all three probes: open.
        page.plan_evaluations(vec![
            Err("frame navigated".into()),
            Ok(serde_json::Value::from(1)),
            Ok(serde_json::Value::from("https://example.com")),
            Ok(serde_json::Value::from("title")),
        ]);
        assert!(!session.is_page_closed().await);
        assert_eq!(page.eval_calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_page_closed_after_three_failed_attempts() {
        let (context, session) = make_session("").await;
        session.get_page().await.unwrap();
        let page = context.page(0);

        // Every probe of every attempt fails; the slot stays populated so
        // the full tri-attempt path runs.
        page.plan_evaluations(vec![
            Err("transient failure".into()),
            Err("transient failure".into()),
            Err("transient failure".into()),
        ]);

        let start = Instant::now();
        assert!(session.is_page_closed().await);
        // Two retry delays between the three attempts
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(page.eval_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_release_normal_persists_and_parks_idle() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("bilibili_1.json");
        let cookie_path_str = cookie_path.to_string_lossy().to_string();

        let (context, session) = make_session(&cookie_path_str).await;
        context.set_cookie("SESSDATA", "token", ".bilibili.com");
        session.get_page().await.unwrap();

        session.release().await.unwrap();

        // Cookies persisted to the identity path
        let raw = std::fs::read_to_string(&cookie_path).unwrap();
        let state: StorageState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.cookies.len(), 1);
        assert_eq!(state.cookies[0].name, "SESSDATA");

        // Page closed, context kept warm, session idle
        assert!(context.page(0).closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!context.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!session.is_checked_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_forced_close_discards_session() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("douyin_2.json");
        let cookie_path_str = cookie_path.to_string_lossy().to_string();

        let (context, session) = make_session(&cookie_path_str).await;
        session.get_page().await.unwrap();
        context.page(0).simulate_external_close();
        // The close observer cleared the slot, so the probe short-circuits

        let err = session.release().await.unwrap_err();
        assert!(matches!(err, PoolError::SessionClosedExternally));
        assert!(context.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_save_cookies_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("nested/cookies/tencent_3.json");
        let cookie_path_str = cookie_path.to_string_lossy().to_string();

        let (context, session) = make_session("").await;
        context.set_cookie("sessionid", "s", "channels.weixin.qq.com");

        session.save_cookies_to(&cookie_path_str).await.unwrap();
        assert!(cookie_path.exists());
    }

    #[tokio::test]
    async fn test_save_cookies_requires_identity_path() {
        let (_context, session) = make_session("").await;
        let err = session.save_cookies().await.unwrap_err();
        assert!(matches!(err, PoolError::EmptyCookiePath));
    }

    #[tokio::test]
    async fn test_storage_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("roundtrip.json");
        let cookie_path_str = cookie_path.to_string_lossy().to_string();

        let (context, session) = make_session(&cookie_path_str).await;
        context.set_cookie("SESSDATA", "token", ".bilibili.com");
        context.set_cookie("bili_jct", "csrf", ".bilibili.com");
        session.save_cookies_to(&cookie_path_str).await.unwrap();

        // Seed a fresh session from the persisted state
        let raw = std::fs::read_to_string(&cookie_path).unwrap();
        let state: StorageState = serde_json::from_str(&raw).unwrap();
        let options = ContextOptions {
            storage_state: Some(state),
            ..Default::default()
        };
        let (seeded_context, _seeded_session) = make_session_with_options("", &options).await;

        let restored = seeded_context.jar.lock().clone();
        let mut names: Vec<&str> = restored.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["SESSDATA", "bili_jct"]);
        assert!(restored.iter().all(|c| !c.value.is_empty()));
    }

    #[tokio::test]
    async fn test_wait_for_login_cookies_requires_page() {
        let (_context, session) = make_session("").await;
        let config = crate::browser::cookie_config::cookie_config("bilibili").unwrap();
        let err = session.wait_for_login_cookies(&config).await.unwrap_err();
        assert!(matches!(err, PoolError::PageNotCreated));
    }
}
