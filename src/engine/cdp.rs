//! CDP engine binding
//!
//! Drives Chrome/Chromium over the DevTools protocol via chromiumoxide.
//! Each pooled session maps to an isolated CDP BrowserContext (separate
//! cookies/storage), created with `Target.createBrowserContext`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetGeolocationOverrideParams, SetLocaleOverrideParams,
    SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, CookieSameSite, Headers, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
    TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::storage;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    domain_matches, host_of, BrowserEngine, BrowserHandle, CloseSubscription, ContextHandle,
    ContextOptions, Cookie, EngineError, LaunchOptions, OriginState, PageHandle, StorageState,
};

/// Stealth init script injected into every page of an anti-detect context.
/// Covers the common automation markers checked by platform risk systems.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', {
    get: () => undefined,
    configurable: true
});
window.chrome = window.chrome || {
    runtime: {},
    loadTimes: function() {},
    csi: function() {},
    app: {}
};
if (window.navigator.permissions && window.navigator.permissions.query) {
    const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
    window.navigator.permissions.query = (parameters) => (
        parameters.name === 'notifications' ?
        Promise.resolve({ state: Notification.permission }) :
        originalQuery(parameters)
    );
}
Object.defineProperty(navigator, 'plugins', {
    get: () => [
        { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
        { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
        { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
    ],
    configurable: true
});
Object.defineProperty(navigator, 'languages', {
    get: () => ['zh-CN', 'zh', 'en'],
    configurable: true
});
"#;

/// Reads back one origin's localStorage as a JSON string.
const LOCAL_STORAGE_CAPTURE: &str = r#"
(() => {
    const entries = [];
    for (let i = 0; i < localStorage.length; i++) {
        const key = localStorage.key(i);
        entries.push({ name: key, value: localStorage.getItem(key) });
    }
    return JSON.stringify({ origin: location.origin, localStorage: entries });
})()
"#;

/// Chrome command-line hardening, matching what the platforms tolerate.
fn default_launch_args() -> Vec<&'static str> {
    vec![
        "--disable-blink-features=AutomationControlled",
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-dev-shm-usage",
        "--window-position=0,0",
        "--start-maximized",
        "--disable-infobars",
        "--disable-extensions",
        "--disable-default-apps",
        "--disable-background-networking",
        "--disable-sync",
        "--disable-translate",
        "--disable-popup-blocking",
        "--disable-features=IsolateOrigins,site-per-process,SameSiteByDefaultCookies,CookiesWithoutSameSiteMustBeSecure",
        "--disable-site-isolation-trials",
        "--no-first-run",
        "--no-default-browser-check",
    ]
}

/// Find a Chrome/Chromium executable on the system.
fn find_chrome() -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Production engine driving local Chrome over CDP.
#[derive(Debug, Default)]
pub struct CdpEngine;

impl CdpEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserEngine for CdpEngine {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn BrowserHandle>, EngineError> {
        if options.chrome_path.is_none() && find_chrome().is_none() {
            return Err(EngineError::LaunchFailed(
                "Chrome/Chromium not found. Install Chrome or set an explicit chrome path."
                    .to_string(),
            ));
        }

        let mut builder = BrowserConfig::builder();

        if !options.headless {
            builder = builder.with_head();
        }

        if let Some(ref path) = options.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(path) = find_chrome() {
            info!("Auto-detected Chrome at: {}", path.display());
            builder = builder.chrome_executable(path);
        }

        builder = builder.viewport(Viewport {
            width: options.window_width,
            height: options.window_height,
            ..Default::default()
        });

        for arg in default_launch_args() {
            builder = builder.arg(arg);
        }
        for arg in &options.extra_args {
            builder = builder.arg(arg);
        }

        let config = builder.build().map_err(EngineError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| EngineError::LaunchFailed(e.to_string()))?;

        let inner = Arc::new(BrowserInner {
            browser: tokio::sync::Mutex::new(Some(browser)),
            alive: AtomicBool::new(true),
        });

        let inner_for_handler = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            // Handler ended = Chrome disconnected or crashed
            warn!("Chrome disconnected (event handler ended)");
            inner_for_handler.alive.store(false, Ordering::Relaxed);
        });

        Ok(Arc::new(CdpBrowser { inner }))
    }
}

/// Shared access to the underlying chromiumoxide connection, held by the
/// browser handle and every context/page created from it.
struct BrowserInner {
    browser: tokio::sync::Mutex<Option<Browser>>,
    alive: AtomicBool,
}

impl BrowserInner {
    fn connection_lost() -> EngineError {
        EngineError::ConnectionLost("browser already closed".into())
    }

    fn check_alive(&self) -> Result<(), EngineError> {
        if self.alive.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(EngineError::ConnectionLost("browser process exited".into()))
        }
    }
}

/// One running Chrome process.
pub struct CdpBrowser {
    inner: Arc<BrowserInner>,
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Arc<dyn ContextHandle>, EngineError> {
        self.inner.check_alive()?;

        let context_id = {
            let guard = self.inner.browser.lock().await;
            let handle = guard.as_ref().ok_or_else(BrowserInner::connection_lost)?;
            handle
                .execute(CreateBrowserContextParams::default())
                .await
                .map_err(|e| EngineError::ContextCreationFailed(e.to_string()))?
                .result
                .browser_context_id
        };

        let mut seed_origins = Vec::new();
        if let Some(ref state) = options.storage_state {
            if !state.cookies.is_empty() {
                let cookies: Vec<CookieParam> = state
                    .cookies
                    .iter()
                    .map(cookie_param)
                    .collect::<Result<_, _>>()?;

                let guard = self.inner.browser.lock().await;
                let handle = guard.as_ref().ok_or_else(BrowserInner::connection_lost)?;
                handle
                    .execute(storage::SetCookiesParams {
                        cookies,
                        browser_context_id: Some(context_id.clone()),
                    })
                    .await
                    .map_err(|e| EngineError::ContextCreationFailed(e.to_string()))?;
            }
            seed_origins = state.origins.clone();
            debug!(
                "Seeded context with {} cookies, {} origins",
                state.cookies.len(),
                seed_origins.len()
            );
        }

        Ok(Arc::new(CdpContext {
            browser: self.inner.clone(),
            context_id,
            options: options.clone(),
            seed_origins,
            pages: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut guard = self.inner.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            // Graceful close first, brief grace period, then force kill so
            // no Chrome child processes linger.
            let _ = browser.close().await;
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = browser.kill().await;
        }
        self.inner.alive.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// One isolated CDP browser context.
pub struct CdpContext {
    browser: Arc<BrowserInner>,
    context_id: BrowserContextId,
    options: ContextOptions,
    seed_origins: Vec<OriginState>,
    pages: parking_lot::Mutex<Vec<Weak<CdpPage>>>,
}

#[async_trait]
impl ContextHandle for CdpContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, EngineError> {
        self.browser.check_alive()?;

        let page = {
            let guard = self.browser.browser.lock().await;
            let handle = guard.as_ref().ok_or_else(BrowserInner::connection_lost)?;
            let params = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(self.context_id.clone())
                .build()
                .map_err(EngineError::PageCreationFailed)?;
            handle
                .new_page(params)
                .await
                .map_err(|e| EngineError::PageCreationFailed(e.to_string()))?
        };

        apply_context_overrides(&page, &self.options).await?;

        if self.options.enable_anti_detect {
            page.evaluate_on_new_document(STEALTH_SCRIPT)
                .await
                .map_err(|e| EngineError::PageCreationFailed(e.to_string()))?;
        }

        if let Some(script) = local_storage_seed_script(&self.seed_origins) {
            page.evaluate_on_new_document(script.as_str())
                .await
                .map_err(|e| EngineError::PageCreationFailed(e.to_string()))?;
        }

        let cdp_page = Arc::new(CdpPage {
            browser: self.browser.clone(),
            context_id: self.context_id.clone(),
            page,
            closed: AtomicBool::new(false),
            observers: parking_lot::Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
        });

        self.pages.lock().push(Arc::downgrade(&cdp_page));

        Ok(cdp_page)
    }

    async fn cookies(&self, domain: Option<&str>) -> Result<Vec<Cookie>, EngineError> {
        fetch_context_cookies(&self.browser, &self.context_id, domain).await
    }

    async fn storage_state(&self) -> Result<StorageState, EngineError> {
        let cookies = fetch_context_cookies(&self.browser, &self.context_id, None).await?;

        // Local storage is only observable through a live page; capture is
        // best effort for whatever origins the open pages are on.
        let pages: Vec<Arc<CdpPage>> = {
            let mut slots = self.pages.lock();
            slots.retain(|weak| weak.strong_count() > 0);
            slots.iter().filter_map(|weak| weak.upgrade()).collect()
        };

        let mut origins: Vec<OriginState> = Vec::new();
        for page in pages {
            if page.closed.load(Ordering::Relaxed) {
                continue;
            }
            match page.evaluate(LOCAL_STORAGE_CAPTURE).await {
                Ok(serde_json::Value::String(raw)) => {
                    match serde_json::from_str::<OriginState>(&raw) {
                        Ok(state) if !state.local_storage.is_empty() => {
                            if !origins.iter().any(|o| o.origin == state.origin) {
                                origins.push(state);
                            }
                        }
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("localStorage capture skipped: {}", e),
            }
        }

        Ok(StorageState { cookies, origins })
    }

    async fn close(&self) -> Result<(), EngineError> {
        let pages: Vec<Arc<CdpPage>> = self
            .pages
            .lock()
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect();
        for page in pages {
            let _ = page.close().await;
        }

        let guard = self.browser.browser.lock().await;
        let handle = guard.as_ref().ok_or_else(BrowserInner::connection_lost)?;
        handle
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await
            .map_err(|e| EngineError::CloseFailed(e.to_string()))?;
        Ok(())
    }
}

/// One CDP page (tab).
pub struct CdpPage {
    browser: Arc<BrowserInner>,
    context_id: BrowserContextId,
    page: Page,
    closed: AtomicBool,
    observers: parking_lot::Mutex<Vec<(u64, Box<dyn Fn() + Send + Sync>)>>,
    next_observer_id: AtomicU64,
}

impl CdpPage {
    /// Flip to closed exactly once and notify observers. Called on explicit
    /// close and whenever an evaluation reports a closed target: CDP gives
    /// no reliable event for a target destroyed by the user, so the error
    /// signature is the detection point.
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let observers = self.observers.lock();
            for (_, observer) in observers.iter() {
                observer();
            }
        }
    }
}

#[async_trait]
impl PageHandle for CdpPage {
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::ConnectionLost("page has been closed".into()));
        }

        match self.page.evaluate(script.to_string()).await {
            Ok(result) => Ok(result
                .into_value::<serde_json::Value>()
                .unwrap_or(serde_json::Value::Null)),
            Err(e) => {
                let err = EngineError::EvaluationFailed(e.to_string());
                if err.is_closed() {
                    self.mark_closed();
                }
                Err(err)
            }
        }
    }

    async fn cookies(&self, domain: Option<&str>) -> Result<Vec<Cookie>, EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::ConnectionLost("page has been closed".into()));
        }
        fetch_context_cookies(&self.browser, &self.context_id, domain).await
    }

    fn on_close(&self, observer: Box<dyn Fn() + Send + Sync>) -> CloseSubscription {
        if self.closed.load(Ordering::Relaxed) {
            observer();
            return CloseSubscription(0);
        }
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, observer));
        CloseSubscription(id)
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(());
        }
        let result = self
            .page
            .clone()
            .close()
            .await
            .map_err(|e| EngineError::CloseFailed(e.to_string()));
        self.mark_closed();
        result.map(|_| ())
    }
}

/// Fetch all cookies of a CDP browser context, optionally domain-scoped.
async fn fetch_context_cookies(
    browser: &Arc<BrowserInner>,
    context_id: &BrowserContextId,
    domain: Option<&str>,
) -> Result<Vec<Cookie>, EngineError> {
    browser.check_alive()?;

    let mut cookies: Vec<Cookie> = {
        let guard = browser.browser.lock().await;
        let handle = guard.as_ref().ok_or_else(BrowserInner::connection_lost)?;
        let mut params = storage::GetCookiesParams::default();
        params.browser_context_id = Some(context_id.clone());
        let resp = handle
            .execute(params)
            .await
            .map_err(|e| EngineError::CookieQueryFailed(e.to_string()))?;
        resp.result.cookies.iter().map(convert_cookie).collect()
    };

    if let Some(domain) = domain {
        let host = host_of(domain);
        cookies.retain(|c| domain_matches(&c.domain, &host));
    }

    Ok(cookies)
}

fn convert_cookie(c: &chromiumoxide::cdp::browser_protocol::network::Cookie) -> Cookie {
    Cookie {
        name: c.name.clone(),
        value: c.value.clone(),
        domain: c.domain.clone(),
        path: c.path.clone(),
        // CDP reports -1 for session cookies
        expires: if c.expires >= 0.0 { Some(c.expires) } else { None },
        http_only: c.http_only,
        secure: c.secure,
        same_site: c.same_site.as_ref().map(|s| {
            match s {
                CookieSameSite::Strict => "Strict",
                CookieSameSite::Lax => "Lax",
                CookieSameSite::None => "None",
            }
            .to_string()
        }),
    }
}

fn cookie_param(c: &Cookie) -> Result<CookieParam, EngineError> {
    let mut builder = CookieParam::builder()
        .name(c.name.clone())
        .value(c.value.clone())
        .path(c.path.clone())
        .secure(c.secure)
        .http_only(c.http_only);

    if !c.domain.is_empty() {
        builder = builder.domain(c.domain.clone());
    }
    if let Some(expires) = c.expires {
        builder = builder.expires(TimeSinceEpoch::new(expires));
    }
    if let Some(ref same_site) = c.same_site {
        let mapped = match same_site.to_lowercase().as_str() {
            "strict" => Some(CookieSameSite::Strict),
            "lax" => Some(CookieSameSite::Lax),
            "none" => Some(CookieSameSite::None),
            _ => None,
        };
        if let Some(value) = mapped {
            builder = builder.same_site(value);
        }
    }

    builder
        .build()
        .map_err(|e| EngineError::ContextCreationFailed(format!("invalid cookie {}: {}", c.name, e)))
}

/// Builds an init script restoring the seeded localStorage entries for
/// whichever of the recorded origins the page ends up on.
fn local_storage_seed_script(origins: &[OriginState]) -> Option<String> {
    if origins.is_empty() {
        return None;
    }

    let mut seeds = serde_json::Map::new();
    for origin in origins {
        seeds.insert(
            origin.origin.clone(),
            serde_json::to_value(&origin.local_storage).unwrap_or_default(),
        );
    }
    let payload = serde_json::Value::Object(seeds).to_string();

    Some(format!(
        r#"(() => {{
    const seeds = {payload};
    const entries = seeds[location.origin];
    if (!entries) return;
    for (const item of entries) {{
        try {{ localStorage.setItem(item.name, item.value); }} catch (e) {{}}
    }}
}})();"#
    ))
}

/// Apply per-context options to a freshly created page. The context itself
/// has no CDP surface for these; they are page-session overrides.
async fn apply_context_overrides(page: &Page, options: &ContextOptions) -> Result<(), EngineError> {
    if let Some(ref user_agent) = options.user_agent {
        let mut builder = SetUserAgentOverrideParams::builder().user_agent(user_agent.clone());
        if let Some(accept_language) = options.extra_headers.get("Accept-Language") {
            builder = builder.accept_language(accept_language.clone());
        }
        let params = builder.build().map_err(EngineError::PageCreationFailed)?;
        page.execute(params)
            .await
            .map_err(|e| EngineError::PageCreationFailed(format!("set user agent: {}", e)))?;
    }

    if let Some(ref locale) = options.locale {
        let params = SetLocaleOverrideParams::builder().locale(locale.clone()).build();
        page.execute(params)
            .await
            .map_err(|e| EngineError::PageCreationFailed(format!("set locale: {}", e)))?;
    }

    if let Some(ref timezone) = options.timezone_id {
        page.execute(SetTimezoneOverrideParams::new(timezone.clone()))
            .await
            .map_err(|e| EngineError::PageCreationFailed(format!("set timezone: {}", e)))?;
    }

    if let Some(geolocation) = options.geolocation {
        let mut params = SetGeolocationOverrideParams::default();
        params.latitude = Some(geolocation.latitude);
        params.longitude = Some(geolocation.longitude);
        params.accuracy = Some(100.0);
        page.execute(params)
            .await
            .map_err(|e| EngineError::PageCreationFailed(format!("set geolocation: {}", e)))?;
    }

    if let Some(viewport) = options.viewport {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(EngineError::PageCreationFailed)?;
        page.execute(params)
            .await
            .map_err(|e| EngineError::PageCreationFailed(format!("set viewport: {}", e)))?;
    }

    if !options.extra_headers.is_empty() {
        let headers_json = serde_json::to_value(&options.extra_headers)
            .map_err(|e| EngineError::PageCreationFailed(e.to_string()))?;
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers_json)))
            .await
            .map_err(|e| EngineError::PageCreationFailed(format!("set extra headers: {}", e)))?;
    }

    Ok(())
}
