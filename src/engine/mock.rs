//! In-memory engine for tests
//!
//! Implements the engine contract with a shared cookie jar per context,
//! scriptable evaluation outcomes and external-close simulation, so pool,
//! session and cookie-checker behavior is testable without a browser.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    domain_matches, host_of, BrowserEngine, BrowserHandle, CloseSubscription, ContextHandle,
    ContextOptions, Cookie, EngineError, LaunchOptions, PageHandle, StorageState,
};

#[derive(Default)]
pub(crate) struct MockEngine {
    pub browsers: Mutex<Vec<Arc<MockBrowser>>>,
    /// When set, the next launch fails with this message.
    pub fail_launch: Mutex<Option<String>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launch_count(&self) -> usize {
        self.browsers.lock().len()
    }

    pub fn browser(&self, index: usize) -> Arc<MockBrowser> {
        self.browsers.lock()[index].clone()
    }
}

#[async_trait]
impl BrowserEngine for MockEngine {
    async fn launch(&self, _options: &LaunchOptions) -> Result<Arc<dyn BrowserHandle>, EngineError> {
        if let Some(message) = self.fail_launch.lock().take() {
            return Err(EngineError::LaunchFailed(message));
        }
        let browser = Arc::new(MockBrowser::default());
        self.browsers.lock().push(browser.clone());
        Ok(browser)
    }
}

#[derive(Default)]
pub(crate) struct MockBrowser {
    pub contexts: Mutex<Vec<Arc<MockContext>>>,
    pub closed: AtomicBool,
}

impl MockBrowser {
    pub fn context(&self, index: usize) -> Arc<MockContext> {
        self.contexts.lock()[index].clone()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }
}

#[async_trait]
impl BrowserHandle for MockBrowser {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Arc<dyn ContextHandle>, EngineError> {
        let context = Arc::new(MockContext {
            jar: Arc::new(Mutex::new(
                options
                    .storage_state
                    .as_ref()
                    .map(|state| state.cookies.clone())
                    .unwrap_or_default(),
            )),
            origins: Mutex::new(
                options
                    .storage_state
                    .as_ref()
                    .map(|state| state.origins.clone())
                    .unwrap_or_default(),
            ),
            options: options.clone(),
            pages: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.contexts.lock().push(context.clone());
        Ok(context)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockContext {
    pub jar: Arc<Mutex<Vec<Cookie>>>,
    pub origins: Mutex<Vec<super::OriginState>>,
    pub options: ContextOptions,
    pub pages: Mutex<Vec<Arc<MockPage>>>,
    pub closed: AtomicBool,
}

impl MockContext {
    pub fn set_cookie(&self, name: &str, value: &str, domain: &str) {
        let mut jar = self.jar.lock();
        jar.retain(|c| !(c.name == name && c.domain == domain));
        jar.push(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
            ..Default::default()
        });
    }

    pub fn remove_cookie(&self, name: &str) {
        self.jar.lock().retain(|c| c.name != name);
    }

    pub fn page(&self, index: usize) -> Arc<MockPage> {
        self.pages.lock()[index].clone()
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    fn filtered_cookies(&self, domain: Option<&str>) -> Vec<Cookie> {
        let jar = self.jar.lock();
        match domain {
            None => jar.clone(),
            Some(domain) => {
                let host = host_of(domain);
                jar.iter()
                    .filter(|c| domain_matches(&c.domain, &host))
                    .cloned()
                    .collect()
            }
        }
    }
}

#[async_trait]
impl ContextHandle for MockContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::PageCreationFailed(
                "context or browser has been closed".into(),
            ));
        }
        let page = Arc::new(MockPage {
            jar: self.jar.clone(),
            eval_plan: Mutex::new(VecDeque::new()),
            eval_calls: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
        });
        self.pages.lock().push(page.clone());
        Ok(page)
    }

    async fn cookies(&self, domain: Option<&str>) -> Result<Vec<Cookie>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::CookieQueryFailed(
                "context or browser has been closed".into(),
            ));
        }
        Ok(self.filtered_cookies(domain))
    }

    async fn storage_state(&self) -> Result<StorageState, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::StorageStateFailed(
                "context or browser has been closed".into(),
            ));
        }
        Ok(StorageState {
            cookies: self.jar.lock().clone(),
            origins: self.origins.lock().clone(),
        })
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        for page in self.pages.lock().iter() {
            page.mark_closed();
        }
        Ok(())
    }
}

pub(crate) struct MockPage {
    /// Shared with the owning context, so cookies added by the test are
    /// immediately visible through the page.
    jar: Arc<Mutex<Vec<Cookie>>>,
    /// Scripted evaluation outcomes, popped per call; empty means success.
    pub eval_plan: Mutex<VecDeque<Result<serde_json::Value, String>>>,
    pub eval_calls: AtomicU64,
    pub closed: AtomicBool,
    observers: Mutex<Vec<(u64, Box<dyn Fn() + Send + Sync>)>>,
    next_observer_id: AtomicU64,
}

impl MockPage {
    /// Queue evaluation outcomes: `Ok` entries succeed, `Err` entries fail
    /// with the given message.
    pub fn plan_evaluations(&self, plan: Vec<Result<serde_json::Value, String>>) {
        *self.eval_plan.lock() = plan.into();
    }

    /// Simulate the page being closed from outside the pool (e.g. a human
    /// closing the window).
    pub fn simulate_external_close(&self) {
        self.mark_closed();
    }

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
impl PageHandle for MockPage {
    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, EngineError> {
        self.eval_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionLost("page has been closed".into()));
        }
        match self.eval_plan.lock().pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(EngineError::EvaluationFailed(message)),
            None => Ok(serde_json::Value::Null),
        }
    }

    async fn cookies(&self, domain: Option<&str>) -> Result<Vec<Cookie>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionLost("page has been closed".into()));
        }
        let jar = self.jar.lock();
        match domain {
            None => Ok(jar.clone()),
            Some(domain) => {
                let host = host_of(domain);
                Ok(jar
                    .iter()
                    .filter(|c| domain_matches(&c.domain, &host))
                    .cloned()
                    .collect())
            }
        }
    }

    fn on_close(&self, observer: Box<dyn Fn() + Send + Sync>) -> CloseSubscription {
        if self.closed.load(Ordering::SeqCst) {
            observer();
            return CloseSubscription(0);
        }
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().push((id, observer));
        CloseSubscription(id)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.mark_closed();
        Ok(())
    }
}
