//! Browser pool error types

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the pool, sessions and cookie detection.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("browser pool at capacity ({max_browsers} browsers x {max_contexts} contexts)")]
    CapacityExceeded {
        max_browsers: usize,
        max_contexts: usize,
    },

    #[error("failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("failed to create browsing context: {0}")]
    ContextCreationFailed(String),

    #[error("failed to create page: {0}")]
    PageCreationFailed(String),

    /// The page/context behind a session was closed by something outside
    /// the pool's control. Terminal for the session, not for the pool.
    #[error("session was closed externally")]
    SessionClosedExternally,

    #[error("failed to persist cookies: {0}")]
    CookiePersistence(String),

    #[error("timed out waiting for login cookies after {0:?}")]
    LoginTimeout(Duration),

    #[error("login cookie wait cancelled")]
    LoginCancelled,

    #[error("cookie validation failed: {0}")]
    ValidationFailed(String),

    #[error("page not created")]
    PageNotCreated,

    #[error("failed to close session: {0}")]
    CloseFailed(String),

    #[error("cookie path is empty")]
    EmptyCookiePath,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<PoolError> for String {
    fn from(err: PoolError) -> String {
        err.to_string()
    }
}
