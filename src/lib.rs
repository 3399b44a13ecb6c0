//! Fuploader browser core
//!
//! Browser session pool and cookie-based login detection for publishing
//! video content to multiple platforms through a real browser. Platform
//! uploaders check sessions out of the shared [`BrowserPool`], drive the
//! page, and let the cookie checker decide login state without any platform
//! API.

pub mod browser;
pub mod config;
pub mod engine;
pub mod validate;

use std::path::PathBuf;

use tracing::info;

pub use browser::{
    cookie_config, BrowserPool, CookieChecker, CookieDomainConfig, PlatformCookieConfig,
    PoolError, PoolStats, PooledSession,
};
pub use config::PoolConfig;
pub use engine::{CdpEngine, ContextOptions, Cookie, LaunchOptions, StorageState};
pub use validate::{SessionValidator, ValidationOptions};

/// Log directory under the platform config directory.
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fuploader").join("logs"))
}

/// Initialize logging: env-filtered console output plus a daily-rolling
/// file when the log directory is available. The returned guard must stay
/// alive for the file writer to flush.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_level = if std::env::var("FUPLOADER_DEBUG").as_deref() == Ok("true") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let env_filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "fuploader.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Log files saved to: {}", log_dir.display());
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
