//! Pool configuration
//!
//! Loaded from a JSON file under the platform config directory, with env
//! switches for the knobs operators flip most often.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

fn default_max_browsers() -> usize {
    2
}

fn default_max_contexts() -> usize {
    4
}

fn default_cookie_dir() -> PathBuf {
    PathBuf::from("cookies")
}

/// Browser pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum concurrent browser processes.
    #[serde(default = "default_max_browsers")]
    pub max_browsers: usize,
    /// Maximum sessions hosted per browser process.
    #[serde(default = "default_max_contexts")]
    pub max_contexts_per_browser: usize,
    /// Run browsers without a visible window.
    #[serde(default)]
    pub headless: bool,
    /// Explicit Chrome/Chromium executable; auto-detected when unset.
    #[serde(default)]
    pub chrome_path: Option<String>,
    /// Directory holding per-account cookie files.
    #[serde(default = "default_cookie_dir")]
    pub cookie_dir: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_browsers: default_max_browsers(),
            max_contexts_per_browser: default_max_contexts(),
            headless: false,
            chrome_path: None,
            cookie_dir: default_cookie_dir(),
        }
    }
}

impl PoolConfig {
    /// Config file path under the platform config directory.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fuploader").join("pool.json"))
    }

    /// Load from the config file, falling back to defaults, then apply env
    /// overrides (`FUPLOADER_HEADLESS=true`).
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|raw| match serde_json::from_str::<Self>(&raw) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Ignoring malformed pool config: {}", e);
                    None
                }
            })
            .unwrap_or_default();

        if std::env::var("FUPLOADER_HEADLESS").as_deref() == Ok("true") {
            config.headless = true;
        }

        config
    }

    /// Persist to the config file, creating directories as needed.
    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_path().ok_or("no config directory available")?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(path, raw).map_err(|e| e.to_string())
    }

    /// Cookie file path for one platform account.
    pub fn cookie_path(&self, platform: &str, account_id: i64) -> PathBuf {
        self.cookie_dir.join(format!("{platform}_{account_id}.json"))
    }
}
