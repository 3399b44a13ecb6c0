//! Per-platform login cookie requirements
//!
//! Required cookies keep the login verdict; extended cookies are recorded
//! for diagnostics/risk control but never load-bearing. Some platforms need
//! cookies across two origins at once (multi-domain entries).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Cookie requirements for a single domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieDomainConfig {
    /// Cookie domain (bare host or full URL); empty means "the current
    /// page's domain".
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub required_cookies: Vec<String>,
    #[serde(default)]
    pub extended_cookies: Vec<String>,
}

/// Cookie detection configuration for one publishing platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformCookieConfig {
    /// Multi-domain configuration; takes precedence when non-empty.
    #[serde(default)]
    pub domains: Vec<CookieDomainConfig>,
    /// Single-domain form kept for older platform configs.
    #[serde(default)]
    pub required_cookies: Vec<String>,
    #[serde(default)]
    pub extended_cookies: Vec<String>,
    /// Page used to re-check a stored session; empty when unconfigured.
    #[serde(default)]
    pub validate_url: String,
}

impl PlatformCookieConfig {
    /// The domain configs to check, falling back to a single current-page
    /// entry for the legacy single-domain form.
    pub fn check_domains(&self) -> Vec<CookieDomainConfig> {
        if !self.domains.is_empty() {
            return self.domains.clone();
        }
        vec![CookieDomainConfig {
            domain: String::new(),
            required_cookies: self.required_cookies.clone(),
            extended_cookies: self.extended_cookies.clone(),
        }]
    }

    /// Every cookie name the config cares about (required + extended,
    /// across all domains).
    pub fn all_cookie_names(&self) -> Vec<String> {
        if !self.domains.is_empty() {
            let mut names = Vec::new();
            for domain in &self.domains {
                names.extend(domain.required_cookies.iter().cloned());
                names.extend(domain.extended_cookies.iter().cloned());
            }
            return names;
        }
        let mut names =
            Vec::with_capacity(self.required_cookies.len() + self.extended_cookies.len());
        names.extend(self.required_cookies.iter().cloned());
        names.extend(self.extended_cookies.iter().cloned());
        names
    }

    /// Domains carrying cookies worth persisting.
    pub fn all_domains(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.domain.clone()).collect()
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Static registry of cookie requirements per platform.
static PLATFORM_COOKIE_CONFIGS: Lazy<HashMap<&'static str, PlatformCookieConfig>> =
    Lazy::new(|| {
        let mut configs = HashMap::new();

        configs.insert(
            "bilibili",
            PlatformCookieConfig {
                required_cookies: strings(&["SESSDATA"]),
                extended_cookies: strings(&["bili_jct", "DedeUserID"]),
                ..Default::default()
            },
        );

        configs.insert(
            "douyin",
            PlatformCookieConfig {
                required_cookies: strings(&["sessionid"]),
                extended_cookies: strings(&["ttwid", "odin_tt"]),
                ..Default::default()
            },
        );

        configs.insert(
            "tiktok",
            PlatformCookieConfig {
                required_cookies: strings(&["sessionid"]),
                extended_cookies: strings(&["_ttp", "tt_chain_token"]),
                ..Default::default()
            },
        );

        configs.insert(
            "kuaishou",
            PlatformCookieConfig {
                required_cookies: strings(&["kuaishou.web.cp.api_ph", "kuaishou.web.cp.api_st"]),
                extended_cookies: strings(&["did"]),
                ..Default::default()
            },
        );

        // WeChat Channels keeps its session cookies on the creator origin
        configs.insert(
            "tencent",
            PlatformCookieConfig {
                domains: vec![CookieDomainConfig {
                    domain: "https://channels.weixin.qq.com".to_string(),
                    required_cookies: strings(&["sessionid", "wxuin"]),
                    extended_cookies: Vec::new(),
                }],
                ..Default::default()
            },
        );

        configs.insert(
            "baijiahao",
            PlatformCookieConfig {
                required_cookies: strings(&["PTOKEN"]),
                extended_cookies: strings(&["BAIDUID", "STOKEN", "BDUSS"]),
                ..Default::default()
            },
        );

        // Xiaohongshu logins span the main site and the creator console;
        // both must be satisfied on the same check.
        configs.insert(
            "xiaohongshu",
            PlatformCookieConfig {
                domains: vec![
                    CookieDomainConfig {
                        domain: "https://xiaohongshu.com".to_string(),
                        required_cookies: strings(&["web_session", "a1", "customer-sso-sid"]),
                        extended_cookies: strings(&["loadts", "websectiga", "webBuild", "webId"]),
                    },
                    CookieDomainConfig {
                        domain: "https://creator.xiaohongshu.com".to_string(),
                        required_cookies: strings(&[
                            "galaxy_creator_session_id",
                            "galaxy.creator.beaker.session.id",
                            "x-user-id-creator.xiaohongshu.com",
                            "access-token-creator.xiaohongshu.com",
                        ]),
                        extended_cookies: Vec::new(),
                    },
                ],
                ..Default::default()
            },
        );

        configs
    });

/// Look up the cookie configuration for a platform.
pub fn cookie_config(platform: &str) -> Option<PlatformCookieConfig> {
    PLATFORM_COOKIE_CONFIGS.get(platform).cloned()
}

/// All platforms with a registered cookie configuration.
pub fn registered_platforms() -> Vec<&'static str> {
    let mut platforms: Vec<&'static str> = PLATFORM_COOKIE_CONFIGS.keys().copied().collect();
    platforms.sort_unstable();
    platforms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let config = cookie_config("bilibili").unwrap();
        assert_eq!(config.required_cookies, vec!["SESSDATA"]);
        assert!(cookie_config("unknown-platform").is_none());
    }

    #[test]
    fn test_check_domains_legacy_fallback() {
        let config = cookie_config("douyin").unwrap();
        let domains = config.check_domains();
        assert_eq!(domains.len(), 1);
        assert!(domains[0].domain.is_empty());
        assert_eq!(domains[0].required_cookies, vec!["sessionid"]);
    }

    #[test]
    fn test_multi_domain_config() {
        let config = cookie_config("xiaohongshu").unwrap();
        let domains = config.check_domains();
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].domain, "https://xiaohongshu.com");
        assert_eq!(domains[1].domain, "https://creator.xiaohongshu.com");
    }

    #[test]
    fn test_all_cookie_names_merges_domains() {
        let config = cookie_config("xiaohongshu").unwrap();
        let names = config.all_cookie_names();
        assert!(names.contains(&"web_session".to_string()));
        assert!(names.contains(&"galaxy_creator_session_id".to_string()));
        assert!(names.contains(&"loadts".to_string()));
    }

    #[test]
    fn test_registered_platforms() {
        let platforms = registered_platforms();
        assert_eq!(platforms.len(), 7);
        assert!(platforms.contains(&"tencent"));
    }
}
