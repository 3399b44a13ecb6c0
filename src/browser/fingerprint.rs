//! Randomized browser fingerprints
//!
//! Pure generation of locale/geo/viewport-consistent context options so
//! pooled sessions don't all present the identical fingerprint to the
//! platforms' risk systems.

use std::collections::HashMap;

use rand::Rng;

use crate::engine::{ContextOptions, Geolocation, ViewportSize};

/// Chrome major versions rotated through generated user agents.
const CHROME_VERSIONS: &[&str] = &["120", "121", "122", "123", "124", "125"];

/// Produce a randomized fingerprint, preserving the behavior flags of
/// `base`. UA version, Sec-CH-UA headers, viewport and geolocation are
/// mutually consistent within one generated set.
pub fn randomize(base: &ContextOptions) -> ContextOptions {
    let mut rng = rand::thread_rng();

    let version = CHROME_VERSIONS[rng.gen_range(0..CHROME_VERSIONS.len())];

    // Viewport jitter around full HD
    let width = 1920 + rng.gen_range(0..100) - 50;
    let height = 1080 + rng.gen_range(0..100) - 50;

    // Geolocation jitter around Beijing
    let latitude = 39.9042 + (rng.gen::<f64>() - 0.5) * 0.1;
    let longitude = 116.4074 + (rng.gen::<f64>() - 0.5) * 0.1;

    let mut extra_headers = HashMap::new();
    extra_headers.insert(
        "Accept-Language".to_string(),
        "zh-CN,zh;q=0.9,en;q=0.8".to_string(),
    );
    extra_headers.insert(
        "Sec-Ch-Ua".to_string(),
        format!(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{version}\", \"Google Chrome\";v=\"{version}\""
        ),
    );
    extra_headers.insert("Sec-Ch-Ua-Mobile".to_string(), "?0".to_string());
    extra_headers.insert("Sec-Ch-Ua-Platform".to_string(), "\"Windows\"".to_string());
    extra_headers.insert(
        "Accept".to_string(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string(),
    );
    extra_headers.insert("Accept-Encoding".to_string(), "gzip, deflate, br".to_string());
    extra_headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());

    ContextOptions {
        user_agent: Some(format!(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.0.0 Safari/537.36"
        )),
        viewport: Some(ViewportSize {
            width: width as u32,
            height: height as u32,
        }),
        locale: Some("zh-CN".to_string()),
        timezone_id: Some("Asia/Shanghai".to_string()),
        geolocation: Some(Geolocation {
            latitude,
            longitude,
        }),
        extra_headers,
        enable_anti_detect: base.enable_anti_detect,
        enable_random_delay: base.enable_random_delay,
        human_like_behavior: base.human_like_behavior,
        storage_state: base.storage_state.clone(),
    }
}
