//! Browser Fingerprint Headers
//!
//! Media CDNs frequently reject requests without a plausible browser
//! User-Agent. Profiles here mimic the headers a browser's media element
//! sends when fetching playlists and segments (not page navigations).

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};

/// Request headers for one simulated browser
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept_language: String,
    /// Chromium-only client hint; empty for Firefox and Safari.
    pub sec_ch_ua: String,
}

const CHROME_VERSIONS: &[(&str, &str)] = &[
    ("131", "131.0.0.0"),
    ("130", "130.0.0.0"),
    ("129", "129.0.0.0"),
    ("128", "128.0.0.0"),
];

const FIREFOX_VERSIONS: &[&str] = &["133.0", "132.0", "131.0"];

const SAFARI_VERSIONS: &[(&str, &str)] = &[("17.6", "605.1.15"), ("17.5", "605.1.15")];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.9,de;q=0.8",
    "en-US,en;q=0.9,fr;q=0.8",
    "en-US,en;q=0.9,es;q=0.8",
];

#[derive(Debug, Clone, Copy)]
enum Platform {
    MacOS,
    Windows,
    Linux,
}

impl Platform {
    fn random() -> Self {
        let roll: f32 = rand::thread_rng().gen();
        if roll < 0.65 {
            Platform::Windows
        } else if roll < 0.85 {
            Platform::MacOS
        } else {
            Platform::Linux
        }
    }

    fn os_string(self) -> &'static str {
        match self {
            Platform::MacOS => "Macintosh; Intel Mac OS X 10_15_7",
            Platform::Windows => "Windows NT 10.0; Win64; x64",
            Platform::Linux => "X11; Linux x86_64",
        }
    }
}

fn pick<'a, T>(items: &'a [T], fallback: &'a T) -> &'a T {
    items.choose(&mut rand::thread_rng()).unwrap_or(fallback)
}

fn random_accept_language() -> String {
    (*pick(ACCEPT_LANGUAGES, &"en-US,en;q=0.9")).to_string()
}

#[must_use]
pub fn chrome_profile() -> BrowserProfile {
    let (major, full) = *pick(CHROME_VERSIONS, &("131", "131.0.0.0"));
    BrowserProfile {
        user_agent: format!(
            "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{full} Safari/537.36",
            Platform::random().os_string()
        ),
        accept_language: random_accept_language(),
        sec_ch_ua: format!(
            "\"Google Chrome\";v=\"{major}\", \"Chromium\";v=\"{major}\", \"Not_A Brand\";v=\"24\""
        ),
    }
}

#[must_use]
pub fn firefox_profile() -> BrowserProfile {
    let version = *pick(FIREFOX_VERSIONS, &"133.0");
    BrowserProfile {
        user_agent: format!(
            "Mozilla/5.0 ({}; rv:{version}) Gecko/20100101 Firefox/{version}",
            Platform::random().os_string()
        ),
        accept_language: random_accept_language(),
        sec_ch_ua: String::new(),
    }
}

#[must_use]
pub fn safari_profile() -> BrowserProfile {
    let (version, webkit) = *pick(SAFARI_VERSIONS, &("17.6", "605.1.15"));
    BrowserProfile {
        user_agent: format!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/{webkit} (KHTML, like Gecko) Version/{version} Safari/{webkit}"
        ),
        accept_language: random_accept_language(),
        sec_ch_ua: String::new(),
    }
}

/// Random profile weighted by market share
#[must_use]
pub fn random_profile() -> BrowserProfile {
    let roll: f32 = rand::thread_rng().gen();
    if roll < 0.65 {
        chrome_profile()
    } else if roll < 0.85 {
        safari_profile()
    } else {
        firefox_profile()
    }
}

impl BrowserProfile {
    /// Headers a media element sends for playlist and segment requests.
    ///
    /// Values that fail header validation are skipped rather than sent.
    pub fn to_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(v) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, v);
        }
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        if !self.sec_ch_ua.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&self.sec_ch_ua) {
                headers.insert("Sec-CH-UA", v);
            }
        }

        headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("video"));
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("no-cors"));
        headers.insert("Sec-Fetch-Site", HeaderValue::from_static("cross-site"));

        headers
    }
}
