//! Shared HTTP client for playlist, segment and thumbnail requests
//!
//! Features:
//! - Connection pooling sized for many small segment requests
//! - Bounded connect time and idle time between body chunks
//! - Randomized browser headers plus user-configured extras

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Client;
use tracing::debug;

use crate::config::Config;
use crate::fingerprint::{random_profile, BrowserProfile};

/// Build the client every pipeline stage shares.
pub fn build_client(config: &Config) -> Result<Client> {
    build_with_profile(config, &random_profile())
}

/// Build a client with a specific browser profile.
pub fn build_with_profile(config: &Config, profile: &BrowserProfile) -> Result<Client> {
    let mut headers = profile.to_headers();
    merge_headers(&mut headers, &config.headers)?;
    debug!(user_agent = %profile.user_agent, "Building HTTP client");

    let client = Client::builder()
        // Segments come from one or two hosts; keep plenty of connections warm
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .use_rustls_tls()
        .gzip(true)
        .default_headers(headers)
        .connect_timeout(config.timeouts.connect())
        // No total timeout: segment bodies may stream for minutes
        .read_timeout(config.timeouts.read())
        .redirect(reqwest::redirect::Policy::limited(10))
        .cookie_store(true)
        .build()?;

    Ok(client)
}

fn merge_headers(
    headers: &mut reqwest::header::HeaderMap,
    extra: &HashMap<String, String>,
) -> Result<()> {
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header {name}"))?;
        headers.insert(name, value);
    }
    Ok(())
}
