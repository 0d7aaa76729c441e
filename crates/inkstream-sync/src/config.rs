use crate::error::{SyncError, SyncResult};
use std::time::Duration;
use url::Url;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const CHANNEL_PATH: &str = "hubs/notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn next(&self, current: Duration) -> Duration {
        let next = current + current;
        if next > self.max {
            self.max
        } else {
            next
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base: Url,
    pub channel_url: Url,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SyncConfig {
    pub fn new(api_base: Url, channel_url: Url) -> Self {
        Self {
            api_base,
            channel_url,
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// `http(s)://host[:port]/...` becomes `ws(s)://host[:port]/hubs/notifications`.
pub fn derive_channel_url(api_base: &Url) -> SyncResult<Url> {
    let scheme = match api_base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::Config(format!(
                "cannot derive a channel url from scheme {other}"
            )))
        }
    };
    let mut url = api_base.clone();
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot switch {api_base} to {scheme}")))?;
    url.set_path(CHANNEL_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
