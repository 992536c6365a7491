use std::{fs, io::ErrorKind, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::{
    backoff::{
        ReconnectPolicy, DEFAULT_RECONNECT_BASE, DEFAULT_RECONNECT_CAP,
        DEFAULT_RECONNECT_MAX_ATTEMPTS,
    },
    transport::TransportError,
};

pub const SETTINGS_FILE: &str = "client.toml";
const API_PREFIX: &str = "api/v1/";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub ws_url: Option<String>,
    pub ws_path: String,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub reconnect_max_attempts: u32,
    pub messages_page_limit: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".into(),
            ws_url: None,
            ws_path: "/ws".into(),
            reconnect_base_ms: DEFAULT_RECONNECT_BASE.as_millis() as u64,
            reconnect_cap_ms: DEFAULT_RECONNECT_CAP.as_millis() as u64,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            messages_page_limit: 50,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn api_root(&self) -> Result<Url, url::ParseError> {
        let base = self.api_base_url.trim().trim_end_matches('/');
        Url::parse(&format!("{base}/"))?.join(API_PREFIX)
    }
}

pub fn load_settings() -> anyhow::Result<ClientSettings> {
    let mut settings = load_settings_file(Path::new(SETTINGS_FILE))?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn load_settings_file(path: &Path) -> anyhow::Result<ClientSettings> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ClientSettings::default()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    };
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))
}

/// Applies environment overrides; the `APP__` name wins over the plain one.
pub fn apply_env_overrides(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let var = |plain: &str, prefixed: &str| lookup(prefixed).or_else(|| lookup(plain));

    if let Some(v) = var("CHAT_API_URL", "APP__API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("CHAT_WS_URL", "APP__WS_URL") {
        settings.ws_url = Some(v).filter(|v| !v.trim().is_empty());
    }
    if let Some(v) = var("CHAT_WS_PATH", "APP__WS_PATH") {
        settings.ws_path = v;
    }
    if let Some(v) = lookup("APP__RECONNECT_BASE_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_base_ms = v;
    }
    if let Some(v) = lookup("APP__RECONNECT_CAP_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_cap_ms = v;
    }
    if let Some(v) = lookup("APP__RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_attempts = v;
    }
    if let Some(v) = lookup("APP__MESSAGES_PAGE_LIMIT").and_then(|v| v.parse().ok()) {
        settings.messages_page_limit = v;
    }
}

/// Resolves the socket endpoint: an explicit `ws_url` wins, otherwise the
/// endpoint is derived from the REST origin with `ws_path` as its path.
pub fn resolve_ws_url(settings: &ClientSettings) -> Result<Url, TransportError> {
    let explicit = settings
        .ws_url
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty());

    let (raw, replace_path) = match explicit {
        Some(raw) => (raw, false),
        None => (settings.api_base_url.trim(), true),
    };
    let mut url = Url::parse(raw)
        .map_err(|err| TransportError::InvalidEndpoint(format!("{raw}: {err}")))?;
    to_socket_scheme(&mut url)?;

    if replace_path || url.path().is_empty() || url.path() == "/" {
        url.set_path(&settings.ws_path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn to_socket_scheme(url: &mut Url) -> Result<(), TransportError> {
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{other}' in {url}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidEndpoint(format!("cannot use {scheme} for {url}")))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
