//! Client-side tunables: ICE servers for the relay-only media path and the
//! timing knobs the queue channel and negotiation depend on.

use std::time::Duration;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
}

/// ICE discovery and relay settings. The media path is forced through a
/// TURN relay, so at least one `turn_urls` entry is needed for a usable
/// candidate set against a real coordinator.
#[derive(Debug, Clone)]
pub struct IceSettings {
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: String,
    pub turn_credential: String,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_urls: Vec::new(),
            turn_username: String::new(),
            turn_credential: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ice: IceSettings,
    /// Upper bound on candidate gathering before the offer is submitted
    /// with whatever candidates exist.
    pub gather_timeout: Duration,
    /// Interval between keepalive probes on the queue socket.
    pub keepalive_interval: Duration,
    /// Flat delay before reopening a dropped queue socket.
    pub reconnect_delay: Duration,
    /// Label of the data channel carrying telemetry envelopes.
    pub telemetry_label: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ice: IceSettings::default(),
            gather_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_millis(400),
            telemetry_label: "logs".to_string(),
        }
    }
}

/// Derive the WebSocket base for a coordinator HTTP base url.
pub fn websocket_base(base: &Url) -> Result<Url, ConfigError> {
    let mut ws = base.clone();
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    ws.set_scheme(scheme)
        .map_err(|_| ConfigError::InvalidUrl(base.to_string()))?;
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ws_scheme_from_http() {
        let base = Url::parse("http://coordinator.local:8000").unwrap();
        let ws = websocket_base(&base).unwrap();
        assert_eq!(ws.as_str(), "ws://coordinator.local:8000/");
    }

    #[test]
    fn derives_wss_scheme_from_https() {
        let base = Url::parse("https://coordinator.local/api?x=1").unwrap();
        let ws = websocket_base(&base).unwrap();
        assert_eq!(ws.scheme(), "wss");
        assert_eq!(ws.query(), None);
    }

    #[test]
    fn rejects_non_http_scheme() {
        let base = Url::parse("ftp://coordinator.local").unwrap();
        assert!(matches!(
            websocket_base(&base),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }
}
