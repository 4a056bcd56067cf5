use serde::{Deserialize, Serialize};
use std::fmt;

use super::link::TransportError;

/// Connection parameters entered by the operator.
///
/// Persisted as-is (credentials included) so a restart can silently resume.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    WebSocket,
}

/// Broker address after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: Scheme,
    /// Host for TCP; the full `ws://host:port/path` URL for websockets.
    pub host: String,
    pub port: u16,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// Validates host/port and resolves the transport scheme.
    pub fn address(&self) -> Result<BrokerAddress, TransportError> {
        let raw = self.host.trim();
        if self.port == 0 {
            return Err(TransportError::InvalidBrokerUrl(format!("{}:{}", raw, self.port)));
        }

        let (scheme, rest) = match raw.split_once("://") {
            None => (Scheme::Tcp, raw),
            Some(("mqtt", rest)) | Some(("tcp", rest)) => (Scheme::Tcp, rest),
            Some(("ws", rest)) => (Scheme::WebSocket, rest),
            Some(_) => return Err(TransportError::InvalidBrokerUrl(raw.to_string())),
        };

        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host, path),
            None => (rest, ""),
        };

        if host.is_empty() || host.contains(char::is_whitespace) || host.contains(':') {
            return Err(TransportError::InvalidBrokerUrl(raw.to_string()));
        }
        if scheme == Scheme::Tcp && !path.is_empty() {
            return Err(TransportError::InvalidBrokerUrl(raw.to_string()));
        }

        let host = match scheme {
            Scheme::Tcp => host.to_string(),
            Scheme::WebSocket => {
                let path = if path.is_empty() { "mqtt" } else { path };
                format!("ws://{}:{}/{}", host, self.port, path)
            }
        };

        Ok(BrokerAddress {
            scheme,
            host,
            port: self.port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_and_mqtt_hosts_use_tcp() {
        let address = BrokerConfig::new("broker.local", 1883).address().unwrap();
        assert_eq!(address.scheme, Scheme::Tcp);
        assert_eq!(address.host, "broker.local");

        let address = BrokerConfig::new("mqtt://10.0.0.2", 1883).address().unwrap();
        assert_eq!(address.host, "10.0.0.2");
    }

    #[test]
    fn websocket_hosts_get_a_full_url() {
        let address = BrokerConfig::new("ws://broker.local", 9001).address().unwrap();
        assert_eq!(address.scheme, Scheme::WebSocket);
        assert_eq!(address.host, "ws://broker.local:9001/mqtt");

        let address = BrokerConfig::new("ws://broker.local/ws", 8083).address().unwrap();
        assert_eq!(address.host, "ws://broker.local:8083/ws");
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for host in ["", "http://broker", "wss://broker", "broker:1883", "bro ker", "mqtt://x/y"] {
            assert!(
                matches!(
                    BrokerConfig::new(host, 1883).address(),
                    Err(TransportError::InvalidBrokerUrl(_))
                ),
                "{host} should be rejected"
            );
        }
        assert!(BrokerConfig::new("broker", 0).address().is_err());
    }

    #[test]
    fn debug_hides_password() {
        let config = BrokerConfig::new("broker", 1883).with_credentials("ops", "hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
