//! Speed limit and proxy settings

use serde::{Deserialize, Serialize};

/// Unit a speed limit value is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpeedUnit {
    #[default]
    KB,
    MB,
}

impl SpeedUnit {
    pub fn multiplier(&self) -> u64 {
        match self {
            SpeedUnit::KB => 1024,
            SpeedUnit::MB => 1024 * 1024,
        }
    }
}

/// A speed cap as entered by the user (value + unit)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedLimit {
    pub value: f64,
    #[serde(default)]
    pub unit: SpeedUnit,
}

impl SpeedLimit {
    pub fn new(value: f64, unit: SpeedUnit) -> Self {
        Self { value, unit }
    }

    /// Limit in bytes per second; non-positive or non-finite values mean "no limit"
    pub fn bytes_per_second(&self) -> Option<u64> {
        if !self.value.is_finite() || self.value <= 0.0 {
            return None;
        }
        Some((self.value * self.unit.multiplier() as f64).round() as u64)
    }
}

/// Proxy protocol for a custom proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

/// A user-defined proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomProxy {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl CustomProxy {
    /// Proxy URL without credentials, e.g. `socks5://127.0.0.1:1080`
    pub fn url(&self) -> String {
        let scheme = match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks5 => "socks5",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Proxy mode handed through to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ProxySettings {
    #[default]
    Disabled,
    System,
    Custom(CustomProxy),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_limit_units() {
        assert_eq!(
            SpeedLimit::new(512.0, SpeedUnit::KB).bytes_per_second(),
            Some(512 * 1024)
        );
        assert_eq!(
            SpeedLimit::new(1.5, SpeedUnit::MB).bytes_per_second(),
            Some(1_572_864)
        );
        assert_eq!(SpeedLimit::new(0.0, SpeedUnit::MB).bytes_per_second(), None);
        assert_eq!(
            SpeedLimit::new(f64::NAN, SpeedUnit::KB).bytes_per_second(),
            None
        );
    }

    #[test]
    fn test_proxy_serialization() {
        let proxy = ProxySettings::Custom(CustomProxy {
            kind: ProxyKind::Socks5,
            host: "127.0.0.1".to_string(),
            port: 1080,
            username: None,
            password: None,
        });
        let json = serde_json::to_string(&proxy).unwrap();
        assert!(json.contains("\"mode\":\"custom\""));

        let back: ProxySettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, proxy);
        if let ProxySettings::Custom(custom) = back {
            assert_eq!(custom.url(), "socks5://127.0.0.1:1080");
        }
    }
}
