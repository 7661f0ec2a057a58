//! Configuration. Validated TOML with `#[serde(default = "fn")]` defaults
//! rather than a hand-rolled config approach.
//!
//! Loading itself (CLI flags, file discovery) is the consumer's concern -
//! only the shape and validation of the config struct lives here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub file: FileConfig,
}

/// Addresses this node listens on for incoming peer connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate; omit to accept plaintext connections only.
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

/// Net stream behaviour: re-request cadence and adaptive buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// How many frames between forced re-requests from a consumer
    /// (`reqtally_` cadence in the original `Net` stream).
    #[serde(default = "default_tally_interval")]
    pub tally_interval: u32,
    /// Initial adaptive receive buffer length, in frames.
    #[serde(default = "default_initial_buffer")]
    pub initial_buffer: u32,
    #[serde(default = "default_max_buffer")]
    pub max_buffer: u32,
    #[serde(default = "default_min_buffer")]
    pub min_buffer: u32,
    /// Reconnection retry interval, in milliseconds.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Periodic `Universe` poll/GC interval, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// File stream replay pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Look-ahead window for scheduling the next packet write, in milliseconds.
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: i64,
    #[serde(default)]
    pub looping: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tally_interval: default_tally_interval(),
            initial_buffer: default_initial_buffer(),
            max_buffer: default_max_buffer(),
            min_buffer: default_min_buffer(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: default_lookahead_ms(),
            looping: false,
        }
    }
}

impl NodeConfig {
    /// Validate the configuration, returning all issues found rather than
    /// failing fast on the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.listen.port == 0 {
            issues.push("ERROR: listen.port must be between 1 and 65535, got 0.".to_string());
        }

        match (&self.listen.tls_cert, &self.listen.tls_key) {
            (Some(_), None) => issues.push(
                "WARNING: listen.tls_cert is set but listen.tls_key is not.".to_string(),
            ),
            (None, Some(_)) => issues.push(
                "WARNING: listen.tls_key is set but listen.tls_cert is not.".to_string(),
            ),
            _ => {}
        }

        if self.net.min_buffer == 0 {
            issues.push("ERROR: net.min_buffer must be at least 1.".to_string());
        }
        if self.net.max_buffer < self.net.min_buffer {
            issues.push(format!(
                "ERROR: net.max_buffer ({}) must be >= net.min_buffer ({}).",
                self.net.max_buffer, self.net.min_buffer
            ));
        }
        if self.net.initial_buffer < self.net.min_buffer || self.net.initial_buffer > self.net.max_buffer {
            issues.push(format!(
                "ERROR: net.initial_buffer ({}) must lie within [min_buffer, max_buffer].",
                self.net.initial_buffer
            ));
        }
        if self.net.tally_interval == 0 {
            issues.push("ERROR: net.tally_interval must be at least 1.".to_string());
        }
        if self.net.reconnect_interval_ms < 100 {
            issues.push(format!(
                "WARNING: net.reconnect_interval_ms is {}ms - reconnect storms below 100ms are likely.",
                self.net.reconnect_interval_ms
            ));
        }

        if self.file.lookahead_ms < 0 {
            issues.push("ERROR: file.lookahead_ms must not be negative.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9001
}
fn default_tally_interval() -> u32 {
    20
}
fn default_initial_buffer() -> u32 {
    4
}
fn default_max_buffer() -> u32 {
    32
}
fn default_min_buffer() -> u32 {
    2
}
fn default_reconnect_interval_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_lookahead_ms() -> i64 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: NodeConfig = toml::from_str("").expect("empty string should deserialize");
        assert_eq!(config.listen.bind, "0.0.0.0");
        assert_eq!(config.listen.port, 9001);
        assert_eq!(config.net.tally_interval, 20);
        assert_eq!(config.net.initial_buffer, 4);
        assert_eq!(config.file.lookahead_ms, 200);
        assert!(!config.file.looping);
    }

    #[test]
    fn partial_config_only_net_section() {
        let toml_str = r#"
[net]
tally_interval = 50
"#;
        let config: NodeConfig = toml::from_str(toml_str).expect("partial config should deserialize");
        assert_eq!(config.net.tally_interval, 50);
        assert_eq!(config.net.initial_buffer, 4);
        assert_eq!(config.listen.port, 9001);
    }

    #[test]
    fn validate_default_config_passes() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config: NodeConfig = toml::from_str("").unwrap();
        config.listen.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_buffer_bounds() {
        let mut config: NodeConfig = toml::from_str("").unwrap();
        config.net.max_buffer = 1;
        config.net.min_buffer = 2;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("max_buffer")));
    }

    #[test]
    fn validate_initial_buffer_out_of_range_is_error() {
        let mut config: NodeConfig = toml::from_str("").unwrap();
        config.net.initial_buffer = 100;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("initial_buffer")));
    }

    #[test]
    fn validate_negative_lookahead_is_error() {
        let mut config: NodeConfig = toml::from_str("").unwrap();
        config.file.lookahead_ms = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_tls_cert_without_key_is_warning_not_error() {
        let mut config: NodeConfig = toml::from_str("").unwrap();
        config.listen.tls_cert = Some("cert.pem".to_string());
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
    }
}
