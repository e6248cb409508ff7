//! Typed, `serde`-deserializable configuration for constructing a
//! [`crate::branch::Branch`] (`LocalBranchInfo`'s attributes plus the
//! network/runtime knobs a host application must supply). Parsing this
//! struct out of a config file or the command line is a caller concern;
//! what's in scope here is the struct itself and its `Deserialize` impl,
//! a plain typed config the rest of the crate consumes.

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

fn default_description() -> String {
    String::new()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_password() -> String {
    String::new()
}

fn default_advertising_address() -> SocketAddr {
    "237.100.0.1:13531".parse().unwrap()
}

fn default_advertising_interval_ms() -> Option<u64> {
    Some(1000)
}

fn default_tcp_bind_address() -> SocketAddr {
    "0.0.0.0:0".parse().unwrap()
}

fn default_timeout_ms() -> Option<u64> {
    Some(3000)
}

fn default_queue_size() -> usize {
    crate::branch_info::DEFAULT_QUEUE_SIZE
}

/// Configuration for a single branch, deserializable from JSON (or built
/// programmatically with plain struct literals / `Default`).
#[derive(Debug, Clone, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    #[serde(default = "default_description")]
    pub description: String,
    pub network_name: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_advertising_address")]
    pub advertising_address: SocketAddr,
    #[serde(default = "default_advertising_interval_ms")]
    pub advertising_interval_ms: Option<u64>,
    #[serde(default = "default_tcp_bind_address")]
    pub tcp_bind_address: SocketAddr,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub ghost_mode: bool,
    #[serde(default = "default_queue_size")]
    pub tx_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub rx_queue_size: usize,
}

impl BranchConfig {
    pub fn advertising_interval(&self) -> Option<Duration> {
        self.advertising_interval_ms.map(Duration::from_millis)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: default_description(),
            network_name: String::new(),
            password: default_password(),
            path: default_path(),
            advertising_address: default_advertising_address(),
            advertising_interval_ms: default_advertising_interval_ms(),
            tcp_bind_address: default_tcp_bind_address(),
            timeout_ms: default_timeout_ms(),
            ghost_mode: false,
            tx_queue_size: default_queue_size(),
            rx_queue_size: default_queue_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_minimal_json_with_defaults_filled_in() {
        let json = serde_json::json!({
            "name": "my-branch",
            "network_name": "my-net",
        });
        let config: BranchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.name, "my-branch");
        assert_eq!(config.path, "/");
        assert_eq!(config.timeout_ms, Some(3000));
        assert_eq!(config.tx_queue_size, crate::branch_info::DEFAULT_QUEUE_SIZE);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let json = serde_json::json!({
            "name": "my-branch",
            "network_name": "my-net",
            "ghost_mode": true,
            "timeout_ms": serde_json::Value::Null,
        });
        let config: BranchConfig = serde_json::from_value(json).unwrap();
        assert!(config.ghost_mode);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn deserializes_from_a_config_file_on_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"name": "file-branch", "network_name": "file-net", "ghost_mode": true}}"#
        )
        .unwrap();

        let reader = std::fs::File::open(file.path()).unwrap();
        let config: BranchConfig = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.name, "file-branch");
        assert!(config.ghost_mode);
    }
}
