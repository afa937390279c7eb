//! Node configuration loaded from environment variables.
//!
//! All settings have defaults so a node can start with zero configuration
//! against a rendezvous server on localhost.

use std::path::PathBuf;
use std::time::Duration;

use tidefeed_shared::constants::{
    DEFAULT_DELETE_RETENTION_DAYS, DEFAULT_SIGNALING_URL, DEFAULT_SYNC_INTERVAL, MAX_CONTENT_SIZE,
};
use tidefeed_shared::types::{DeviceClass, UserId};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// WebSocket URL of the rendezvous server.
    /// Env: `TIDEFEED_SIGNALING_URL`
    pub signaling_url: String,

    /// Directory holding the database, the node key and the content store.
    /// Env: `TIDEFEED_DATA_DIR`
    /// Default: the platform data directory.
    pub data_dir: PathBuf,

    /// Env: `TIDEFEED_DEVICE_CLASS` (pc | mobile | server)
    pub device_class: DeviceClass,

    /// Env: `TIDEFEED_DEVICE_NAME`
    pub device_name: String,

    /// Owner of local content, hex. When unset the node key is the owner.
    /// Env: `TIDEFEED_USER_ID`
    pub user_id: Option<UserId>,

    /// Device classes the owner has registered, first = primary.
    /// Env: `TIDEFEED_DEVICE_ROSTER` (comma separated)
    /// Default: this node's class only.
    pub roster: Vec<DeviceClass>,

    /// Env: `TIDEFEED_SYNC_INTERVAL_SECS`
    pub sync_interval: Duration,

    /// Env: `TIDEFEED_DELETE_RETENTION_DAYS`
    pub delete_retention_days: i64,

    /// Env: `TIDEFEED_MAX_CONTENT_SIZE` (bytes)
    pub max_content_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = tidefeed_store::database::default_data_dir()
            .unwrap_or_else(|_| PathBuf::from("./tidefeed-data"));
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            data_dir,
            device_class: DeviceClass::Pc,
            device_name: "tidefeed-pc".to_string(),
            user_id: None,
            roster: vec![DeviceClass::Pc],
            sync_interval: DEFAULT_SYNC_INTERVAL,
            delete_retention_days: DEFAULT_DELETE_RETENTION_DAYS,
            max_content_size: MAX_CONTENT_SIZE,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("TIDEFEED_SIGNALING_URL") {
            config.signaling_url = url;
        }

        if let Some(dir) = lookup("TIDEFEED_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(class) = lookup("TIDEFEED_DEVICE_CLASS") {
            match class.parse().unwrap_or(DeviceClass::Unknown) {
                DeviceClass::Unknown => {
                    tracing::warn!(value = %class, "Invalid TIDEFEED_DEVICE_CLASS, using default");
                }
                parsed => {
                    config.device_class = parsed;
                    config.device_name = format!("tidefeed-{parsed}");
                    config.roster = vec![parsed];
                }
            }
        }

        if let Some(name) = lookup("TIDEFEED_DEVICE_NAME") {
            if !name.is_empty() {
                config.device_name = name;
            }
        }

        if let Some(hex_id) = lookup("TIDEFEED_USER_ID") {
            match UserId::from_hex(hex_id.trim()) {
                Ok(id) => config.user_id = Some(id),
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid TIDEFEED_USER_ID, using node key");
                }
            }
        }

        if let Some(list) = lookup("TIDEFEED_DEVICE_ROSTER") {
            let mut roster = Vec::new();
            for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match item.parse().unwrap_or(DeviceClass::Unknown) {
                    DeviceClass::Unknown => {
                        tracing::warn!(value = %item, "Ignoring unknown device class in roster");
                    }
                    class if !roster.contains(&class) => roster.push(class),
                    _ => {}
                }
            }
            if !roster.contains(&config.device_class) {
                roster.push(config.device_class);
            }
            config.roster = roster;
        }

        if let Some(val) = lookup("TIDEFEED_SYNC_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.sync_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid TIDEFEED_SYNC_INTERVAL_SECS, using default"),
            }
        }

        if let Some(val) = lookup("TIDEFEED_DELETE_RETENTION_DAYS") {
            match val.parse::<i64>() {
                Ok(days) if days >= 0 => config.delete_retention_days = days,
                _ => tracing::warn!(value = %val, "Invalid TIDEFEED_DELETE_RETENTION_DAYS, using default"),
            }
        }

        if let Some(val) = lookup("TIDEFEED_MAX_CONTENT_SIZE") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_content_size = n;
            }
        }

        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("tidefeed.db")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("node.key")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }

    pub fn delete_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.delete_retention_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> NodeConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.device_class, DeviceClass::Pc);
        assert_eq!(config.roster, vec![DeviceClass::Pc]);
        assert_eq!(config.delete_retention_days, 30);
    }

    #[test]
    fn env_overrides() {
        let config = load(&[
            ("TIDEFEED_DATA_DIR", "/tmp/tf"),
            ("TIDEFEED_DEVICE_CLASS", "mobile"),
            ("TIDEFEED_DEVICE_ROSTER", "pc, mobile, pc"),
            ("TIDEFEED_SYNC_INTERVAL_SECS", "5"),
            ("TIDEFEED_USER_ID", &"ab".repeat(32)),
        ]);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/tf/tidefeed.db"));
        assert_eq!(config.device_class, DeviceClass::Mobile);
        assert_eq!(config.device_name, "tidefeed-mobile");
        assert_eq!(config.roster, vec![DeviceClass::Pc, DeviceClass::Mobile]);
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert_eq!(config.user_id, Some(UserId([0xab; 32])));
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = load(&[
            ("TIDEFEED_DEVICE_CLASS", "toaster"),
            ("TIDEFEED_SYNC_INTERVAL_SECS", "0"),
            ("TIDEFEED_USER_ID", "not-hex"),
            ("TIDEFEED_DELETE_RETENTION_DAYS", "-3"),
        ]);
        assert_eq!(config.device_class, DeviceClass::Pc);
        assert_eq!(config.sync_interval, DEFAULT_SYNC_INTERVAL);
        assert!(config.user_id.is_none());
        assert_eq!(config.delete_retention_days, DEFAULT_DELETE_RETENTION_DAYS);
    }
}
