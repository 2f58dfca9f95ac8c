use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Default beacon interval is 1 second
fn default_beacon_interval_ms() -> u64 {
    1000
}

/// Node configuration.
///
/// The library API takes a value of this type; the `zrechat` binary loads it
/// from `config.toml` in the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name. Empty means "derive from the UUID"
    /// (first 6 hex characters).
    #[serde(default)]
    pub name: String,
    /// TCP inbox port. 0 lets the OS pick an ephemeral port.
    #[serde(default)]
    pub port: u16,
    /// Beacon broadcast interval in milliseconds.
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Emit per-frame trace output.
    #[serde(default)]
    pub verbose: bool,
    /// Headers advertised to every new peer in HELLO.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            port: 0,
            beacon_interval_ms: default_beacon_interval_ms(),
            verbose: false,
            headers: HashMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms.max(1))
    }

    /// Read `config.toml` from the current working directory, writing a
    /// commented template first when the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let config_file = cwd.join("config.toml");
        if !config_file.exists() {
            let template = "# zre-node configuration\n\
                # name = \"kitchen-pi\"          # default: first 6 hex chars of the UUID\n\
                # port = 0                     # TCP inbox port, 0 = ephemeral\n\
                # beacon_interval_ms = 1000\n\
                # verbose = false\n\
                #\n\
                # [headers]\n\
                # \"X-ROLE\" = \"sensor\"\n";
            fs::write(&config_file, template)?;
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_file)?;
        let cfg: NodeConfig = toml::from_str(&content)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_toml() {
        let cfg: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.beacon_interval(), Duration::from_millis(1000));
        assert!(cfg.name.is_empty());
        assert!(!cfg.verbose);
        assert!(cfg.headers.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let cfg: NodeConfig = toml::from_str(
            "name = \"a\"\nport = 4000\nbeacon_interval_ms = 250\nverbose = true\n\n[headers]\n\"X-ROLE\" = \"sensor\"\n",
        )
        .unwrap();
        assert_eq!(cfg.name, "a");
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.beacon_interval(), Duration::from_millis(250));
        assert!(cfg.verbose);
        assert_eq!(cfg.headers["X-ROLE"], "sensor");
    }
}
