use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Lock server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    /// port 0 binds an ephemeral port (see [`super::Server::local_addr`])
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::Config;

    #[test]
    fn deserialize_lock_server_config() {
        let mut config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        config_path.push("conf/lock_server.json");

        let stringified_json = std::fs::read_to_string(config_path).unwrap();
        let config: Config = serde_json::from_str(&stringified_json).unwrap();

        assert_eq!(
            config,
            Config {
                host: "127.0.0.1".to_string(),
                port: 4500,
            }
        );
    }

    #[test]
    fn host_defaults_to_localhost() {
        let config: Config = serde_json::from_str(r#"{"port": 0}"#).unwrap();
        assert_eq!(config.host, "127.0.0.1");
    }
}
