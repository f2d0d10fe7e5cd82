use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::policy::PolicyConfig;

pub const DEFAULT_PORT: u16 = 41591;

/// Declared spawn recipe for one tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// On-disk daemon configuration (`companion.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub mcp_servers: HashMap<String, ToolServerConfig>,
    #[serde(default)]
    pub permission_policy: PolicyConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_ids: Option<Vec<String>>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            token: None,
            mcp_servers: HashMap::new(),
            permission_policy: PolicyConfig::default(),
            extension_ids: None,
        }
    }
}

impl ConfigFile {
    /// Declared servers with a usable command; entries without one are
    /// skipped (logged by the caller), not treated as a hard config error.
    pub fn runnable_servers(&self) -> impl Iterator<Item = (&String, &ToolServerConfig)> {
        self.mcp_servers
            .iter()
            .filter(|(_, server)| !server.command.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: ConfigFile = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.token.is_none());
        assert!(config.mcp_servers.is_empty());
        assert_eq!(config.permission_policy.mode, "full");
    }

    #[test]
    fn extension_ids_round_trip_opaquely() {
        let json = serde_json::json!({
            "port": 41592,
            "token": "t",
            "extensionIds": ["abcdefg"]
        });
        let config: ConfigFile = serde_json::from_value(json).expect("parse");
        let back = serde_json::to_value(&config).expect("serialize");
        assert_eq!(back["extensionIds"][0], "abcdefg");
        assert_eq!(back["port"], 41592);
    }

    #[test]
    fn runnable_servers_skips_commandless_entries() {
        let json = serde_json::json!({
            "mcpServers": {
                "good": {"command": "echo-server", "args": ["--stdio"]},
                "bad": {"command": "  "}
            }
        });
        let config: ConfigFile = serde_json::from_value(json).expect("parse");
        let names: Vec<&String> = config.runnable_servers().map(|(name, _)| name).collect();
        assert_eq!(names, vec![&"good".to_string()]);
    }
}
