//! Client configuration: defaults, layered with an optional TOML file
//! and `KVCLI_`-prefixed environment variables, generalizing the
//! teacher's `ConfigLoad`/`inject_cmd` runtime-settings pattern -- but
//! loaded with `envy` + `toml` instead of a bespoke reader, matching the
//! configuration layer `kv-server` uses for its own settings.

use std::path::Path;

use anyhow::{Context, Result};
use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "kvcli";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the `kv-server` this client talks to.
    pub server_url: String,

    /// Tenant id sent as the `X-Tenant` header on every request; `None`
    /// means the global namespace.
    pub tenant: Option<String>,

    pub prompt: String,

    /// Show timing/row-affected info after executing queries. Only
    /// meaningful in non-interactive mode.
    pub show_stats: bool,

    pub multi_line: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_url: "http://127.0.0.1:8080".to_string(),
            tenant: None,
            prompt: DEFAULT_PROMPT.to_string(),
            show_stats: false,
            multi_line: true,
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Loads defaults, overlays a TOML file at `path` if it exists, then
    /// overlays `KVCLI_*` environment variables -- later layers win.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = path {
            if path.exists() {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let from_file: ClientConfigOverlay =
                    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
                from_file.apply(&mut config);
            }
        }

        if let Ok(from_env) = envy::prefixed("KVCLI_").from_env::<ClientConfigOverlay>() {
            from_env.apply(&mut config);
        }

        Ok(config)
    }

    pub fn inject_cmd(&mut self, cmd_name: &str, cmd_value: &str) -> Result<()> {
        match cmd_name {
            "show_stats" => self.show_stats = cmd_value.parse()?,
            "multi_line" => self.multi_line = cmd_value.parse()?,
            "tenant" => self.tenant = Some(cmd_value.to_string()),
            "server_url" => self.server_url = cmd_value.to_string(),
            _ => anyhow::bail!("Unknown command: {}", cmd_name),
        }
        Ok(())
    }

    pub fn terminal_update(&mut self) {
        self.show_stats = true;
    }
}

/// Every field optional so a partial TOML file or a handful of env vars
/// only override what they mention.
#[derive(Debug, Default, Deserialize)]
struct ClientConfigOverlay {
    server_url: Option<String>,
    tenant: Option<String>,
    prompt: Option<String>,
    show_stats: Option<bool>,
    multi_line: Option<bool>,
    log_level: Option<String>,
}

impl ClientConfigOverlay {
    fn apply(self, config: &mut ClientConfig) {
        if let Some(v) = self.server_url {
            config.server_url = v;
        }
        if let Some(v) = self.tenant {
            config.tenant = Some(v);
        }
        if let Some(v) = self.prompt {
            config.prompt = v;
        }
        if let Some(v) = self.show_stats {
            config.show_stats = v;
        }
        if let Some(v) = self.multi_line {
            config.multi_line = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "http://127.0.0.1:8080");
        assert_eq!(config.prompt, DEFAULT_PROMPT);
        assert!(!config.show_stats);
        assert!(config.multi_line);
    }

    #[test]
    fn inject_cmd_updates_known_settings() {
        let mut config = ClientConfig::default();
        config.inject_cmd("show_stats", "true").unwrap();
        assert!(config.show_stats);

        config.inject_cmd("tenant", "acme").unwrap();
        assert_eq!(config.tenant.as_deref(), Some("acme"));
    }

    #[test]
    fn inject_cmd_rejects_unknown_settings() {
        let mut config = ClientConfig::default();
        assert!(config.inject_cmd("nonsense", "value").is_err());
    }

    #[test]
    fn load_overlays_toml_file_onto_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvcli.toml");
        std::fs::write(&path, "server_url = \"http://example.test:9090\"\ntenant = \"acme\"\n").unwrap();

        let config = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server_url, "http://example.test:9090");
        assert_eq!(config.tenant.as_deref(), Some("acme"));
        // unspecified fields keep their defaults
        assert_eq!(config.prompt, DEFAULT_PROMPT);
    }
}
