use helpdock_core::error::HelpDockError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_assistant_base_url() -> String {
    String::new()
}
fn default_assistant_api_key() -> String {
    String::new()
}
fn default_data_dir() -> String {
    "./helpdock.data".into()
}
fn default_web_host() -> String {
    "127.0.0.1".into()
}
fn default_web_port() -> u16 {
    10870
}
fn default_idle_timeout_seconds() -> u64 {
    900
}
fn default_sweep_interval_seconds() -> u64 {
    1
}
fn default_presence_stale_seconds() -> u64 {
    45
}
fn default_geo_lookup_enabled() -> bool {
    false
}
fn default_geo_base_url() -> String {
    "http://ip-api.com/json".into()
}

fn is_local_web_host(host: &str) -> bool {
    let h = host.trim().to_ascii_lowercase();
    h == "127.0.0.1" || h == "localhost" || h == "::1"
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the assistant backend that serves the streaming chat
    /// endpoint.
    #[serde(default = "default_assistant_base_url")]
    pub assistant_base_url: String,
    #[serde(default = "default_assistant_api_key")]
    pub assistant_api_key: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_web_host")]
    pub web_host: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// Required for dashboard/admin routes when web_host is not local.
    #[serde(default)]
    pub web_auth_token: Option<String>,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_presence_stale_seconds")]
    pub presence_stale_seconds: u64,
    #[serde(default = "default_geo_lookup_enabled")]
    pub geo_lookup_enabled: bool,
    #[serde(default = "default_geo_base_url")]
    pub geo_base_url: String,
}

impl Config {
    pub fn resolve_config_path() -> Result<Option<PathBuf>, HelpDockError> {
        if let Ok(custom) = std::env::var("HELPDOCK_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(HelpDockError::Config(format!(
                "HELPDOCK_CONFIG points to non-existent file: {custom}"
            )));
        }

        if std::path::Path::new("./helpdock.config.yaml").exists() {
            return Ok(Some(PathBuf::from("./helpdock.config.yaml")));
        }
        if std::path::Path::new("./helpdock.config.yml").exists() {
            return Ok(Some(PathBuf::from("./helpdock.config.yml")));
        }
        Ok(None)
    }

    /// Load config from YAML file.
    pub fn load() -> Result<Self, HelpDockError> {
        let yaml_path = Self::resolve_config_path()?;

        if let Some(path) = yaml_path {
            let path_str = path.to_string_lossy().to_string();
            let content = std::fs::read_to_string(&path)
                .map_err(|e| HelpDockError::Config(format!("Failed to read {path_str}: {e}")))?;
            let mut config: Config = serde_yaml::from_str(&content)
                .map_err(|e| HelpDockError::Config(format!("Failed to parse {path_str}: {e}")))?;
            config.post_deserialize()?;
            return Ok(config);
        }

        Err(HelpDockError::Config(
            "No helpdock.config.yaml found in the working directory".into(),
        ))
    }

    /// Apply post-deserialization normalization and validation.
    pub(crate) fn post_deserialize(&mut self) -> Result<(), HelpDockError> {
        self.assistant_base_url = self.assistant_base_url.trim().trim_end_matches('/').into();
        if self.assistant_base_url.is_empty() {
            return Err(HelpDockError::Config(
                "assistant_base_url is required".into(),
            ));
        }
        if self.web_host.trim().is_empty() {
            self.web_host = default_web_host();
        }
        if let Some(token) = &self.web_auth_token {
            if token.trim().is_empty() {
                self.web_auth_token = None;
            }
        }
        if !is_local_web_host(&self.web_host) && self.web_auth_token.is_none() {
            return Err(HelpDockError::Config(
                "web_auth_token is required when web_host is not local".into(),
            ));
        }
        if self.idle_timeout_seconds == 0 {
            self.idle_timeout_seconds = default_idle_timeout_seconds();
        }
        if self.sweep_interval_seconds == 0 {
            self.sweep_interval_seconds = default_sweep_interval_seconds();
        }
        if self.presence_stale_seconds == 0 {
            self.presence_stale_seconds = default_presence_stale_seconds();
        }
        if self.geo_base_url.trim().is_empty() {
            self.geo_base_url = default_geo_base_url();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_config() -> Config {
        Config {
            assistant_base_url: "http://127.0.0.1:9000".into(),
            assistant_api_key: "key".into(),
            data_dir: "./helpdock.data".into(),
            web_host: "127.0.0.1".into(),
            web_port: 10870,
            web_auth_token: None,
            idle_timeout_seconds: 900,
            sweep_interval_seconds: 1,
            presence_stale_seconds: 45,
            geo_lookup_enabled: false,
            geo_base_url: "http://ip-api.com/json".into(),
        }
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = "assistant_base_url: http://127.0.0.1:9000\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.post_deserialize().unwrap();
        assert_eq!(config.web_host, "127.0.0.1");
        assert_eq!(config.web_port, 10870);
        assert_eq!(config.idle_timeout_seconds, 900);
        assert_eq!(config.sweep_interval_seconds, 1);
        assert_eq!(config.presence_stale_seconds, 45);
        assert!(!config.geo_lookup_enabled);
    }

    #[test]
    fn test_missing_assistant_url_rejected() {
        let yaml = "web_port: 8080\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.post_deserialize().unwrap_err();
        assert!(err.to_string().contains("assistant_base_url is required"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let yaml = "assistant_base_url: 'http://127.0.0.1:9000/'\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.post_deserialize().unwrap();
        assert_eq!(config.assistant_base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_non_local_host_requires_token() {
        let yaml = "assistant_base_url: http://127.0.0.1:9000\nweb_host: 0.0.0.0\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.post_deserialize().unwrap_err();
        assert!(err.to_string().contains("web_auth_token is required"));
    }

    #[test]
    fn test_non_local_host_with_token_ok() {
        let yaml = "assistant_base_url: http://127.0.0.1:9000\nweb_host: 0.0.0.0\nweb_auth_token: tok123\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.post_deserialize().unwrap();
        assert_eq!(config.web_auth_token.as_deref(), Some("tok123"));
    }

    #[test]
    fn test_empty_token_becomes_none() {
        let yaml = "assistant_base_url: http://127.0.0.1:9000\nweb_auth_token: '  '\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.post_deserialize().unwrap();
        assert!(config.web_auth_token.is_none());
    }

    #[test]
    fn test_zero_intervals_fall_back_to_defaults() {
        let yaml = "assistant_base_url: http://127.0.0.1:9000\nidle_timeout_seconds: 0\nsweep_interval_seconds: 0\npresence_stale_seconds: 0\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.post_deserialize().unwrap();
        assert_eq!(config.idle_timeout_seconds, 900);
        assert_eq!(config.sweep_interval_seconds, 1);
        assert_eq!(config.presence_stale_seconds, 45);
    }

    #[test]
    fn test_resolve_config_path_env_override() {
        let _guard = crate::test_support::env_lock();
        let dir = std::env::temp_dir().join("helpdock-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("helpdock.config.yaml");
        std::fs::write(&path, "assistant_base_url: http://127.0.0.1:9000\n").unwrap();

        std::env::set_var("HELPDOCK_CONFIG", &path);
        let resolved = Config::resolve_config_path().unwrap();
        assert_eq!(resolved, Some(path));

        std::env::set_var("HELPDOCK_CONFIG", dir.join("missing.yaml"));
        assert!(Config::resolve_config_path().is_err());
        std::env::remove_var("HELPDOCK_CONFIG");
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = test_config();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.assistant_base_url, config.assistant_base_url);
        assert_eq!(parsed.web_port, config.web_port);
    }
}
