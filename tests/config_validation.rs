//! Integration tests for configuration loading and validation.

use helpdock::config::Config;

#[test]
fn test_yaml_parse_minimal() {
    let yaml = "assistant_base_url: http://127.0.0.1:9000\nassistant_api_key: key\n";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.assistant_base_url, "http://127.0.0.1:9000");
    assert_eq!(config.assistant_api_key, "key");
    // Defaults
    assert_eq!(config.data_dir, "./helpdock.data");
    assert_eq!(config.web_host, "127.0.0.1");
    assert_eq!(config.web_port, 10870);
    assert_eq!(config.idle_timeout_seconds, 900);
    assert_eq!(config.sweep_interval_seconds, 1);
    assert_eq!(config.presence_stale_seconds, 45);
    assert!(!config.geo_lookup_enabled);
    assert!(config.web_auth_token.is_none());
}

#[test]
fn test_yaml_full_overrides() {
    let yaml = r#"
assistant_base_url: https://assistant.example.com/
assistant_api_key: secret
data_dir: /var/lib/helpdock
web_host: 0.0.0.0
web_port: 8080
web_auth_token: dashboard-token
idle_timeout_seconds: 600
sweep_interval_seconds: 2
presence_stale_seconds: 30
geo_lookup_enabled: true
geo_base_url: http://geo.internal/json
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.assistant_base_url, "https://assistant.example.com/");
    assert_eq!(config.data_dir, "/var/lib/helpdock");
    assert_eq!(config.web_host, "0.0.0.0");
    assert_eq!(config.web_port, 8080);
    assert_eq!(config.web_auth_token.as_deref(), Some("dashboard-token"));
    assert_eq!(config.idle_timeout_seconds, 600);
    assert!(config.geo_lookup_enabled);
    assert_eq!(config.geo_base_url, "http://geo.internal/json");
}

#[test]
fn test_unknown_keys_are_ignored() {
    let yaml = "assistant_base_url: http://127.0.0.1:9000\nsome_future_flag: true\n";
    let config: Result<Config, _> = serde_yaml::from_str(yaml);
    assert!(config.is_ok());
}

#[test]
fn test_invalid_yaml_rejected() {
    let yaml = "assistant_base_url: [unclosed\n";
    let config: Result<Config, _> = serde_yaml::from_str(yaml);
    assert!(config.is_err());
}
