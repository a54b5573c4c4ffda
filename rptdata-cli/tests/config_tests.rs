#![allow(clippy::unwrap_used, clippy::expect_used)]

use rptdata_cli::config::{CliConfig, CodecMode, ConfigError, ConfigManager};
use std::time::Duration;

#[test]
fn bundled_defaults_match_code_defaults() {
    let manager = ConfigManager::load_defaults().expect("bundled config");
    assert_eq!(manager.config(), &CliConfig::default());
    assert!(manager.path().is_none());
}

#[test]
fn user_file_overrides_single_keys() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config_path = temp_dir.path().join("rptdata.toml");
    std::fs::write(
        &config_path,
        "[timeouts]\nrequest_timeout_ms = 750\n\n[codec]\nmode = \"disabled\"\n",
    )
    .unwrap();

    let manager = ConfigManager::load_with_path(&config_path).expect("load config");
    let config = manager.config();
    assert_eq!(config.timeouts.request_timeout_ms, 750);
    // untouched keys in the same section keep their defaults
    assert_eq!(config.timeouts.codec_response_timeout_ms, 6_000);
    assert_eq!(config.codec.mode, CodecMode::Disabled);
    assert_eq!(
        config.search_settings().request_timeout,
        Duration::from_millis(750)
    );
    assert_eq!(manager.get("timeouts.request_timeout_ms").unwrap(), "750");
    assert_eq!(manager.get("codec.mode").unwrap(), "disabled");
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let manager = ConfigManager::load_with_path(temp_dir.path().join("absent.toml")).unwrap();
    assert_eq!(manager.config().server.port, 8080);
}

#[test]
fn zero_page_size_is_rejected() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config_path = temp_dir.path().join("rptdata.toml");
    std::fs::write(&config_path, "[search]\nmessage_page_size = 0\n").unwrap();

    let err = ConfigManager::load_with_path(&config_path).err().unwrap();
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::MustBePositive {
            key: "search.message_page_size"
        })
    );
}

#[test]
fn unknown_key_lookup_fails() {
    let manager = ConfigManager::load_defaults().unwrap();
    assert!(matches!(
        manager.get("server.colour"),
        Err(ConfigError::UnknownKey { .. })
    ));
}

#[test]
fn zero_max_duration_means_unlimited() {
    let mut config = CliConfig::default();
    assert_eq!(config.stream_settings().max_duration, None);

    config.timeouts.sse_search_max_duration_ms = 30_000;
    assert_eq!(
        config.stream_settings().max_duration,
        Some(Duration::from_secs(30))
    );
}
