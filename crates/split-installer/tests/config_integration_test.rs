/// Integration tests for the configuration system
///
/// These tests verify that configuration layers from defaults, a config
/// file and `SPLIT_*` environment variables in that order.

use split_installer::config::{ConfigLoader, ConfigSource, InstallConfig, CONFIG_FILE_NAME};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_config_defaults() {
    let config = InstallConfig::default();

    assert!(config.verify_signature);
    assert!(config.host_certificates.is_empty());
    assert!(!config.native_multi_archive);
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.lock_timeout(), None);
    assert_eq!(config.process_name, "main");
    assert!(config.main_process);
    assert_eq!(config.device.os_version, 0);
    assert_eq!(config.bundled_dir, None);
    assert_eq!(config.metered_threshold, -1);
}

#[test]
fn test_config_with_root_dir() {
    let config = InstallConfig::with_root_dir("/data/app/splits");

    assert_eq!(config.root_dir, PathBuf::from("/data/app/splits"));
    assert!(config.verify_signature);
}

#[test]
fn test_config_loader_default_root() {
    let root = ConfigLoader::new(false).default_root_dir();
    assert!(root.ends_with("splits"));
}

#[test]
fn test_empty_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join(CONFIG_FILE_NAME);
    fs::write(&config_file, "{}").unwrap();

    let config = InstallConfig::build(Some(&config_file), false).unwrap();

    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.get_source("max-attempts"), Some(&ConfigSource::Default));
}

#[test]
fn test_full_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join(CONFIG_FILE_NAME);
    fs::write(
        &config_file,
        r#"{
            "root-dir": "/var/lib/splits",
            "verify-signature": true,
            "host-certificates": ["AB12", "cd34"],
            "native-multi-archive": true,
            "max-attempts": 5,
            "lock-timeout-ms": null,
            "process-name": "app:remote",
            "main-process": false,
            "device": {"os-version": 24, "abis": ["armeabi-v7a"]},
            "metered-threshold": 10485760
        }"#,
    )
    .unwrap();

    let config = InstallConfig::build(Some(&config_file), false).unwrap();

    assert_eq!(config.root_dir, PathBuf::from("/var/lib/splits"));
    assert_eq!(config.host_certificates, vec!["AB12", "cd34"]);
    assert!(config.native_multi_archive);
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.lock_timeout(), None);
    assert_eq!(config.process_name, "app:remote");
    assert!(!config.main_process);
    assert_eq!(config.device.os_version, 24);
    assert_eq!(config.metered_threshold, 10_485_760);
    assert_eq!(
        config.get_source("process-name"),
        Some(&ConfigSource::File(config_file.clone()))
    );
}

#[test]
fn test_malformed_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join(CONFIG_FILE_NAME);
    fs::write(&config_file, "{ not json").unwrap();

    assert!(InstallConfig::build(Some(&config_file), false).is_err());
}

#[test]
fn test_environment_overrides_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join(CONFIG_FILE_NAME);
    fs::write(
        &config_file,
        r#"{"root-dir": "/from/file", "max-attempts": 2, "lock-timeout-ms": 100}"#,
    )
    .unwrap();

    env::set_var("SPLIT_ROOT_DIR", "/from/env");
    env::set_var("SPLIT_VERIFY_SIGNATURE", "off");
    env::set_var("SPLIT_LOCK_TIMEOUT_MS", "2500");
    env::set_var("SPLIT_BUNDLED_DIR", "/opt/bundled");

    let with_env = InstallConfig::build(Some(&config_file), true);
    let without_env = InstallConfig::build(Some(&config_file), false);

    env::remove_var("SPLIT_ROOT_DIR");
    env::remove_var("SPLIT_VERIFY_SIGNATURE");
    env::remove_var("SPLIT_LOCK_TIMEOUT_MS");
    env::remove_var("SPLIT_BUNDLED_DIR");

    let config = with_env.unwrap();
    assert_eq!(config.root_dir, PathBuf::from("/from/env"));
    assert!(!config.verify_signature);
    assert_eq!(config.lock_timeout(), Some(Duration::from_millis(2500)));
    assert_eq!(config.bundled_dir, Some(PathBuf::from("/opt/bundled")));
    assert_eq!(config.max_attempts, 2);
    assert_eq!(
        config.get_source("root-dir"),
        Some(&ConfigSource::Environment("SPLIT_ROOT_DIR".to_string()))
    );

    let config = without_env.unwrap();
    assert_eq!(config.root_dir, PathBuf::from("/from/file"));
    assert!(config.verify_signature);
    assert_eq!(config.lock_timeout(), Some(Duration::from_millis(100)));
}
