//! Integration tests for lws-config
//!
//! These tests verify the config loading pipeline with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from a real config file
#[test]
fn test_load_config_from_file() {
    let temp = tempdir().unwrap();
    let lws_dir = temp.path().join(".lws");
    std::fs::create_dir_all(&lws_dir).unwrap();

    let config_content = r#"
[metadata]
root = "/custom/metadata"

[baseline]
compress = false
threads = 3

[reconcile]
freshness_window_secs = 0

[limits]
max_server_path = 400
"#;
    std::fs::write(lws_dir.join("config.toml"), config_content).unwrap();

    let config = lws_config::Config::load_file(&lws_dir.join("config.toml")).unwrap();

    assert_eq!(config.metadata.root, PathBuf::from("/custom/metadata"));
    assert!(!config.baseline.compress);
    assert_eq!(config.baseline.threads, Some(3));
    // Sections not mentioned keep their defaults
    assert_eq!(config.baseline.decompress_buffer, 4096);
    assert_eq!(config.reconcile.freshness_window_secs, 0);
    assert_eq!(config.limits.max_server_path, 400);
    assert!(config.lock.yield_on_contention);
}

/// Test config hierarchy: project config overrides global
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global_path = temp.path().join("global.toml");
    std::fs::write(
        &global_path,
        r#"
[limits]
max_server_path = 300

[reconcile]
freshness_window_secs = 30
"#,
    )
    .unwrap();

    let project_path = temp.path().join("project.toml");
    std::fs::write(
        &project_path,
        r#"
[reconcile]
freshness_window_secs = 1
"#,
    )
    .unwrap();

    let mut config = lws_config::Config::load_file(&global_path).unwrap();
    config.merge(lws_config::Config::load_file(&project_path).unwrap());

    assert_eq!(config.limits.max_server_path, 300);
    assert_eq!(config.reconcile.freshness_window_secs, 1);
}

/// Malformed TOML surfaces as a parse error rather than silent defaults
#[test]
fn test_invalid_toml_is_an_error() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("bad.toml");
    std::fs::write(&path, "[reconcile\nfreshness_window_secs = ").unwrap();

    let result = lws_config::Config::load_file(&path);
    assert!(matches!(result, Err(lws_config::ConfigError::Toml(_))));
}

#[test]
fn test_default_toml_parses_back() {
    let rendered = lws_config::Config::default_toml().unwrap();
    let parsed: lws_config::Config = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed, lws_config::Config::default());
}
