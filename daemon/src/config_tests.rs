use crate::config::*;
use mps_engine::{Directory, GroupMode};
use std::time::Duration;

#[test]
fn test_default_config() {
    let config = MpsConfig::default();
    assert_eq!(config.server.bind.port(), 4433);
    assert!(config.server.ws_bind.is_none());
    assert_eq!(config.server.idle_timeout_secs, 90);
    assert_eq!(config.channels.window_size, 32768);
    assert!(config.groups.is_empty());
}

#[test]
fn test_parse_toml() {
    let config: MpsConfig = toml::from_str(
        r#"
        [server]
        bind = "127.0.0.1:4433"
        ws_bind = "127.0.0.1:8080"

        [auth]
        domain = "lab"
        shared_secret = "hunter2"

        [keepalive]
        interval_secs = 30

        [[groups]]
        id = "abcdefghijklmnopqrstuvwxyz"
        name = "Lab"
        mode = "amt"

        [[groups]]
        id = "zyxwvutsrqponmlkjihgfedcba"
        mode = "agent"
        "#,
    )
    .unwrap();

    assert_eq!(config.server.ws_bind.unwrap().port(), 8080);
    assert_eq!(config.auth.domain, "lab");
    assert_eq!(config.groups.len(), 2);
    assert_eq!(config.groups[1].mode, GroupMode::Agent);
    assert_eq!(config.registry.publish_delay_ms, 400);
}

#[test]
fn test_unknown_group_mode() {
    let config: MpsConfig = toml::from_str(
        r#"
        [[groups]]
        id = "abcdefghijklmnop"
        mode = "legacy"
        "#,
    )
    .unwrap();
    assert_eq!(config.groups[0].mode, GroupMode::Other);
}

#[test]
fn test_merge_scalars() {
    let mut config = MpsConfig::default();
    let mut other = MpsConfig::default();
    other.server.idle_timeout_secs = 30;
    other.channels.window_size = 65536;

    config.merge(other);

    assert_eq!(config.server.idle_timeout_secs, 30);
    assert_eq!(config.channels.window_size, 65536);
    assert_eq!(config.registry.publish_delay_ms, 400);
}

#[test]
fn test_merge_options() {
    let mut config = MpsConfig::default();
    config.auth.shared_secret = Some("old".to_string());

    let mut other = MpsConfig::default();
    other.directory.max_devices = Some(10);
    config.merge(other);
    assert_eq!(config.auth.shared_secret.as_deref(), Some("old"));
    assert_eq!(config.directory.max_devices, Some(10));

    let mut other = MpsConfig::default();
    other.auth.shared_secret = Some("new".to_string());
    config.merge(other);
    assert_eq!(config.auth.shared_secret.as_deref(), Some("new"));
}

#[test]
fn test_merge_groups() {
    let mut config = MpsConfig::default();
    config.groups.push(GroupConfig {
        id: "group1".to_string(),
        name: "One".to_string(),
        mode: GroupMode::Amt,
    });

    let mut other = MpsConfig::default();
    // Update existing
    other.groups.push(GroupConfig {
        id: "group1".to_string(),
        name: "Renamed".to_string(),
        mode: GroupMode::Agent,
    });
    // Add new
    other.groups.push(GroupConfig {
        id: "group2".to_string(),
        name: "Two".to_string(),
        mode: GroupMode::Amt,
    });

    config.merge(other);

    assert_eq!(config.groups.len(), 2);
    let g1 = config.groups.iter().find(|g| g.id == "group1").unwrap();
    assert_eq!(g1.name, "Renamed");
    assert_eq!(g1.mode, GroupMode::Agent);
}

#[test]
fn test_engine_config() {
    let mut config = MpsConfig::default();
    config.auth.domain = "lab".to_string();
    config.keepalive.interval_secs = Some(20);
    config.registry.publish_delay_ms = 100;

    let engine = config.engine_config();
    assert_eq!(engine.domain, "lab");
    assert_eq!(engine.publish_delay, Duration::from_millis(100));
    let keepalive = engine.keepalive.unwrap();
    assert_eq!(keepalive.interval, 20);
    assert_eq!(keepalive.timeout, 60);
    assert!(!engine.echo_version);
}

#[tokio::test]
async fn test_build_directory() {
    let mut config = MpsConfig::default();
    config.auth.domain = "lab".to_string();
    config.groups.push(GroupConfig {
        id: "abcdefghijklmnopqrstuvwxyz".to_string(),
        name: "Lab".to_string(),
        mode: GroupMode::Amt,
    });

    let directory = config.build_directory();
    let groups = directory.groups("lab").await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, "mesh/lab/abcdefghijklmnopqrstuvwxyz");
}
