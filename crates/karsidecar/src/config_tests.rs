// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn base_config() -> Config {
    Config {
        app: "myapp".into(),
        service: "mysvc".into(),
        actors: vec![],
        actor_reminder_interval_ms: 100,
        actor_reminder_acceptable_delay_ms: 3_000,
        actor_timeout_ms: 10_000,
        service_port: 8080,
        runtime_port: 3500,
        bus_brokers: vec!["broker:9092".into()],
        bus_enable_tls: false,
        bus_username: None,
        bus_password: None,
        bus_version: None,
        kv_host: Some("localhost".into()),
        kv_port: None,
        kv_enable_tls: false,
        kv_password: None,
        verbosity: "info".into(),
        config_dir: None,
        progress_retain_ms: None,
        id: "fixed-id".into(),
    }
}

#[test]
fn rejects_missing_app_or_service() {
    let mut cfg = base_config();
    cfg.app = String::new();
    assert!(cfg.resolve().is_err());
}

#[test]
fn rejects_separator_in_names() {
    let mut cfg = base_config();
    cfg.service = "my_svc".into();
    assert!(cfg.resolve().is_err());
}

#[test]
fn fills_in_defaults() {
    let mut cfg = base_config();
    cfg.resolve().unwrap();
    assert_eq!(cfg.bus_username.as_deref(), Some("token"));
    assert_eq!(cfg.bus_version.as_deref(), Some("2.2.0"));
    assert_eq!(cfg.kv_port, Some(6379));
}

#[test]
fn reads_file_backed_value_over_default() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("kv_port"), "6380\n")?;
    let mut cfg = base_config();
    cfg.kv_port = None;
    cfg.config_dir = Some(dir.path().to_path_buf());
    cfg.resolve()?;
    assert_eq!(cfg.kv_port, Some(6380));
    Ok(())
}

#[test]
fn topic_name_uses_separator() {
    let cfg = base_config();
    assert_eq!(cfg.topic(), "kar_myapp");
}
