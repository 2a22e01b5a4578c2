/// Integration tests for controller config loading: defaults, required
/// field validation, and the phase map.
use controller::config::{default_phase_map, load_config_from_str};

#[test]
fn valid_minimal_config_loads_with_defaults() {
    let toml = r#"
schema_version = 1
controller_id = "beacon-1"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.schema_version, 1);
    assert_eq!(cfg.controller_id, "beacon-1");
    assert_eq!(cfg.broker.host, "localhost");
    assert_eq!(cfg.broker.port, 1883);
    assert_eq!(cfg.broker.keepalive_secs, 60);
    assert_eq!(cfg.broker.username, "beacon-1");
    assert_eq!(cfg.broker.password, None);
    assert_eq!(cfg.watchdog.heartbeat_secs, 15);
    assert_eq!(cfg.phase_to_output, default_phase_map());
}

#[test]
fn full_config_overrides_every_default() {
    let toml = r#"
schema_version = 1
controller_id = "beacon-2"

[broker]
host = "broker.example.edu"
port = 8883
keepalive_secs = 30
username = "tc-user"
password = "hunter2"

[outputs]
sysfs_root = "/tmp/gpio"

[watchdog]
heartbeat_secs = 5

[phases]
7 = 2
8 = 6
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.broker.host, "broker.example.edu");
    assert_eq!(cfg.broker.port, 8883);
    assert_eq!(cfg.broker.username, "tc-user");
    assert_eq!(cfg.broker.password.as_deref(), Some("hunter2"));
    assert_eq!(cfg.outputs.sysfs_root.to_str(), Some("/tmp/gpio"));
    assert_eq!(cfg.watchdog.heartbeat_secs, 5);
    assert_eq!(cfg.phase_to_output.len(), 2);
    assert_eq!(cfg.phase_to_output.get(&7), Some(&2));
    assert_eq!(cfg.phase_to_output.get(&8), Some(&6));
}

#[test]
fn missing_schema_version_fails() {
    let toml = r#"controller_id = "beacon-1""#;
    let err = load_config_from_str(toml).expect_err("must fail");
    assert!(err.to_string().contains("schema_version"), "got: {err}");
}

#[test]
fn wrong_schema_version_fails() {
    let toml = r#"
schema_version = 2
controller_id = "beacon-1"
"#;
    assert!(load_config_from_str(toml).is_err());
}

#[test]
fn missing_controller_id_fails() {
    let toml = "schema_version = 1";
    let err = load_config_from_str(toml).expect_err("must fail");
    assert!(err.to_string().contains("controller_id"), "got: {err}");
}

#[test]
fn oversized_controller_id_fails() {
    let toml = format!(
        "schema_version = 1\ncontroller_id = \"{}\"\n",
        "x".repeat(65)
    );
    assert!(load_config_from_str(&toml).is_err());
}

#[test]
fn empty_phase_map_fails() {
    let toml = r#"
schema_version = 1
controller_id = "beacon-1"

[phases]
"#;
    assert!(load_config_from_str(toml).is_err());
}

#[test]
fn non_numeric_phase_key_fails() {
    let toml = r#"
schema_version = 1
controller_id = "beacon-1"

[phases]
north = 3
"#;
    let err = load_config_from_str(toml).expect_err("must fail");
    assert!(err.to_string().contains("north"), "got: {err}");
}

#[test]
fn config_file_round_trips_through_disk() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("controller.toml");
    std::fs::write(&path, "schema_version = 1\ncontroller_id = \"beacon-9\"\n")
        .expect("write config");
    let cfg = controller::config::load_config_from_path(&path).expect("should load");
    assert_eq!(cfg.controller_id, "beacon-9");
}

#[test]
fn missing_config_file_reports_io_error() {
    let err = controller::config::load_config_from_path(std::path::Path::new(
        "/nonexistent/controller.toml",
    ))
    .expect_err("must fail");
    assert!(err.to_string().contains("IO error"), "got: {err}");
}
