use std::io::Write;

use tempfile::NamedTempFile;
use taskweave::config::{load_from_path, load_with_overrides};
use taskweave::errors::TaskweaveError;
use taskweave::types::SchedulingPolicy;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn file_values_replace_defaults() {
    let file = config_file(
        r#"
[cluster]
nodes = 4
message_max_size = 1024

[runtime]
workers_per_node = 3

[scheduler]
policy = "random"
"#,
    );

    let config = load_with_overrides(Some(file.path()), None).unwrap();
    assert_eq!(config.nodes(), 4);
    assert_eq!(config.cluster.message_max_size, 1024);
    assert!(config.cluster.eager_send, "untouched keys keep their default");
    assert_eq!(config.runtime.workers_per_node, 3);
    assert_eq!(config.runtime.reduction_slots, 4);
    assert_eq!(config.policy(), SchedulingPolicy::Random);
}

#[test]
fn overrides_win_over_file_values() {
    let file = config_file(
        r#"
[cluster]
nodes = 4

[scheduler]
policy = "random"
"#,
    );

    let config = load_with_overrides(
        Some(file.path()),
        Some("cluster.nodes=2, scheduler.policy=local, runtime.idle_wait_us=10"),
    )
    .unwrap();
    assert_eq!(config.nodes(), 2);
    assert_eq!(config.policy(), SchedulingPolicy::Local);
    assert_eq!(config.runtime.idle_wait_us, 10);
}

#[test]
fn overrides_apply_without_a_file() {
    let config = load_with_overrides(None, Some("cluster.disable_remote=true")).unwrap();
    assert!(config.cluster.disable_remote);
    assert_eq!(config.nodes(), 1);
}

#[test]
fn zero_nodes_is_a_config_error() {
    let file = config_file("[cluster]\nnodes = 0\n");
    match load_with_overrides(Some(file.path()), None) {
        Err(TaskweaveError::ConfigError(msg)) => assert!(msg.contains("nodes")),
        other => panic!("Expected ConfigError, got: {other:?}"),
    }
}

#[test]
fn too_many_reduction_slots_is_a_config_error() {
    let result = load_with_overrides(None, Some("runtime.reduction_slots=65"));
    assert!(matches!(result, Err(TaskweaveError::ConfigError(_))));
}

#[test]
fn unknown_override_key_is_rejected() {
    let result = load_with_overrides(None, Some("cluster.speed=11"));
    match result {
        Err(TaskweaveError::ConfigError(msg)) => assert!(msg.contains("cluster.speed")),
        other => panic!("Expected ConfigError, got: {other:?}"),
    }
}

#[test]
fn malformed_override_is_rejected() {
    assert!(matches!(
        load_with_overrides(None, Some("cluster.nodes")),
        Err(TaskweaveError::ConfigError(_))
    ));
}

#[test]
fn unknown_policy_in_file_is_a_toml_error() {
    let file = config_file("[scheduler]\npolicy = \"fastest\"\n");
    assert!(matches!(
        load_from_path(file.path()),
        Err(TaskweaveError::TomlError(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = load_with_overrides(Some(&dir.path().join("absent.toml")), None);
    assert!(matches!(result, Err(TaskweaveError::IoError(_))));
}
