// src/config/loader.rs

use std::fs;
use std::path::Path;

use toml::{Table, Value};
use tracing::debug;

use crate::config::model::{RawRuntimeConfig, RuntimeConfig};
use crate::errors::{Result, TaskweaveError};

/// Environment variable holding `section.key=value` overrides, comma
/// separated.
pub const CONFIG_OVERRIDE_ENV: &str = "TASKWEAVE_CONFIG_OVERRIDE";

const KNOWN_KEYS: &[(&str, &[&str])] = &[
    (
        "cluster",
        &["nodes", "message_max_size", "disable_remote", "eager_send"],
    ),
    (
        "runtime",
        &["workers_per_node", "reduction_slots", "idle_wait_us"],
    ),
    ("scheduler", &["policy"]),
];

/// Read a configuration file into a TOML table. No defaults are applied yet.
pub fn load_table(path: impl AsRef<Path>) -> Result<Table> {
    let contents = fs::read_to_string(path.as_ref())?;
    Ok(toml::from_str(&contents)?)
}

/// Load a configuration file and deserialize it without validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawRuntimeConfig> {
    into_raw(load_table(path)?)
}

fn into_raw(table: Table) -> Result<RawRuntimeConfig> {
    Ok(Value::Table(table).try_into()?)
}

/// Apply `section.key=value` overrides on top of a parsed table.
///
/// Values are TOML scalars (`4`, `true`, `"local"`); a bare word such as
/// `local` is taken as a string.
pub fn apply_overrides(mut table: Table, overrides: &str) -> Result<Table> {
    for entry in overrides.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (path, raw_value) = entry.split_once('=').ok_or_else(|| {
            TaskweaveError::ConfigError(format!("override '{entry}' is not of the form section.key=value"))
        })?;
        let (section, key) = path.trim().split_once('.').ok_or_else(|| {
            TaskweaveError::ConfigError(format!("override key '{path}' must be section.key"))
        })?;
        let known = KNOWN_KEYS
            .iter()
            .find(|(name, _)| *name == section)
            .is_some_and(|(_, keys)| keys.contains(&key));
        if !known {
            return Err(TaskweaveError::ConfigError(format!(
                "unknown configuration key '{section}.{key}'"
            )));
        }
        let value = parse_scalar(raw_value.trim()).ok_or_else(|| {
            TaskweaveError::ConfigError(format!("cannot parse value '{raw_value}' for '{section}.{key}'"))
        })?;
        debug!(%section, %key, ?value, "configuration override");
        let section_table = table
            .entry(section.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        match section_table {
            Value::Table(section_table) => {
                section_table.insert(key.to_string(), value);
            }
            _ => {
                return Err(TaskweaveError::ConfigError(format!(
                    "[{section}] is not a table"
                )));
            }
        }
    }
    Ok(table)
}

fn parse_scalar(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(mut parsed) = toml::from_str::<Table>(&format!("v = {raw}")) {
        return parsed.remove("v").filter(|v| !matches!(v, Value::Table(_) | Value::Array(_)));
    }
    let bare = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    bare.then(|| Value::String(raw.to_string()))
}

/// Load (or default), apply `overrides`, and validate.
pub fn load_with_overrides(path: Option<&Path>, overrides: Option<&str>) -> Result<RuntimeConfig> {
    let table = match path {
        Some(path) => load_table(path)?,
        None => Table::new(),
    };
    let table = match overrides {
        Some(overrides) => apply_overrides(table, overrides)?,
        None => table,
    };
    RuntimeConfig::try_from(into_raw(table)?)
}

/// The entry point for the binary: file (if any), then the overrides from
/// [`CONFIG_OVERRIDE_ENV`], then validation.
pub fn load_and_validate(path: Option<&Path>) -> Result<RuntimeConfig> {
    let overrides = std::env::var(CONFIG_OVERRIDE_ENV).ok();
    load_with_overrides(path, overrides.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchedulingPolicy;

    #[test]
    fn overrides_replace_and_add_keys() {
        let table: Table = toml::from_str("[cluster]\nnodes = 2\n").unwrap();
        let table = apply_overrides(table, "cluster.nodes=4, scheduler.policy=random").unwrap();
        let raw = into_raw(table).unwrap();
        assert_eq!(raw.cluster.nodes, 4);
        assert_eq!(raw.scheduler.policy, SchedulingPolicy::Random);
    }

    #[test]
    fn unknown_override_keys_are_rejected() {
        let err = apply_overrides(Table::new(), "cluster.bogus=1").unwrap_err();
        assert!(matches!(err, TaskweaveError::ConfigError(_)));
        let err = apply_overrides(Table::new(), "nodes=1").unwrap_err();
        assert!(matches!(err, TaskweaveError::ConfigError(_)));
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let err = apply_overrides(Table::new(), "runtime.idle_wait_us=1 2").unwrap_err();
        assert!(matches!(err, TaskweaveError::ConfigError(_)));
    }
}
