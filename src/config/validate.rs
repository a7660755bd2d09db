// src/config/validate.rs

use crate::config::model::{RawRuntimeConfig, RuntimeConfig};
use crate::errors::{Result, TaskweaveError};

/// Most slots a reduction group can track in its atomic bitset.
pub const MAX_REDUCTION_SLOTS: usize = 64;

impl TryFrom<RawRuntimeConfig> for RuntimeConfig {
    type Error = TaskweaveError;

    fn try_from(raw: RawRuntimeConfig) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(RuntimeConfig::new_unchecked(raw))
    }
}

/// Check a raw configuration without building it.
pub fn validate_raw_config(cfg: &RawRuntimeConfig) -> Result<()> {
    validate_cluster(cfg)?;
    validate_runtime(cfg)?;
    Ok(())
}

fn validate_cluster(cfg: &RawRuntimeConfig) -> Result<()> {
    if cfg.cluster.nodes == 0 {
        return Err(TaskweaveError::ConfigError(
            "[cluster].nodes must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.cluster.message_max_size == 0 {
        return Err(TaskweaveError::ConfigError(
            "[cluster].message_max_size must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_runtime(cfg: &RawRuntimeConfig) -> Result<()> {
    if cfg.runtime.workers_per_node == 0 {
        return Err(TaskweaveError::ConfigError(
            "[runtime].workers_per_node must be >= 1 (got 0)".to_string(),
        ));
    }
    let slots = cfg.runtime.reduction_slots;
    if slots == 0 || slots > MAX_REDUCTION_SLOTS {
        return Err(TaskweaveError::ConfigError(format!(
            "[runtime].reduction_slots must be between 1 and {MAX_REDUCTION_SLOTS} (got {slots})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RuntimeConfig::try_from(RawRuntimeConfig::default()).is_ok());
    }

    #[test]
    fn zero_nodes_is_rejected() {
        let mut raw = RawRuntimeConfig::default();
        raw.cluster.nodes = 0;
        let err = RuntimeConfig::try_from(raw).unwrap_err();
        assert!(err.to_string().contains("nodes"));
    }

    #[test]
    fn reduction_slots_are_bounded_by_the_bitset() {
        let mut raw = RawRuntimeConfig::default();
        raw.runtime.reduction_slots = MAX_REDUCTION_SLOTS + 1;
        assert!(RuntimeConfig::try_from(raw).is_err());
    }
}
