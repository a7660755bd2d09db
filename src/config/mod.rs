// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs`: the TOML data model and the validated `RuntimeConfig`.
//! - `loader.rs`: file loading and `TASKWEAVE_CONFIG_OVERRIDE` overrides.
//! - `validate.rs`: `TryFrom<RawRuntimeConfig>` for `RuntimeConfig`.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{apply_overrides, load_and_validate, load_from_path, load_with_overrides};
pub use model::{ClusterSection, RawRuntimeConfig, RuntimeConfig, RuntimeSection, SchedulerSection};
pub use validate::validate_raw_config;
