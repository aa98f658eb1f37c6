//! Engine configuration.
//!
//! [`EngineConfig`] can be built directly (it implements `Default`) or loaded
//! through [`EngineConfig::load`], which layers built-in defaults, an optional
//! TOML file, and `ACQ_ENGINE_*` environment variables. Loading is separate
//! from validation: a config that parses may still be semantically invalid
//! (for example a zero notification queue), which `validate` catches before
//! the engine starts any threads.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Environment variable prefix recognized by [`EngineConfig::load`],
/// e.g. `ACQ_ENGINE_DEFAULT_WORKER_NAME=acq`.
const ENV_PREFIX: &str = "ACQ_ENGINE";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker used when a submission names none and the event declares no
    /// preference.
    pub default_worker_name: String,

    /// Per-worker queue depth limit. `None` means unbounded.
    pub max_queue_depth: Option<usize>,

    /// Capacity of the notification dispatch queue. Publication never blocks;
    /// notifications beyond this depth are dropped with a warning.
    pub notification_queue_depth: usize,

    /// Soft bound, in bytes, on data held in memory by a data handler.
    /// `None` means unbounded. Exceeding the bound is reported, not enforced,
    /// since `put` must stay non-blocking.
    pub handler_memory_bound: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_worker_name: "main".to_string(),
            max_queue_depth: None,
            notification_queue_depth: 1024,
            handler_memory_bound: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional TOML file, and the
    /// environment.
    pub fn load(path: Option<&str>) -> EngineResult<Self> {
        let defaults = EngineConfig::default();
        let mut builder = config::Config::builder()
            .set_default("default_worker_name", defaults.default_worker_name)?
            .set_default(
                "notification_queue_depth",
                defaults.notification_queue_depth as u64,
            )?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX));

        let cfg: EngineConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check semantic constraints that parsing cannot express.
    pub fn validate(&self) -> EngineResult<()> {
        if self.default_worker_name.is_empty() {
            return Err(EngineError::Configuration(
                "default_worker_name must not be empty".to_string(),
            ));
        }
        if self.notification_queue_depth == 0 {
            return Err(EngineError::Configuration(
                "notification_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.max_queue_depth == Some(0) {
            return Err(EngineError::Configuration(
                "max_queue_depth of 0 would reject every submission".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.default_worker_name, "main");
        assert!(cfg.max_queue_depth.is_none());
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let cfg = EngineConfig {
            max_queue_depth: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_worker_name_rejected() {
        let cfg = EngineConfig {
            default_worker_name: String::new(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let cfg = EngineConfig::load(None).expect("load failed");
        assert_eq!(cfg.default_worker_name, "main");
        assert_eq!(cfg.notification_queue_depth, 1024);
    }
}
