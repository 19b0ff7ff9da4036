//! Internal tunables Populating these from the environment
//! or a config file is a host-process concern, out of scope for this crate;
//! what lives here is the code-level surface and its spec-mandated defaults.

use std::time::Duration;

/// Per-source processing knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub poll_interval: Duration,
    pub position_update_interval: Duration,
    pub worker_pool_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            batch_size: 1000,
            batch_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            position_update_interval: Duration::from_millis(500),
            worker_pool_size: 4,
        }
    }
}

/// Cutoff-window settings for `apply_initial_import_limit`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportLimitConfig {
    pub enabled: bool,
    pub days: u32,
}

impl Default for ImportLimitConfig {
    fn default() -> Self {
        ImportLimitConfig {
            enabled: true,
            days: 60,
        }
    }
}

impl ImportLimitConfig {
    /// `days == 0` disables the limit regardless of `enabled`
    pub fn is_active(&self) -> bool {
        self.enabled && self.days > 0
    }
}

/// How often the `Coordinator` reconciles against the source registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorConfig {
    pub sync_interval: Duration,
    pub processor: ProcessorConfig,
    pub import_limit: ImportLimitConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            sync_interval: Duration::from_secs(30),
            processor: ProcessorConfig::default(),
            import_limit: ImportLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = ProcessorConfig::default();
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.worker_pool_size, 4);
        assert_eq!(cfg.batch_timeout, Duration::from_secs(2));
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.position_update_interval, Duration::from_millis(500));

        let import = ImportLimitConfig::default();
        assert_eq!(import.days, 60);
        assert!(import.is_active());
        assert!(!ImportLimitConfig { enabled: true, days: 0 }.is_active());
    }
}
