//! Library-level settings.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::RefreshMode;
use crate::error::{StatzError, StatzResult};
use crate::flush::FlushSettings;
use crate::schema::{MergePolicy, SchemaRegistry};
use crate::types::StatKind;

#[derive(Debug, Clone)]
pub struct StatzConfig {
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub cache_refresh: RefreshMode,
    /// When false every kind is disabled and updates are ignored.
    pub tracking_enabled: bool,
    pub disabled_stats: Vec<StatKind>,
    pub merge_overrides: HashMap<StatKind, MergePolicy>,
}

impl Default for StatzConfig {
    fn default() -> Self {
        let flush = FlushSettings::default();
        Self {
            flush_interval: flush.interval,
            max_retries: flush.max_retries,
            cache_refresh: RefreshMode::default(),
            tracking_enabled: true,
            disabled_stats: Vec::new(),
            merge_overrides: HashMap::new(),
        }
    }
}

impl StatzConfig {
    pub fn validate(&self) -> StatzResult<()> {
        if self.flush_interval.is_zero() {
            return Err(StatzError::config("flush interval must be greater than zero"));
        }
        Ok(())
    }

    pub fn flush_settings(&self) -> FlushSettings {
        FlushSettings {
            interval: self.flush_interval,
            max_retries: self.max_retries,
        }
    }

    /// Builds the schema registry with overrides and disabled kinds applied.
    pub fn build_registry(&self) -> StatzResult<SchemaRegistry> {
        let mut registry = SchemaRegistry::builtin();
        for (kind, policy) in &self.merge_overrides {
            registry.set_merge_policy(*kind, *policy)?;
        }
        if self.tracking_enabled {
            for kind in &self.disabled_stats {
                registry.disable(*kind)?;
            }
        } else {
            registry.disable_all();
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StatzConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = StatzConfig {
            flush_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StatzError::Config { .. })));
    }

    #[test]
    fn test_registry_applies_overrides() {
        let mut config = StatzConfig::default();
        config.disabled_stats.push(StatKind::Votes);
        config.merge_overrides.insert(StatKind::XpGained, MergePolicy::Max);

        let registry = config.build_registry().unwrap();
        assert!(!registry.schema(StatKind::Votes).unwrap().enabled);
        assert!(registry.schema(StatKind::Joins).unwrap().enabled);
        assert_eq!(registry.schema(StatKind::XpGained).unwrap().merge, MergePolicy::Max);
    }

    #[test]
    fn test_tracking_disabled_disables_everything() {
        let config = StatzConfig {
            tracking_enabled: false,
            ..Default::default()
        };
        let registry = config.build_registry().unwrap();
        assert!(registry.schemas().iter().all(|s| !s.enabled));
    }

    #[test]
    fn test_sum_on_text_kind_rejected() {
        let mut config = StatzConfig::default();
        config.merge_overrides.insert(StatKind::CurrentWorld, MergePolicy::Sum);
        assert!(config.build_registry().is_err());
    }
}
