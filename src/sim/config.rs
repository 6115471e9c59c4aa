use std::path::PathBuf;
use std::str::FromStr;

use log::{warn, LevelFilter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

use crate::error::{CacheError, Result};
use crate::policy::CachePolicy;

/// What to do when prescan cannot produce a usable estimate.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrescFallback {
    #[default]
    None,
    Degree,
}

impl FromStr for PrescFallback {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "degree" => Ok(Self::Degree),
            _ => Err(format!(
                "unsupported prescan fallback '{}', expected one of: none, degree",
                value
            )),
        }
    }
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Result<Self> {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|err| CacheError::config(format!("cannot deserialize config: {err}"))),
            None => {
                warn!("config section not found");
                Ok(Self::default())
            }
        }
    }
}

/// One experiment run. Values are never mutated once a run starts; sweeps
/// derive new values through [`crate::sim::sweep::ConfigList`].
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub cache_policy: CachePolicy,
    /// Share of the feature table each GPU may cache, 0.0 to 1.0.
    pub cache_percent: f64,
    pub num_workers: usize,
    pub epochs: usize,
    pub skip_epoch: usize,
    pub presc_epoch: usize,
    pub local_step: usize,
    /// Node IDs per worker per step.
    pub batch_size: usize,
    pub concurrent_link: bool,
    pub no_group: bool,
    pub presc_fallback: PrescFallback,
    pub max_step_retries: u32,
    pub log_level: u64,
    pub logdir: Option<PathBuf>,
}

impl Config for RunConfig {}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cache_policy: CachePolicy::CollCacheAsymmLink,
            cache_percent: 0.1,
            num_workers: 8,
            epochs: 4,
            skip_epoch: 2,
            presc_epoch: 1,
            local_step: 1002,
            batch_size: 8192,
            concurrent_link: false,
            no_group: false,
            presc_fallback: PrescFallback::None,
            max_step_retries: 3,
            log_level: 0,
            logdir: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.cache_percent) {
            return Err(CacheError::config(format!(
                "cache_percent {} outside [0, 1]",
                self.cache_percent
            )));
        }
        if self.num_workers == 0 {
            return Err(CacheError::config("num_workers must be > 0"));
        }
        if self.local_step == 0 || self.batch_size == 0 {
            return Err(CacheError::config("local_step and batch_size must be > 0"));
        }
        if self.skip_epoch >= self.epochs {
            return Err(CacheError::config(format!(
                "skip_epoch {} leaves no measured epoch out of {}",
                self.skip_epoch, self.epochs
            )));
        }
        Ok(())
    }

    pub fn measured_epochs(&self) -> usize {
        self.epochs.saturating_sub(self.skip_epoch)
    }

    /// File stem for this run's logs.
    pub fn log_name(&self) -> String {
        let mut name = format!(
            "{}_cache_rate_{:03}_batch_size_{}",
            self.cache_policy,
            (self.cache_percent * 100.0).round() as u64,
            self.batch_size
        );
        if self.no_group {
            name.push_str("_nogroup");
        }
        if self.concurrent_link {
            name.push_str("_concurrent_link");
        }
        name
    }

    pub fn describe(&self) -> String {
        let mut line = format!(
            "{} cache={:.0}% workers={} batch={} epochs={} (skip {}, presc {})",
            self.cache_policy,
            self.cache_percent * 100.0,
            self.num_workers,
            self.batch_size,
            self.epochs,
            self.skip_epoch,
            self.presc_epoch
        );
        if self.concurrent_link {
            line.push_str(" concurrent_link");
        }
        if self.no_group {
            line.push_str(" nogroup");
        }
        line
    }

    /// 0: none, 1: info, 2 and up: debug.
    pub fn level_filter(&self) -> LevelFilter {
        match self.log_level {
            0 => LevelFilter::Off,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> toml::Table {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn missing_section_uses_defaults() {
        let table = parse("");
        let run = RunConfig::from_section(table.get("run")).unwrap();
        assert_eq!(run, RunConfig::default());
    }

    #[test]
    fn section_overrides_fields() {
        let table = parse(
            r#"
            [run]
            cache_policy = "clique_part"
            cache_percent = 0.25
            num_workers = 4
            presc_fallback = "degree"
            "#,
        );
        let run = RunConfig::from_section(table.get("run")).unwrap();
        assert_eq!(run.cache_policy, CachePolicy::CliquePart);
        assert_eq!(run.cache_percent, 0.25);
        assert_eq!(run.num_workers, 4);
        assert_eq!(run.presc_fallback, PrescFallback::Degree);
        assert_eq!(run.epochs, 4);
    }

    #[test]
    fn bad_section_is_a_config_error() {
        let table = parse("[run]\ncache_policy = \"lru\"\n");
        let err = RunConfig::from_section(table.get("run")).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn log_name_encodes_run() {
        let run = RunConfig {
            cache_policy: CachePolicy::CollCache,
            cache_percent: 0.07,
            batch_size: 8000,
            no_group: true,
            concurrent_link: true,
            ..RunConfig::default()
        };
        assert_eq!(
            run.log_name(),
            "coll_cache_cache_rate_007_batch_size_8000_nogroup_concurrent_link"
        );
        assert!(run.describe().starts_with("coll_cache cache=7% workers=8"));
    }

    #[test]
    fn validate_rejects_empty_window() {
        let run = RunConfig { epochs: 2, skip_epoch: 2, ..RunConfig::default() };
        assert!(run.validate().is_err());
        let run = RunConfig { cache_percent: 1.5, ..RunConfig::default() };
        assert!(run.validate().is_err());
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn log_level_maps_to_filter() {
        let mut run = RunConfig::default();
        assert_eq!(run.level_filter(), LevelFilter::Off);
        run.log_level = 1;
        assert_eq!(run.level_filter(), LevelFilter::Info);
        run.log_level = 5;
        assert_eq!(run.level_filter(), LevelFilter::Debug);
    }
}
