use serde::Deserialize;

use crate::policy::CachePolicy;
use crate::sim::config::{Config, RunConfig};

/// Values to sweep over; an empty list keeps the `[run]` value.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SweepConfig {
    pub cache_policy: Vec<CachePolicy>,
    pub cache_percent: Vec<f64>,
}

impl Config for SweepConfig {}

impl SweepConfig {
    pub fn is_empty(&self) -> bool {
        self.cache_policy.is_empty() && self.cache_percent.is_empty()
    }

    /// Every policy crossed with every cache percent, policy-major.
    pub fn expand(&self, base: &RunConfig) -> ConfigList {
        ConfigList::single(base.clone())
            .fork(&self.cache_policy, |cfg, &policy| cfg.cache_policy = policy)
            .fork(&self.cache_percent, |cfg, &pct| cfg.cache_percent = pct)
    }
}

/// An ordered list of run configurations. Every operation returns a new
/// list and leaves the receiver alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigList {
    configs: Vec<RunConfig>,
}

impl ConfigList {
    pub fn new(configs: Vec<RunConfig>) -> Self {
        Self { configs }
    }

    pub fn single(config: RunConfig) -> Self {
        Self { configs: vec![config] }
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RunConfig> {
        self.configs.iter()
    }

    /// Keep the configs matching `pred`.
    pub fn select(&self, pred: impl Fn(&RunConfig) -> bool) -> Self {
        Self {
            configs: self.configs.iter().filter(|c| pred(c)).cloned().collect(),
        }
    }

    /// Apply `set` to a copy of every config.
    pub fn override_each(&self, set: impl Fn(&mut RunConfig)) -> Self {
        Self {
            configs: self
                .configs
                .iter()
                .map(|c| {
                    let mut c = c.clone();
                    set(&mut c);
                    c
                })
                .collect(),
        }
    }

    /// One copy of every config per value. An empty `values` returns the
    /// list unchanged.
    pub fn fork<T>(&self, values: &[T], set: impl Fn(&mut RunConfig, &T)) -> Self {
        if values.is_empty() {
            return self.clone();
        }
        let mut configs = Vec::with_capacity(self.configs.len() * values.len());
        for c in &self.configs {
            for value in values {
                let mut c = c.clone();
                set(&mut c, value);
                configs.push(c);
            }
        }
        Self { configs }
    }

    pub fn concat(&self, other: &ConfigList) -> Self {
        Self {
            configs: self.configs.iter().chain(&other.configs).cloned().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ConfigList {
    type Item = &'a RunConfig;
    type IntoIter = std::slice::Iter<'a, RunConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_crosses_policies_and_percents() {
        let sweep = SweepConfig {
            cache_policy: vec![CachePolicy::Rep, CachePolicy::CollCacheAsymmLink],
            cache_percent: vec![0.05, 0.1, 0.2],
        };
        let list = sweep.expand(&RunConfig::default());
        assert_eq!(list.len(), 6);
        let names: Vec<_> = list.iter().map(|c| c.log_name()).collect();
        assert_eq!(names[0], "rep_cache_rate_005_batch_size_8192");
        assert_eq!(names[5], "coll_cache_asymm_link_cache_rate_020_batch_size_8192");
    }

    #[test]
    fn empty_sweep_is_the_base_run() {
        let base = RunConfig::default();
        let list = SweepConfig::default().expand(&base);
        assert_eq!(list, ConfigList::single(base));
        assert!(SweepConfig::default().is_empty());
    }

    #[test]
    fn operations_leave_the_receiver_alone() {
        let list = ConfigList::single(RunConfig::default())
            .fork(&[1, 2, 4, 8], |c, &n| c.num_workers = n);
        let small = list.select(|c| c.num_workers <= 2);
        let grouped = list.override_each(|c| c.no_group = true);
        assert_eq!(list.len(), 4);
        assert_eq!(small.len(), 2);
        assert!(grouped.iter().all(|c| c.no_group));
        assert!(list.iter().all(|c| !c.no_group));

        let both = small.concat(&grouped);
        assert_eq!(both.len(), 6);
        assert_eq!(both.iter().last().map(|c| c.num_workers), Some(8));
    }
}
