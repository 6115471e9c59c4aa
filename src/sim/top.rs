use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use anyhow::Context;
use log::{debug, info, warn};
use serde::Serialize;

use crate::base::mem::HostFeatures;
use crate::error::{CacheError, NodeId, Result};
use crate::gather::{Engine, EngineConfig, MetricsSnapshot};
use crate::policy::{budget_for, PlacementStrategy, PlacementSummary, Strategy, StrategyOptions};
use crate::presc::{FrequencyTable, Prescan};
use crate::sim::config::{PrescFallback, RunConfig};
use crate::sim::workload::{Workload, WorkloadConfig};
use crate::table::CacheTable;
use crate::topology::{Topology, TopologyConfig, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencySource {
    Prescan,
    Degree,
}

/// Outcome of one run, as written to `summary.json` and `sweep.csv`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub name: String,
    pub description: String,
    pub policy: String,
    pub cache_percent: f64,
    pub num_workers: usize,
    pub batch_size: usize,
    pub concurrent_link: bool,
    pub no_group: bool,
    pub frequency_source: FrequencySource,
    pub prescan_batches: u64,
    pub placement: PlacementSummary,
    pub retries: u64,
    pub elapsed_s: f64,
    pub per_worker: Vec<MetricsSnapshot>,
    pub total: MetricsSnapshot,
}

impl RunReport {
    pub const CSV_HEADER: &'static str = "name,policy,cache_percent,num_workers,batch_size,\
concurrent_link,no_group,optimal_local_rate,optimal_remote_rate,optimal_cpu_rate,\
local_cache_rate,remote_cache_rate,cpu_rate,global_cache_rate,\
size_gb_local,size_gb_remote,size_gb_cpu,time_s_local,time_s_remote,time_s_cpu,\
modeled_time_s_local,modeled_time_s_remote,modeled_time_s_cpu,\
weight_pct_local,weight_pct_remote,weight_pct_cpu,steps,aborted_steps,retries";

    pub fn csv_row(&self) -> String {
        let t = &self.total;
        let p = &self.placement;
        let fields = [
            self.name.clone(),
            self.policy.clone(),
            self.cache_percent.to_string(),
            self.num_workers.to_string(),
            self.batch_size.to_string(),
            self.concurrent_link.to_string(),
            self.no_group.to_string(),
            p.optimal_local_rate.to_string(),
            p.optimal_remote_rate.to_string(),
            p.optimal_cpu_rate.to_string(),
            t.local_cache_rate.to_string(),
            t.remote_cache_rate.to_string(),
            t.cpu_rate.to_string(),
            t.global_cache_rate.to_string(),
            t.local.size_gb.to_string(),
            t.remote.size_gb.to_string(),
            t.cpu.size_gb.to_string(),
            t.local.time_s.to_string(),
            t.remote.time_s.to_string(),
            t.cpu.time_s.to_string(),
            t.local.modeled_time_s.to_string(),
            t.remote.modeled_time_s.to_string(),
            t.cpu.modeled_time_s.to_string(),
            t.local.weight_pct.to_string(),
            t.remote.weight_pct.to_string(),
            t.cpu.weight_pct.to_string(),
            t.steps.to_string(),
            t.aborted_steps.to_string(),
            self.retries.to_string(),
        ];
        fields.join(",")
    }

    /// One human-readable line per run.
    pub fn table_line(&self) -> String {
        let t = &self.total;
        format!(
            "{:<60} L {:>6.2}% R {:>6.2}% C {:>6.2}% | opt L {:>6.2}% R {:>6.2}% C {:>6.2}% | modeled {:.4}s",
            self.name,
            t.local_cache_rate * 100.0,
            t.remote_cache_rate * 100.0,
            t.cpu_rate * 100.0,
            self.placement.optimal_local_rate * 100.0,
            self.placement.optimal_remote_rate * 100.0,
            self.placement.optimal_cpu_rate * 100.0,
            t.modeled_step_time_s
        )
    }
}

/// Everything a run needs before the first training step.
pub struct Prepared {
    pub workload: Workload,
    pub frequencies: FrequencyTable,
    pub frequency_source: FrequencySource,
    pub prescan_batches: u64,
    pub placement: PlacementSummary,
    pub engine: Engine,
}

/// Runs experiments over one workload and topology description.
pub struct Driver {
    topology: TopologyConfig,
    workload: WorkloadConfig,
    host: Arc<HostFeatures>,
}

impl Driver {
    pub fn new(topology: TopologyConfig, workload: WorkloadConfig) -> Result<Self> {
        workload.validate()?;
        let host = Arc::new(HostFeatures::synthetic(workload.num_nodes, workload.feat_dim)?);
        Ok(Self { topology, workload, host })
    }

    pub fn run(&self, run: &RunConfig) -> anyhow::Result<RunReport> {
        let name = run.log_name();
        info!("starting {}", run.describe());
        let start = Instant::now();
        let prepared = self
            .prepare(run)
            .with_context(|| format!("preparing {name}"))?;
        let retries = self
            .train(run, &prepared)
            .with_context(|| format!("training {name}"))?;

        let engine = &prepared.engine;
        let per_worker = (0..engine.num_workers())
            .map(|w| engine.metrics(w))
            .collect::<Result<Vec<_>>>()?;
        let report = RunReport {
            name,
            description: run.describe(),
            policy: run.cache_policy.to_string(),
            cache_percent: run.cache_percent,
            num_workers: run.num_workers,
            batch_size: run.batch_size,
            concurrent_link: run.concurrent_link,
            no_group: run.no_group,
            frequency_source: prepared.frequency_source,
            prescan_batches: prepared.prescan_batches,
            placement: prepared.placement.clone(),
            retries,
            elapsed_s: start.elapsed().as_secs_f64(),
            per_worker,
            total: engine.metrics_total(),
        };
        info!("{}", report.table_line());
        Ok(report)
    }

    /// Prescan, place and load the caches for `run`.
    pub fn prepare(&self, run: &RunConfig) -> Result<Prepared> {
        run.validate()?;
        let topology = self.topology.build(run.num_workers, self.workload.num_nodes)?;
        let workload = Workload::new(&self.workload, run.num_workers)?;
        let (frequencies, frequency_source, prescan_batches) = estimate(run, &workload)?;

        let budgets = budget_for(run.cache_percent, workload.num_nodes(), &topology);
        let table = place(run, &self.topology, &topology, &workload, &frequencies, &budgets)?;
        let placement = PlacementSummary::new(run.cache_policy.name(), &table, &frequencies);
        debug!("placement: {:?}", placement);

        let engine = Engine::new(
            Arc::clone(&self.host),
            topology,
            table,
            EngineConfig {
                concurrent_link: run.concurrent_link,
                ..EngineConfig::default()
            },
        )?;
        Ok(Prepared {
            workload,
            frequencies,
            frequency_source,
            prescan_batches,
            placement,
            engine,
        })
    }

    /// One thread per worker. Metrics are reset once every worker has
    /// finished the skipped epochs. Returns the number of retried steps.
    fn train(&self, run: &RunConfig, prepared: &Prepared) -> Result<u64> {
        let engine = &prepared.engine;
        let workload = &prepared.workload;
        let barrier = Barrier::new(run.num_workers);
        let abort = AtomicBool::new(false);

        let outcomes: Vec<Result<u64>> = thread::scope(|s| {
            let handles: Vec<_> = (0..run.num_workers)
                .map(|worker| {
                    let (barrier, abort) = (&barrier, &abort);
                    s.spawn(move || {
                        let mut outcome = Ok(0u64);
                        for epoch in 0..run.epochs {
                            if epoch == run.skip_epoch {
                                if barrier.wait().is_leader() {
                                    engine.reset_metrics();
                                    debug!("measurement window opens at epoch {epoch}");
                                }
                                barrier.wait();
                            }
                            for step in 0..run.local_step {
                                if abort.load(Ordering::Relaxed) {
                                    break;
                                }
                                let ids = workload.batch(worker, epoch, step, run.batch_size);
                                match gather_with_retry(engine, &ids, worker, run.max_step_retries) {
                                    Ok(retried) => {
                                        if let Ok(total) = outcome.as_mut() {
                                            *total += retried as u64;
                                        }
                                    }
                                    Err(err) => {
                                        abort.store(true, Ordering::Relaxed);
                                        outcome = Err(err);
                                        break;
                                    }
                                }
                            }
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
                .collect()
        });

        let mut retries = 0u64;
        for outcome in outcomes {
            retries = retries.saturating_add(outcome?);
        }
        Ok(retries)
    }
}

fn estimate(run: &RunConfig, workload: &Workload) -> Result<(FrequencyTable, FrequencySource, u64)> {
    let mut prescan = Prescan::new(workload.num_nodes(), run.num_workers);
    for epoch in 0..run.presc_epoch {
        for step in 0..run.local_step {
            for worker in 0..run.num_workers {
                prescan.observe(worker, &workload.batch(worker, epoch, step, run.batch_size))?;
            }
        }
    }
    let batches = prescan.batches();
    match prescan.finish() {
        Ok(table) => Ok((table, FrequencySource::Prescan, batches)),
        Err(err @ CacheError::Estimation(_)) if run.presc_fallback == PrescFallback::Degree => {
            warn!("{err}; ranking by degree instead");
            let table = FrequencyTable::from_degree(&workload.degrees(), run.num_workers);
            Ok((table, FrequencySource::Degree, batches))
        }
        Err(err) => Err(err),
    }
}

fn place(
    run: &RunConfig,
    topology_config: &TopologyConfig,
    topology: &Topology,
    workload: &Workload,
    frequencies: &FrequencyTable,
    budgets: &[usize],
) -> Result<CacheTable> {
    let options = StrategyOptions {
        no_group: run.no_group,
        clique_threshold: topology_config.clique_threshold,
        degrees: Some(workload.degrees()),
    };
    let strategy = Strategy::from_policy(run.cache_policy, &options)?;
    let decisions = strategy.optimize(topology, frequencies, budgets)?;
    let table = CacheTable::from_decisions(
        decisions,
        workload.num_nodes(),
        topology.num_workers(),
        budgets,
    )?;
    for w in 0..topology.num_workers() {
        let counts = table.counts(w);
        debug!(
            "{} worker {w}: {} local, {} remote, {} cpu",
            strategy.name(),
            counts.local,
            counts.remote,
            counts.cpu
        );
    }
    Ok(table)
}

/// Returns how many attempts failed before the step went through.
fn gather_with_retry(
    engine: &Engine,
    ids: &[NodeId],
    worker: WorkerId,
    max_retries: u32,
) -> Result<u32> {
    let mut failed = 0;
    loop {
        match engine.gather(ids, worker) {
            Ok(_) => return Ok(failed),
            Err(err) if err.is_step_local() && failed < max_retries => {
                failed += 1;
                debug!("worker {worker}: retrying step ({failed}/{max_retries}): {err}");
            }
            Err(err) => return Err(err),
        }
    }
}
