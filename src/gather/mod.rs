//! Gather/combine engine.
//!
//! Each step takes one table generation, splits the batch by source, reads
//! the local cache, every remote owner, and the host table on scoped
//! threads, then scatters the rows back into batch order. Metrics are
//! committed only once every read has succeeded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::base::mem::{DeviceCache, FeatureSource, HostFeatures};
use crate::error::{CacheError, NodeId, Result};
use crate::table::{CacheTable, Location, PlacementDecision, TableCell};
use crate::topology::{transfer_time_s, Topology, WorkerId, LINK_LATENCY_US};

pub mod metrics;


pub use metrics::{MetricsSnapshot, SourceReport, SourceStats, StepMetrics};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Read from all remote owners at once instead of one link at a time.
    pub concurrent_link: bool,
    pub link_latency_us: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrent_link: false,
            link_latency_us: LINK_LATENCY_US,
        }
    }
}

/// Combined features of one batch; row `k` belongs to `ids[k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch {
    dim: usize,
    data: Vec<f32>,
}

impl FeatureBatch {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_rows(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn row(&self, k: usize) -> &[f32] {
        &self.data[k * self.dim..(k + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// A cache table together with the device caches filled from it.
#[derive(Debug)]
struct Resident {
    table: CacheTable,
    caches: Vec<DeviceCache>,
}

impl Resident {
    fn build(table: CacheTable, host: &HostFeatures, topology: &Topology) -> Result<Self> {
        if table.num_workers() != topology.num_workers() {
            return Err(CacheError::config(format!(
                "table covers {} workers, topology has {}",
                table.num_workers(),
                topology.num_workers()
            )));
        }
        if table.num_nodes() != host.num_nodes() {
            return Err(CacheError::config(format!(
                "table covers {} nodes, host table has {}",
                table.num_nodes(),
                host.num_nodes()
            )));
        }
        if let Some(d) = table.rows().iter().find(|d| match d.location {
            Location::Remote(owner) => !topology.has_link(d.worker, owner),
            _ => false,
        }) {
            return Err(CacheError::invalid_placement(format!(
                "worker {} reads node {} from {:?} without a peer link",
                d.worker, d.node_id, d.location
            )));
        }
        let caches = (0..table.num_workers())
            .map(|w| {
                let nodes = table.local_nodes(w);
                if nodes.len() > topology.capacity(w) {
                    return Err(CacheError::invalid_placement(format!(
                        "worker {w} caches {} nodes but holds only {}",
                        nodes.len(),
                        topology.capacity(w)
                    )));
                }
                DeviceCache::fill(w, host, nodes)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { table, caches })
    }
}

/// One published generation, held by readers for as long as they need it.
#[derive(Debug, Clone)]
pub struct Generation {
    id: u64,
    resident: Arc<Resident>,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn table(&self) -> &CacheTable {
        &self.resident.table
    }

    pub fn cache(&self, worker: WorkerId) -> &DeviceCache {
        &self.resident.caches[worker]
    }
}

/// Batch positions routed to one source, with the row each reads there.
#[derive(Debug, Default)]
struct Route {
    positions: Vec<usize>,
    rows: Vec<usize>,
}

impl Route {
    fn push(&mut self, position: usize, row: usize) {
        self.positions.push(position);
        self.rows.push(row);
    }

    fn len(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Debug)]
struct Plan {
    local: Route,
    /// Non-empty routes only, ascending by owner.
    remote: Vec<(WorkerId, Route)>,
    cpu: Route,
}

impl Plan {
    fn build(table: &CacheTable, ids: &[NodeId], worker: WorkerId) -> Result<Self> {
        let num_nodes = table.num_nodes();
        let mut local = Route::default();
        let mut cpu = Route::default();
        let mut by_owner: Vec<Route> = (0..table.num_workers()).map(|_| Route::default()).collect();
        for (pos, &id) in ids.iter().enumerate() {
            if id as usize >= num_nodes {
                return Err(CacheError::NodeOutOfRange { node: id, num_nodes });
            }
            let d = table.lookup(id, worker);
            match d.location {
                Location::Local => local.push(pos, d.slot_offset),
                Location::Remote(owner) => by_owner[owner].push(pos, d.slot_offset),
                Location::Cpu => cpu.push(pos, d.slot_offset),
            }
        }
        let remote = by_owner
            .into_iter()
            .enumerate()
            .filter(|(_, route)| route.len() > 0)
            .collect();
        Ok(Self { local, remote, cpu })
    }
}

struct Fetched {
    data: Vec<f32>,
    elapsed: Duration,
}

fn fetch(source: &dyn FeatureSource, route: &Route) -> anyhow::Result<Fetched> {
    let start = Instant::now();
    let mut data = vec![0.0; route.len() * source.feat_dim()];
    source.read_rows(&route.rows, &mut data)?;
    Ok(Fetched { data, elapsed: start.elapsed() })
}

fn join<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
}

fn scatter(out: &mut [f32], route: &Route, data: &[f32], dim: usize) {
    for (k, &pos) in route.positions.iter().enumerate() {
        out[pos * dim..(pos + 1) * dim].copy_from_slice(&data[k * dim..(k + 1) * dim]);
    }
}

pub struct Engine {
    host: Arc<HostFeatures>,
    topology: Topology,
    config: EngineConfig,
    resident: TableCell<Resident>,
    metrics: Vec<Mutex<StepMetrics>>,
    aborted: Vec<AtomicU64>,
    online: Vec<AtomicBool>,
}

impl Engine {
    pub fn new(
        host: Arc<HostFeatures>,
        topology: Topology,
        table: CacheTable,
        config: EngineConfig,
    ) -> Result<Self> {
        let resident = Resident::build(table, &host, &topology)?;
        let n = topology.num_workers();
        info!(
            "engine ready: {} workers, {} nodes, {} local rows",
            n,
            host.num_nodes(),
            resident.caches.iter().map(|c| c.num_rows()).sum::<usize>()
        );
        Ok(Self {
            host,
            topology,
            config,
            resident: TableCell::new(resident),
            metrics: (0..n).map(|_| Mutex::new(StepMetrics::default())).collect(),
            aborted: (0..n).map(|_| AtomicU64::new(0)).collect(),
            online: (0..n).map(|_| AtomicBool::new(true)).collect(),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.topology.num_workers()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn host(&self) -> &HostFeatures {
        &self.host
    }

    pub fn snapshot(&self) -> Generation {
        let (id, resident) = self.resident.snapshot();
        Generation { id, resident }
    }

    fn check_worker(&self, worker: WorkerId) -> Result<()> {
        if worker >= self.num_workers() {
            return Err(CacheError::config(format!(
                "worker {worker} out of range (num_workers = {})",
                self.num_workers()
            )));
        }
        Ok(())
    }

    fn lock_metrics(&self, worker: WorkerId) -> MutexGuard<'_, StepMetrics> {
        self.metrics[worker]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Gather the features of `ids` for `worker`, in batch order.
    pub fn gather(&self, ids: &[NodeId], worker: WorkerId) -> Result<FeatureBatch> {
        self.check_worker(worker)?;
        match self.step(ids, worker) {
            Ok((batch, step)) => {
                *self.lock_metrics(worker) += &step;
                Ok(batch)
            }
            Err(err) => {
                if err.is_step_local() {
                    self.aborted[worker].fetch_add(1, Ordering::Relaxed);
                    warn!("worker {worker}: step aborted: {err}");
                }
                Err(err)
            }
        }
    }

    fn step(&self, ids: &[NodeId], worker: WorkerId) -> Result<(FeatureBatch, StepMetrics)> {
        let generation = self.snapshot();
        let resident: &Resident = &generation.resident;
        let plan = Plan::build(&resident.table, ids, worker)?;
        let host: &HostFeatures = &self.host;
        let start = Instant::now();

        let (local, cpu, remote, remote_elapsed) = thread::scope(|s| {
            let local = s.spawn(|| fetch(&resident.caches[worker], &plan.local));
            let cpu = s.spawn(|| fetch(host, &plan.cpu));
            let remote_start = Instant::now();
            let remote: Vec<Result<Fetched>> = if self.config.concurrent_link {
                let handles: Vec<_> = plan
                    .remote
                    .iter()
                    .map(|(owner, route)| {
                        s.spawn(move || self.fetch_remote(resident, worker, *owner, route))
                    })
                    .collect();
                handles.into_iter().map(join).collect()
            } else {
                plan.remote
                    .iter()
                    .map(|(owner, route)| self.fetch_remote(resident, worker, *owner, route))
                    .collect()
            };
            let remote_elapsed = remote_start.elapsed();
            (join(local), join(cpu), remote, remote_elapsed)
        });

        let local = local.map_err(|err| CacheError::Transfer {
            worker,
            owner: worker,
            reason: format!("local read: {err}"),
        })?;
        let cpu = cpu.map_err(|err| CacheError::Transfer {
            worker,
            owner: worker,
            reason: format!("host read: {err}"),
        })?;
        let remote = remote.into_iter().collect::<Result<Vec<_>>>()?;

        let dim = host.feat_dim();
        let mut out = vec![0.0; ids.len() * dim];
        scatter(&mut out, &plan.local, &local.data, dim);
        scatter(&mut out, &plan.cpu, &cpu.data, dim);
        for ((_, route), fetched) in plan.remote.iter().zip(&remote) {
            scatter(&mut out, route, &fetched.data, dim);
        }

        let row_bytes = host.row_bytes();
        let latency = self.config.link_latency_us;
        let local_bytes = plan.local.len() as u64 * row_bytes;
        let cpu_bytes = plan.cpu.len() as u64 * row_bytes;
        let mut step = StepMetrics {
            local: SourceStats {
                rows: plan.local.len() as u64,
                bytes: local_bytes,
                time_s: local.elapsed.as_secs_f64(),
                modeled_time_s: transfer_time_s(local_bytes, self.topology.local_bandwidth(), 0.0),
            },
            cpu: SourceStats {
                rows: plan.cpu.len() as u64,
                bytes: cpu_bytes,
                time_s: cpu.elapsed.as_secs_f64(),
                modeled_time_s: transfer_time_s(
                    cpu_bytes,
                    self.topology.cpu_bandwidth(worker),
                    latency,
                ),
            },
            steps: 1,
            ..StepMetrics::default()
        };
        step.remote.time_s = remote_elapsed.as_secs_f64();
        for (owner, route) in &plan.remote {
            let bytes = route.len() as u64 * row_bytes;
            let modeled = transfer_time_s(bytes, self.topology.bandwidth(worker, *owner), latency);
            step.remote.rows += route.len() as u64;
            step.remote.bytes += bytes;
            step.remote.modeled_time_s = if self.config.concurrent_link {
                step.remote.modeled_time_s.max(modeled)
            } else {
                step.remote.modeled_time_s + modeled
            };
        }
        step.modeled_step_time_s = step
            .local
            .modeled_time_s
            .max(step.remote.modeled_time_s)
            .max(step.cpu.modeled_time_s);
        step.step_time_s = start.elapsed().as_secs_f64();

        debug!(
            "worker {worker} gen {}: {} local, {} remote over {} links, {} cpu",
            generation.id,
            step.local.rows,
            step.remote.rows,
            plan.remote.len(),
            step.cpu.rows
        );
        Ok((FeatureBatch { dim, data: out }, step))
    }

    fn fetch_remote(
        &self,
        resident: &Resident,
        worker: WorkerId,
        owner: WorkerId,
        route: &Route,
    ) -> Result<Fetched> {
        if !self.online[owner].load(Ordering::Acquire) {
            return Err(CacheError::Transfer {
                worker,
                owner,
                reason: "peer is offline".to_string(),
            });
        }
        fetch(&resident.caches[owner], route).map_err(|err| CacheError::Transfer {
            worker,
            owner,
            reason: err.to_string(),
        })
    }

    /// Mark `worker`'s cache reachable or unreachable for peer reads.
    pub fn set_peer_online(&self, worker: WorkerId, online: bool) -> Result<()> {
        self.check_worker(worker)?;
        self.online[worker].store(online, Ordering::Release);
        Ok(())
    }

    /// Validate `decisions` and publish them as the next generation.
    pub fn rebuild(&self, decisions: Vec<PlacementDecision>) -> Result<u64> {
        let table = CacheTable::from_decisions(
            decisions,
            self.host.num_nodes(),
            self.num_workers(),
            self.topology.capacities(),
        )?;
        self.rebuild_table(table)
    }

    pub fn rebuild_table(&self, table: CacheTable) -> Result<u64> {
        let resident = Resident::build(table, &self.host, &self.topology)?;
        let id = self.resident.publish(resident);
        info!("published cache table generation {id}");
        Ok(id)
    }

    /// Raw accumulated counters for `worker`.
    pub fn step_metrics(&self, worker: WorkerId) -> Result<StepMetrics> {
        self.check_worker(worker)?;
        Ok(self.lock_metrics(worker).clone())
    }

    pub fn metrics(&self, worker: WorkerId) -> Result<MetricsSnapshot> {
        let metrics = self.step_metrics(worker)?;
        let aborted = self.aborted[worker].load(Ordering::Relaxed);
        Ok(MetricsSnapshot::new(&metrics, aborted))
    }

    pub fn metrics_total(&self) -> MetricsSnapshot {
        let mut total = StepMetrics::default();
        let mut aborted = 0u64;
        for worker in 0..self.num_workers() {
            total += &*self.lock_metrics(worker);
            aborted = aborted.saturating_add(self.aborted[worker].load(Ordering::Relaxed));
        }
        MetricsSnapshot::new(&total, aborted)
    }

    pub fn reset_metrics(&self) {
        for worker in 0..self.num_workers() {
            *self.lock_metrics(worker) = StepMetrics::default();
            self.aborted[worker].store(0, Ordering::Relaxed);
        }
    }
}
