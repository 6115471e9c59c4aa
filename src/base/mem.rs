use anyhow::bail;

use crate::error::{CacheError, NodeId, Result};
use crate::topology::WorkerId;

/// Row-addressed feature storage: the host table or one GPU's cache.
pub trait FeatureSource: Send + Sync {
    fn feat_dim(&self) -> usize;
    fn num_rows(&self) -> usize;
    fn row_impl(&self, row: usize) -> &[f32];

    fn row(&self, row: usize) -> anyhow::Result<&[f32]> {
        if row >= self.num_rows() {
            bail!("row {} outside a {}-row table", row, self.num_rows());
        }
        Ok(self.row_impl(row))
    }

    /// Copy `rows` in order into `out`, row-major.
    fn read_rows(&self, rows: &[usize], out: &mut [f32]) -> anyhow::Result<()> {
        let dim = self.feat_dim();
        if out.len() != rows.len() * dim {
            bail!(
                "output buffer holds {} values, {} rows of dim {} need {}",
                out.len(),
                rows.len(),
                dim,
                rows.len() * dim
            );
        }
        for (dst, &row) in out.chunks_exact_mut(dim).zip(rows) {
            dst.copy_from_slice(self.row(row)?);
        }
        Ok(())
    }

    fn row_bytes(&self) -> u64 {
        (self.feat_dim() * std::mem::size_of::<f32>()) as u64
    }
}

/// Full feature table in host memory, one row per node.
#[derive(Debug, Clone)]
pub struct HostFeatures {
    data: Vec<f32>,
    dim: usize,
}

impl HostFeatures {
    pub fn new(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(CacheError::config("feature dimension must be > 0"));
        }
        if data.len() % dim != 0 {
            return Err(CacheError::config(format!(
                "{} values do not split into rows of {}",
                data.len(),
                dim
            )));
        }
        Ok(Self { data, dim })
    }

    /// Row `v` holds `v * dim .. (v + 1) * dim`, so every value names its
    /// node and column.
    pub fn synthetic(num_nodes: usize, dim: usize) -> Result<Self> {
        let data = (0..num_nodes * dim).map(|x| x as f32).collect();
        Self::new(data, dim)
    }

    pub fn num_nodes(&self) -> usize {
        self.data.len() / self.dim
    }
}

impl FeatureSource for HostFeatures {
    fn feat_dim(&self) -> usize {
        self.dim
    }

    fn num_rows(&self) -> usize {
        self.num_nodes()
    }

    fn row_impl(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }
}

/// One worker's GPU cache: the rows of `nodes`, slot `i` holding
/// `nodes[i]`. Never modified after it is filled.
#[derive(Debug, Clone)]
pub struct DeviceCache {
    worker: WorkerId,
    nodes: Vec<NodeId>,
    data: Vec<f32>,
    dim: usize,
}

impl DeviceCache {
    pub fn fill(worker: WorkerId, host: &HostFeatures, nodes: &[NodeId]) -> Result<Self> {
        let num_nodes = host.num_nodes();
        if let Some(&node) = nodes.iter().find(|&&n| n as usize >= num_nodes) {
            return Err(CacheError::NodeOutOfRange { node, num_nodes });
        }
        let mut data = Vec::with_capacity(nodes.len() * host.dim);
        for &node in nodes {
            data.extend_from_slice(host.row_impl(node as usize));
        }
        Ok(Self {
            worker,
            nodes: nodes.to_vec(),
            data,
            dim: host.dim,
        })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn size_bytes(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>()) as u64
    }
}

impl FeatureSource for DeviceCache {
    fn feat_dim(&self) -> usize {
        self.dim
    }

    fn num_rows(&self) -> usize {
        self.nodes.len()
    }

    fn row_impl(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }
}
