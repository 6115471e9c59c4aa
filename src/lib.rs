//! Collaborative multi-GPU feature cache.
//!
//! A [`topology::Topology`] and a prescan [`presc::FrequencyTable`] feed a
//! placement [`policy::Strategy`], whose decisions become a
//! [`table::CacheTable`]. The [`gather::Engine`] serves every training step
//! from that table, reading local, peer and host rows concurrently.

pub mod base;
pub mod error;
pub mod gather;
pub mod policy;
pub mod presc;
pub mod sim;
pub mod table;
pub mod topology;

pub use error::{CacheError, NodeId, Result};
pub use topology::WorkerId;
