pub mod config;
pub mod perf_log;
pub mod sweep;
pub mod top;
pub mod workload;
