use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{warn, LevelFilter};
use toml::Table;

use collcache::policy::CachePolicy;
use collcache::sim::config::{Config, RunConfig};
use collcache::sim::perf_log::{perf_run_dir, ReportWriter};
use collcache::sim::sweep::{ConfigList, SweepConfig};
use collcache::sim::top::Driver;
use collcache::sim::workload::WorkloadConfig;
use collcache::topology::TopologyConfig;

#[derive(Parser)]
#[command(version, about)]
struct CollCacheArgs {
    #[arg(help="Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help="Override cache policy")]
    cache_policy: Option<CachePolicy>,
    #[arg(long, help="Override share of the feature table cached per GPU (0.0 to 1.0)")]
    cache_percent: Option<f64>,
    #[arg(long, help="Override number of GPU workers")]
    num_workers: Option<usize>,
    #[arg(long, help="Read from all peers at once")]
    concurrent_link: Option<bool>,
    #[arg(long, help="Treat all workers as one clique")]
    no_group: Option<bool>,
    #[arg(long, help="Enable log at level (0:none, 1:info, 2:debug)")]
    log: Option<u64>,
    #[arg(long, help="Run every combination listed in [sweep]")]
    sweep: bool,
    #[arg(long, help="Print run descriptions without running")]
    dry_run: bool,
}

const SECTIONS: [&str; 4] = ["run", "topology", "workload", "sweep"];

/// Sections of `table` that are absent and fall back to defaults.
fn missing_sections(table: &Table) -> Vec<&'static str> {
    SECTIONS
        .into_iter()
        .filter(|name| !table.contains_key(*name))
        .collect()
}

fn init_logger(filter: LevelFilter) {
    let mut builder = env_logger::Builder::from_default_env();
    // RUST_LOG, when set, wins over the config
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(filter);
    }
    builder.init();
}

pub fn main() -> anyhow::Result<()> {
    let argv = CollCacheArgs::parse();
    let config = fs::read_to_string(&argv.config_path).with_context(|| {
        format!("failed to read config file {}", argv.config_path.display())
    })?;
    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut run = RunConfig::from_section(config_table.get("run"))?;

    // override toml configs with argv
    run.log_level = argv.log.unwrap_or(run.log_level);
    run.cache_policy = argv.cache_policy.unwrap_or(run.cache_policy);
    run.cache_percent = argv.cache_percent.unwrap_or(run.cache_percent);
    run.num_workers = argv.num_workers.unwrap_or(run.num_workers);
    run.concurrent_link = argv.concurrent_link.unwrap_or(run.concurrent_link);
    run.no_group = argv.no_group.unwrap_or(run.no_group);
    init_logger(run.level_filter());
    // [run] is read before the logger exists, so report gaps here
    for name in missing_sections(&config_table) {
        warn!(
            "config section [{name}] not found in {}, using defaults",
            argv.config_path.display()
        );
    }

    let topology_config = TopologyConfig::from_section(config_table.get("topology"))?;
    let workload_config = WorkloadConfig::from_section(config_table.get("workload"))?;
    let sweep_config = SweepConfig::from_section(config_table.get("sweep"))?;

    let runs = if argv.sweep {
        if sweep_config.is_empty() {
            warn!("--sweep given but [sweep] lists nothing; running the base config");
        }
        sweep_config.expand(&run)
    } else {
        ConfigList::single(run.clone())
    };

    if argv.dry_run {
        for cfg in &runs {
            println!("{:<60} {}", cfg.log_name(), cfg.describe());
        }
        return Ok(());
    }

    let driver = Driver::new(topology_config, workload_config)?;
    let run_dir = perf_run_dir(run.logdir.as_deref())
        .context("cannot create performance log directory")?;
    let writer = ReportWriter::create(run_dir)?;
    for cfg in &runs {
        let report = driver.run(cfg)?;
        println!("{}", report.table_line());
        writer.record(&report)?;
    }
    let summary = writer.finish()?;
    println!("summary written to {}", summary.display());
    Ok(())
}
