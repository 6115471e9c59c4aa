use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::Serialize;

use crate::sim::top::RunReport;

static PERF_RUN_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Root for run directories: `logdir` when given, else
/// `$COLLCACHE_PERF_LOG_DIR`, else `performance_logs`.
pub fn perf_root(logdir: Option<&Path>) -> PathBuf {
    match logdir {
        Some(dir) => dir.to_path_buf(),
        None => env::var("COLLCACHE_PERF_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("performance_logs")),
    }
}

/// Create `root/run_<ts>_<pid>`.
pub fn create_run_dir(root: &Path) -> io::Result<PathBuf> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let pid = std::process::id();
    let run_dir = root.join(format!("run_{ts}_{pid}"));
    fs::create_dir_all(&run_dir)?;
    Ok(run_dir)
}

/// Process-wide run directory, created on first use.
pub fn perf_run_dir(logdir: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = PERF_RUN_DIR.get() {
        return Some(path.clone());
    }
    match create_run_dir(&perf_root(logdir)) {
        Ok(dir) => Some(PERF_RUN_DIR.get_or_init(|| dir).clone()),
        Err(err) => {
            warn!("cannot create performance log directory: {err}");
            None
        }
    }
}

#[derive(Debug, Serialize)]
struct SweepSummary<'a> {
    runs: &'a [RunReport],
}

/// Writes one run directory: a JSON file per run, `sweep.csv` with one row
/// per run, and `summary.json` over all runs on [`ReportWriter::finish`].
pub struct ReportWriter {
    dir: PathBuf,
    csv: Mutex<BufWriter<File>>,
    reports: Mutex<Vec<RunReport>>,
}

impl ReportWriter {
    pub fn create(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let path = dir.join("sweep.csv");
        let fresh = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if fresh {
            writeln!(writer, "{}", RunReport::CSV_HEADER)?;
        }
        Ok(Self {
            dir,
            csv: Mutex::new(writer),
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self, report: &RunReport) -> io::Result<()> {
        let payload = serde_json::to_string_pretty(report)?;
        fs::write(self.dir.join(format!("{}.json", report.name)), payload)?;
        {
            let mut csv = self.csv.lock().unwrap_or_else(PoisonError::into_inner);
            writeln!(csv, "{}", report.csv_row())?;
            csv.flush()?;
        }
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        Ok(())
    }

    pub fn finish(self) -> io::Result<PathBuf> {
        let reports = self
            .reports
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let path = self.dir.join("summary.json");
        let payload = serde_json::to_string_pretty(&SweepSummary { runs: &reports })?;
        fs::write(&path, payload)?;
        info!("wrote {} run(s) to {}", reports.len(), self.dir.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gather::MetricsSnapshot;
    use crate::policy::PlacementSummary;
    use crate::sim::top::FrequencySource;

    fn report(name: &str) -> RunReport {
        RunReport {
            name: name.to_string(),
            description: "rep cache=10%".to_string(),
            policy: "rep".to_string(),
            cache_percent: 0.1,
            num_workers: 2,
            batch_size: 16,
            concurrent_link: false,
            no_group: false,
            frequency_source: FrequencySource::Prescan,
            prescan_batches: 4,
            placement: PlacementSummary::default(),
            retries: 0,
            elapsed_s: 0.01,
            per_worker: vec![MetricsSnapshot::default(); 2],
            total: MetricsSnapshot::default(),
        }
    }

    fn scratch(tag: &str) -> PathBuf {
        let root = env::temp_dir().join(format!("collcache_{tag}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        root
    }

    #[test]
    fn run_dir_is_timestamped() {
        let root = scratch("run_dir");
        let dir = create_run_dir(&root).unwrap();
        assert!(dir.is_dir());
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("run_"));
        assert!(name.ends_with(&format!("_{}", std::process::id())));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn explicit_logdir_wins() {
        assert_eq!(perf_root(Some(Path::new("/tmp/x"))), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn writer_emits_csv_and_summary() {
        let root = scratch("writer");
        let writer = ReportWriter::create(root.clone()).unwrap();
        writer.record(&report("a")).unwrap();
        writer.record(&report("b")).unwrap();
        let summary = writer.finish().unwrap();

        let csv = fs::read_to_string(root.join("sweep.csv")).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], RunReport::CSV_HEADER);
        assert!(lines[2].starts_with("b,rep,0.1,2,16"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(summary).unwrap()).unwrap();
        assert_eq!(json["runs"].as_array().map(|r| r.len()), Some(2));
        assert_eq!(json["runs"][0]["name"], "a");
        assert!(root.join("a.json").is_file());
        fs::remove_dir_all(&root).unwrap();
    }
}
