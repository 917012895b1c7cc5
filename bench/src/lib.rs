use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use cli_table::{Cell, Style, Table};
use kdam::BarExt;
use log::{debug, info};
use pgexec::{Client, Collector, OnError, Settings};

use crate::record::{CaseResult, Measurement, Record};

pub mod output;
pub mod record;

pub const RUNS: usize = 5;
pub const SQL_DIR: &str = "sql";
pub const OUTPUT_DIR: &str = "output";
pub const TARGET_FILES: &[&str] = &[
    "update_10000_without_tx.sql",
    "update_10000_with_tx.sql",
    "update_10000_each_tx.sql",
    "bulk_update.sql",
];

#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub sql_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Workload file names inside `sql_dir`, in the order they are run and reported.
    pub files: Vec<String>,
    pub runs: usize,
    pub progress: bool,
}

impl Default for BenchOptions {
    fn default() -> Self {
        Self {
            sql_dir: SQL_DIR.into(),
            output_dir: OUTPUT_DIR.into(),
            files: TARGET_FILES.iter().map(|&f| f.to_owned()).collect(),
            runs: RUNS,
            progress: true,
        }
    }
}

impl BenchOptions {
    /// Defaults, overridden by `BENCH_RUNS`, `BENCH_SQL_DIR` and `BENCH_OUTPUT_DIR`.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut options = Self::default();
        if let Some(runs) = settings.get("BENCH_RUNS") {
            options.runs = runs.trim().parse().with_context(|| format!("invalid BENCH_RUNS {runs:?}"))?;
        }
        if options.runs == 0 {
            bail!("BENCH_RUNS must be at least 1");
        }
        if let Some(dir) = settings.get("BENCH_SQL_DIR") {
            options.sql_dir = dir.into();
        }
        if let Some(dir) = settings.get("BENCH_OUTPUT_DIR") {
            options.output_dir = dir.into();
        }
        Ok(options)
    }
}

/// Runs workload files through the client and samples statistics around each run.
///
/// Only one client process is ever in flight, and nothing else should be touching the
/// database's statistics counters while a benchmark runs.
#[derive(Debug)]
pub struct Harness {
    client: Client,
    database: String,
    options: BenchOptions,
}

impl Harness {
    /// Checks that the SQL directory, the client, and every workload file exist.
    pub fn new(client: Client, database: impl Into<String>, options: BenchOptions) -> anyhow::Result<Self> {
        if !options.sql_dir.is_dir() {
            bail!("sql directory not found at {}", options.sql_dir.display());
        }
        let program = client.locate()?;
        debug!("using client {}", program.display());
        if options.runs == 0 {
            bail!("at least one run per file is required");
        }
        for file in &options.files {
            let path = options.sql_dir.join(file);
            if !path.is_file() {
                bail!("SQL file not found: {}", path.display());
            }
        }
        Ok(Self {
            client,
            database: database.into(),
            options,
        })
    }

    pub fn options(&self) -> &BenchOptions {
        &self.options
    }

    fn collector(&self) -> Collector<'_> {
        Collector::new(&self.client, self.database.as_str())
    }

    /// Executes `sql_file` once per configured run.
    ///
    /// Statistics are reset before the first run and after every run, so each measurement
    /// only sees its own activity. A failing workload is fatal; failing statistics queries are
    /// not.
    pub fn run_case(&self, sql_file: &Path) -> Result<Vec<Measurement>, pgexec::Error> {
        let stats = self.collector();
        stats.reset_wal_stats();
        stats.reset_stats();

        let mut measurements = Vec::with_capacity(self.options.runs);
        for run in 1..=self.options.runs {
            let elapsed = self.client.run_file(sql_file, OnError::Abort)?.elapsed;
            let measurement = Measurement {
                elapsed,
                wal: stats.wal_metrics(),
                commit_latency_ms: stats.commit_latency_ms(),
            };
            debug!("{} run {run}: {:.6}s", sql_file.display(), elapsed.as_secs_f64());
            measurements.push(measurement);

            stats.reset_wal_stats();
            stats.reset_stats();
        }
        Ok(measurements)
    }

    /// Runs every workload file in declaration order.
    pub fn run(&self) -> anyhow::Result<Results> {
        let mut bar = self.options.progress.then(|| kdam::Bar::new(self.options.files.len()));
        let mut cases = Vec::with_capacity(self.options.files.len());
        for file in &self.options.files {
            info!("benchmarking {file} ({} runs)", self.options.runs);
            let measurements = self.run_case(&self.options.sql_dir.join(file))?;
            cases.push(CaseResult::new(file.as_str(), measurements));
            if let Some(bar) = &mut bar {
                bar.update(1)?;
            }
        }
        if let Some(bar) = &mut bar {
            bar.clear()?;
        }
        Ok(Results(cases))
    }
}

#[derive(Debug)]
pub struct Results(Vec<CaseResult>);

impl Results {
    pub fn cases(&self) -> &[CaseResult] {
        &self.0
    }

    /// Every per-run record and the `avg` record of each file, in declaration order.
    pub fn records(&self) -> Vec<Record> {
        self.0.iter().flat_map(|case| case.records()).collect()
    }

    pub fn write_csv(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        output::write_records(dir, &self.records())
    }

    /// Prints the averages of every file as a table.
    pub fn stdout(&self) -> anyhow::Result<()> {
        let table = self
            .0
            .iter()
            .map(|case| {
                let avg = case.average();
                vec![
                    case.file.as_str().cell(),
                    case.measurements.len().cell().justify(cli_table::format::Justify::Right),
                    format!("{:.6}", avg.elapsed_seconds)
                        .cell()
                        .justify(cli_table::format::Justify::Right),
                    format!("{:.3}", avg.wal_sync_time)
                        .cell()
                        .justify(cli_table::format::Justify::Right),
                    format!("{:.1}", avg.wal_sync_count)
                        .cell()
                        .justify(cli_table::format::Justify::Right),
                    if avg.commit_samples > 0 {
                        format!("{:.1}", avg.commit_latency_ms).cell()
                    } else {
                        "N/A".cell().dimmed(true).italic(true)
                    }
                    .justify(cli_table::format::Justify::Right),
                ]
            })
            .collect::<Vec<_>>()
            .table()
            .title(vec![
                "File",
                "Runs",
                "Elapsed (s)",
                "WAL sync\ntime (ms)",
                "WAL syncs",
                "Commit\nlatency (ms)",
            ])
            .bold(true);
        cli_table::print_stdout(table)?;
        Ok(())
    }
}

/// Runs the whole benchmark and writes the results file, returning its path.
///
/// Nothing is written if any workload fails.
pub fn run(harness: &Harness) -> anyhow::Result<(Results, PathBuf)> {
    let results = harness.run()?;
    let path = results.write_csv(&harness.options.output_dir)?;
    Ok((results, path))
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use pgexec::{
        testing::{FakeClient, Response},
        ConnectionConfig,
    };
    use tempfile::TempDir;

    use super::*;

    const FILES: [&str; 2] = ["first.sql", "second.sql"];

    fn harness(fake: &FakeClient, runs: usize) -> (TempDir, Harness) {
        let dir = tempfile::tempdir().unwrap();
        let sql_dir = dir.path().join("sql");
        std::fs::create_dir(&sql_dir).unwrap();
        for f in FILES {
            std::fs::write(sql_dir.join(f), "UPDATE benchmark_accounts SET status = 'active';\n").unwrap();
        }
        let options = BenchOptions {
            sql_dir,
            output_dir: dir.path().join("output"),
            files: FILES.iter().map(|&f| f.to_owned()).collect(),
            runs,
            progress: false,
        };
        let config = ConnectionConfig::from_settings(&Settings::default()).unwrap();
        let harness = Harness::new(fake.client(&config), config.database, options).unwrap();
        (dir, harness)
    }

    fn read_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let header = reader.headers().unwrap().iter().map(str::to_owned).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_owned).collect())
            .collect();
        (header, rows)
    }

    #[test]
    fn run_case_measures_every_run() {
        let fake = FakeClient::new();
        let (_dir, harness) = harness(&fake, 4);
        let measurements = harness.run_case(&harness.options().sql_dir.join("first.sql")).unwrap();
        assert_eq!(measurements.len(), 4);
        for m in &measurements {
            assert!(m.elapsed >= Duration::ZERO);
            assert_eq!(m.wal.map(|w| w.sync_count), Some(67));
            assert_eq!(m.commit_latency_ms, Some(2));
        }

        let calls = fake.calls();
        // Two resets up front, then per run: the file, two samples, two resets
        assert_eq!(calls.len(), 2 + 4 * 5);
        assert_eq!(calls.iter().filter(|c| c.starts_with("--file=")).count(), 4);
        assert!(calls[0].contains("pg_stat_reset_shared"));
        assert!(calls[2].starts_with("--file=") && calls[2].ends_with("first.sql"));
    }

    #[test]
    fn end_to_end() {
        let fake = FakeClient::new();
        let (_dir, harness) = harness(&fake, 3);
        let (results, path) = run(&harness).unwrap();
        assert!(path.starts_with(&harness.options().output_dir));
        assert_eq!(results.cases().len(), 2);

        let (header, rows) = read_rows(&path);
        assert_eq!(header, output::HEADER);
        assert_eq!(rows.len(), 2 * (3 + 1));
        let labels = rows.iter().map(|r| (r[0].as_str(), r[1].as_str())).collect::<Vec<_>>();
        assert_eq!(
            labels,
            [
                ("first.sql", "1"),
                ("first.sql", "2"),
                ("first.sql", "3"),
                ("first.sql", "avg"),
                ("second.sql", "1"),
                ("second.sql", "2"),
                ("second.sql", "3"),
                ("second.sql", "avg"),
            ]
        );

        for block in rows.chunks(4) {
            let runs = &block[..3];
            let avg = &block[3];
            let mean = runs.iter().map(|r| r[2].parse::<f64>().unwrap()).sum::<f64>() / 3.0;
            assert!((avg[2].parse::<f64>().unwrap() - mean).abs() < 2e-6, "{avg:?} vs {mean}");
            for r in runs {
                assert_eq!(r[3..], ["123.450", "67", "2"]);
            }
            assert_eq!(avg[3..], ["123.450", "67.0", "2.0"]);
        }
    }

    #[test]
    fn degrades_without_optional_metrics() {
        let fake = FakeClient::new()
            .reset(Response::fail(1, "ERROR:  must be superuser to reset statistics\n"))
            .wal(Response::ok("123.45"))
            .commit_latency(Response::ok(""));
        let (_dir, harness) = harness(&fake, 3);
        let (results, path) = run(&harness).unwrap();
        for case in results.cases() {
            assert!(case.measurements.iter().all(|m| m.wal.is_none() && m.commit_latency_ms.is_none()));
            assert_eq!(case.average().commit_latency_ms, 0.0);
        }

        let (_, rows) = read_rows(&path);
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[0][3..], ["0.000", "0", ""]);
        assert_eq!(rows[3][3..], ["0.000", "0.0", "0.0"]);
    }

    #[test]
    fn failing_workload_is_fatal() {
        let fake = FakeClient::new().file(Response::fail(3, "psql:first.sql:1: ERROR:  deadlock detected\n"));
        let (_dir, harness) = harness(&fake, 3);
        let e = run(&harness).unwrap_err();
        let e = e.downcast_ref::<pgexec::Error>().unwrap();
        assert_eq!(e.exit_code(), 3);
        assert!(
            matches!(e, pgexec::Error::CommandFailed { stderr, .. } if stderr.contains("deadlock detected")),
            "{e:?}"
        );
        assert!(!harness.options().output_dir.exists());
        // The first failure stops everything
        assert_eq!(fake.calls().iter().filter(|c| c.starts_with("--file=")).count(), 1);
    }

    #[test]
    fn repeated_runs_do_not_overwrite() {
        let fake = FakeClient::new();
        let (_dir, harness) = harness(&fake, 2);
        let (_, first) = run(&harness).unwrap();
        let (_, second) = run(&harness).unwrap();
        assert_ne!(first, second);

        let without_timing = |path: &Path| {
            let (header, rows) = read_rows(path);
            let rows = rows
                .into_iter()
                .map(|mut r| {
                    r.remove(2);
                    r
                })
                .collect::<Vec<_>>();
            (header, rows)
        };
        assert_eq!(without_timing(&first), without_timing(&second));
    }

    #[test]
    fn prerequisites() {
        let fake = FakeClient::new();
        let config = ConnectionConfig::from_settings(&Settings::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let options = || BenchOptions {
            sql_dir: dir.path().join("sql"),
            output_dir: dir.path().join("output"),
            files: vec!["first.sql".into()],
            runs: 1,
            progress: false,
        };

        let e = Harness::new(fake.client(&config), "app_db", options()).unwrap_err();
        assert!(e.to_string().starts_with("sql directory not found"), "{e}");

        std::fs::create_dir(dir.path().join("sql")).unwrap();
        let e = Harness::new(fake.client(&config), "app_db", options()).unwrap_err();
        assert!(e.to_string().starts_with("SQL file not found"), "{e}");

        std::fs::write(dir.path().join("sql/first.sql"), "SELECT 1;").unwrap();
        let missing = Client::with_program("definitely-not-a-psql-binary", &config);
        let e = Harness::new(missing, "app_db", options()).unwrap_err();
        assert!(matches!(e.downcast_ref::<pgexec::Error>(), Some(pgexec::Error::ClientNotFound { .. })), "{e}");

        Harness::new(fake.client(&config), "app_db", options()).unwrap();
    }

    #[test]
    fn options_from_settings() {
        let settings = |pairs: &[(&str, &str)]| {
            let env = pairs.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())).collect();
            Settings::from_layers(env, Default::default())
        };
        let o = BenchOptions::from_settings(&settings(&[])).unwrap();
        assert_eq!(o.runs, RUNS);
        assert_eq!(o.files, TARGET_FILES);
        assert_eq!(o.sql_dir, Path::new(SQL_DIR));

        let o = BenchOptions::from_settings(&settings(&[("BENCH_RUNS", "3"), ("BENCH_OUTPUT_DIR", "/tmp/out")])).unwrap();
        assert_eq!(o.runs, 3);
        assert_eq!(o.output_dir, Path::new("/tmp/out"));

        assert!(BenchOptions::from_settings(&settings(&[("BENCH_RUNS", "0")])).is_err());
        assert!(BenchOptions::from_settings(&settings(&[("BENCH_RUNS", "five")])).is_err());
    }
}
