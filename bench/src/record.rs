use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

use pgexec::WalMetrics;

/// One execution of a workload file.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub elapsed: Duration,
    pub wal: Option<WalMetrics>,
    pub commit_latency_ms: Option<i64>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunLabel {
    /// 1-based run index
    Run(usize),
    Avg,
}

impl Display for RunLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run(n) => write!(f, "{n}"),
            Self::Avg => f.write_str("avg"),
        }
    }
}

/// A row of the results file.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub file: String,
    pub run: RunLabel,
    pub elapsed_seconds: f64,
    pub wal_sync_time: f64,
    pub wal_sync_count: f64,
    /// `None` on a run row where the backend did not report commit latency.
    pub commit_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Average {
    pub elapsed_seconds: f64,
    pub wal_sync_time: f64,
    pub wal_sync_count: f64,
    /// Mean over the runs that reported a value, `0.0` if none did.
    pub commit_latency_ms: f64,
    pub commit_samples: usize,
}

/// All measurements for one workload file.
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub file: String,
    pub measurements: Vec<Measurement>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0_usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

impl CaseResult {
    pub fn new(file: impl Into<String>, measurements: Vec<Measurement>) -> Self {
        Self {
            file: file.into(),
            measurements,
        }
    }

    /// Missing WAL samples count as zero; missing commit latency samples are left out.
    pub fn average(&self) -> Average {
        let m = &self.measurements;
        let wal = || m.iter().map(|m| m.wal.unwrap_or_default());
        let commit = m.iter().filter_map(|m| m.commit_latency_ms).collect::<Vec<_>>();
        Average {
            elapsed_seconds: mean(m.iter().map(|m| m.elapsed.as_secs_f64())).unwrap_or(0.0),
            wal_sync_time: mean(wal().map(|w| w.sync_time)).unwrap_or(0.0),
            wal_sync_count: mean(wal().map(|w| w.sync_count as f64)).unwrap_or(0.0),
            commit_latency_ms: mean(commit.iter().map(|&c| c as f64)).unwrap_or(0.0),
            commit_samples: commit.len(),
        }
    }

    /// One record per run followed by the `avg` record.
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        let runs = self.measurements.iter().enumerate().map(move |(i, m)| {
            let wal = m.wal.unwrap_or_default();
            Record {
                file: self.file.clone(),
                run: RunLabel::Run(i + 1),
                elapsed_seconds: m.elapsed.as_secs_f64(),
                wal_sync_time: wal.sync_time,
                wal_sync_count: wal.sync_count as f64,
                commit_latency_ms: m.commit_latency_ms.map(|c| c as f64),
            }
        });
        let avg = self.average();
        runs.chain(std::iter::once(Record {
            file: self.file.clone(),
            run: RunLabel::Avg,
            elapsed_seconds: avg.elapsed_seconds,
            wal_sync_time: avg.wal_sync_time,
            wal_sync_count: avg.wal_sync_count,
            commit_latency_ms: Some(avg.commit_latency_ms),
        }))
    }
}
