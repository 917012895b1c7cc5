use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use time::{macros::format_description, OffsetDateTime};

use crate::record::{Record, RunLabel};

pub const PREFIX: &str = "raw_sql_benchmark_results";
pub const HEADER: [&str; 6] = [
    "file",
    "run",
    "elapsed_seconds",
    "wal_sync_time",
    "wal_sync_count",
    "commit_latency_ms",
];

/// `YYYYMMDDhhmmss` in local time, falling back to UTC when the local offset is unknown.
pub fn timestamp() -> anyhow::Result<String> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(now.format(format_description!("[year][month][day][hour][minute][second]"))?)
}

/// Creates `<dir>/<prefix>_<stamp>.csv`, or `<prefix>_<stamp>-<n>.csv` if earlier runs already
/// took that name. Never truncates an existing file.
pub fn create_unique(dir: &Path, prefix: &str, stamp: &str) -> anyhow::Result<(PathBuf, fs_err::File)> {
    fs_err::create_dir_all(dir)?;
    for n in 0_u32.. {
        let name = match n {
            0 => format!("{prefix}_{stamp}.csv"),
            n => format!("{prefix}_{stamp}-{n}.csv"),
        };
        let path = dir.join(name);
        match fs_err::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("ran out of suffixes for {prefix}_{stamp}")
}

pub fn format_record(r: &Record) -> [String; 6] {
    let (count, commit) = match r.run {
        RunLabel::Run(_) => (
            format!("{:.0}", r.wal_sync_count),
            r.commit_latency_ms.map(|c| format!("{c:.0}")).unwrap_or_default(),
        ),
        RunLabel::Avg => (
            format!("{:.1}", r.wal_sync_count),
            format!("{:.1}", r.commit_latency_ms.unwrap_or(0.0)),
        ),
    };
    [
        r.file.clone(),
        r.run.to_string(),
        format!("{:.6}", r.elapsed_seconds),
        format!("{:.3}", r.wal_sync_time),
        count,
        commit,
    ]
}

/// Writes the header and all records to a new timestamped file in `dir`.
pub fn write_records(dir: &Path, records: &[Record]) -> anyhow::Result<PathBuf> {
    let (path, file) = create_unique(dir, PREFIX, &timestamp()?)?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(HEADER)?;
    for record in records {
        writer.write_record(format_record(record))?;
    }
    writer.flush().with_context(|| format!("could not write {}", path.display()))?;
    log::debug!("wrote {} records to {}", records.len(), path.display());
    Ok(path)
}
