//! Best-effort statistics queries.
//!
//! Managed backends frequently forbid resetting shared statistics or lack the views these
//! queries read, so every collector here logs a warning and reports the metric as
//! unavailable instead of failing.

use log::warn;

use crate::{Client, Error, OnError};

const RESET_WAL_SQL: &str = "SELECT pg_stat_reset_shared('wal');";
const RESET_STATS_SQL: &str = "SELECT pg_stat_reset();";
const WAL_METRICS_SQL: &str = "SELECT wal_sync_time, wal_sync FROM pg_stat_wal;";

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct WalMetrics {
    /// Milliseconds spent syncing WAL to disk.
    pub sync_time: f64,
    pub sync_count: i64,
}

/// Parses `sync_time|sync_count` as printed by `psql -tA`.
///
/// Fields are split on `|` and trimmed, empty fields are dropped, and exactly two must
/// remain: a float followed by an integer.
pub fn parse_wal_metrics(output: &str) -> Result<WalMetrics, Error> {
    let malformed = || Error::MalformedOutput {
        metric: "wal metrics",
        output: output.to_owned(),
    };
    let fields = output.split('|').map(str::trim).filter(|f| !f.is_empty()).collect::<Vec<_>>();
    let [time, count] = fields[..] else {
        return Err(malformed());
    };
    Ok(WalMetrics {
        sync_time: time.parse().map_err(|_| malformed())?,
        sync_count: count.parse().map_err(|_| malformed())?,
    })
}

/// Parses a commit latency in microseconds and floors it to milliseconds.
///
/// Empty output means the backend has no value for this database, which is `Ok(None)`.
pub fn parse_commit_latency(output: &str) -> Result<Option<i64>, Error> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(None);
    }
    let micros = match output.parse::<i64>() {
        Ok(n) => n,
        Err(_) => match output.parse::<f64>() {
            Ok(f) if f.is_finite() => f.floor() as i64,
            _ => {
                return Err(Error::MalformedOutput {
                    metric: "commit latency",
                    output: output.to_owned(),
                })
            }
        },
    };
    Ok(Some(micros.div_euclid(1000)))
}

/// Quotes `s` as a SQL string literal.
fn literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Runs the statistics queries for one database through a [`Client`].
#[derive(Debug, Clone)]
pub struct Collector<'a> {
    client: &'a Client,
    database: String,
}

impl<'a> Collector<'a> {
    pub fn new(client: &'a Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
        }
    }

    fn try_query(&self, sql: &str) -> Option<String> {
        match self.client.query(sql, OnError::Ignore) {
            Ok(out) if out.success => Some(out.stdout),
            Ok(out) => {
                log::debug!("{sql} failed: {}", out.stderr.trim());
                None
            }
            Err(e) => {
                log::debug!("{sql} failed: {e}");
                None
            }
        }
    }

    /// Clears the shared WAL counters. Returns whether the reset happened.
    pub fn reset_wal_stats(&self) -> bool {
        let ok = self.try_query(RESET_WAL_SQL).is_some();
        if !ok {
            warn!("could not reset WAL statistics; continuing without reset");
        }
        ok
    }

    /// Clears the current database's statistics counters. Returns whether the reset happened.
    pub fn reset_stats(&self) -> bool {
        let ok = self.try_query(RESET_STATS_SQL).is_some();
        if !ok {
            warn!("could not reset database statistics; continuing without reset");
        }
        ok
    }

    pub fn wal_metrics(&self) -> Option<WalMetrics> {
        let Some(output) = self.try_query(WAL_METRICS_SQL) else {
            warn!("WAL metrics unavailable");
            return None;
        };
        parse_wal_metrics(&output)
            .map_err(|e| warn!("WAL metrics unavailable: {e}"))
            .ok()
    }

    /// Average commit latency in milliseconds, where the backend exposes it (Aurora PostgreSQL).
    pub fn commit_latency_ms(&self) -> Option<i64> {
        let sql = format!(
            "SELECT aurora_stat_get_db_commit_latency(oid) FROM pg_database WHERE datname = {};",
            literal(&self.database)
        );
        let Some(output) = self.try_query(&sql) else {
            warn!("commit latency unavailable");
            return None;
        };
        parse_commit_latency(&output)
            .map_err(|e| warn!("commit latency unavailable: {e}"))
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_metrics() {
        assert_eq!(
            parse_wal_metrics("123.45|67").unwrap(),
            WalMetrics {
                sync_time: 123.45,
                sync_count: 67
            }
        );
        assert_eq!(
            parse_wal_metrics(" 0 | 0 \n").unwrap(),
            WalMetrics {
                sync_time: 0.0,
                sync_count: 0
            }
        );
        for bad in ["", "123.45", "abc|67", "123.45|6.7", "1|2|3", "|67"] {
            let e = parse_wal_metrics(bad).unwrap_err();
            assert!(matches!(e, Error::MalformedOutput { .. }), "{bad:?} -> {e:?}");
        }
    }

    #[test]
    fn commit_latency() {
        assert_eq!(parse_commit_latency("2500").unwrap(), Some(2));
        assert_eq!(parse_commit_latency("999").unwrap(), Some(0));
        assert_eq!(parse_commit_latency(" 1000\n").unwrap(), Some(1));
        assert_eq!(parse_commit_latency("2500.9").unwrap(), Some(2));
        assert_eq!(parse_commit_latency("").unwrap(), None);
        assert!(parse_commit_latency("abc").is_err());
        assert!(parse_commit_latency("NaN").is_err());
    }

    #[test]
    fn quoting() {
        assert_eq!(literal("app_db"), "'app_db'");
        assert_eq!(literal("o'brien"), "'o''brien'");
    }

    #[cfg(unix)]
    mod collector {
        use super::*;
        use crate::{
            testing::{FakeClient, Response},
            ConnectionConfig,
        };

        fn config() -> ConnectionConfig {
            ConnectionConfig::from_settings(&Default::default()).unwrap()
        }

        #[test]
        fn available() {
            let fake = FakeClient::new();
            let client = fake.client(&config());
            let c = Collector::new(&client, "app_db");
            assert!(c.reset_wal_stats());
            assert!(c.reset_stats());
            assert_eq!(
                c.wal_metrics(),
                Some(WalMetrics {
                    sync_time: 123.45,
                    sync_count: 67
                })
            );
            assert_eq!(c.commit_latency_ms(), Some(2));

            let calls = fake.calls();
            assert_eq!(calls[0], RESET_WAL_SQL);
            assert_eq!(calls[1], RESET_STATS_SQL);
            assert_eq!(calls[2], WAL_METRICS_SQL);
            assert!(calls[3].ends_with("WHERE datname = 'app_db';"), "{}", calls[3]);
        }

        #[test]
        fn unavailable() {
            let fake = FakeClient::new()
                .reset(Response::fail(1, "ERROR:  permission denied for function pg_stat_reset_shared\n"))
                .wal(Response::fail(1, "ERROR:  relation \"pg_stat_wal\" does not exist\n"))
                .commit_latency(Response::fail(
                    1,
                    "ERROR:  function aurora_stat_get_db_commit_latency(oid) does not exist\n",
                ));
            let client = fake.client(&config());
            let c = Collector::new(&client, "app_db");
            assert!(!c.reset_wal_stats());
            assert!(!c.reset_stats());
            assert_eq!(c.wal_metrics(), None);
            assert_eq!(c.commit_latency_ms(), None);
        }

        #[test]
        fn malformed() {
            let fake = FakeClient::new()
                .wal(Response::ok("123.45"))
                .commit_latency(Response::ok(""));
            let client = fake.client(&config());
            let c = Collector::new(&client, "app_db");
            assert_eq!(c.wal_metrics(), None);
            assert_eq!(c.commit_latency_ms(), None);
        }
    }
}
