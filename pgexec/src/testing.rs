//! A scriptable stand-in for `psql`.
//!
//! [`FakeClient`] writes a small `/bin/sh` script that answers each kind of call the
//! harness makes with a canned [`Response`] and appends the last argument of every call to
//! a log, so tests can assert on what was run and in which order.

use std::{os::unix::fs::PermissionsExt, path::PathBuf};

use tempfile::TempDir;

use crate::{config::ConnectionConfig, Client};

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl Response {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    fn render(&self) -> String {
        format!(
            "printf '%s\\n' {}; printf '%s' {} >&2; exit {}",
            quote(&self.stdout),
            quote(&self.stderr),
            self.code
        )
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Debug)]
pub struct FakeClient {
    dir: TempDir,
    file: Response,
    reset: Response,
    wal: Response,
    commit_latency: Response,
    other: Response,
}

impl FakeClient {
    /// Succeeds everywhere, reporting `123.45|67` for WAL metrics and `2500` microseconds of
    /// commit latency.
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("could not create scratch directory"),
            file: Response::default(),
            reset: Response::default(),
            wal: Response::ok("123.45|67"),
            commit_latency: Response::ok("2500"),
            other: Response::default(),
        }
    }

    /// Response to `--file=` executions.
    pub fn file(mut self, r: Response) -> Self {
        self.file = r;
        self
    }

    /// Response to both statistics resets.
    pub fn reset(mut self, r: Response) -> Self {
        self.reset = r;
        self
    }

    pub fn wal(mut self, r: Response) -> Self {
        self.wal = r;
        self
    }

    pub fn commit_latency(mut self, r: Response) -> Self {
        self.commit_latency = r;
        self
    }

    /// Response to any statement not matched by the other cases.
    pub fn other(mut self, r: Response) -> Self {
        self.other = r;
        self
    }

    fn script_path(&self) -> PathBuf {
        self.dir.path().join("psql.sh")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("calls.log")
    }

    fn write_script(&self) -> PathBuf {
        let log = self.log_path();
        let script = format!(
            r#"#!/bin/sh
for arg in "$@"; do last="$arg"; done
printf '%s\n' "$last" >> {log}
case "$last" in
  --file=*) {file} ;;
  *pg_stat_reset*) {reset} ;;
  *pg_stat_wal*) {wal} ;;
  *commit_latency*) {commit} ;;
  *) {other} ;;
esac
"#,
            log = quote(&log.to_string_lossy()),
            file = self.file.render(),
            reset = self.reset.render(),
            wal = self.wal.render(),
            commit = self.commit_latency.render(),
            other = self.other.render(),
        );
        let path = self.script_path();
        std::fs::write(&path, script).expect("could not write fake client");
        path
    }

    /// Writes the script and returns a client that runs it through `/bin/sh`.
    ///
    /// Running via the interpreter keeps the script itself non-executable, which avoids
    /// `ETXTBSY` when tests spawn processes concurrently.
    pub fn client(&self, config: &ConnectionConfig) -> Client {
        Client::with_program("/bin/sh", config).with_leading_args([self.write_script()])
    }

    /// Writes the script as an executable file and returns its path, for handing to a
    /// separate process as its client program.
    ///
    /// The file is closed before this returns, but a process forked concurrently by another
    /// thread can still hold it open; keep such tests in their own test binary.
    pub fn executable(&self) -> PathBuf {
        let path = self.write_script();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("could not make fake client executable");
        path
    }

    /// The last argument of every call so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        match std::fs::read_to_string(self.log_path()) {
            Ok(log) => log.lines().map(str::to_owned).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for FakeClient {
    fn default() -> Self {
        Self::new()
    }
}
