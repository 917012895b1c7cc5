use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use crate::{config::ConnectionConfig, Error};

pub const DEFAULT_PROGRAM: &str = "psql";

/// What to do when the client exits unsuccessfully.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OnError {
    /// Turn the failure into [`Error::CommandFailed`].
    Abort,
    /// Report the failure through the returned `success` flag.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct QueryOutput {
    /// Standard output with surrounding whitespace removed.
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct FileRun {
    /// Wall-clock time spent in the client process.
    pub elapsed: Duration,
    pub success: bool,
}

/// A command-line client bound to a single connection.
///
/// Every call spawns exactly one process and waits for it.
#[derive(Debug, Clone)]
pub struct Client {
    program: PathBuf,
    leading_args: Vec<OsString>,
    url: String,
}

impl Client {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self::with_program(DEFAULT_PROGRAM, config)
    }

    pub fn with_program(program: impl Into<PathBuf>, config: &ConnectionConfig) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            url: config.connection_url(),
        }
    }

    /// Arguments placed before the connection arguments on every call, for wrappers such as
    /// `docker exec <container> psql` or an interpreter running a script.
    pub fn with_leading_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Resolves the program the same way the OS would, searching `PATH` for bare names.
    pub fn locate(&self) -> Result<PathBuf, Error> {
        let not_found = || Error::ClientNotFound {
            program: self.program.clone(),
        };
        if self.program.components().count() > 1 {
            return if self.program.is_file() {
                Ok(self.program.clone())
            } else {
                Err(not_found())
            };
        }
        let path = std::env::var_os("PATH").ok_or_else(not_found)?;
        std::env::split_paths(&path)
            .flat_map(|dir| {
                let exact = dir.join(&self.program);
                let mut suffixed = exact.clone().into_os_string();
                suffixed.push(std::env::consts::EXE_SUFFIX);
                [exact, PathBuf::from(suffixed)]
            })
            .find(|candidate| candidate.is_file())
            .ok_or_else(not_found)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg("--set=ON_ERROR_STOP=1")
            .arg(format!("--dbname={}", self.url))
            .stdin(Stdio::null());
        cmd
    }

    fn spawn_err(&self) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| Error::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    /// Runs a single statement in tuples-only, unaligned mode (`-tA -q -c`).
    pub fn query(&self, sql: &str, on_error: OnError) -> Result<QueryOutput, Error> {
        log::trace!("query: {sql}");
        let output = self
            .command()
            .args(["-tA", "-q", "-c", sql])
            .output()
            .map_err(self.spawn_err())?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let success = check_status(output.status, &stderr, on_error)?;
        Ok(QueryOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            stderr,
            success,
        })
    }

    /// Executes a SQL file (`--file=`), discarding its output and timing the process.
    pub fn run_file(&self, path: &Path, on_error: OnError) -> Result<FileRun, Error> {
        log::trace!("file: {}", path.display());
        let mut file_arg = OsString::from("--file=");
        file_arg.push(path);

        let mut cmd = self.command();
        cmd.arg(file_arg).stdout(Stdio::null()).stderr(Stdio::piped());

        let start = Instant::now();
        let output = cmd.output();
        let elapsed = start.elapsed();

        let output = output.map_err(self.spawn_err())?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let success = check_status(output.status, &stderr, on_error)?;
        Ok(FileRun { elapsed, success })
    }
}

fn check_status(status: ExitStatus, stderr: &str, on_error: OnError) -> Result<bool, Error> {
    if status.success() {
        return Ok(true);
    }
    match on_error {
        OnError::Ignore => Ok(false),
        // Killed by a signal has no code of its own
        OnError::Abort => Err(Error::CommandFailed {
            code: status.code().unwrap_or(1),
            stderr: stderr.to_owned(),
        }),
    }
}
