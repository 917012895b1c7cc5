use std::path::PathBuf;

use thiserror::Error;

/// Errors that can be encountered while resolving configuration or driving the client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The client program could not be found on `PATH`.
    #[error("{} command not found in PATH", .program.display())]
    ClientNotFound { program: PathBuf },
    /// The client program was found but could not be started.
    #[error("could not run {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The client exited unsuccessfully while running in [`OnError::Abort`][crate::OnError::Abort] mode.
    ///
    /// `stderr` holds everything the client wrote to its error stream, so that it can be
    /// forwarded verbatim.
    #[error("client exited with status {code}")]
    CommandFailed { code: i32, stderr: String },
    /// The local settings file exists but could not be parsed.
    #[error("could not read settings file {}: {source}", .path.display())]
    Settings {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("invalid port {value:?}")]
    InvalidPort { value: String },
    #[error("unknown sslmode {value:?}")]
    InvalidSslMode { value: String },
    /// Client output did not have the expected shape for the given metric.
    #[error("could not parse {metric} from output {output:?}")]
    MalformedOutput { metric: &'static str, output: String },
}

impl Error {
    /// The process exit status this error should terminate the program with.
    ///
    /// A failing client propagates its own status; everything else is `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandFailed { code, .. } => *code,
            _ => 1,
        }
    }
}
