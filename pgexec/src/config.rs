//! Connection settings, resolved once from the environment and an optional dotenv file.
//!
//! Nothing here mutates the process environment: [`Settings`] takes a snapshot of it and
//! layers the settings file underneath, and [`ConnectionConfig`] is built from that snapshot.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Write},
    path::Path,
    str::FromStr,
};

use crate::Error;

/// Location of the local settings file, relative to the working directory.
pub const SETTINGS_FILE: &str = ".env";

pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_ENDPOINT: &str = "localhost:15432";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "app_db";

/// A read-only view over the process environment layered on top of a settings file.
///
/// Empty values are treated as absent in both layers.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    env: HashMap<String, String>,
    file: HashMap<String, String>,
}

impl Settings {
    /// Snapshots the process environment and reads `path` if it exists.
    ///
    /// A missing settings file is fine, a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let settings_err = |source| Error::Settings {
            path: path.to_owned(),
            source,
        };
        let file = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter.collect::<Result<HashMap<_, _>, _>>().map_err(settings_err)?,
            Err(e) if e.not_found() => HashMap::new(),
            Err(e) => return Err(settings_err(e)),
        };
        if !file.is_empty() {
            log::debug!("loaded {} settings from {}", file.len(), path.display());
        }
        Ok(Self { env, file })
    }

    pub fn from_layers(env: HashMap<String, String>, file: HashMap<String, String>) -> Self {
        Self { env, file }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        [&self.env, &self.file]
            .into_iter()
            .find_map(|layer| layer.get(key).map(String::as_str).filter(|v| !v.is_empty()))
    }
}

/// libpq's `sslmode` values.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum SslMode {
    #[default]
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Self::Disable,
            "allow" => Self::Allow,
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => return Err(Error::InvalidSslMode { value: s.to_owned() }),
        })
    }
}

impl Display for SslMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// `None` leaves authentication to the client's own credential store (`.pgpass` etc.).
    pub password: Option<String>,
    pub database: String,
    pub ssl_mode: SslMode,
}

impl ConnectionConfig {
    /// Resolves `DB_USER`, `DB_PASSWORD`, `DB_HOST`, `DB_PORT`, `DB_NAME` and `DB_SSLMODE`.
    ///
    /// `DB_HOST` may carry a port (`host:port`, or `[addr]:port` for IPv6). An explicit
    /// `DB_PORT` takes precedence over it.
    pub fn from_settings(settings: &Settings) -> Result<Self, Error> {
        let (host, embedded_port) = split_endpoint(settings.get("DB_HOST").unwrap_or(DEFAULT_ENDPOINT))?;
        let port = match settings.get("DB_PORT") {
            Some(p) => parse_port(p)?,
            None => embedded_port.unwrap_or(DEFAULT_PORT),
        };
        let ssl_mode = settings.get("DB_SSLMODE").map(str::parse).transpose()?.unwrap_or_default();

        Ok(Self {
            host,
            port,
            user: settings.get("DB_USER").unwrap_or(DEFAULT_USER).to_owned(),
            password: settings.get("DB_PASSWORD").map(str::to_owned),
            database: settings.get("DB_NAME").unwrap_or(DEFAULT_DATABASE).to_owned(),
            ssl_mode,
        })
    }

    /// A libpq connection URI for this configuration.
    ///
    /// User, password and database name are percent-encoded.
    pub fn connection_url(&self) -> String {
        let mut url = String::from("postgres://");
        encode_component(&self.user, &mut url);
        if let Some(password) = &self.password {
            url.push(':');
            encode_component(password, &mut url);
        }
        url.push('@');
        if self.host.contains(':') {
            let _ = write!(url, "[{}]", self.host);
        } else {
            url.push_str(&self.host);
        }
        let _ = write!(url, ":{}/", self.port);
        encode_component(&self.database, &mut url);
        let _ = write!(url, "?sslmode={}", self.ssl_mode);
        url
    }
}

fn parse_port(s: &str) -> Result<u16, Error> {
    s.trim().parse().map_err(|_| Error::InvalidPort { value: s.to_owned() })
}

/// Splits `host`, `host:port`, `[v6]` or `[v6]:port`. A bare IPv6 address is all host.
pub fn split_endpoint(endpoint: &str) -> Result<(String, Option<u16>), Error> {
    let endpoint = endpoint.trim();
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(parse_port(p)?),
                None if tail.is_empty() => None,
                None => return Err(Error::InvalidPort { value: tail.to_owned() }),
            };
            return Ok((host.to_owned(), port));
        }
    }
    match endpoint.split_once(':') {
        Some((host, port)) if !port.contains(':') => Ok((host.to_owned(), Some(parse_port(port)?))),
        _ => Ok((endpoint.to_owned(), None)),
    }
}

/// Percent-encodes everything outside RFC 3986's unreserved set.
fn encode_component(s: &str, out: &mut String) {
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
}
