//! Connection configuration resolution.
//!
//! Precedence is explicit [`ConnectArgs`] first, then `GEL_*` / `EDGEDB_*`
//! environment variables, then built-in defaults. At each level only one of
//! `dsn`, `credentials_file` or `host`/`port` may be given.

use crate::config::{
    Address, ClientConfig, ConnectArgs, ConnectTarget, DEFAULT_BRANCH, DEFAULT_HOST,
    DEFAULT_PORT, DEFAULT_USER, ResolvedParams,
};
use crate::error::{GelError, GelResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Turns connect arguments into a connect target.
pub trait ConfigResolver: Send + Sync + 'static {
    fn resolve(&self, args: &ConnectArgs) -> GelResult<ConnectTarget>;
}

/// Resolver that ignores the arguments and returns a fixed target.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    target: ConnectTarget,
}

impl StaticResolver {
    pub fn new(target: ConnectTarget) -> Self {
        Self { target }
    }
}

impl ConfigResolver for StaticResolver {
    fn resolve(&self, _args: &ConnectArgs) -> GelResult<ConnectTarget> {
        Ok(self.target.clone())
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolver reading the process environment.
pub struct EnvResolver {
    lookup: EnvLookup,
}

impl EnvResolver {
    /// Resolve against the process environment.
    pub fn from_env() -> Self {
        Self {
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Resolve against a fixed set of variables.
    pub fn with_vars(vars: HashMap<String, String>) -> Self {
        Self {
            lookup: Box::new(move |key| vars.get(key).cloned()),
        }
    }

    /// Look up `GEL_{key}`, falling back to `EDGEDB_{key}`.
    fn var(&self, key: &str) -> Option<String> {
        let gel = (self.lookup)(&format!("GEL_{}", key)).filter(|v| !v.is_empty());
        let edgedb = (self.lookup)(&format!("EDGEDB_{}", key)).filter(|v| !v.is_empty());
        if gel.is_some() && edgedb.is_some() {
            warn!("Both GEL_{key} and EDGEDB_{key} are set; EDGEDB_{key} will be ignored");
        }
        gel.or(edgedb)
    }

    fn env_layer(&self) -> GelResult<Layer> {
        let port = match self.var("PORT") {
            // set by `docker --link`
            Some(p) if p.starts_with("tcp://") => {
                warn!("EDGEDB_PORT in \"tcp://host:port\" format, so will be ignored");
                None
            }
            Some(p) => Some(parse_port(&p)?),
            None => None,
        };
        let wait_until_available = self
            .var("WAIT_UNTIL_AVAILABLE")
            .map(|v| parse_duration(&v))
            .transpose()?;
        Ok(Layer {
            dsn: self.var("DSN"),
            credentials_file: self.var("CREDENTIALS_FILE").map(PathBuf::from),
            host: self.var("HOST"),
            port,
            user: self.var("USER"),
            password: self.var("PASSWORD"),
            database: self.var("DATABASE"),
            branch: self.var("BRANCH"),
            wait_until_available,
            connect_timeout: None,
        })
    }
}

impl Default for EnvResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl std::fmt::Debug for EnvResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvResolver").finish_non_exhaustive()
    }
}

impl ConfigResolver for EnvResolver {
    fn resolve(&self, args: &ConnectArgs) -> GelResult<ConnectTarget> {
        let mut resolved = Resolved::default();

        let explicit = Layer::from_args(args);
        let has_compound = resolved.apply(
            explicit,
            "Cannot have more than one of the following connection options: \
             \"dsn\", \"credentials_file\" or \"host\"/\"port\"",
        )?;
        if !has_compound {
            resolved.apply(
                self.env_layer()?,
                "Cannot have more than one of the following connection environment \
                 variables: \"GEL_DSN\", \"GEL_CREDENTIALS_FILE\" or \"GEL_HOST\"/\"GEL_PORT\"",
            )?;
        }

        Ok(resolved.finish())
    }
}

/// One level of configuration input.
#[derive(Debug, Default)]
struct Layer {
    dsn: Option<String>,
    credentials_file: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    branch: Option<String>,
    wait_until_available: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl Layer {
    fn from_args(args: &ConnectArgs) -> Self {
        Self {
            dsn: args.dsn.clone(),
            credentials_file: args.credentials_file.clone(),
            host: args.host.clone(),
            port: args.port,
            user: args.user.clone(),
            password: args.password.clone(),
            database: args.database.clone(),
            branch: args.branch.clone(),
            wait_until_available: args.wait_until_available.map(Duration::from_secs),
            connect_timeout: args.connect_timeout.map(Duration::from_secs),
        }
    }

    fn compound_count(&self) -> usize {
        [
            self.dsn.is_some(),
            self.credentials_file.is_some(),
            self.host.is_some() || self.port.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    host: Option<String>,
    port: Option<u16>,
    user: String,
    password: Option<String>,
    database: Option<String>,
    branch: Option<String>,
}

/// Accumulated result; the first level to set a field wins.
#[derive(Debug, Default)]
struct Resolved {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    branch: Option<String>,
    wait_until_available: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl Resolved {
    /// Apply one layer. Returns whether it carried a compound option.
    fn apply(&mut self, layer: Layer, conflict_message: &str) -> GelResult<bool> {
        if layer.database.is_some() && layer.branch.is_some() {
            return Err(GelError::configuration(
                "\"database\" and \"branch\" are mutually exclusive",
            ));
        }
        let compound = layer.compound_count();
        if compound > 1 {
            return Err(GelError::configuration(conflict_message));
        }

        set_once(&mut self.user, layer.user);
        set_once(&mut self.password, layer.password);
        set_once(&mut self.branch, layer.branch.or(layer.database));
        set_once(&mut self.wait_until_available, layer.wait_until_available);
        set_once(&mut self.connect_timeout, layer.connect_timeout);

        if compound == 0 {
            return Ok(false);
        }

        if let Some(dsn) = layer.dsn {
            self.apply_dsn(&dsn)?;
        } else if let Some(path) = layer.credentials_file {
            self.apply_credentials_file(&path)?;
        } else {
            set_once(&mut self.host, layer.host);
            set_once(&mut self.port, layer.port);
        }
        Ok(true)
    }

    fn apply_dsn(&mut self, dsn: &str) -> GelResult<()> {
        let url = Url::parse(dsn)
            .map_err(|e| GelError::configuration(format!("invalid DSN {:?}: {}", dsn, e)))?;
        if !matches!(url.scheme(), "gel" | "edgedb") {
            return Err(GelError::configuration(format!(
                "invalid DSN: scheme is expected to be \"gel\" or \"edgedb\", got {:?}",
                url.scheme()
            )));
        }
        set_once(
            &mut self.host,
            url.host_str().filter(|h| !h.is_empty()).map(String::from),
        );
        set_once(&mut self.port, url.port());
        if !url.username().is_empty() {
            set_once(&mut self.user, Some(url.username().to_string()));
        }
        set_once(&mut self.password, url.password().map(String::from));
        let branch = url.path().trim_start_matches('/');
        if !branch.is_empty() {
            set_once(&mut self.branch, Some(branch.to_string()));
        }
        Ok(())
    }

    fn apply_credentials_file(&mut self, path: &Path) -> GelResult<()> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GelError::configuration(format!(
                "cannot read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        let creds: CredentialsFile = serde_json::from_str(&raw).map_err(|e| {
            GelError::configuration(format!(
                "invalid credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        if creds.database.is_some() && creds.branch.is_some() {
            return Err(GelError::configuration(
                "`database` and `branch` cannot both be set in a credentials file",
            ));
        }
        set_once(&mut self.host, creds.host);
        set_once(&mut self.port, creds.port);
        set_once(&mut self.user, Some(creds.user));
        set_once(&mut self.password, creds.password);
        set_once(&mut self.branch, creds.branch.or(creds.database));
        Ok(())
    }

    fn finish(self) -> ConnectTarget {
        let defaults = ClientConfig::default();
        ConnectTarget {
            addresses: vec![Address::tcp(
                self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                self.port.unwrap_or(DEFAULT_PORT),
            )],
            params: ResolvedParams {
                user: self.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
                password: self.password,
                branch: self.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            },
            config: ClientConfig {
                connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
                wait_until_available: self
                    .wait_until_available
                    .unwrap_or(defaults.wait_until_available),
            },
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn parse_port(value: &str) -> GelResult<u16> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(GelError::configuration(format!(
            "invalid port: {:?}, must be between 1 and 65535",
            value
        ))),
    }
}

/// Parse a duration given as plain seconds (`"30"`, `"1.5"`) or with units
/// (`"1h 30m"`, `"500ms"`, `"10s"`).
pub fn parse_duration(value: &str) -> GelResult<Duration> {
    let invalid = || GelError::configuration(format!("invalid duration {:?}", value));
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
    }

    let mut total = 0f64;
    let mut found = false;
    for token in trimmed.split_whitespace() {
        let split = token
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, unit) = token.split_at(split);
        let number: f64 = number.parse().map_err(|_| invalid())?;
        let scale = match unit {
            "h" | "hours" => 3600.0,
            "m" | "minutes" => 60.0,
            "s" | "seconds" => 1.0,
            "ms" | "milliseconds" => 0.001,
            "us" | "microseconds" => 0.000_001,
            _ => return Err(invalid()),
        };
        total += number * scale;
        found = true;
    }
    if !found {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
