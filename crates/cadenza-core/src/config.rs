// src/config.rs
use crate::error::{ServeError, ServeResult};
use crate::resolver::{DEFAULT_MAX_PATH_LEN, DocumentRoot};
use serde::Deserialize;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Prefix of every environment variable read by [`ServerConfig::apply_env`].
pub const ENV_PREFIX: &str = "CADENZA_";

/// Server configuration.
///
/// Layered lowest to highest: built-in defaults, an optional TOML file,
/// `CADENZA_*` environment variables (a `.env` file is honoured), then
/// whatever the caller sets directly (the CLI applies its flags last).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address (default: 127.0.0.1)
    pub host: String,
    /// Listen port (default: 8080)
    pub port: u16,
    /// Directory files are served from (default: ./www)
    pub doc_root: PathBuf,
    /// Size of the pre-allocated connection table (default: 10000)
    pub max_connections: usize,
    /// Worker threads for parse + build (default: one per CPU)
    pub workers: usize,
    /// Bound of the worker queue (default: 10000)
    pub max_queued_requests: usize,
    /// Readiness events fetched per wait (default: 1024)
    pub max_events: usize,
    /// Longest `doc_root + url` accepted, in bytes (default: 200)
    pub max_path_len: usize,
    /// listen(2) backlog (default: 1024)
    pub backlog: i32,
    /// Wait timeout; bounds how long shutdown takes to notice (default: 500)
    pub poll_timeout_ms: i32,
    /// Pin worker threads to CPU cores (default: false)
    pub pin_workers: bool,
    /// Period of the metrics log line; 0 disables it (default: 0)
    pub metrics_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            doc_root: PathBuf::from("./www"),
            max_connections: 10_000,
            workers: num_cpus::get(),
            max_queued_requests: 10_000,
            max_events: 1024,
            max_path_len: DEFAULT_MAX_PATH_LEN,
            backlog: 1024,
            poll_timeout_ms: 500,
            pin_workers: false,
            metrics_interval_secs: 0,
        }
    }
}

impl ServerConfig {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> ServeResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ServeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Missing keys keep their defaults; unknown keys are rejected.
    pub fn from_toml_str(text: &str) -> ServeResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `CADENZA_*` variables, loading `.env` first if present.
    pub fn apply_env(&mut self) -> ServeResult<()> {
        let _ = dotenvy::dotenv();
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`, keyed by full variable name.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ServeResult<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(host) = var("HOST") {
            self.host = host;
        }
        if let Some(root) = var("DOC_ROOT") {
            self.doc_root = PathBuf::from(root);
        }
        if let Some(pin) = var("PIN_WORKERS") {
            self.pin_workers = matches!(pin.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        parse_var(&var, "PORT", &mut self.port)?;
        parse_var(&var, "MAX_CONNECTIONS", &mut self.max_connections)?;
        parse_var(&var, "WORKERS", &mut self.workers)?;
        parse_var(&var, "MAX_QUEUED_REQUESTS", &mut self.max_queued_requests)?;
        parse_var(&var, "MAX_EVENTS", &mut self.max_events)?;
        parse_var(&var, "MAX_PATH_LEN", &mut self.max_path_len)?;
        parse_var(&var, "BACKLOG", &mut self.backlog)?;
        parse_var(&var, "POLL_TIMEOUT_MS", &mut self.poll_timeout_ms)?;
        parse_var(&var, "METRICS_INTERVAL_SECS", &mut self.metrics_interval_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> ServeResult<()> {
        let positive = [
            ("workers", self.workers),
            ("max_connections", self.max_connections),
            ("max_queued_requests", self.max_queued_requests),
            ("max_events", self.max_events),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ServeError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.poll_timeout_ms <= 0 {
            return Err(ServeError::Config(
                "poll_timeout_ms must be positive".to_string(),
            ));
        }

        let root_len = self.doc_root.as_os_str().len();
        if root_len == 0 {
            return Err(ServeError::Config("doc_root is empty".to_string()));
        }
        if self.max_path_len <= root_len {
            return Err(ServeError::Config(format!(
                "max_path_len {} leaves no room after doc_root ({} bytes)",
                self.max_path_len, root_len
            )));
        }
        Ok(())
    }

    /// Listen address. IP literals are used as-is; names are resolved.
    pub fn socket_addr(&self) -> ServeResult<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ServeError::Config(format!("host {} did not resolve", self.host)))
    }

    pub fn document_root(&self) -> DocumentRoot {
        DocumentRoot::new(self.doc_root.clone()).with_max_path_len(self.max_path_len)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) -> ServeResult<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = var(name) {
        *slot = raw.trim().parse().map_err(|e| {
            ServeError::Config(format!("{}{}={:?}: {}", ENV_PREFIX, name, raw, e))
        })?;
    }
    Ok(())
}
