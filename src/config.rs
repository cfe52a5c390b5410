use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `BOOKDESK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults;
    /// set but unparsable numbers are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let var = |name: &str| lookup(&format!("BOOKDESK_{name}")).filter(|v| !v.is_empty());

        Ok(Self {
            bind: var("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_var("PORT", var("PORT"))?.unwrap_or(5433),
            data_dir: PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "./data".into())),
            user: var("USER").unwrap_or_else(|| "bookdesk".into()),
            password: var("PASSWORD").unwrap_or_else(|| "bookdesk".into()),
            max_connections: parse_var("MAX_CONNECTIONS", var("MAX_CONNECTIONS"))?.unwrap_or(256),
            compact_threshold: parse_var("COMPACT_THRESHOLD", var("COMPACT_THRESHOLD"))?
                .unwrap_or(1000),
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
            metrics_port: parse_var("METRICS_PORT", var("METRICS_PORT"))?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(name: &str, value: Option<String>) -> io::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim().parse().map_err(|e| {
                io::Error::new(ErrorKind::InvalidInput, format!("BOOKDESK_{name}={v:?}: {e}"))
            })
        })
        .transpose()
}
