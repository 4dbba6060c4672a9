use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "DROP_STORE_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub metadata_dir: PathBuf,
    /// When set, metadata lives in SQLite instead of per-record JSON files.
    pub database_url: Option<String>,
    pub ttl_hours: i64,
    pub max_upload_bytes: u64,
    pub preview_limit: usize,
    /// Zero means "sweep at the start of every request".
    pub sweep_interval_secs: u64,
    /// Prefix for `downloadUrl`; empty yields a relative URL.
    pub public_url: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Ephemeral file drop API")]
pub struct Args {
    /// Host to bind to (overrides DROP_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DROP_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides DROP_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Directory where metadata records are stored (overrides DROP_STORE_METADATA_DIR)
    #[arg(long)]
    pub metadata_dir: Option<PathBuf>,

    /// SQLite URL for metadata (overrides DROP_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Apply the SQLite schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_string("HOST").unwrap_or_else(|| "0.0.0.0".into())),
            port: match args.port {
                Some(port) => port,
                None => env_parse("PORT", 3000)?,
            },
            storage_dir: args.storage_dir.unwrap_or_else(|| {
                env_string("STORAGE_DIR")
                    .unwrap_or_else(|| "./data/objects".into())
                    .into()
            }),
            metadata_dir: args.metadata_dir.unwrap_or_else(|| {
                env_string("METADATA_DIR")
                    .unwrap_or_else(|| "./data/meta".into())
                    .into()
            }),
            database_url: args.database_url.or_else(|| env_string("DATABASE_URL")),
            ttl_hours: env_parse("TTL_HOURS", 48)?,
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", 1024 * 1024 * 1024)?,
            preview_limit: env_parse("PREVIEW_LIMIT", 200)?,
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", 0)?,
            public_url: env_string("PUBLIC_URL").unwrap_or_default(),
        };

        cfg.validate()?;
        Ok((cfg, args.migrate))
    }

    /// Reject values that would break request handling later.
    pub fn validate(&self) -> Result<()> {
        checked_ttl(self.ttl_hours)?;
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Lifetime of an upload. `ttl_hours` is range-checked by `validate`.
    pub fn ttl(&self) -> chrono::Duration {
        checked_ttl(self.ttl_hours).unwrap_or(TimeDelta::hours(48))
    }

    /// Interval for the background sweeper, if one is configured.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// TTL that is positive and can be added to the current time.
fn checked_ttl(hours: i64) -> Result<TimeDelta> {
    if hours <= 0 {
        anyhow::bail!("{ENV_PREFIX}TTL_HOURS must be positive");
    }
    let ttl = TimeDelta::try_hours(hours)
        .with_context(|| format!("{ENV_PREFIX}TTL_HOURS value {} is out of range", hours))?;
    Utc::now()
        .checked_add_signed(ttl)
        .with_context(|| format!("{ENV_PREFIX}TTL_HOURS value {} is out of range", hours))?;
    Ok(ttl)
}

fn env_string(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|value| !value.is_empty())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{ENV_PREFIX}{name}");
    match env::var(&key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
impl AppConfig {
    /// Configuration rooted in a scratch directory, with defaults elsewhere.
    pub fn for_root(root: &std::path::Path) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            storage_dir: root.join("objects"),
            metadata_dir: root.join("meta"),
            database_url: None,
            ttl_hours: 48,
            max_upload_bytes: 1024 * 1024 * 1024,
            preview_limit: 200,
            sweep_interval_secs: 0,
            public_url: String::new(),
        }
    }
}
