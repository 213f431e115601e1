use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Default block size for the first write of an upload, in bytes.
    pub chunk_size: usize,
    /// Global byte ceiling advertised as `Tus-Max-Size`; unset means unlimited.
    pub max_size: Option<u64>,
    /// Seconds added to `now` for each `Upload-Expires` refresh.
    pub expiration_secs: u64,
    /// Period of the background expiration sweep, in seconds.
    pub sweep_interval_secs: u64,
    /// `Content-Disposition` kind on downloads.
    pub disposition: Disposition,
    /// Optional URL template (`{uid}` substituted); turns GET into a redirect.
    pub redirect_download: Option<String>,
    /// CORS allow-list; empty disables CORS headers entirely.
    pub request_origins: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "tus 1.0.0 resumable upload server")]
pub struct Args {
    /// Host to bind to (overrides TUS_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TUS_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides TUS_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Default chunk size in bytes (overrides TUS_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Maximum upload size in bytes (overrides TUS_STORE_MAX_SIZE)
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Upload-Expires horizon in seconds (overrides TUS_STORE_EXPIRATION_SECS)
    #[arg(long)]
    pub expiration_secs: Option<u64>,

    /// Expiration sweep period in seconds (overrides TUS_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Content-Disposition on downloads (overrides TUS_STORE_DISPOSITION)
    #[arg(long, value_enum)]
    pub disposition: Option<Disposition>,

    /// Redirect template for downloads (overrides TUS_STORE_REDIRECT_DOWNLOAD)
    #[arg(long)]
    pub redirect_download: Option<String>,

    /// Comma-separated CORS allow-list (overrides TUS_STORE_REQUEST_ORIGINS)
    #[arg(long, value_delimiter = ',')]
    pub request_origins: Option<Vec<String>>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("TUS_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("TUS_STORE_PORT")?.unwrap_or(1080);
        let env_db = env::var("TUS_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/tus_store.db".into());
        let env_chunk_size = parse_env("TUS_STORE_CHUNK_SIZE")?.unwrap_or(16 * 1024 * 1024);
        let env_max_size = parse_env("TUS_STORE_MAX_SIZE")?;
        let env_expiration = parse_env("TUS_STORE_EXPIRATION_SECS")?.unwrap_or(86_400);
        let env_sweep = parse_env("TUS_STORE_SWEEP_INTERVAL_SECS")?.unwrap_or(3_600);
        let env_disposition = match env::var("TUS_STORE_DISPOSITION") {
            Ok(value) => Some(
                Disposition::from_str(&value, true)
                    .map_err(|e| anyhow::anyhow!("parsing TUS_STORE_DISPOSITION: {e}"))?,
            ),
            Err(_) => None,
        };
        let env_redirect = env::var("TUS_STORE_REDIRECT_DOWNLOAD").ok();
        let env_origins = env::var("TUS_STORE_REQUEST_ORIGINS").ok().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            chunk_size: args.chunk_size.unwrap_or(env_chunk_size),
            max_size: args.max_size.or(env_max_size),
            expiration_secs: args.expiration_secs.unwrap_or(env_expiration),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_sweep),
            disposition: args
                .disposition
                .or(env_disposition)
                .unwrap_or(Disposition::Attachment),
            redirect_download: args.redirect_download.or(env_redirect),
            request_origins: args.request_origins.or(env_origins).unwrap_or_default(),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`"))
            .map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}
