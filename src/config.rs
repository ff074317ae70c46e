use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use url::Url;

// ── Constants ────────────────────────────────────────────────────────────────

pub const DEFAULT_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5001;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY must be set")]
    MissingApiKey,
    #[error("{var} is not a valid http(s) URL: {value}")]
    InvalidUrl { var: &'static str, value: String },
    #[error("{var} is not a valid {expected}: {value}")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

// ── Config ───────────────────────────────────────────────────────────────────

/// Process configuration, built once at startup and shared read-only.
#[derive(Clone)]
pub struct Config {
    pub api_key: String,
    pub api_url: Url,
    pub host: IpAddr,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub upstream_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url.as_str())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("upstream_timeout", &self.upstream_timeout)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("GEMINI_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        let api_url = match get("GEMINI_API_URL") {
            Some(raw) => parse_http_url("GEMINI_API_URL", &raw)?,
            None => parse_http_url("GEMINI_API_URL", DEFAULT_API_URL)?,
        };

        let host = match get("HOST") {
            Some(raw) => parse_value("HOST", "IP address", raw)?,
            None => DEFAULT_HOST
                .parse()
                .map_err(|_| invalid("HOST", "IP address", DEFAULT_HOST))?,
        };
        let port = match get("PORT") {
            Some(raw) => parse_value("PORT", "port number", raw)?,
            None => DEFAULT_PORT,
        };
        let max_upload_bytes = match get("MAX_UPLOAD_BYTES") {
            Some(raw) => parse_value("MAX_UPLOAD_BYTES", "byte count", raw)?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        Ok(Self {
            api_key,
            api_url,
            host,
            port,
            max_upload_bytes,
            upstream_timeout: UPSTREAM_TIMEOUT,
        })
    }
}

fn parse_http_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let bad = || ConfigError::InvalidUrl {
        var,
        value: raw.to_string(),
    };
    let url = Url::parse(raw).map_err(|_| bad())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(bad()),
    }
}

fn parse_value<T: std::str::FromStr>(
    var: &'static str,
    expected: &'static str,
    raw: String,
) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| invalid(var, expected, &raw))
}

fn invalid(var: &'static str, expected: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        expected,
        value: value.to_string(),
    }
}
