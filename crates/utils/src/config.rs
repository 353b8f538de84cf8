use std::{collections::HashMap, ffi::OsString, fmt::Display, path::Path, str::FromStr};

use tracing::warn;

use crate::AllowList;

pub const PROXY_HOST: &str = "PROXY_HOST";
pub const PROXY_PORT: &str = "PROXY_PORT";
pub const PROXY_HOSTNAME: &str = "PROXY_HOSTNAME";
pub const PROXY_USER: &str = "PROXY_USER";
pub const PROXY_PASSWORD: &str = "PROXY_PASSWORD";
pub const PROXY_ALLOWED_SENDER: &str = "PROXY_ALLOWED_SENDER";
pub const PROXY_MAX_FORWARDS: &str = "PROXY_MAX_FORWARDS";
pub const PROXY_TLS_CERT: &str = "PROXY_TLS_CERT";
pub const PROXY_TLS_KEY: &str = "PROXY_TLS_KEY";
pub const UPSTREAM_HOST: &str = "UPSTREAM_HOST";
pub const UPSTREAM_PORT: &str = "UPSTREAM_PORT";
pub const UPSTREAM_SSL: &str = "UPSTREAM_SSL";
pub const UPSTREAM_USER: &str = "SMTP_USER";
pub const UPSTREAM_PASSWORD: &str = "SMTP_PASSWORD";
pub const UPSTREAM_DEBUG: &str = "UPSTREAM_DEBUG";
pub const UPSTREAM_FROM: &str = "UPSTREAM_FROM";
pub const LOG_LEVEL: &str = "LOG_LEVEL";

/// Top-level configuration of the proxy, built once at startup and shared
/// read-only by every session.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub proxy: ListenerConfig,
    pub upstream: UpstreamConfig,
    pub allowed_senders: AllowList,
    pub log_level: String,
}

/// Client-facing listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub hostname: String,
    pub credentials: Option<LoginCredentials>,
    pub tls: Option<ListenerTlsConfig>,
    pub max_forwards: usize,
}

/// Certificate and key used to offer `STARTTLS` to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerTlsConfig {
    pub cert: String,
    pub key: String,
}

/// Upstream relay configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub tls: UpstreamTls,
    pub credentials: Option<LoginCredentials>,
    pub debug: bool,
    /// Identity placed in the `From` header and the envelope sender of
    /// every forwarded message.
    pub from: String,
}

/// How the connection to the upstream relay is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTls {
    /// TLS from the first byte (`ssl`).
    Implicit,
    /// Plaintext connect followed by a mandatory `STARTTLS` (`starttls`).
    StartTls,
}

impl UpstreamTls {
    /// Anything other than `starttls` selects implicit TLS.
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "starttls" => UpstreamTls::StartTls,
            "ssl" => UpstreamTls::Implicit,
            other => {
                warn!(value = %other, "Unknown {UPSTREAM_SSL} value, using implicit TLS");
                UpstreamTls::Implicit
            }
        }
    }
}

/// Username and password pair used for SMTP authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required key is not set.
    Missing(&'static str),
    /// A key is set to a value that cannot be used.
    Invalid { key: &'static str, value: String },
    /// The `.env` file could not be read or parsed.
    Env(dotenvy::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "{key} environment variable not set"),
            ConfigError::Invalid { key, value } => write!(f, "Invalid value for {key}: {value:?}"),
            ConfigError::Env(e) => write!(f, "Config env file error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<dotenvy::Error> for ConfigError {
    fn from(error: dotenvy::Error) -> Self {
        ConfigError::Env(error)
    }
}

impl ProxyConfig {
    /// Loads the configuration from the process environment, after merging
    /// a `.env` file from the working directory if there is one (existing
    /// variables win).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(unicode_vars(std::env::vars_os()))
    }

    /// Loads the configuration from a dotenv-formatted file only, leaving
    /// the process environment untouched.
    pub fn from_dotenv_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let vars = dotenvy::from_path_iter(path)?.collect::<Result<Vec<_>, _>>()?;
        Self::from_vars(vars)
    }

    /// Builds the configuration from explicit key/value pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<HashMap<String, String>>();
        let get = |key: &str| vars.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let upstream_from = get(UPSTREAM_FROM).ok_or(ConfigError::Missing(UPSTREAM_FROM))?;
        let upstream_host = get(UPSTREAM_HOST).ok_or(ConfigError::Missing(UPSTREAM_HOST))?;

        let proxy = ListenerConfig {
            host: get(PROXY_HOST).unwrap_or(default_proxy_host()).to_string(),
            port: parse_or(get(PROXY_PORT), PROXY_PORT, default_proxy_port())?,
            hostname: get(PROXY_HOSTNAME)
                .unwrap_or(default_hostname())
                .to_string(),
            credentials: credentials(get(PROXY_USER), get(PROXY_PASSWORD)),
            tls: match (get(PROXY_TLS_CERT), get(PROXY_TLS_KEY)) {
                (Some(cert), Some(key)) => Some(ListenerTlsConfig {
                    cert: cert.to_string(),
                    key: key.to_string(),
                }),
                (None, None) => None,
                (Some(_), None) => return Err(ConfigError::Missing(PROXY_TLS_KEY)),
                (None, Some(_)) => return Err(ConfigError::Missing(PROXY_TLS_CERT)),
            },
            max_forwards: parse_or(
                get(PROXY_MAX_FORWARDS),
                PROXY_MAX_FORWARDS,
                default_max_forwards(),
            )?,
        };
        if proxy.max_forwards == 0 {
            return Err(ConfigError::Invalid {
                key: PROXY_MAX_FORWARDS,
                value: "0".to_string(),
            });
        }

        let upstream = UpstreamConfig {
            host: upstream_host.to_string(),
            port: parse_or(get(UPSTREAM_PORT), UPSTREAM_PORT, default_upstream_port())?,
            tls: get(UPSTREAM_SSL)
                .map(UpstreamTls::from_setting)
                .unwrap_or(UpstreamTls::Implicit),
            credentials: credentials(get(UPSTREAM_USER), get(UPSTREAM_PASSWORD)),
            debug: get(UPSTREAM_DEBUG).is_some_and(parse_flag),
            from: upstream_from.to_string(),
        };

        Ok(Self {
            proxy,
            upstream,
            allowed_senders: AllowList::from_csv(get(PROXY_ALLOWED_SENDER).unwrap_or_default()),
            log_level: get(LOG_LEVEL).unwrap_or(default_log_level()).to_string(),
        })
    }

    /// Address the listener binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }

    /// Converts `LOG_LEVEL` into `tracing` filter directives.
    ///
    /// Level names such as `WARNING` or `CRITICAL` are mapped onto their `tracing` equivalent,
    /// anything else is passed through lower-cased so that full directives
    /// such as `subrelay_utils=debug` keep working. The upstream debug flag
    /// adds verbose output for the SMTP client.
    pub fn log_directives(&self) -> String {
        let level = self.log_level.trim().to_ascii_lowercase();
        let mut directives = match level.as_str() {
            "warning" => "warn".to_string(),
            "critical" | "fatal" => "error".to_string(),
            "notset" => "trace".to_string(),
            _ => level,
        };
        if self.upstream.debug {
            directives.push_str(",lettre=trace");
        }
        directives
    }
}

/// Keeps the entries that are valid Unicode, skipping the others.
fn unicode_vars<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Ok(key), Err(_)) => {
                warn!(key = %key, "Skipping environment variable with non-Unicode value");
                None
            }
            (Err(key), _) => {
                warn!(key = %key.to_string_lossy(), "Skipping non-Unicode environment variable");
                None
            }
        })
        .collect()
}

fn credentials(username: Option<&str>, password: Option<&str>) -> Option<LoginCredentials> {
    match (username, password) {
        (Some(username), Some(password)) => Some(LoginCredentials::new(username, password)),
        _ => None,
    }
}

fn parse_or<T: FromStr>(value: Option<&str>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_proxy_host() -> &'static str {
    "127.0.0.1"
}

fn default_proxy_port() -> u16 {
    8025
}

fn default_hostname() -> &'static str {
    "localhost"
}

fn default_max_forwards() -> usize {
    16
}

fn default_upstream_port() -> u16 {
    465
}

fn default_log_level() -> &'static str {
    "WARNING"
}
