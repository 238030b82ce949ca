use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::level_filters::LevelFilter;

use crate::caching::QueryConfig;
use crate::polling::PollerOptions;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for sporecache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "sporecache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Defaults for every resource cache request.
///
/// Individual consumers may override any of these through their [`QueryConfig`].
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which an entry is served stale and revalidated in the background.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,

    /// Age after which an entry is removed by the garbage collection sweep.
    #[serde(with = "humantime_serde")]
    pub cache_time: Duration,

    /// How often the garbage collection sweep runs.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,

    /// Revalidate stale subscriptions when the application regains focus.
    pub revalidate_on_focus: bool,

    /// Revalidate stale subscriptions when the network comes back.
    pub revalidate_on_reconnect: bool,

    /// Number of retries after a failed fetch.
    pub retry_count: u32,

    /// Base delay between retries, multiplied by the retry number.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(30),
            cache_time: Duration::from_secs(5 * 60),
            gc_interval: Duration::from_secs(60),
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl CacheConfig {
    /// The per-request configuration derived from these defaults.
    pub fn query(&self) -> QueryConfig {
        QueryConfig {
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            revalidate_on_focus: self.revalidate_on_focus,
            revalidate_on_reconnect: self.revalidate_on_reconnect,
            retry_count: self.retry_count,
            retry_delay: self.retry_delay,
        }
    }
}

/// Settings for the HTTP client used by the fetch helpers.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Timeout for a whole request, including reading the body.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            user_agent: concat!("sporecache/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration of the resource cache.
    pub cache: CacheConfig,

    /// Configuration of the completion poller.
    pub poller: PollerOptions,

    /// Configuration of the HTTP fetchers.
    pub http: HttpConfig,

    /// Internal logging configuration.
    pub logging: Logging,

    /// An optional DSN to report errors to Sentry.
    pub sentry_dsn: Option<Dsn>,

    /// Configuration of metrics reporting.
    pub metrics: Metrics,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
