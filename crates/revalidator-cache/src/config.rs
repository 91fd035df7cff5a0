use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::fetch::RetryPolicy;
use crate::key::QueryKey;

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
    /// The log level for the cache.
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
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "revalidator".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Freshness, lifetime and retry settings of a cache entry.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EntryConfig {
    /// How long a fetched value counts as fresh.
    ///
    /// `None` means values never go stale on their own, only through invalidation.
    #[serde(with = "humantime_serde")]
    pub stale_time: Option<Duration>,
    /// How long an entry without observers is kept before it is collected.
    ///
    /// `None` keeps unobserved entries forever, zero collects them right away.
    #[serde(with = "humantime_serde")]
    pub gc_time: Option<Duration>,
    /// Whether writes are compared against the current value to suppress redundant updates.
    pub structural_sharing: bool,
    /// How many times a failed fetch is attempted again.
    pub retry: u32,
    /// The delay before the first retry, doubled for every further attempt.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// The upper bound for the delay between retries.
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            stale_time: Some(Duration::ZERO),
            gc_time: Some(Duration::from_secs(5 * 60)),
            structural_sharing: true,
            retry: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl EntryConfig {
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retry,
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
        }
    }
}

/// Settings for every entry under a key prefix.
///
/// Fields not given in the configuration file take their built-in default, not the value of
/// [`CacheConfig::defaults`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PrefixConfig {
    pub prefix: QueryKey,
    #[serde(flatten)]
    pub config: EntryConfig,
}

/// Configuration of a [`CacheStore`](crate::CacheStore).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Settings for keys not covered by any prefix.
    pub defaults: EntryConfig,
    /// Per-prefix overrides. The longest matching prefix wins.
    pub prefixes: Vec<PrefixConfig>,
}

impl CacheConfig {
    /// Resolves the settings for a single key.
    pub fn resolve(&self, key: &QueryKey) -> EntryConfig {
        self.prefixes
            .iter()
            .filter(|rule| key.matches(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.config)
            .unwrap_or(self.defaults)
    }

    /// Adds or replaces the settings for `prefix`.
    pub fn set_prefix(&mut self, prefix: QueryKey, config: EntryConfig) {
        match self.prefixes.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.config = config,
            None => self.prefixes.push(PrefixConfig { prefix, config }),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,
    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
    /// Freshness and lifetime settings of cached entries.
    pub cache: CacheConfig,
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

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
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
