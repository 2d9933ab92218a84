use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// The image origin the portal has always used.
pub const DEFAULT_ORIGIN: &str = "https://ik.imagekit.io/a7kelms9a";

/// The file name of the primary product image.
pub const DEFAULT_IMAGE_FILE: &str = "{sku}_1.webp";

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
    /// The log level.
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
            prefix: "brandimage".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the image origin.
    ///
    /// Product images live at `{origin}/brand-images/{brand}/{sku}_1.webp`.
    pub origin: Url,

    /// File names tried for a product image, in order. `{sku}` is replaced by the SKU.
    ///
    /// The first file the origin serves wins. All candidates of one product are tried
    /// within a single probe.
    pub image_files: Vec<String>,

    /// Maximum number of resolved images kept in memory.
    pub capacity: u64,

    /// Upper bound for a single existence probe.
    ///
    /// A probe exceeding this is treated as a transient failure.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// The timeout for establishing a connection to the origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving the response headers from the origin.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,

    /// Re-probe images that were found after this long. Unset means never.
    #[serde(with = "humantime_serde")]
    pub retry_hits_after: Option<Duration>,

    /// Re-probe images that were confirmed missing after this long. Unset means never.
    #[serde(with = "humantime_serde")]
    pub retry_misses_after: Option<Duration>,

    /// Remember transient probe failures for this long.
    ///
    /// Unset means transient failures are not remembered at all, and the next
    /// lookup probes again.
    #[serde(with = "humantime_serde")]
    pub retry_transient_after: Option<Duration>,

    /// How many probes a prefetch keeps in flight.
    pub prefetch_concurrency: usize,

    /// Brand spellings mapped to their image folder, on top of the builtin ones.
    pub brand_aliases: BTreeMap<String, String>,

    /// Whether to stop probing an origin that keeps failing.
    pub origin_guard_enabled: bool,

    /// The time window in which failures are counted.
    #[serde(with = "humantime_serde")]
    pub origin_guard_time_window: Duration,

    /// The granularity at which failures are counted.
    #[serde(with = "humantime_serde")]
    pub origin_guard_bucket_size: Duration,

    /// The number of failures within the time window that blocks the origin.
    pub origin_guard_threshold: usize,

    /// How long a blocked origin stays blocked.
    #[serde(with = "humantime_serde")]
    pub origin_guard_block_time: Duration,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            origin: Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL"),
            image_files: vec![DEFAULT_IMAGE_FILE.to_owned()],
            capacity: 10_000,
            probe_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(500),
            head_timeout: Duration::from_secs(5),
            retry_hits_after: None,
            retry_misses_after: None,
            retry_transient_after: None,
            prefetch_concurrency: 8,
            brand_aliases: BTreeMap::new(),
            origin_guard_enabled: true,
            origin_guard_time_window: Duration::from_secs(60),
            origin_guard_bucket_size: Duration::from_secs(5),
            origin_guard_threshold: 20,
            origin_guard_block_time: Duration::from_secs(30),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
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
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        if config.origin.cannot_be_a_base() {
            anyhow::bail!("origin `{}` cannot be used as a base URL", config.origin);
        }
        if config.image_files.is_empty() {
            anyhow::bail!("at least one image file name is required");
        }
        if let Some(file) = config.image_files.iter().find(|f| !f.contains("{sku}")) {
            anyhow::bail!("image file name `{file}` does not contain `{{sku}}`");
        }
        Ok(config)
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
            _ => Err(E::unknown_variant(
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
