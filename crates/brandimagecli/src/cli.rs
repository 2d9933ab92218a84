//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use brandimage_service::brand::BrandAliases;
use brandimage_service::config::Config;
use brandimage_service::metrics;
use brandimage_service::{ImageCache, SizeVariant};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::logging;
use crate::output;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per SKU, as handed to the portal.
    Json,
    /// A table with one row per SKU.
    Compact,
}

/// Brand image commands.
#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Resolves the images of one or more SKUs of a brand.
    Resolve {
        /// The brand as spelled in the product data.
        brand: String,

        /// The SKUs to resolve.
        #[arg(required = true)]
        skus: Vec<String>,

        /// The size variant to resolve.
        ///
        /// Possible values: thumbnail, medium, large, preview-blurred
        #[arg(long, default_value = "medium")]
        variant: SizeVariant,

        /// The output format.
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },

    /// Prints the image folder of brand names, without probing anything.
    Canonicalize {
        /// The brands as spelled in the product data.
        #[arg(required = true)]
        brands: Vec<String>,
    },
}

/// Resolves product images on the image origin.
#[derive(Clone, Debug, Parser)]
#[command(name = "brandimage", author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The image origin, overriding the configuration file.
    #[arg(long, global = true, value_name = "URL")]
    origin: Option<Url>,

    /// The severity level of logging output, overriding the configuration file.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    /// Loads the configuration file and applies the overrides given on the command line.
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::get(self.config()).context("failed loading config")?;
        if let Some(origin) = &self.origin {
            anyhow::ensure!(
                !origin.cannot_be_a_base(),
                "origin `{origin}` cannot be used as a base URL"
            );
            config.origin = origin.clone();
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        Ok(config)
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // SAFETY: Nothing has spawned a thread yet. The sentry transport and the runtime
    // are both started below.
    unsafe { logging::init_logging(&config) };

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    match cli.command {
        Command::Resolve {
            brand,
            skus,
            variant,
            format,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("brandimage-probe")
                .enable_all()
                .build()
                .context("failed to create the runtime")?;
            let cache = ImageCache::from_config(&config)?;
            tracing::debug!(?cache, %variant, "Resolving {} images", skus.len());

            let products = skus.iter().map(|sku| (brand.as_str(), sku.as_str()));
            let resolutions = runtime.block_on(cache.prefetch(products, variant));

            match format {
                OutputFormat::Json => {
                    let json = output::resolutions_json(&skus, &resolutions)
                        .context("failed to serialize resolutions")?;
                    println!("{json}");
                }
                OutputFormat::Compact => output::resolutions_table(&skus, &resolutions).printstd(),
            }
        }
        Command::Canonicalize { brands } => {
            let aliases = BrandAliases::with_extra(&config.brand_aliases);
            let brands: Vec<_> = brands
                .into_iter()
                .map(|raw| {
                    let canonical = aliases.canonicalize(&raw);
                    (raw, canonical)
                })
                .collect();
            output::brands_table(&brands).printstd();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolve() {
        let cli = Cli::try_parse_from([
            "brandimage",
            "resolve",
            "Räder",
            "R1",
            "R2",
            "--variant",
            "thumbnail",
            "--format",
            "compact",
            "--origin",
            "http://localhost:8080/images",
        ])
        .unwrap();

        let config = cli.load_config().unwrap();
        assert_eq!(config.origin.as_str(), "http://localhost:8080/images");

        let Command::Resolve {
            brand,
            skus,
            variant,
            format,
        } = cli.command
        else {
            panic!("expected the resolve command");
        };
        assert_eq!(brand, "Räder");
        assert_eq!(skus, ["R1", "R2"]);
        assert_eq!(variant, SizeVariant::Thumbnail);
        assert_eq!(format, OutputFormat::Compact);
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["brandimage", "resolve", "gefu", "G1"]).unwrap();
        let Command::Resolve {
            variant, format, ..
        } = &cli.command
        else {
            panic!("expected the resolve command");
        };
        assert_eq!(*variant, SizeVariant::Medium);
        assert_eq!(*format, OutputFormat::Json);
        assert_eq!(cli.log_level, None);
    }

    #[test]
    fn test_log_level_override() {
        let cli = Cli::try_parse_from([
            "brandimage",
            "--log-level",
            "debug",
            "canonicalize",
            "My Flame",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn test_missing_arguments() {
        assert!(Cli::try_parse_from(["brandimage", "resolve", "gefu"]).is_err());
        assert!(Cli::try_parse_from(["brandimage", "canonicalize"]).is_err());
        assert!(
            Cli::try_parse_from(["brandimage", "resolve", "gefu", "G1", "--variant", "huge"])
                .is_err()
        );
    }

    #[test]
    fn test_origin_must_be_base() {
        let cli = Cli::try_parse_from([
            "brandimage",
            "canonicalize",
            "gefu",
            "--origin",
            "mailto:images@example.com",
        ])
        .unwrap();
        assert!(cli.load_config().is_err());
    }
}
