//! Configuration infrastructure
//!
//! Layered configuration for the resolver:
//! 1. Built-in defaults (the `defaults` module)
//! 2. Optional config file (TOML/JSON, `~/.config/postal-resolver/config.toml` by default)
//! 3. Environment overrides: `POSTAL_RESOLVER__RESOLVER__MAX_WORKERS=4`
//!
//! The maintenance cadence and jitter windows are empirically tuned anti-blocking
//! heuristics, not correctness requirements; they are plain knobs here.

#![allow(clippy::module_name_repetitions)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub resolver: ResolverConfig,
    pub pacing: PacingConfig,
    pub output: OutputConfig,
    pub markers: MarkerConfig,
    pub site: SiteConfig,
    pub logging: LoggingConfig,
}

/// Worker pool, retry and polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Fixed worker pool size (context creation is heavyweight, keep it small)
    pub max_workers: usize,

    /// Attempts per key before it is recorded as SKIPPED
    pub max_retries: u32,

    /// Marker sampling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Deadline for one attempt to reach a terminal marker, in seconds
    pub result_timeout_secs: u64,

    /// Consecutive timeouts that trigger the long cooldown
    pub timeout_streak_limit: u32,

    /// Long cooldown after a timeout streak, in seconds
    pub timeout_cooldown_secs: u64,

    /// Wait between connectivity probes while offline, in seconds
    pub unresponsive_pause_secs: u64,
}

/// Human-like pacing and periodic maintenance pauses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,

    /// Pause the whole run after this many processed keys (0 disables)
    pub maintenance_every: u64,

    pub maintenance_pause_secs: u64,

    /// Recreate every execution context at each maintenance pause
    pub maintenance_invalidate: bool,
}

/// Result persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Merge-and-write the output after this many new records
    pub flush_every: usize,

    /// Attempts when the output file is locked by another process
    pub write_retries: u32,

    /// Base backoff between locked-file retries, in milliseconds
    pub write_backoff_ms: u64,

    /// Downgrade successes without an artifact reference to NO_DATA
    pub require_artifact: bool,

    /// Download the artifact of every OK record and fill ARTIFACT_FILE
    pub save_artifacts: bool,

    /// Where downloaded artifacts go; relative paths sit next to the output file
    pub artifact_dir: PathBuf,

    /// Save the page source when an attempt fails in a way worth inspecting
    pub debug_snapshots: bool,

    /// Where page snapshots go; relative paths sit next to the output file
    pub debug_dir: PathBuf,
}

/// Keyword heuristics for terminal-page classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Lower-case snippets that mean "the service has no data for this key"
    pub no_data_snippets: Vec<String>,

    /// Lower-case snippets of anti-automation / block pages
    pub block_signatures: Vec<String>,

    /// Diagnostic messages are trimmed to start at the first of these
    pub start_keywords: Vec<String>,

    /// Diagnostic messages are cut at the first of these
    pub noise_keywords: Vec<String>,
}

/// Target site description for the HTTP page driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Lookup page holding the input form
    pub target_url: String,

    /// Optional direct lookup URL, `{key}` is replaced with the key
    pub query_template: Option<String>,

    pub input_selector: String,

    /// Element whose presence means success (PDF link, map image, hidden field)
    pub success_selector: String,

    /// Attributes read from the success element, first non-empty wins
    pub success_attributes: Vec<String>,

    /// Explicit error panel
    pub failure_selector: String,

    /// Primary content region watched for changes
    pub content_selector: String,

    /// URL probed before each attempt; empty disables probing.
    /// Connectivity checks bypass the driver's rate limiter, so keep this off the target host.
    pub connectivity_url: String,

    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub max_requests_per_second: u32,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,
    pub file_output: bool,

    /// Log directory; defaults to `logs/` next to the executable
    pub log_dir: Option<PathBuf>,

    /// Module-specific log level filters (e.g., "reqwest": "warn")
    pub module_filters: std::collections::HashMap<String, String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_workers: defaults::MAX_WORKERS,
            max_retries: defaults::MAX_RETRIES,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            result_timeout_secs: defaults::RESULT_TIMEOUT_SECS,
            timeout_streak_limit: defaults::TIMEOUT_STREAK_LIMIT,
            timeout_cooldown_secs: defaults::TIMEOUT_COOLDOWN_SECS,
            unresponsive_pause_secs: defaults::UNRESPONSIVE_PAUSE_SECS,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: defaults::JITTER_MIN_MS,
            jitter_max_ms: defaults::JITTER_MAX_MS,
            maintenance_every: defaults::MAINTENANCE_EVERY,
            maintenance_pause_secs: defaults::MAINTENANCE_PAUSE_SECS,
            maintenance_invalidate: defaults::MAINTENANCE_INVALIDATE,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            flush_every: defaults::FLUSH_EVERY,
            write_retries: defaults::WRITE_RETRIES,
            write_backoff_ms: defaults::WRITE_BACKOFF_MS,
            require_artifact: false,
            save_artifacts: false,
            artifact_dir: PathBuf::from(defaults::ARTIFACT_DIR),
            debug_snapshots: false,
            debug_dir: PathBuf::from(defaults::DEBUG_DIR),
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| -> Vec<String> { items.iter().map(ToString::to_string).collect() };
        Self {
            no_data_snippets: owned(defaults::NO_DATA_SNIPPETS),
            block_signatures: owned(defaults::BLOCK_SIGNATURES),
            start_keywords: owned(defaults::START_KEYWORDS),
            noise_keywords: owned(defaults::NOISE_KEYWORDS),
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            target_url: defaults::TARGET_URL.to_string(),
            query_template: None,
            input_selector: defaults::INPUT_SELECTOR.to_string(),
            success_selector: defaults::SUCCESS_SELECTOR.to_string(),
            success_attributes: vec!["href".into(), "src".into(), "value".into()],
            failure_selector: defaults::FAILURE_SELECTOR.to_string(),
            content_selector: "body".to_string(),
            connectivity_url: defaults::CONNECTIVITY_URL.to_string(),
            user_agent: defaults::USER_AGENT.to_string(),
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: None,
            module_filters: std::collections::HashMap::new(),
        }
    }
}

impl ResolverConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    #[must_use]
    pub const fn timeout_cooldown(&self) -> Duration {
        Duration::from_secs(self.timeout_cooldown_secs)
    }

    #[must_use]
    pub const fn unresponsive_pause(&self) -> Duration {
        Duration::from_secs(self.unresponsive_pause_secs)
    }
}

impl PacingConfig {
    /// Pacing with every wait disabled (tests, dry runs)
    #[must_use]
    pub const fn none() -> Self {
        Self {
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            maintenance_every: 0,
            maintenance_pause_secs: 0,
            maintenance_invalidate: false,
        }
    }

    #[must_use]
    pub const fn maintenance_pause(&self) -> Duration {
        Duration::from_secs(self.maintenance_pause_secs)
    }
}

impl AppConfig {
    /// Default config file location
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("postal-resolver").join("config.toml"))
    }

    /// Load defaults + optional file + environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                if let Some(default_path) = Self::default_path() {
                    builder = builder.add_source(File::from(default_path).required(false));
                }
            }
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix("POSTAL_RESOLVER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.resolver.max_workers == 0 {
            bail!("resolver.max_workers must be at least 1");
        }
        if self.resolver.max_retries == 0 {
            bail!("resolver.max_retries must be at least 1");
        }
        if self.resolver.poll_interval_ms == 0 {
            bail!("resolver.poll_interval_ms must be greater than 0");
        }
        if self.pacing.jitter_min_ms > self.pacing.jitter_max_ms {
            bail!(
                "pacing.jitter_min_ms ({}) exceeds pacing.jitter_max_ms ({})",
                self.pacing.jitter_min_ms,
                self.pacing.jitter_max_ms
            );
        }
        if self.output.flush_every == 0 {
            bail!("output.flush_every must be at least 1");
        }
        Ok(())
    }
}

/// Default configuration values
pub mod defaults {
    /// Default worker pool size
    pub const MAX_WORKERS: usize = 2;

    /// Default attempts per key
    pub const MAX_RETRIES: u32 = 3;

    /// Default marker sampling interval in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 250;

    /// Default per-attempt result deadline in seconds
    pub const RESULT_TIMEOUT_SECS: u64 = 20;

    /// Default consecutive timeouts before the long cooldown
    pub const TIMEOUT_STREAK_LIMIT: u32 = 3;

    /// Default long cooldown in seconds
    pub const TIMEOUT_COOLDOWN_SECS: u64 = 60;

    /// Default connectivity cooldown in seconds
    pub const UNRESPONSIVE_PAUSE_SECS: u64 = 120;

    // Pacing defaults
    pub const JITTER_MIN_MS: u64 = 3000;
    pub const JITTER_MAX_MS: u64 = 4000;
    pub const MAINTENANCE_EVERY: u64 = 100;
    pub const MAINTENANCE_PAUSE_SECS: u64 = 60;
    pub const MAINTENANCE_INVALIDATE: bool = true;

    // Output defaults
    pub const FLUSH_EVERY: usize = 10;
    pub const WRITE_RETRIES: u32 = 20;
    pub const WRITE_BACKOFF_MS: u64 = 250;
    pub const ARTIFACT_DIR: &str = "images";
    pub const DEBUG_DIR: &str = "debug_shots";

    // Site defaults
    pub const TARGET_URL: &str = "https://www.fedexfreight.fedex.com/servicemaps.jsp";
    /// Neutral endpoint that answers 204; checking it never counts against the target
    pub const CONNECTIVITY_URL: &str = "https://www.gstatic.com/generate_204";
    pub const INPUT_SELECTOR: &str =
        "#shipperZipCode, input[name*='zip'], input[id*='zip'], input[type='text']";
    pub const SUCCESS_SELECTOR: &str =
        "a[href$='.pdf'], #popUpMapURLHidden, #mapURLHidden, img#imgMap";
    pub const FAILURE_SELECTOR: &str = ".errortext, [role='alert'], .error, .alert";
    pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    pub const REQUEST_TIMEOUT_SECS: u64 = 40;
    pub const MAX_REQUESTS_PER_SECOND: u32 = 2;

    // Log configuration defaults
    pub const LOG_LEVEL: &str = "info";

    // Marker heuristics
    pub const NO_DATA_SNIPPETS: &[&str] = &[
        "no results",
        "no information",
        "invalid",
        "not found",
        "try again",
        "either the zip code does not exist",
    ];
    pub const BLOCK_SIGNATURES: &[&str] = &[
        "access denied",
        "request blocked",
        "too many requests",
        "temporarily unavailable",
        "captcha",
    ];
    pub const START_KEYWORDS: &[&str] = &[
        "sorry",
        "error",
        "no information",
        "no results",
        "invalid",
        "not found",
    ];
    pub const NOISE_KEYWORDS: &[&str] = &["support", "tracking", "ups sites", "connect with us"];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolver.max_workers, 2);
        assert_eq!(config.resolver.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn connectivity_check_stays_off_the_target_host() {
        let site = SiteConfig::default();
        let host = |raw: &str| url::Url::parse(raw).unwrap().host_str().map(str::to_string);
        assert!(host(&site.connectivity_url).is_some());
        assert_ne!(host(&site.connectivity_url), host(&site.target_url));
    }

    #[test]
    fn artifact_and_snapshot_capture_are_opt_in() {
        let output = OutputConfig::default();
        assert!(!output.save_artifacts);
        assert!(!output.debug_snapshots);
        assert_eq!(output.artifact_dir, PathBuf::from("images"));
        assert_eq!(output.debug_dir, PathBuf::from("debug_shots"));
    }

    #[test]
    fn inverted_jitter_window_is_rejected() {
        let mut config = AppConfig::default();
        config.pacing.jitter_min_ms = 5000;
        config.pacing.jitter_max_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[resolver]\nmax_workers = 6\nmax_retries = 2\n\n[pacing]\nmaintenance_every = 250\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.resolver.max_workers, 6);
        assert_eq!(config.resolver.max_retries, 2);
        assert_eq!(config.pacing.maintenance_every, 250);
        // untouched sections keep their defaults
        assert_eq!(config.resolver.poll_interval_ms, defaults::POLL_INTERVAL_MS);
        assert_eq!(config.output.write_retries, defaults::WRITE_RETRIES);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
