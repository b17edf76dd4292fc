//! TOML Configuration File Support
//!
//! Router configuration lives in `$XDG_CONFIG_HOME/switchboard/switchboard.toml`
//! (typically `~/.config/switchboard/switchboard.toml`).
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! Loaded configurations put any unset ledger and persistent cache database
//! under the data directory (`$XDG_DATA_HOME/switchboard`), so the router
//! and `switchboard-ctl` read and write the same files. A config built in
//! code keeps both in memory unless paths are set.
//!
//! # Example Configuration
//!
//! ```toml
//! strategy = "cost-based"
//! default_timeout_ms = 30000
//!
//! [[providers]]
//! id = "openai"
//! weight = 2.0
//! capabilities = { vision = true, streaming = true }
//!
//! [[providers.models]]
//! id = "gpt-4o-mini"
//! input = 0.00000015
//! output = 0.0000006
//!
//! [providers.breaker]
//! failure_threshold = 5
//! timeout_ms = 30000
//!
//! [budget]
//! mode = "hard"
//! daily_limit = 10.0
//!
//! [cache.persistent]
//! path = "/var/lib/switchboard/cache.db"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::ledger::{BudgetConfig, BudgetMode, PricingTable};
use crate::routing::{ProviderConfig, StrategyKind, DEFAULT_STATS_WINDOW};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {message}")]
    ReadError { path: PathBuf, message: String },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::ParseError(e.to_string())
    }
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration was last overridden from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Env,
    File,
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration Structures
// =============================================================================

/// Ledger database file name under the data directory
pub const LEDGER_FILE: &str = "usage.db";

/// Persistent cache database file name under the data directory
pub const CACHE_FILE: &str = "cache.db";

/// Usage ledger storage
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// SQLite database for usage records; kept in memory when unset
    pub path: Option<PathBuf>,
}

/// Complete router configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Strategy active at startup
    pub strategy: StrategyKind,

    /// Providers in configuration order (the final tie-breaker)
    pub providers: Vec<ProviderConfig>,

    /// Overall request deadline when the request sets none
    pub default_timeout_ms: u64,

    /// Treat an ineligible override as a first choice instead of failing
    pub failover_on_override: bool,

    /// Health probe interval; 0 disables probing
    pub health_check_interval_ms: u64,

    /// Per-probe timeout
    pub health_check_timeout_ms: u64,

    /// Buffered events per subscriber
    pub event_capacity: usize,

    /// Samples kept in each provider's rolling window
    pub stats_window: usize,

    pub cache: CacheConfig,
    pub budget: BudgetConfig,
    pub ledger: LedgerConfig,

    #[serde(skip)]
    source: ConfigSource,

    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            providers: Vec::new(),
            default_timeout_ms: 30_000,
            failover_on_override: false,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            stats_window: DEFAULT_STATS_WINDOW,
            cache: CacheConfig::default(),
            budget: BudgetConfig::default(),
            ledger: LedgerConfig::default(),
            source: ConfigSource::Default,
            config_file_path: None,
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            ..Default::default()
        }
    }

    /// Put any unset ledger or persistent cache database under `dir`
    pub fn resolve_storage_paths(&mut self, dir: &Path) {
        if self.ledger.path.is_none() {
            self.ledger.path = Some(dir.join(LEDGER_FILE));
        }
        if self.cache.persistent.path.is_none() {
            self.cache.persistent.path = Some(dir.join(CACHE_FILE));
        }
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.resolve_storage_paths(dir.as_ref());
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_failover_on_override(mut self, enabled: bool) -> Self {
        self.failover_on_override = enabled;
        self
    }

    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn source(&self) -> ConfigSource {
        self.source
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0).then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Prices for every configured (provider, model)
    #[must_use]
    pub fn pricing_table(&self) -> PricingTable {
        let mut table = PricingTable::new();
        for provider in &self.providers {
            for model in &provider.models {
                table.insert(provider.id.clone(), model.id.clone(), model.pricing);
            }
        }
        table
    }

    /// Check every value the router relies on
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.providers.is_empty() {
            return invalid("at least one provider must be configured".into());
        }
        if self.default_timeout_ms == 0 {
            return invalid("default_timeout_ms must be greater than 0".into());
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be greater than 0".into());
        }
        if self.stats_window == 0 {
            return invalid("stats_window must be greater than 0".into());
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            validate_provider(provider)?;
            if !seen.insert(provider.id.as_str()) {
                return invalid(format!("duplicate provider id '{}'", provider.id));
            }
        }

        validate_budget(&self.budget)?;

        let similarity = &self.cache.similarity;
        if !(similarity.threshold > 0.0 && similarity.threshold <= 1.0) {
            return invalid(format!(
                "cache.similarity.threshold must be in (0, 1], got {}",
                similarity.threshold
            ));
        }
        if self.cache.memory.max_entries == 0 || self.cache.persistent.max_entries == 0 {
            return invalid("cache max_entries must be greater than 0".into());
        }

        Ok(())
    }
}

fn validate_provider(provider: &ProviderConfig) -> Result<(), ConfigError> {
    let id = &provider.id;
    let invalid = |msg: String| Err(ConfigError::ValidationError(format!("provider '{id}': {msg}")));

    if id.trim().is_empty() {
        return Err(ConfigError::ValidationError("provider id must not be empty".into()));
    }
    if provider.models.is_empty() {
        return invalid("at least one model must be configured".into());
    }
    if let Some(default) = &provider.default_model {
        if !provider.has_model(default) {
            return invalid(format!("default_model '{default}' is not in models"));
        }
    }
    for model in &provider.models {
        if !model.pricing.is_valid() {
            return invalid(format!("model '{}' has a negative or non-finite price", model.id));
        }
    }
    if !(provider.weight.is_finite() && provider.weight >= 0.0) {
        return invalid(format!("weight must be a non-negative number, got {}", provider.weight));
    }

    let breaker = &provider.breaker;
    if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
        return invalid("breaker thresholds must be greater than 0".into());
    }
    if breaker.half_open_requests == 0 {
        return invalid("breaker.half_open_requests must be greater than 0".into());
    }
    if provider.limits.max_concurrent_requests == 0 {
        return invalid("limits.max_concurrent_requests must be greater than 0".into());
    }

    let retry = &provider.retry;
    if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0) {
        return invalid(format!(
            "retry.backoff_multiplier must be at least 1.0, got {}",
            retry.backoff_multiplier
        ));
    }
    if retry.initial_delay_ms > retry.max_delay_ms {
        return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms".into());
    }
    Ok(())
}

fn validate_budget(budget: &BudgetConfig) -> Result<(), ConfigError> {
    if !(budget.alert_threshold > 0.0 && budget.alert_threshold <= 1.0) {
        return Err(ConfigError::ValidationError(format!(
            "budget.alert_threshold must be in (0, 1], got {}",
            budget.alert_threshold
        )));
    }
    for (name, limit) in [
        ("daily_limit", budget.daily_limit),
        ("monthly_limit", budget.monthly_limit),
        ("per_caller_daily_limit", budget.per_caller_daily_limit),
    ] {
        if let Some(limit) = limit {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "budget.{name} must be a positive number, got {limit}"
                )));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Loading
// =============================================================================

/// Get the default configuration file path
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("switchboard.toml"))
}

/// Directory for the cache and ledger databases when none is configured
#[must_use]
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("switchboard"))
}

/// Load and validate configuration from the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting configuration is invalid.
pub fn load_config() -> Result<RouterConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, apply environment overrides and
/// validate. A missing file is not an error.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if validation
/// fails.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RouterConfig, ConfigError> {
    load_config_with_data_dir(path, default_data_dir())
}

/// [`load_config_from_path`] with an explicit data directory for unset
/// database paths; `None` leaves them in memory
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_data_dir(
    path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
) -> Result<RouterConfig, ConfigError> {
    let mut config = RouterConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                path: config_path.clone(),
                message: e.to_string(),
            })?;

            config = toml::from_str(&content)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                providers = config.providers.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    if let Some(dir) = data_dir {
        config.resolve_storage_paths(&dir);
    }
    config.validate()?;
    Ok(config)
}

/// Apply `SWITCHBOARD_*` environment overrides
pub fn apply_env_config(config: &mut RouterConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

fn apply_overrides<F>(config: &mut RouterConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("SWITCHBOARD_STRATEGY") {
        match value.parse::<StrategyKind>() {
            Ok(strategy) => {
                config.strategy = strategy;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring SWITCHBOARD_STRATEGY"),
        }
    }
    if let Some(path) = lookup("SWITCHBOARD_CACHE_PATH") {
        config.cache.persistent.path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
    if let Some(path) = lookup("SWITCHBOARD_LEDGER_PATH") {
        config.ledger.path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("SWITCHBOARD_DAILY_BUDGET") {
        if let Ok(limit) = value.parse::<f64>() {
            config.budget.daily_limit = Some(limit);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = lookup("SWITCHBOARD_BUDGET_MODE") {
        match value.parse::<BudgetMode>() {
            Ok(mode) => {
                config.budget.mode = mode;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring SWITCHBOARD_BUDGET_MODE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ModelPricing;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig::new(id, format!("{id}-model"), ModelPricing::flat(0.001))
    }

    fn valid() -> RouterConfig {
        RouterConfig::new(vec![provider("a"), provider("b")])
    }

    fn assert_invalid(config: &RouterConfig, needle: &str) {
        match config.validate() {
            Err(ConfigError::ValidationError(msg)) => {
                assert!(msg.contains(needle), "'{msg}' does not mention '{needle}'");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    // =========================================================================
    // Defaults and validation
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.strategy, StrategyKind::CostBased);
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert!(!config.failover_on_override);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!((config.budget.alert_threshold - 0.8).abs() < f64::EPSILON);
        assert!((config.cache.similarity.threshold - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("switchboard/switchboard.toml"));
        }
    }

    #[test]
    fn test_validation() {
        assert!(valid().validate().is_ok());
        assert_invalid(&RouterConfig::default(), "at least one provider");
        assert_invalid(&RouterConfig::new(vec![provider("a"), provider("a")]), "duplicate");

        let mut negative = valid();
        negative.providers[0].models[0].pricing.input = -1.0;
        assert_invalid(&negative, "negative");

        let mut breaker = valid();
        breaker.providers[1].breaker.failure_threshold = 0;
        assert_invalid(&breaker, "breaker thresholds");

        let mut threshold = valid();
        threshold.budget.alert_threshold = 1.5;
        assert_invalid(&threshold, "alert_threshold");

        let mut similarity = valid();
        similarity.cache.similarity.threshold = 0.0;
        assert_invalid(&similarity, "similarity");

        let mut default_model = valid();
        default_model.providers[0].default_model = Some("missing".into());
        assert_invalid(&default_model, "default_model");

        let mut budget = valid();
        budget.budget.daily_limit = Some(0.0);
        assert_invalid(&budget, "daily_limit");
    }

    #[test]
    fn test_pricing_table() {
        let table = valid().pricing_table();
        assert_eq!(table.len(), 2);
        assert!(table.get("a", "a-model").is_some());
    }

    // =========================================================================
    // File loading
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let toml_content = r#"
strategy = "round-robin"
default_timeout_ms = 5000

[[providers]]
id = "alpha"
weight = 2.0
capabilities = { vision = true }

[[providers.models]]
id = "alpha-large"
input = 0.01
output = 0.02

[providers.breaker]
failure_threshold = 3

[[providers]]
id = "beta"

[[providers.models]]
id = "beta-small"

[budget]
mode = "soft"
daily_limit = 25.0

[cache.similarity]
algorithm = "jaccard"
threshold = 0.9
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.strategy, StrategyKind::RoundRobin);
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.providers.len(), 2);
        let alpha = config.provider("alpha").unwrap();
        assert!(alpha.capabilities.vision);
        assert_eq!(alpha.breaker.failure_threshold, 3);
        assert_eq!(alpha.breaker.success_threshold, 2);
        assert!((alpha.models[0].pricing.output - 0.02).abs() < f64::EPSILON);
        assert_eq!(config.budget.daily_limit, Some(25.0));
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_loaded_config_places_databases_in_data_dir() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"
[[providers]]
id = "alpha"

[[providers.models]]
id = "alpha-small"

[ledger]
path = "/srv/switchboard/ledger.db"
"#,
        )
        .unwrap();
        let data = tempfile::tempdir().unwrap();

        let config =
            load_config_with_data_dir(Some(file.path().to_path_buf()), Some(data.path().to_path_buf())).unwrap();
        assert_eq!(config.ledger.path, Some(PathBuf::from("/srv/switchboard/ledger.db")));
        assert_eq!(config.cache.persistent.path, Some(data.path().join(CACHE_FILE)));

        let in_memory = load_config_with_data_dir(Some(file.path().to_path_buf()), None).unwrap();
        assert_eq!(in_memory.cache.persistent.path, None);
        assert_eq!(RouterConfig::default().ledger.path, None);
    }

    #[test]
    fn test_missing_file_fails_validation_without_providers() {
        let result = load_config_from_path(Some(PathBuf::from("/nonexistent/switchboard.toml")));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_malformed_toml_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"strategy = [unclosed").unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    // =========================================================================
    // Environment overrides
    // =========================================================================

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SWITCHBOARD_STRATEGY", "weighted"),
            ("SWITCHBOARD_CACHE_PATH", "/tmp/sb-cache.db"),
            ("SWITCHBOARD_LEDGER_PATH", "/tmp/sb-ledger.db"),
            ("SWITCHBOARD_DAILY_BUDGET", "12.5"),
            ("SWITCHBOARD_BUDGET_MODE", "soft"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        apply_overrides(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.strategy, StrategyKind::Weighted);
        assert_eq!(config.cache.persistent.path, Some(PathBuf::from("/tmp/sb-cache.db")));
        assert_eq!(config.ledger.path, Some(PathBuf::from("/tmp/sb-ledger.db")));
        assert_eq!(config.budget.daily_limit, Some(12.5));
        assert_eq!(config.budget.mode, BudgetMode::Soft);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut config = valid();
        apply_overrides(&mut config, |name| match name {
            "SWITCHBOARD_STRATEGY" => Some("fastest".into()),
            "SWITCHBOARD_DAILY_BUDGET" => Some("lots".into()),
            _ => None,
        });

        assert_eq!(config.strategy, StrategyKind::CostBased);
        assert_eq!(config.budget.daily_limit, None);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
