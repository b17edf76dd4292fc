//! Switchboard Control - Operator CLI for the routing engine
//!
//! Inspects what a deployment's router would load and the state it keeps on
//! disk: configuration, the usage ledger, budgets and the persistent cache.
//!
//! # Usage
//!
//! ```bash
//! # Validate the configuration file
//! switchboard-ctl check --config /etc/switchboard/switchboard.toml
//!
//! # Spend and token usage over the last 24 hours
//! switchboard-ctl usage --since 24
//!
//! # Budget status for the current day and month
//! switchboard-ctl budget --json
//!
//! # Drop expired entries from the persistent cache
//! switchboard-ctl cache-cleanup
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-ctl check
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use switchboard_core::cache::CacheEngine;
use switchboard_core::config::{self, RouterConfig};
use switchboard_core::ledger::{BudgetStatus, SqliteUsageStore, TokenTracker, UsageStats, UsageStore};

/// Switchboard Control - inspect router configuration, usage and cache
#[derive(Parser, Debug)]
#[command(name = "switchboard-ctl")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Load and validate the configuration
    Check,

    /// Usage totals from the ledger
    Usage {
        /// Report window, in hours back from now
        #[arg(long, default_value_t = 24)]
        since: u32,
    },

    /// Spend against each configured budget
    Budget,

    /// Remove expired cache entries
    CacheCleanup,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_ctl={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Ledger database the router writes for this configuration
fn ledger_path(config: &RouterConfig) -> Result<PathBuf> {
    config
        .ledger
        .path
        .clone()
        .context("No ledger path configured and no data directory available; set [ledger] path or SWITCHBOARD_LEDGER_PATH")
}

/// Persistent cache database the router writes for this configuration
fn cache_path(config: &RouterConfig) -> Result<PathBuf> {
    config
        .cache
        .persistent
        .path
        .clone()
        .context("No cache path configured and no data directory available; set [cache.persistent] path or SWITCHBOARD_CACHE_PATH")
}

fn open_ledger(config: &RouterConfig) -> Result<TokenTracker> {
    let path = ledger_path(config)?;
    let store = SqliteUsageStore::open(&path)
        .with_context(|| format!("Failed to open usage ledger: {}", path.display()))?;
    info!(path = %path.display(), "Opened usage ledger");

    let store: Arc<dyn UsageStore> = Arc::new(store);
    Ok(TokenTracker::new(config.pricing_table(), config.budget.clone(), store))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check(config: &RouterConfig, json: bool) -> Result<()> {
    if json {
        return print_json(config);
    }

    println!("Configuration OK ({})", config.source());
    if let Some(path) = &config.config_file_path {
        println!("  file:       {}", path.display());
    }
    println!("  strategy:   {}", config.strategy);
    println!("  timeout:    {:?}", config.default_timeout());
    println!("  budget:     {}", config.budget.mode);
    for provider in &config.providers {
        let models: Vec<&str> = provider.models.iter().map(|m| m.id.as_str()).collect();
        println!(
            "  provider {:<12} weight {:<5} models [{}]",
            provider.id,
            provider.weight,
            models.join(", ")
        );
    }
    Ok(())
}

fn print_usage(stats: &UsageStats) {
    println!("Usage {} .. {}", stats.start.format("%Y-%m-%d %H:%M"), stats.end.format("%Y-%m-%d %H:%M"));
    println!(
        "  total        {:>6} requests  {:>6} ok  {:>10} tokens  ${:.4}  avg {:.0}ms",
        stats.total.requests,
        stats.total.successes,
        stats.total.tokens.total(),
        stats.total.cost,
        stats.avg_latency_ms
    );
    for (model, totals) in &stats.by_model {
        println!(
            "  {:<12} {:>6} requests  {:>6} ok  {:>10} tokens  ${:.4}",
            model,
            totals.requests,
            totals.successes,
            totals.tokens.total(),
            totals.cost
        );
    }
}

fn print_budget(status: &BudgetStatus) {
    println!("Budget mode: {} (alert at {:.0}%)", status.mode, status.alert_threshold * 100.0);
    for scope in &status.scopes {
        let limit = match (scope.ceiling, scope.remaining) {
            (Some(ceiling), Some(remaining)) => format!("of ${ceiling:.4} (${remaining:.4} left)"),
            _ => "(unlimited)".to_string(),
        };
        println!(
            "  {:<24} {:<10} ${:.4} {}{}",
            scope.scope.to_string(),
            scope.period,
            scope.spent,
            limit,
            if scope.alerted { "  ALERT" } else { "" }
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = config::load_config_from_path(args.config.clone()).context("Failed to load configuration")?;

    match args.command {
        Command::Check => check(&config, args.json)?,
        Command::Usage { since } => {
            let tracker = open_ledger(&config)?;
            let end = chrono::Utc::now();
            let start = end - chrono::Duration::hours(i64::from(since));
            let stats = tracker.usage_stats(start, end)?;
            if args.json {
                print_json(&stats)?;
            } else {
                print_usage(&stats);
            }
        }
        Command::Budget => {
            let status = open_ledger(&config)?.budget_status();
            if args.json {
                print_json(&status)?;
            } else {
                print_budget(&status);
            }
        }
        Command::CacheCleanup => {
            let path = cache_path(&config)?;
            let cache = CacheEngine::new(config.cache.clone())
                .with_context(|| format!("Failed to open cache: {}", path.display()))?;
            let removed = cache.cleanup_expired().await;
            info!(removed, "Cache cleanup finished");
            if args.json {
                print_json(&serde_json::json!({ "removed": removed }))?;
            } else {
                println!("Removed {removed} expired cache entries");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let args = Args::try_parse_from(["switchboard-ctl", "usage", "--since", "48", "--json"]).unwrap();
        assert_eq!(args.command, Command::Usage { since: 48 });
        assert!(args.json);

        let args = Args::try_parse_from(["switchboard-ctl", "cache-cleanup"]).unwrap();
        assert_eq!(args.command, Command::CacheCleanup);
        assert_eq!(args.log_level, "warn");

        assert!(Args::try_parse_from(["switchboard-ctl", "frobnicate"]).is_err());
    }

    #[test]
    fn test_paths_follow_loaded_config() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("switchboard.toml");
        std::fs::write(&file, "[[providers]]\nid = \"alpha\"\n\n[[providers.models]]\nid = \"alpha-small\"\n").unwrap();

        let config = config::load_config_with_data_dir(Some(file), Some(dir.path().join("data"))).unwrap();
        assert_eq!(ledger_path(&config).unwrap(), dir.path().join("data").join(config::LEDGER_FILE));
        assert_eq!(cache_path(&config).unwrap(), dir.path().join("data").join(config::CACHE_FILE));
    }

    #[test]
    fn test_unset_paths_are_an_error() {
        let config = RouterConfig::default();
        assert!(ledger_path(&config).is_err());
        assert!(cache_path(&config).is_err());
    }

    #[test]
    fn test_open_ledger_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RouterConfig::default();
        config.ledger.path = Some(dir.path().join("nested").join("usage.db"));

        let tracker = open_ledger(&config).unwrap();
        let now = chrono::Utc::now();
        let stats = tracker.usage_stats(now - chrono::Duration::hours(1), now).unwrap();
        assert_eq!(stats.total.requests, 0);
        assert!(dir.path().join("nested").join("usage.db").exists());
    }
}
