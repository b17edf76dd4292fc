//! Cache layering, similarity fallback, budget enforcement and ledger
//! persistence through the router.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use common::{provider, quiet_config, request, start, FakeProvider};
use switchboard_core::cache::{CacheLayer, MemoryLayer};
use switchboard_core::ledger::{BudgetScope, SqliteUsageStore, TokenTracker, UsageStore};
use switchboard_core::{BudgetConfig, BudgetMode, CacheHitKind, RequestRouter, RouterError, RouterEvent};

// =============================================================================
// Cache
// =============================================================================

#[tokio::test]
async fn exact_hit_is_free_and_skips_providers() {
    let a = FakeProvider::new("a");
    let router = start(quiet_config(vec![provider("a", 0.01)]), &[a.clone()]);

    let first = router.submit(request("What is a monad?")).await.unwrap();
    let second = router.submit(request("  what IS a   monad? ")).await.unwrap();

    assert_eq!(a.calls(), 1);
    assert_eq!(second.response, first.response);
    assert_eq!(second.cost, 0.0);
    assert_eq!(second.attempts, 0);
    assert_eq!(
        second.cache_hit,
        Some(CacheHitKind::Exact {
            layer: "memory".into()
        })
    );
    assert_eq!(router.stats().cache.exact_hits, 1);
}

#[tokio::test]
async fn similar_prompt_served_from_cache() {
    let a = FakeProvider::new("a");
    let router = start(quiet_config(vec![provider("a", 0.01)]), &[a.clone()]);
    let mut events = router.subscribe();

    router.submit(request("Explain the borrow checker in Rust")).await.unwrap();
    let similar = router.submit(request("Explain the borrow checker in Rust please")).await.unwrap();

    assert_eq!(a.calls(), 1);
    match similar.cache_hit {
        Some(CacheHitKind::Similar { similarity }) => assert!(similarity >= 0.85 && similarity < 1.0),
        other => panic!("expected similar hit, got {other:?}"),
    }

    let hit = std::iter::from_fn(|| events.try_recv().ok()).find(|e| matches!(e, RouterEvent::CacheHit { .. }));
    assert!(hit.is_some());
}

#[tokio::test]
async fn unrelated_prompt_misses() {
    let a = FakeProvider::new("a");
    let router = start(quiet_config(vec![provider("a", 0.01)]), &[a.clone()]);

    router.submit(request("Explain the borrow checker in Rust")).await.unwrap();
    let other = router.submit(request("Write a haiku about autumn leaves")).await.unwrap();

    assert!(other.cache_hit.is_none());
    assert_eq!(a.calls(), 2);
}

#[tokio::test]
async fn responses_written_to_every_layer() {
    let a = FakeProvider::new("a");
    let distributed = Arc::new(MemoryLayer::new(100, Duration::from_secs(600)));
    let router = RequestRouter::builder(quiet_config(vec![provider("a", 0.01)]))
        .provider(a.clone())
        .distributed_cache(distributed.clone())
        .build()
        .unwrap();
    router.start().unwrap();

    router.submit(request("cache me")).await.unwrap();

    assert_eq!(distributed.len().await.unwrap(), 1);
    assert_eq!(router.cache().layer_names(), vec!["memory", "sqlite", "memory"]);
    assert_eq!(router.stats().cache.sets, 1);
}

#[tokio::test]
async fn persistent_layer_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = quiet_config(vec![provider("a", 0.01)]);
    config.cache.persistent.path = Some(dir.path().join("cache.db"));

    let a = FakeProvider::new("a");
    {
        let router = start(config.clone(), &[a.clone()]);
        router.submit(request("remember this")).await.unwrap();
        router.stop();
    }

    let router = start(config, &[a.clone()]);
    let routed = router.submit(request("remember this")).await.unwrap();

    assert_eq!(a.calls(), 1);
    assert_eq!(
        routed.cache_hit,
        Some(CacheHitKind::Exact {
            layer: "sqlite".into()
        })
    );
}

// =============================================================================
// Budgets
// =============================================================================

fn budget(mode: BudgetMode) -> BudgetConfig {
    BudgetConfig {
        mode,
        daily_limit: Some(10.0),
        ..Default::default()
    }
}

#[tokio::test]
async fn hard_budget_alerts_once_then_rejects() {
    // 10 input + 10 output tokens at 0.15 each: 3.0 per request
    let a = FakeProvider::new("a");
    let config = quiet_config(vec![provider("a", 0.15)]).with_budget(budget(BudgetMode::Hard));
    let router = start(config, &[a.clone()]);
    let mut events = router.subscribe();

    for i in 0..3 {
        let routed = router.submit(request(&format!("job {i}")).without_cache()).await.unwrap();
        assert!((routed.cost - 3.0).abs() < 1e-9);
    }

    let err = router.submit(request("job 3").without_cache()).await.unwrap_err();
    match err {
        RouterError::BudgetExceeded {
            scope,
            spent,
            estimate,
            ceiling,
        } => {
            assert_eq!(scope, BudgetScope::Daily);
            assert!((spent - 9.0).abs() < 1e-9);
            assert!((estimate - 3.0).abs() < 1e-9);
            assert!((ceiling - 10.0).abs() < 1e-9);
        }
        other => panic!("expected budget rejection, got {other:?}"),
    }
    assert_eq!(a.calls(), 3);

    let alerts: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, RouterEvent::BudgetAlert { .. }))
        .collect();
    assert_eq!(alerts.len(), 1);

    let status = router.stats().budget;
    let daily = status.scope(&BudgetScope::Daily).unwrap();
    assert!(daily.alerted);
    assert!((daily.spent - 9.0).abs() < 1e-9);
}

#[tokio::test]
async fn concurrent_requests_cannot_overshoot_hard_ceiling() {
    // 20 tokens at 0.01: each request reserves 0.2 against a 0.25 ceiling
    let a = FakeProvider::slow("a", Duration::from_millis(100));
    let config = quiet_config(vec![provider("a", 0.01)]).with_budget(BudgetConfig {
        daily_limit: Some(0.25),
        ..Default::default()
    });
    let router = start(config, &[a.clone()]);

    let results = futures::future::join_all(
        (0..5).map(|i| router.submit(request(&format!("parallel {i}")).without_cache())),
    )
    .await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(RouterError::BudgetExceeded { .. })))
        .count();
    assert_eq!((accepted, rejected), (1, 4));
    assert_eq!(a.calls(), 1);

    let status = router.stats().budget;
    let daily = status.scope(&BudgetScope::Daily).unwrap();
    assert!(daily.spent <= 0.25);
    assert!(daily.reserved.abs() < 1e-9);
}

#[tokio::test]
async fn soft_budget_only_warns() {
    let a = FakeProvider::new("a");
    let config = quiet_config(vec![provider("a", 0.15)]).with_budget(budget(BudgetMode::Soft));
    let router = start(config, &[a.clone()]);

    for i in 0..5 {
        router.submit(request(&format!("job {i}")).without_cache()).await.unwrap();
    }
    assert_eq!(a.calls(), 5);
    assert_eq!(router.stats().requests.budget_rejections, 0);
}

#[tokio::test]
async fn per_caller_budget_isolated() {
    let a = FakeProvider::new("a");
    let config = quiet_config(vec![provider("a", 0.15)]).with_budget(BudgetConfig {
        per_caller_daily_limit: Some(5.0),
        ..Default::default()
    });
    let router = start(config, &[a]);

    router
        .submit(request("one").with_caller("team-a").without_cache())
        .await
        .unwrap();
    let err = router
        .submit(request("two").with_caller("team-a").without_cache())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouterError::BudgetExceeded {
            scope: BudgetScope::CallerDaily(ref caller),
            ..
        } if caller == "team-a"
    ));

    assert!(router
        .submit(request("three").with_caller("team-b").without_cache())
        .await
        .is_ok());
}

#[tokio::test]
async fn spend_rehydrates_from_ledger() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("usage.db");
    let config = quiet_config(vec![provider("a", 0.15)]).with_budget(budget(BudgetMode::Hard));

    {
        let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::open(&path).unwrap());
        let router = RequestRouter::builder(config.clone())
            .provider(FakeProvider::new("a"))
            .usage_store(store)
            .build()
            .unwrap();
        router.start().unwrap();
        for i in 0..3 {
            router.submit(request(&format!("job {i}")).without_cache()).await.unwrap();
        }
    }

    let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::open(&path).unwrap());
    let tracker = TokenTracker::new(config.pricing_table(), config.budget.clone(), store);
    assert!(tracker.check_budget(None, 3.0).is_err());

    let now = chrono::Utc::now();
    let stats = tracker.usage_stats(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1)).unwrap();
    assert_eq!(stats.total.requests, 3);
    assert!((stats.total.cost - 9.0).abs() < 1e-9);
}

#[tokio::test]
async fn loaded_config_shares_databases_with_operator_tools() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("switchboard.toml");
    std::fs::write(
        &file,
        r#"
health_check_interval_ms = 0

[[providers]]
id = "a"

[[providers.models]]
id = "a-model"
input = 0.15
output = 0.15

[cache]
cleanup_interval_secs = 0
"#,
    )
    .unwrap();
    let data = dir.path().join("data");
    let config = switchboard_core::config::load_config_with_data_dir(Some(file), Some(data.clone())).unwrap();
    let ledger_path = config.ledger.path.clone().unwrap();
    assert!(ledger_path.starts_with(&data));

    {
        let router = start(config.clone(), &[FakeProvider::new("a")]);
        router.submit(request("logged once")).await.unwrap();
    }
    assert!(data.join(switchboard_core::config::CACHE_FILE).exists());

    // What the operator CLI opens for the same configuration
    let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::open(&ledger_path).unwrap());
    let tracker = TokenTracker::new(config.pricing_table(), config.budget.clone(), store);
    let now = chrono::Utc::now();
    let stats = tracker.usage_stats(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1)).unwrap();
    assert_eq!(stats.total.requests, 1);
    assert!((stats.total.cost - 3.0).abs() < 1e-9);
}
