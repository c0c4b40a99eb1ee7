mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use support::{customer, service, settings, FakeCrm};
use vykup_sync::{RunGuard, SyncConfig, DEFAULT_RECOMPUTE_CRON};

fn config(extra: &[(&str, &str)]) -> SyncConfig {
    let vars: HashMap<String, String> = [
        ("RETAILCRM_URL", "https://shop.retailcrm.test"),
        ("RETAILCRM_API_KEY", "secret"),
        ("RETAILCRM_SITES", "a"),
    ]
    .into_iter()
    .chain(extra.iter().copied())
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    SyncConfig::from_lookup(move |key| vars.get(key).cloned()).expect("config")
}

fn populated(count: i64) -> FakeCrm {
    (1..=count).fold(FakeCrm::new(), |crm, id| {
        crm.with_customer(customer(id), "a").with_orders(id, &["completed"])
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn default_cron_builds_a_scheduler() {
    let config = config(&[("VYKUP_SCHEDULER_ENABLED", "1")]);
    assert_eq!(config.recompute_cron, DEFAULT_RECOMPUTE_CRON);

    let crm = Arc::new(populated(1));
    let svc = Arc::new(service(&crm, settings("a")));

    let sched = svc.maybe_build_scheduler(&config).await;

    assert!(matches!(sched, Ok(Some(_))));
    assert_eq!(crm.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_scheduler_is_not_built() {
    let config = config(&[]);
    let crm = Arc::new(populated(1));
    let svc = Arc::new(service(&crm, settings("a")));

    let sched = svc.maybe_build_scheduler(&config).await.expect("no error");

    assert!(sched.is_none());
}

#[tokio::test]
async fn overlapping_runs_are_skipped() {
    let crm = Arc::new(populated(25));
    let mut slow = settings("a");
    slow.page_delay = Duration::from_millis(200);
    let svc = service(&crm, slow);
    let guard = RunGuard::default();

    let (first, second) = tokio::join!(guard.run_exclusive(&svc, 100, 20), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.run_exclusive(&svc, 100, 20).await
    });

    let first = first.expect("first run proceeds");
    assert_eq!(first.processed, 25);
    assert!(second.is_none());
    assert_eq!(crm.updates().len(), 25);

    let third = guard.run_exclusive(&svc, 5, 20).await;
    assert_eq!(third.map(|s| s.processed), Some(5));
}
