use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use uuid::Uuid;

use mailwatch::clock::{Clock, ManualClock};
use mailwatch::db::models::{ChangeType, SubscriptionState};
use mailwatch::db::{InMemoryStore, SqliteStore, SubscriptionStore, Transition};
use mailwatch::error::SubscriptionError;
use mailwatch::graph::{MockFailure, MockSubscriptionApi};
use mailwatch::subscriptions::{CallbackUrls, RenewalPolicy, RenewalScheduler, SubscriptionManager};

const INBOX: &str = "/users/owner@example.com/mailFolders('Inbox')/messages";

struct Harness {
    manager: Arc<SubscriptionManager>,
    scheduler: RenewalScheduler,
    api: Arc<MockSubscriptionApi>,
    clock: Arc<ManualClock>,
}

fn harness(store: Arc<dyn SubscriptionStore>, policy: RenewalPolicy) -> Harness {
    let api = Arc::new(MockSubscriptionApi::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap(),
    ));
    let manager = Arc::new(SubscriptionManager::new(
        store,
        api.clone(),
        clock.clone(),
        policy,
        Some(CallbackUrls::from_base("https://hooks.example.com")),
    ));
    let scheduler = RenewalScheduler::new(manager.clone(), clock.clone());
    Harness {
        manager,
        scheduler,
        api,
        clock,
    }
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("mailwatch-it-{}", Uuid::new_v4()))
        .join("mailwatch.db")
}

#[tokio::test]
async fn renews_inside_margin_by_exactly_one_lifetime() {
    let h = harness(
        Arc::new(InMemoryStore::new()),
        RenewalPolicy {
            margin: Duration::minutes(10),
            ..RenewalPolicy::default()
        },
    );
    let created = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(60))
        .await
        .expect("create");

    h.clock.advance(Duration::minutes(49));
    assert!(h.scheduler.tick().await.is_quiet());
    assert_eq!(h.api.renew_calls(), 0);

    h.clock.advance(Duration::minutes(2));
    let report = h.scheduler.tick().await;
    assert_eq!(report.renewed, vec![created.id.clone()]);
    assert_eq!(h.api.renew_calls(), 1);

    let renewed = h.manager.get(&created.id).expect("get");
    assert_eq!(renewed.state, SubscriptionState::Active);
    assert_eq!(renewed.expires_at, created.expires_at + Duration::minutes(60));
    assert!(renewed.expires_at > h.clock.now());
}

#[tokio::test]
async fn transient_failures_retry_once_per_tick_until_failed() {
    let h = harness(
        Arc::new(InMemoryStore::new()),
        RenewalPolicy {
            margin: Duration::minutes(60),
            max_attempts: 3,
            backoff_base: Duration::seconds(30),
            backoff_max: Duration::minutes(10),
            ..RenewalPolicy::default()
        },
    );
    let created = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(240))
        .await
        .expect("create");
    h.api.fail_renewals(MockFailure::Unavailable, 10);

    h.clock.advance(Duration::minutes(181));
    let report = h.scheduler.tick().await;
    assert_eq!(report.retrying, vec![created.id.clone()]);
    assert_eq!(h.api.renew_calls(), 1);

    // Backoff has not elapsed yet.
    let report = h.scheduler.tick().await;
    assert!(report.retrying.is_empty());
    assert_eq!(h.api.renew_calls(), 1);
    let pending = h.manager.get(&created.id).expect("get");
    assert_eq!(pending.state, SubscriptionState::RenewalDue);
    assert_eq!(pending.renewal_attempts, 1);
    assert!(pending.next_renewal_at.is_some_and(|at| at > h.clock.now()));

    h.clock.advance(Duration::minutes(11));
    let report = h.scheduler.tick().await;
    assert_eq!(report.retrying, vec![created.id.clone()]);
    assert_eq!(h.api.renew_calls(), 2);

    h.clock.advance(Duration::minutes(11));
    let report = h.scheduler.tick().await;
    assert_eq!(report.failed, vec![created.id.clone()]);
    assert_eq!(report.alerts(), vec![created.id.as_str()]);
    assert_eq!(h.api.renew_calls(), 3);

    let failed = h.manager.get(&created.id).expect("get");
    assert_eq!(failed.state, SubscriptionState::Failed);
    assert!(failed.last_error.is_some());

    h.clock.advance(Duration::minutes(11));
    assert!(h.scheduler.tick().await.is_quiet());
    assert_eq!(h.api.renew_calls(), 3);
}

#[tokio::test]
async fn permanent_failure_stops_renewal_immediately() {
    let h = harness(
        Arc::new(InMemoryStore::new()),
        RenewalPolicy {
            margin: Duration::minutes(10),
            ..RenewalPolicy::default()
        },
    );
    let created = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(60))
        .await
        .expect("create");
    h.api.fail_renewals(MockFailure::Forbidden, 1);

    h.clock.advance(Duration::minutes(55));
    let report = h.scheduler.tick().await;
    assert_eq!(report.failed, vec![created.id.clone()]);
    assert_eq!(
        h.manager.get(&created.id).expect("get").state,
        SubscriptionState::Failed
    );
}

#[tokio::test]
async fn lapsed_subscription_is_expired_not_renewed() {
    let h = harness(Arc::new(InMemoryStore::new()), RenewalPolicy::default());
    let created = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(30))
        .await
        .expect("create");

    h.clock.advance(Duration::minutes(31));
    let report = h.scheduler.tick().await;
    assert_eq!(report.expired, vec![created.id.clone()]);
    assert_eq!(h.api.renew_calls(), 0);
    assert_eq!(
        h.manager.get(&created.id).expect("get").state,
        SubscriptionState::Expired
    );

    let replacement = h
        .manager
        .ensure(INBOX, &ChangeType::created(), Duration::minutes(30))
        .await
        .expect("replacement");
    assert_ne!(replacement.id, created.id);
    assert_eq!(h.api.create_calls(), 2);
}

#[tokio::test]
async fn renewal_in_flight_is_not_repeated() {
    let h = harness(Arc::new(InMemoryStore::new()), RenewalPolicy::default());
    let created = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(120))
        .await
        .expect("create");

    let lease_until = h.clock.now() + Duration::minutes(5);
    let claimed = h
        .manager
        .store()
        .transition(&created.id, &[SubscriptionState::Active], &mut |record| {
            record.state = SubscriptionState::Renewing;
            record.next_renewal_at = Some(lease_until);
        })
        .expect("claim");
    assert!(matches!(claimed, Transition::Applied(_)));

    let error = h.manager.renew(&created.id).await.expect_err("in flight");
    assert!(matches!(error, SubscriptionError::RenewalInFlight(_)));

    h.clock.advance(Duration::minutes(1));
    let report = h.scheduler.tick().await;
    assert_eq!(report.skipped_in_flight, vec![created.id.clone()]);
    assert_eq!(h.api.renew_calls(), 0);

    h.clock.advance(Duration::minutes(4));
    let report = h.scheduler.tick().await;
    assert_eq!(report.reclaimed, vec![created.id.clone()]);
    assert_eq!(report.renewed, vec![created.id.clone()]);
    assert_eq!(h.api.renew_calls(), 1);
}

#[tokio::test]
async fn dropped_renewal_is_reclaimed_once_its_lease_lapses() {
    let h = harness(
        Arc::new(InMemoryStore::new()),
        RenewalPolicy {
            margin: Duration::minutes(10),
            lease: Duration::minutes(5),
            ..RenewalPolicy::default()
        },
    );
    let created = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(60))
        .await
        .expect("create");

    h.clock.advance(Duration::minutes(51));
    h.api.hold_renewals(true);
    let abandoned = tokio::time::timeout(
        StdDuration::from_millis(50),
        h.manager.renew(&created.id),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(
        h.manager.get(&created.id).expect("get").state,
        SubscriptionState::Renewing
    );
    h.api.hold_renewals(false);

    let mut renewed_at = None;
    for minute in 1..=8 {
        h.clock.advance(Duration::minutes(1));
        let report = h.scheduler.tick().await;
        if !report.renewed.is_empty() {
            assert_eq!(report.reclaimed, vec![created.id.clone()]);
            renewed_at = Some(minute);
            break;
        }
        assert_eq!(report.skipped_in_flight, vec![created.id.clone()]);
    }
    assert_eq!(renewed_at, Some(5));

    let renewed = h.manager.get(&created.id).expect("get");
    assert_eq!(renewed.state, SubscriptionState::Active);
    assert_eq!(renewed.expires_at, created.expires_at + Duration::minutes(60));
    assert_eq!(h.api.renew_calls(), 2);
}

#[tokio::test]
async fn dropped_create_still_records_the_remote_subscription() {
    let h = harness(Arc::new(InMemoryStore::new()), RenewalPolicy::default());
    h.api.set_create_latency(StdDuration::from_millis(100));

    let abandoned = tokio::time::timeout(
        StdDuration::from_millis(20),
        h.manager
            .create(INBOX, &ChangeType::created(), Duration::minutes(60)),
    )
    .await;
    assert!(abandoned.is_err());
    tokio::time::sleep(StdDuration::from_millis(300)).await;

    let stored = h.manager.list(None).expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].state, SubscriptionState::Active);
    assert!(h.api.remote_expiration(&stored[0].id).is_some());
    assert_eq!(h.api.remote_count(), 1);

    let error = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(60))
        .await
        .expect_err("pair already covered");
    assert!(matches!(error, SubscriptionError::AlreadyActive { .. }));
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
    let path = temp_db_path();
    let h = harness(
        Arc::new(SqliteStore::open(&path).expect("open sqlite store")),
        RenewalPolicy::default(),
    );
    let created = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(90))
        .await
        .expect("create");
    drop(h);

    let reopened = SqliteStore::open(&path).expect("reopen sqlite store");
    let stored = reopened
        .get(&created.id)
        .expect("read")
        .expect("record persisted");
    assert_eq!(stored.state, SubscriptionState::Active);
    assert_eq!(stored.expires_at, created.expires_at);
    assert!(stored.client_secret.matches(created.client_secret.expose()));
    assert_eq!(
        reopened
            .list(Some(&SubscriptionState::ACCEPTING))
            .expect("list")
            .len(),
        1
    );

    if let Some(parent) = path.parent() {
        let _ = std::fs::remove_dir_all(parent);
    }
}

#[tokio::test]
async fn restart_releases_renewal_claims_left_in_sqlite() {
    let path = temp_db_path();
    let h = harness(
        Arc::new(SqliteStore::open(&path).expect("open sqlite store")),
        RenewalPolicy::default(),
    );
    let created = h
        .manager
        .create(INBOX, &ChangeType::created(), Duration::minutes(90))
        .await
        .expect("create");
    let far_lease = h.clock.now() + Duration::days(1);
    h.manager
        .store()
        .transition(&created.id, &[SubscriptionState::Active], &mut |record| {
            record.state = SubscriptionState::Renewing;
            record.next_renewal_at = Some(far_lease);
        })
        .expect("claim");
    drop(h);

    let h = harness(
        Arc::new(SqliteStore::open(&path).expect("reopen sqlite store")),
        RenewalPolicy::default(),
    );
    assert_eq!(
        h.manager.recover_interrupted_renewals().expect("recover"),
        vec![created.id.clone()]
    );
    assert_eq!(
        h.manager.get(&created.id).expect("get").state,
        SubscriptionState::RenewalDue
    );
    assert!(h.manager.recover_interrupted_renewals().expect("recover").is_empty());

    if let Some(parent) = path.parent() {
        let _ = std::fs::remove_dir_all(parent);
    }
}
