use std::time::Duration;

use refresh_cache::{Lifetime, RefreshCache, Schedule, TokioClock};

use crate::{Calls, Gate, Outcomes, manual_cache, secs, setup, yield_until};

#[tokio::test]
async fn test_fresh_value_is_served_from_cache() {
    let (cache, clock) = manual_cache::<&str, usize>(Some(secs(10)), 0);
    let calls = Calls::new();

    let value = cache
        .get_or_create("metadata", calls.numbered(), secs(20))
        .await
        .unwrap();
    assert_eq!(value, 1);

    for t in [1, 5, 9] {
        clock.set(secs(t));
        let value = cache
            .get_or_create("metadata", calls.numbered(), secs(20))
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    assert_eq!(calls.count(), 1);
    assert_eq!(cache.in_flight(), 0);
}

/// The refresh started at t=12 fails, so the value expires at t=20 and the lookup at t=25 has
/// to wait for a third fetch.
#[tokio::test]
async fn test_refresh_ahead_with_failed_refresh() {
    let (cache, clock) = manual_cache::<&str, usize>(Some(secs(10)), 0);
    let calls = Calls::new();
    let outcomes = Outcomes::default();
    let observer = outcomes.observer();

    let value = cache
        .get_or_create_observed("token", calls.numbered(), secs(20), &observer)
        .await
        .unwrap();
    assert_eq!(value, 1);

    clock.set(secs(5));
    let value = cache
        .get_or_create_observed("token", calls.numbered(), secs(20), &observer)
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(calls.count(), 1);

    clock.set(secs(12));
    let value = cache
        .get_or_create_observed(
            "token",
            calls.failing("token endpoint unavailable"),
            secs(20),
            &observer,
        )
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(calls.count(), 2);

    yield_until(|| cache.in_flight() == 0).await;
    assert_eq!(cache.len(), 1);

    clock.set(secs(25));
    let value = cache
        .get_or_create_observed("token", calls.numbered(), secs(20), &observer)
        .await
        .unwrap();
    assert_eq!(value, 3);
    assert_eq!(calls.count(), 3);

    insta::assert_debug_snapshot!(outcomes.take(), @r###"
    [
        New,
        Cached,
        Refreshed,
        Error,
        Expired,
    ]
    "###);
}

/// The refresh started at t=12 is still running at t=25, so the expired lookup joins it.
#[tokio::test]
async fn test_expired_lookup_joins_pending_refresh() {
    let (cache, clock) = manual_cache::<&str, usize>(Some(secs(10)), 0);
    let calls = Calls::new();
    let gate = Gate::new();

    cache
        .get_or_create("token", calls.numbered(), secs(20))
        .await
        .unwrap();

    clock.set(secs(12));
    let value = cache
        .get_or_create("token", calls.gated(&gate, 42), secs(20))
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(cache.in_flight(), 1);

    clock.set(secs(25));
    let (value, ()) = tokio::join!(
        cache.get_or_create("token", calls.numbered(), secs(20)),
        async { gate.open() },
    );

    assert_eq!(value.unwrap(), 42);
    assert_eq!(calls.count(), 2);

    // The refresh started at t=12, so its value is good until t=32.
    let entry = &cache.values()[0];
    assert_eq!(entry.expiry(), clock.origin() + secs(32));
    assert_eq!(entry.refresh_at(), Some(clock.origin() + secs(22)));
}

#[tokio::test]
async fn test_refresh_replaces_value_in_background() {
    let (cache, clock) = manual_cache::<&str, usize>(Some(secs(10)), 0);
    let calls = Calls::new();

    cache
        .get_or_create("token", calls.numbered(), secs(20))
        .await
        .unwrap();

    clock.set(secs(12));
    let value = cache
        .get_or_create("token", calls.numbered(), secs(20))
        .await
        .unwrap();
    assert_eq!(value, 1);

    yield_until(|| cache.in_flight() == 0).await;

    for t in [15, 21] {
        clock.set(secs(t));
        let value = cache
            .get_or_create("token", calls.numbered(), secs(20))
            .await
            .unwrap();
        assert_eq!(value, 2, "at t={t}");
    }
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn test_stale_lookups_start_one_refresh() {
    let (cache, clock) = manual_cache::<&str, usize>(Some(secs(10)), 0);
    let calls = Calls::new();
    let gate = Gate::new();
    let outcomes = Outcomes::default();
    let observer = outcomes.observer();

    cache
        .get_or_create("config", calls.numbered(), secs(20))
        .await
        .unwrap();

    clock.set(secs(12));
    let (first, second) = tokio::join!(
        cache.get_or_create_observed("config", calls.gated(&gate, 100), secs(20), &observer),
        cache.get_or_create_observed("config", calls.gated(&gate, 200), secs(20), &observer),
    );
    assert_eq!(first.unwrap(), 1);
    assert_eq!(second.unwrap(), 1);
    assert_eq!(calls.count(), 2);
    assert_eq!(cache.in_flight(), 1);

    gate.open();
    yield_until(|| cache.in_flight() == 0).await;

    clock.set(secs(13));
    let value = cache
        .get_or_create_observed("config", calls.numbered(), secs(20), &observer)
        .await
        .unwrap();
    assert_eq!(value, 100);
    assert_eq!(calls.count(), 2);

    insta::assert_debug_snapshot!(outcomes.take(), @r###"
    [
        Refreshed,
        Refreshed,
        Cached,
    ]
    "###);
}

#[tokio::test]
async fn test_hard_expiry_without_margin_blocks() {
    let (cache, clock) = manual_cache::<&str, usize>(None, 0);
    let calls = Calls::new();
    let gate = Gate::new();
    let outcomes = Outcomes::default();
    let observer = outcomes.observer();

    cache
        .get_or_create("metadata", calls.numbered(), secs(20))
        .await
        .unwrap();

    // Without a margin, there is no refresh before the expiry.
    clock.set(secs(19));
    let value = cache
        .get_or_create_observed("metadata", calls.numbered(), secs(20), &observer)
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(cache.in_flight(), 0);

    clock.set(secs(20));
    let (first, second, ()) = tokio::join!(
        cache.get_or_create_observed("metadata", calls.gated(&gate, 7), secs(20), &observer),
        cache.get_or_create_observed("metadata", calls.numbered(), secs(20), &observer),
        async { gate.open() },
    );
    assert_eq!(first.unwrap(), 7);
    assert_eq!(second.unwrap(), 7);
    assert_eq!(calls.count(), 2);

    insta::assert_debug_snapshot!(outcomes.take(), @r###"
    [
        Cached,
        Expired,
        Expired,
    ]
    "###);
}

#[tokio::test]
async fn test_scheduled_refresh() {
    let (cache, clock) = manual_cache::<&str, usize>(None, 0);
    let calls = Calls::new();
    let schedule = |_: &usize| Schedule::new(secs(10), secs(30));

    cache
        .get_or_refresh("token", calls.numbered(), schedule)
        .await
        .unwrap();

    clock.set(secs(9));
    let value = cache
        .get_or_refresh("token", calls.numbered(), schedule)
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(calls.count(), 1);

    clock.set(secs(10));
    let value = cache
        .get_or_refresh("token", calls.numbered(), schedule)
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(calls.count(), 2);

    yield_until(|| cache.in_flight() == 0).await;

    let entry = &cache.values()[0];
    assert_eq!(*entry.value(), 2);
    assert_eq!(entry.refresh_at(), Some(clock.origin() + secs(20)));
    assert_eq!(entry.expiry(), clock.origin() + secs(40));
}

#[tokio::test]
async fn test_scheduled_refresh_ignores_configured_margin() {
    let (cache, clock) = manual_cache::<&str, usize>(Some(secs(25)), 0);
    let calls = Calls::new();
    let outcomes = Outcomes::default();
    let observer = outcomes.observer();
    let schedule = |_: &usize| Schedule::new(secs(20), secs(30));

    cache
        .get_or_refresh_observed("token", calls.numbered(), schedule, &observer)
        .await
        .unwrap();

    clock.set(secs(10));
    cache
        .get_or_refresh_observed("token", calls.numbered(), schedule, &observer)
        .await
        .unwrap();

    assert_eq!(calls.count(), 1);
    insta::assert_debug_snapshot!(outcomes.take(), @r###"
    [
        New,
        Cached,
    ]
    "###);
}

#[derive(Clone, Debug, PartialEq)]
struct AccessToken {
    token: String,
    expires_in: Duration,
}

#[tokio::test]
async fn test_lifetime_derived_from_value() {
    let (cache, clock) = manual_cache::<&str, AccessToken>(Some(secs(5)), 0);
    let calls = Calls::new();
    let token = AccessToken {
        token: "eyJhbGciOi".into(),
        expires_in: secs(120),
    };

    let lifetime = || Lifetime::per_value(|token: &AccessToken| token.expires_in);
    let value = cache
        .get_or_create("maskinporten", calls.returning(token.clone()), lifetime())
        .await
        .unwrap();
    assert_eq!(value, token);

    let entry = &cache.values()[0];
    assert_eq!(entry.expiry(), clock.origin() + secs(120));
    assert_eq!(entry.refresh_at(), Some(clock.origin() + secs(115)));

    clock.set(secs(100));
    cache
        .get_or_create("maskinporten", calls.returning(token.clone()), lifetime())
        .await
        .unwrap();
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_unbounded_values_never_expire() {
    let (cache, clock) = manual_cache::<&str, &str>(Some(secs(10)), 0);
    let calls = Calls::new();

    cache
        .get_or_create("app", calls.returning("v1"), Lifetime::unbounded())
        .await
        .unwrap();

    clock.advance(secs(86400 * 365));
    let value = cache
        .get_or_create("app", calls.returning("v2"), Lifetime::unbounded())
        .await
        .unwrap();

    assert_eq!(value, "v1");
    assert_eq!(calls.count(), 1);
    assert_eq!(cache.values()[0].refresh_at(), None);
}

#[tokio::test(start_paused = true)]
async fn test_tokio_clock_follows_paused_time() {
    setup();
    let cache = RefreshCache::builder().clock(TokioClock).build();
    let calls = Calls::new();

    cache
        .get_or_create("a", calls.numbered(), secs(20))
        .await
        .unwrap();

    tokio::time::advance(secs(19)).await;
    let value = cache
        .get_or_create("a", calls.numbered(), secs(20))
        .await
        .unwrap();
    assert_eq!(value, 1);

    tokio::time::advance(secs(1)).await;
    let value = cache
        .get_or_create("a", calls.numbered(), secs(20))
        .await
        .unwrap();
    assert_eq!(value, 2);
}
