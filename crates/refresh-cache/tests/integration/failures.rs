use refresh_cache::CacheError;

use crate::{Calls, Gate, Outcomes, manual_cache, secs, yield_until};

#[tokio::test]
async fn test_blocking_failure_is_returned_and_retryable() {
    let (cache, _clock) = manual_cache::<&str, String>(None, 0);
    let calls = Calls::new();
    let outcomes = Outcomes::default();
    let observer = outcomes.observer();

    let err = cache
        .get_or_create_observed(
            "metadata",
            calls.failing("metadata service returned 503"),
            secs(60),
            &observer,
        )
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "value factory failed: metadata service returned 503"
    );
    assert!(cache.is_empty());
    assert_eq!(cache.in_flight(), 0);

    let value = cache
        .get_or_create_observed(
            "metadata",
            calls.returning("metadata".to_owned()),
            secs(60),
            &observer,
        )
        .await
        .unwrap();
    assert_eq!(value, "metadata");
    assert_eq!(calls.count(), 2);

    insta::assert_debug_snapshot!(outcomes.take(), @r###"
    [
        Error,
        New,
    ]
    "###);
}

#[tokio::test]
async fn test_failure_does_not_affect_other_keys() {
    let (cache, _clock) = manual_cache::<&str, u32>(None, 0);
    let calls = Calls::new();

    cache
        .get_or_create("a", calls.returning(1), secs(60))
        .await
        .unwrap();
    let (a, b) = tokio::join!(
        cache.get_or_create("a", calls.failing("unused"), secs(60)),
        cache.get_or_create("b", calls.failing("upstream unavailable"), secs(60)),
    );

    assert_eq!(a.unwrap(), 1);
    assert!(b.is_err());
    assert_eq!(cache.keys(), ["a"]);
}

#[tokio::test]
async fn test_background_failure_keeps_stale_value() {
    let (cache, clock) = manual_cache::<&str, u32>(Some(secs(10)), 0);
    let calls = Calls::new();
    let gate = Gate::new();
    let outcomes = Outcomes::default();
    let observer = outcomes.observer();

    cache
        .get_or_create("token", calls.returning(1), secs(20))
        .await
        .unwrap();

    clock.set(secs(12));
    let value = cache
        .get_or_create_observed(
            "token",
            calls.gated_failing(&gate, "unauthorized"),
            secs(20),
            &observer,
        )
        .await
        .unwrap();
    assert_eq!(value, 1);

    gate.open();
    yield_until(|| cache.in_flight() == 0).await;

    // Still servable until its expiry. Every lookup in the refresh window tries again.
    clock.set(secs(19));
    let value = cache
        .get_or_create_observed("token", calls.returning(2), secs(20), &observer)
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(calls.count(), 3);

    yield_until(|| cache.in_flight() == 0).await;
    assert_eq!(*cache.values()[0].value(), 2);

    insta::assert_debug_snapshot!(outcomes.take(), @r###"
    [
        Refreshed,
        Error,
        Refreshed,
    ]
    "###);
}

#[tokio::test]
async fn test_panicking_factory_aborts_fetch() {
    let (cache, _clock) = manual_cache::<&str, u32>(None, 0);

    let result = cache
        .get_or_create(
            "config",
            || async {
                if true {
                    panic!("factory exploded");
                }
                Ok(0)
            },
            secs(60),
        )
        .await;

    assert!(matches!(result, Err(CacheError::Aborted)));
    assert_eq!(cache.in_flight(), 0);

    let value = cache
        .get_or_create("config", || async { Ok(1) }, secs(60))
        .await
        .unwrap();
    assert_eq!(value, 1);
}

#[tokio::test]
async fn test_panicking_background_refresh_is_reported() {
    let (cache, clock) = manual_cache::<&str, u32>(Some(secs(10)), 0);
    let calls = Calls::new();
    let outcomes = Outcomes::default();
    let observer = outcomes.observer();

    cache
        .get_or_create("token", calls.returning(1), secs(20))
        .await
        .unwrap();

    clock.set(secs(12));
    let value = cache
        .get_or_create_observed(
            "token",
            || async {
                if true {
                    panic!("token endpoint exploded");
                }
                Ok(2)
            },
            secs(20),
            &observer,
        )
        .await
        .unwrap();
    assert_eq!(value, 1);

    yield_until(|| cache.in_flight() == 0).await;
    assert_eq!(*cache.values()[0].value(), 1);

    insta::assert_debug_snapshot!(outcomes.take(), @r###"
    [
        Refreshed,
        Error,
    ]
    "###);
}

#[tokio::test]
async fn test_dropped_caller_does_not_cancel_fetch() {
    let (cache, _clock) = manual_cache::<&str, usize>(None, 0);
    let calls = Calls::new();
    let gate = Gate::new();

    let lookup = cache.get_or_create("metadata", calls.gated(&gate, 5), secs(60));
    let timed_out = tokio::time::timeout(secs(0), lookup).await;
    assert!(timed_out.is_err());
    assert_eq!(cache.in_flight(), 1);

    gate.open();
    yield_until(|| cache.in_flight() == 0).await;

    let value = cache
        .get_or_create("metadata", calls.numbered(), secs(60))
        .await
        .unwrap();
    assert_eq!(value, 5);
    assert_eq!(calls.count(), 1);
}
