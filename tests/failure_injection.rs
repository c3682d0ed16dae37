//! Failure injection tests for the policy pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use resilience_engine::config::{EngineConfig, ExpiryMode, PolicySet, TimeoutConfig};
use resilience_engine::{
    CallOptions, CircuitState, Deadline, ErrorKind, ExecuteError, Pipeline,
};

mod common;

use common::{fail_after, succeed_after, DependencyDown, Invocations};

const KEY: &str = "inventory";

#[tokio::test]
async fn test_success_and_operation_error_pass_through() {
    let pipeline = common::pipeline(
        Some(common::timeout(1_000)),
        Some(common::bulkhead(4, 4, None)),
        None,
        Some(common::breaker(10, 1_000)),
    );

    let ok = pipeline
        .execute(KEY, || succeed_after(Duration::ZERO, "stock"))
        .await;
    assert_eq!(ok.unwrap(), "stock");

    let err = pipeline
        .execute(KEY, || fail_after::<()>(Duration::ZERO, "db gone"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operation);
    assert_eq!(err.into_operation_error(), Some(DependencyDown("db gone")));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_returns_at_deadline() {
    let pipeline = common::pipeline(Some(common::timeout(3_000)), None, None, None);

    let start = Instant::now();
    let err = pipeline
        .execute(KEY, || succeed_after(Duration::from_millis(5_000), ()))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Timeout { deadline } if deadline == Duration::from_millis(3_000)));
    assert_eq!(start.elapsed(), Duration::from_millis(3_000));
}

#[tokio::test]
async fn test_breaker_opens_on_the_eleventh_call() {
    let pipeline = common::pipeline(None, None, None, Some(common::breaker(10, 30_000)));
    let breaker_state = || pipeline.breaker(KEY).map(|b| b.state());

    for _ in 0..5 {
        pipeline
            .execute(KEY, || succeed_after(Duration::ZERO, ()))
            .await
            .unwrap();
    }
    for failure in 1..=6 {
        let err = pipeline
            .execute(KEY, || fail_after::<()>(Duration::ZERO, "boom"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);

        let expected = if failure < 6 {
            CircuitState::Closed
        } else {
            CircuitState::Open
        };
        assert_eq!(breaker_state(), Some(expected), "after failure {failure}");
    }

    let invocations = Invocations::default();
    let probe = invocations.clone();
    let err = pipeline
        .execute(KEY, move || {
            probe.hit();
            succeed_after(Duration::ZERO, ())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(invocations.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reset_timeout_lets_one_trial_through() {
    let pipeline = common::pipeline(None, None, None, Some(common::breaker(1, 10_000)));
    for _ in 0..2 {
        let _ = pipeline
            .execute(KEY, || fail_after::<()>(Duration::ZERO, "boom"))
            .await;
    }
    let breaker = pipeline.breaker(KEY).unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(9_999)).await;
    let err = pipeline
        .execute(KEY, || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);

    tokio::time::advance(Duration::from_millis(1)).await;
    let trial = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .execute(KEY, || succeed_after(Duration::from_millis(500), "recovered"))
                .await
        })
    };
    common::until(|| breaker.snapshot().trial_in_flight).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let invocations = Invocations::default();
    let probe = invocations.clone();
    let concurrent = pipeline
        .execute(KEY, move || {
            probe.hit();
            succeed_after(Duration::ZERO, "stampede")
        })
        .await
        .unwrap_err();
    assert_eq!(concurrent.kind(), ErrorKind::CircuitOpen);
    assert_eq!(invocations.count(), 0);

    assert_eq!(trial.await.unwrap().unwrap(), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_expired_trial_counts_as_failure() {
    let mut breaker = common::breaker(1, 1_000);
    breaker.trial_timeout_ms = Some(100);
    let pipeline = common::pipeline(Some(common::timeout(5_000)), None, None, Some(breaker));

    for _ in 0..2 {
        let _ = pipeline
            .execute(KEY, || fail_after::<()>(Duration::ZERO, "boom"))
            .await;
    }
    tokio::time::advance(Duration::from_millis(1_000)).await;

    let start = Instant::now();
    let err = pipeline
        .execute(KEY, || succeed_after(Duration::from_millis(1_000), ()))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::Timeout { deadline } if deadline == Duration::from_millis(100)));
    assert_eq!(start.elapsed(), Duration::from_millis(100));
    assert_eq!(pipeline.breaker(KEY).unwrap().state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_feed_the_breaker() {
    let pipeline = common::pipeline(
        Some(common::timeout(50)),
        None,
        None,
        Some(common::breaker(1, 1_000)),
    );
    for _ in 0..2 {
        let err = pipeline
            .execute(KEY, || succeed_after(Duration::from_millis(200), ()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
    assert_eq!(pipeline.breaker(KEY).unwrap().state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_admission_rejections_do_not_feed_the_breaker() {
    let pipeline = common::pipeline(
        None,
        None,
        Some(common::fixed_rate(1, 60_000)),
        Some(common::breaker(1, 1_000)),
    );

    let _ = pipeline
        .execute(KEY, || fail_after::<()>(Duration::ZERO, "boom"))
        .await;
    for _ in 0..10 {
        let err = pipeline
            .execute(KEY, || fail_after::<()>(Duration::ZERO, "boom"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    let snapshot = pipeline.breaker(KEY).unwrap().snapshot();
    assert_eq!(snapshot.failures, 1);
    assert_eq!(snapshot.successes, 0);
    assert_eq!(snapshot.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_consumes_no_admission() {
    let pipeline = common::pipeline(
        None,
        None,
        Some(common::fixed_rate(3, 60_000)),
        Some(common::breaker(1, 10_000)),
    );

    for _ in 0..2 {
        let _ = pipeline
            .execute(KEY, || fail_after::<()>(Duration::ZERO, "boom"))
            .await;
    }
    for _ in 0..5 {
        let err = pipeline
            .execute(KEY, || succeed_after(Duration::ZERO, ()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    // Same rate window: the third token is still there for the trial.
    tokio::time::advance(Duration::from_millis(10_000)).await;
    pipeline
        .execute(KEY, || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap();

    let err = pipeline
        .execute(KEY, || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap_err();
    match err {
        ExecuteError::RateLimited { retry_after } => {
            assert_eq!(retry_after, Duration::from_millis(50_000));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_key_separates_callers() {
    let pipeline = common::pipeline(None, None, Some(common::fixed_rate(1, 1_000)), None);

    let alice = CallOptions::new().with_rate_limit_key("alice");
    let bob = CallOptions::new().with_rate_limit_key("bob");

    pipeline
        .execute_with(KEY, alice.clone(), || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap();
    pipeline
        .execute_with(KEY, bob, || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap();
    let err = pipeline
        .execute_with(KEY, alice, || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
}

#[tokio::test(start_paused = true)]
async fn test_bulkhead_rejection_is_distinct() {
    let pipeline = common::pipeline(
        None,
        Some(common::bulkhead(1, 0, None)),
        None,
        Some(common::breaker(1, 1_000)),
    );

    let holder = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .execute(KEY, || succeed_after(Duration::from_millis(100), ()))
                .await
        })
    };
    common::until(|| pipeline.bulkhead_stats(KEY).is_some_and(|s| s.active == 1)).await;

    let err = pipeline
        .execute(KEY, || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BulkheadRejected);

    holder.await.unwrap().unwrap();
    let snapshot = pipeline.breaker(KEY).unwrap().snapshot();
    assert_eq!((snapshot.successes, snapshot.failures), (1, 0));
    assert_eq!(pipeline.bulkhead_stats(KEY).unwrap().active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_detached_operation_keeps_its_slot() {
    let mut config = EngineConfig::default();
    config.defaults.timeout = Some(TimeoutConfig {
        deadline_ms: 100,
        on_expiry: ExpiryMode::Detach,
        ..TimeoutConfig::default()
    });
    config.defaults.bulkhead = Some(common::bulkhead(1, 0, None));
    let pipeline = Pipeline::new(config).unwrap();

    let err = pipeline
        .execute(KEY, || succeed_after(Duration::from_millis(500), ()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(pipeline.detached_in_flight(), 1);
    assert_eq!(pipeline.bulkhead_stats(KEY).unwrap().active, 1);

    let err = pipeline
        .execute(KEY, || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BulkheadRejected);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pipeline.detached_in_flight(), 0);
    assert_eq!(pipeline.bulkhead_stats(KEY).unwrap().active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_operation_frees_its_slot() {
    let pipeline = common::pipeline(
        Some(common::timeout(100)),
        Some(common::bulkhead(1, 0, None)),
        None,
        None,
    );
    let err = pipeline
        .execute(KEY, || succeed_after(Duration::from_millis(500), ()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(pipeline.bulkhead_stats(KEY).unwrap().active, 0);
    assert_eq!(pipeline.detached_in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_per_call_deadline_override() {
    let pipeline = common::pipeline(Some(common::timeout(5_000)), None, None, None);
    let options = CallOptions::new().with_deadline(Deadline::from_millis(20).unwrap());

    let start = Instant::now();
    let err = pipeline
        .execute_with(KEY, options, || succeed_after(Duration::from_millis(1_000), ()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(start.elapsed(), Duration::from_millis(20));
}

#[tokio::test]
async fn test_fallback_degrades_without_touching_statistics() {
    let pipeline = common::pipeline(None, None, None, Some(common::breaker(1, 60_000)));

    let completed = pipeline
        .execute_with_fallback(
            KEY,
            CallOptions::default(),
            || fail_after::<&str>(Duration::ZERO, "boom"),
            |err| {
                assert_eq!(err.kind(), ErrorKind::Operation);
                "cached"
            },
        )
        .await;
    assert_eq!(completed.value, "cached");
    assert_eq!(completed.degraded_from, Some(ErrorKind::Operation));
    let snapshot = pipeline.breaker(KEY).unwrap().snapshot();
    assert_eq!((snapshot.successes, snapshot.failures), (0, 1));

    let _ = pipeline
        .execute(KEY, || fail_after::<()>(Duration::ZERO, "boom"))
        .await;
    let completed = pipeline
        .execute_with_fallback(
            KEY,
            CallOptions::default(),
            || succeed_after(Duration::ZERO, "live"),
            |_| "cached",
        )
        .await;
    assert_eq!(completed.degraded_from, Some(ErrorKind::CircuitOpen));
    assert!(completed.is_degraded());

    let fresh = pipeline
        .execute_with_fallback(
            "other",
            CallOptions::default(),
            || succeed_after(Duration::ZERO, "live"),
            |_| "cached",
        )
        .await;
    assert_eq!(fresh.into_value(), "live");
}

#[tokio::test(start_paused = true)]
async fn test_readiness_follows_critical_breakers() {
    let mut config = EngineConfig::default();
    config.dependencies.insert(
        "db".into(),
        PolicySet {
            circuit_breaker: Some(common::breaker(1, 1_000)),
            ..PolicySet::default()
        },
    );
    let mut optional = common::breaker(1, 1_000);
    optional.readiness_critical = false;
    config.dependencies.insert(
        "recommendations".into(),
        PolicySet {
            circuit_breaker: Some(optional),
            ..PolicySet::default()
        },
    );
    let pipeline = Pipeline::new(config).unwrap();
    assert!(pipeline.get_health().ready);

    for _ in 0..2 {
        let _ = pipeline
            .execute("recommendations", || fail_after::<()>(Duration::ZERO, "boom"))
            .await;
    }
    assert!(pipeline.get_health().ready);

    for _ in 0..2 {
        let _ = pipeline
            .execute("db", || fail_after::<()>(Duration::ZERO, "boom"))
            .await;
    }
    let health = pipeline.get_health();
    assert!(!health.ready);
    assert!(health.live);
    assert_eq!(pipeline.get_health(), health);
    assert!(!pipeline.health().cached_ready());

    tokio::time::advance(Duration::from_millis(1_000)).await;
    assert!(!pipeline.get_health().ready);
    pipeline
        .execute("db", || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap();
    assert!(pipeline.health().cached_ready());
    assert!(pipeline.get_health().ready);
}

#[tokio::test(start_paused = true)]
async fn test_unconfigured_keys_do_not_gate_readiness_or_accumulate() {
    let mut config = EngineConfig::default();
    config.defaults.circuit_breaker = Some(common::breaker(1, 60_000));
    config.dependencies.insert("db".into(), PolicySet::default());
    let pipeline = Pipeline::new(config).unwrap();

    for i in 0..1_000 {
        pipeline
            .execute(&format!("tenant-{i}"), || succeed_after(Duration::ZERO, ()))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        let _ = pipeline
            .execute("typo-key", || fail_after::<()>(Duration::ZERO, "boom"))
            .await;
    }
    assert_eq!(pipeline.breaker("typo-key").unwrap().state(), CircuitState::Open);
    assert!(pipeline.get_health().ready);
    assert_eq!(pipeline.health().critical_keys(), vec!["db"]);
    assert!(pipeline.on_transition("watched", |_| {}));
    assert_eq!(pipeline.keys().len(), 1_003);

    tokio::time::advance(Duration::from_secs(3_600)).await;
    pipeline
        .execute("db", || succeed_after(Duration::ZERO, ()))
        .await
        .unwrap();

    assert_eq!(pipeline.keys(), vec!["db", "watched"]);
    assert_eq!(pipeline.sweep_idle_keys(), 0);
}

#[tokio::test]
async fn test_transition_observers_are_isolated() {
    let pipeline = common::pipeline(None, None, None, Some(common::breaker(1, 60_000)));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let panics = Arc::new(AtomicUsize::new(0));
    {
        let panics = panics.clone();
        assert!(pipeline.on_transition(KEY, move |_| {
            panics.fetch_add(1, Ordering::SeqCst);
            panic!("observer bug");
        }));
    }
    {
        let seen = seen.clone();
        assert!(pipeline.on_transition(KEY, move |event| {
            seen.lock().unwrap().push((event.from, event.to));
        }));
    }

    for _ in 0..2 {
        let err = pipeline
            .execute(KEY, || fail_after::<()>(Duration::ZERO, "boom"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);
    }

    assert_eq!(panics.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(CircuitState::Closed, CircuitState::Open)]
    );
}

#[tokio::test]
async fn test_on_transition_without_breaker() {
    let pipeline = common::pipeline(None, None, None, None);
    assert!(!pipeline.on_transition(KEY, |_| {}));
}
