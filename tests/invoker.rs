mod common;

use common::TestError;
use faultguard_rs::metrics::{
    CIRCUIT_BREAKERS_OPEN, CIRCUIT_BREAKER_STATE, INVOKER_ERRORS_TOTAL, INVOKER_FALLBACKS_TOTAL, INVOKER_REQUESTS_TOTAL,
    INVOKER_REQUEST_DURATION, RETRY_ATTEMPTS_TOTAL, SYSTEM_HEALTH_CHECK,
};
use faultguard_rs::{
    AlertLevel, BreakerConfig, DependencyConfig, ErrorKind, FaultToleranceConfig, HealthLevel,
    InvokeError, Jitter, Resilience, RetryConfig, State,
};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Work = Box<dyn FnMut() -> BoxFuture<'static, Result<String, TestError>> + Send>;

fn failing(calls: &Arc<AtomicUsize>, kind: ErrorKind) -> Work {
    let calls = Arc::clone(calls);
    Box::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Err(TestError::with_kind(kind, "dependency failed")) })
    })
}

fn answering(calls: &Arc<AtomicUsize>, answer: &'static str) -> Work {
    let calls = Arc::clone(calls);
    Box::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(answer.to_string()) })
    })
}

fn context() -> Resilience {
    let primary = DependencyConfig::new("primary")
        .with_breaker(BreakerConfig {
            failure_threshold: 2,
            recovery_timeout_sec: 30,
            ..BreakerConfig::default()
        })
        .with_retry(RetryConfig {
            max_attempts: 2,
            base_delay: 0.1,
            max_delay: 1.0,
            jitter: Jitter::None,
            retry_budget_enabled: true,
            retry_budget_max_ratio: 1.0,
            ..RetryConfig::default()
        });
    let backup = DependencyConfig::new("backup").with_retry(RetryConfig::conservative());

    Resilience::from_config(FaultToleranceConfig {
        dependencies: vec![primary, backup],
        ..FaultToleranceConfig::default()
    })
    .expect("valid config")
}

#[tokio::test(start_paused = true)]
async fn test_fallback_serves_when_primary_exhausts_retries() {
    let ctx = context();
    let invoker = ctx.invoker();
    let primary_calls = Arc::new(AtomicUsize::new(0));
    let backup_calls = Arc::new(AtomicUsize::new(0));

    let result = invoker
        .invoke_with_fallback(
            "primary",
            failing(&primary_calls, ErrorKind::Unavailable),
            "backup",
            answering(&backup_calls, "from backup"),
        )
        .await;

    assert_eq!(result.ok().as_deref(), Some("from backup"));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 2);
    assert_eq!(backup_calls.load(Ordering::SeqCst), 1);

    let metrics = ctx.metrics();
    assert_eq!(metrics.get(INVOKER_REQUESTS_TOTAL).map(|m| m.len()), Some(2));
    assert_eq!(metrics.get(INVOKER_FALLBACKS_TOTAL).map(|m| m.len()), Some(1));
    assert_eq!(metrics.get(RETRY_ATTEMPTS_TOTAL).map(|m| m.len()), Some(1));

    let error = metrics.latest_sample(INVOKER_ERRORS_TOTAL).expect("error recorded");
    assert_eq!(error.labels["dependency"], "primary");
    assert_eq!(error.labels["error"], "retry_exhausted");

    let duration = metrics.latest_sample(INVOKER_REQUEST_DURATION).expect("duration recorded");
    assert_eq!(duration.labels["dependency"], "backup");
    assert_eq!(duration.labels["outcome"], "success");

    assert!(ctx.alerts(None, None, 10).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fallback_exhaustion_raises_critical_alert() {
    let ctx = context();
    let invoker = ctx.invoker();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = invoker
        .invoke_with_fallback(
            "primary",
            failing(&calls, ErrorKind::Timeout),
            "backup",
            failing(&calls, ErrorKind::Connection),
        )
        .await;

    match result {
        Err(InvokeError::FallbackExhausted { primary, fallback }) => {
            assert!(matches!(*primary, InvokeError::RetryExhausted { .. }));
            match *fallback {
                InvokeError::RetryExhausted { last_error, attempts } => {
                    assert_eq!(last_error.kind, ErrorKind::Connection);
                    assert_eq!(attempts.len(), 2);
                }
                other => panic!("unexpected fallback error {other:?}"),
            }
        }
        other => panic!("expected fallback exhaustion, got {other:?}"),
    }

    let critical = ctx.alerts(Some(AlertLevel::Critical), None, 10);
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].source, "invoker:primary");
    assert_eq!(critical[0].metadata["fallback"], "backup");
}

#[tokio::test(start_paused = true)]
async fn test_open_primary_is_skipped() {
    let ctx = context();
    let invoker = ctx.invoker();
    assert!(ctx.breakers().breaker("primary").force_open());

    let primary_calls = Arc::new(AtomicUsize::new(0));
    let backup_calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let result = invoker
            .invoke_with_fallback(
                "primary",
                answering(&primary_calls, "from primary"),
                "backup",
                answering(&backup_calls, "from backup"),
            )
            .await;
        assert_eq!(result.ok().as_deref(), Some("from backup"));
    }

    assert_eq!(primary_calls.load(Ordering::SeqCst), 0);
    assert_eq!(backup_calls.load(Ordering::SeqCst), 3);

    let error = ctx.metrics().latest_sample(INVOKER_ERRORS_TOTAL).expect("recorded");
    assert_eq!(error.labels["error"], "circuit_open");
}

fn with_primary(breaker: BreakerConfig, retry: RetryConfig) -> Resilience {
    let primary = DependencyConfig::new("primary")
        .with_breaker(breaker)
        .with_retry(retry);
    let backup = DependencyConfig::new("backup").with_retry(RetryConfig::conservative());

    Resilience::from_config(FaultToleranceConfig {
        dependencies: vec![primary, backup],
        ..FaultToleranceConfig::default()
    })
    .expect("valid config")
}

#[tokio::test(start_paused = true)]
async fn test_breaker_timeout_takes_the_fallback() {
    let ctx = with_primary(
        BreakerConfig {
            call_timeout_sec: 0.5,
            ..BreakerConfig::default()
        },
        RetryConfig {
            jitter: Jitter::None,
            ..RetryConfig::default()
        },
    );
    let invoker = ctx.invoker();
    let primary_calls = Arc::new(AtomicUsize::new(0));
    let backup_calls = Arc::new(AtomicUsize::new(0));

    let slow: Work = {
        let calls = Arc::clone(&primary_calls);
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, TestError>("too late".to_string())
            })
        })
    };

    let result = invoker
        .invoke_with_fallback(
            "primary",
            slow,
            "backup",
            answering(&backup_calls, "from backup"),
        )
        .await;

    assert_eq!(result.ok().as_deref(), Some("from backup"));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backup_calls.load(Ordering::SeqCst), 1);

    let error = ctx.metrics().latest_sample(INVOKER_ERRORS_TOTAL).expect("error recorded");
    assert_eq!(error.labels["dependency"], "primary");
    assert_eq!(error.labels["error"], "circuit_timeout");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_budget_takes_the_fallback() {
    let ctx = with_primary(
        BreakerConfig::default(),
        RetryConfig {
            max_attempts: 3,
            base_delay: 0.1,
            jitter: Jitter::None,
            retry_budget_enabled: true,
            retry_budget_max_ratio: 0.5,
            ..RetryConfig::default()
        },
    );
    let invoker = ctx.invoker();
    let primary_calls = Arc::new(AtomicUsize::new(0));
    let backup_calls = Arc::new(AtomicUsize::new(0));

    let result = invoker
        .invoke_with_fallback(
            "primary",
            failing(&primary_calls, ErrorKind::Unavailable),
            "backup",
            answering(&backup_calls, "from backup"),
        )
        .await;

    // One retry brings retries/requests to 1.0, past the 0.5 budget.
    assert_eq!(result.ok().as_deref(), Some("from backup"));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 2);
    assert_eq!(backup_calls.load(Ordering::SeqCst), 1);

    let error = ctx.metrics().latest_sample(INVOKER_ERRORS_TOTAL).expect("error recorded");
    assert_eq!(error.labels["error"], "budget_exhausted");
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_skips_fallback() {
    let ctx = context();
    let invoker = ctx.invoker();
    let primary_calls = Arc::new(AtomicUsize::new(0));
    let backup_calls = Arc::new(AtomicUsize::new(0));

    let config = RetryConfig {
        non_retryable: [ErrorKind::InvalidRequest].into_iter().collect(),
        ..RetryConfig::default()
    };
    invoker
        .register(DependencyConfig::new("strict").with_retry(config))
        .expect("valid dependency");

    let result = invoker
        .invoke_with_fallback(
            "strict",
            failing(&primary_calls, ErrorKind::InvalidRequest),
            "backup",
            answering(&backup_calls, "unused"),
        )
        .await;

    assert!(matches!(result, Err(InvokeError::NonRetryable { .. })));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backup_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_state_is_mirrored_to_gauge() {
    let ctx = context();
    let invoker = ctx.invoker();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let result = invoker
            .invoke("primary", failing(&calls, ErrorKind::Server))
            .await;
        assert!(matches!(result, Err(InvokeError::RetryExhausted { .. })));
    }

    assert_eq!(
        ctx.breaker_status("primary").map(|s| s.state),
        Some(State::Open)
    );
    let gauge = ctx
        .metrics()
        .latest_sample(CIRCUIT_BREAKER_STATE)
        .expect("gauge recorded");
    assert_eq!(gauge.value, 1.0);
    assert_eq!(gauge.labels["breaker"], "primary");

    let raised = ctx.alert_engine().evaluate_rules();
    assert!(raised.iter().any(|a| a.title == "Alert: circuit_breaker_open"));

    assert!(ctx.reset_breaker("primary"));
    assert_eq!(ctx.metrics().latest(CIRCUIT_BREAKER_STATE), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_alert_survives_another_breaker_closing() {
    let ctx = context();
    let breakers = ctx.breakers();
    assert!(breakers.breaker("primary").force_open());
    assert!(breakers.breaker("backup").force_open());
    assert!(ctx.reset_breaker("backup"));

    // The latest state sample is backup's close; primary is still open.
    assert_eq!(ctx.metrics().latest(CIRCUIT_BREAKER_STATE), Some(0.0));
    assert_eq!(ctx.metrics().latest(CIRCUIT_BREAKERS_OPEN), Some(1.0));
    let raised = ctx.alert_engine().evaluate_rules();
    assert!(raised.iter().any(|a| a.title == "Alert: circuit_breaker_open"));

    assert!(ctx.reset_breaker("primary"));
    assert_eq!(ctx.metrics().latest(CIRCUIT_BREAKERS_OPEN), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_health_reflects_open_breakers() {
    let ctx = context();
    let invoker = ctx.invoker();

    let report = invoker.health();
    assert_eq!(report.status, HealthLevel::Healthy);
    assert_eq!(report.score, 1.0);
    assert!(report.dependencies["primary"].retry_budget.is_some());
    assert!(report.dependencies["backup"].retry_budget.is_none());

    ctx.breakers().breaker("primary").force_open();
    let report = invoker.health();
    assert_eq!(report.status, HealthLevel::Degraded);
    assert_eq!(report.score, 0.5);
    assert!(!report.dependencies["primary"].available);
    assert_eq!(ctx.metrics().latest(SYSTEM_HEALTH_CHECK), Some(50.0));

    ctx.breakers().breaker("backup").force_open();
    assert_eq!(invoker.health().status, HealthLevel::Unhealthy);

    assert_eq!(
        invoker.retry_budget_stats().keys().cloned().collect::<Vec<_>>(),
        vec!["primary".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_is_not_a_dependency_failure() {
    let ctx = context();
    let invoker = ctx.invoker();
    invoker
        .register(DependencyConfig::new("slow").with_retry(RetryConfig {
            base_delay: 10.0,
            max_delay: 10.0,
            jitter: Jitter::None,
            ..RetryConfig::default()
        }))
        .expect("valid dependency");

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let primary_calls = Arc::new(AtomicUsize::new(0));
    let backup_calls = Arc::new(AtomicUsize::new(0));
    let result = invoker
        .invoke_with_fallback_and_cancel(
            "slow",
            failing(&primary_calls, ErrorKind::Timeout),
            "backup",
            answering(&backup_calls, "unused"),
            &token,
        )
        .await;

    assert!(matches!(result, Err(InvokeError::Cancelled)));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backup_calls.load(Ordering::SeqCst), 0);
    let status = ctx.breaker_status("slow").expect("breaker exists");
    assert_eq!(status.stats.total_calls(), 0);
    assert!(ctx.alerts(None, None, 10).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_dependency_is_created_with_defaults() {
    let ctx = context();
    let invoker = ctx.invoker();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = invoker.invoke("adhoc", answering(&calls, "ok")).await;
    assert_eq!(result.ok().as_deref(), Some("ok"));

    assert!(invoker.dependency_names().contains(&"adhoc".to_string()));
    let dependency = invoker.dependency("adhoc");
    assert_eq!(dependency.config().retry, ctx.config().retry);
    assert_eq!(dependency.breaker().config(), &ctx.config().breaker);

    let stats = ctx.stats();
    assert_eq!(stats.breakers.total, 3);
    assert_eq!(stats.breakers.closed, 3);
}
