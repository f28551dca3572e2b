use faultguard_rs::{
    AlertLevel, BackoffStrategy, Condition, ConfigError, ErrorKind, FaultToleranceConfig, Jitter,
    Resilience,
};
use std::time::Duration;

const FULL: &str = r#"
[breaker]
failure_threshold = 3
recovery_timeout_sec = 20
success_threshold = 2
call_timeout_sec = 2.5

[retry]
max_attempts = 4
base_delay = 0.5
max_delay = 8.0
multiplier = 3.0
strategy = "fibonacci"
jitter = "decorrelated"
non_retryable = ["invalid_request", "unauthorized"]

[metrics]
capacity = 50

[alerts]
evaluation_interval_sec = 5
default_rules = false

[[alerts.rules]]
name = "slow_calls"
metric = "invoker_request_duration"
condition = ">="
threshold = 12.5
level = "warning"
cooldown_sec = 90

[[alerts.rules]]
name = "legacy"
metric_name = "invoker_errors_total"
condition = "!="
threshold = 0.0
level = "critical"

[[dependencies]]
name = "primary"
breaker = { failure_threshold = 5 }
retry = { max_attempts = 3, retry_budget_enabled = true, retry_budget_ttl_sec = 600, retry_budget_max_ratio = 0.2 }

[[dependencies]]
name = "fallback"
retry = { strategy = "linear", jitter = "none" }
"#;

#[test]
fn test_full_document_parses() {
    let config = FaultToleranceConfig::from_toml_str(FULL).expect("valid config");

    assert_eq!(config.breaker.failure_threshold, 3);
    assert_eq!(config.breaker.call_timeout(), Duration::from_millis(2500));
    assert_eq!(config.retry.strategy, BackoffStrategy::Fibonacci);
    assert_eq!(config.retry.jitter, Jitter::Decorrelated);
    assert_eq!(
        config.retry.non_retryable.as_slice(),
        &[ErrorKind::InvalidRequest, ErrorKind::Unauthorized]
    );
    assert_eq!(config.retry.retryable.len(), ErrorKind::ALL.len());
    assert_eq!(config.metrics.capacity, 50);
    assert!(config.metrics.register_defaults);
    assert_eq!(config.alerts.evaluation_interval(), Duration::from_secs(5));

    let rules = &config.alerts.rules;
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].condition, Condition::Ge);
    assert_eq!(rules[0].cooldown_sec, 90);
    assert_eq!(rules[1].metric_name, "invoker_errors_total");
    assert_eq!(rules[1].level, AlertLevel::Critical);
    assert_eq!(rules[1].cooldown_sec, 300);
    assert!(rules[1].enabled);

    let primary = config.dependency("primary");
    assert_eq!(primary.breaker.failure_threshold, 5);
    assert_eq!(primary.breaker.recovery_timeout_sec, 60);
    assert!(primary.retry.retry_budget_enabled);
    assert_eq!(primary.retry.retry_budget_ttl_sec, 600);

    let fallback = config.dependency("fallback");
    assert_eq!(fallback.retry.strategy, BackoffStrategy::Linear);
    assert!(!fallback.retry.retry_budget_enabled);

    // Unknown dependencies inherit the top-level sections.
    let other = config.dependency("other");
    assert_eq!(other.name, "other");
    assert_eq!(other.breaker, config.breaker);
    assert_eq!(other.retry, config.retry);
}

#[test]
fn test_empty_document_uses_defaults() {
    let config = FaultToleranceConfig::from_toml_str("").expect("empty config");
    assert_eq!(config, FaultToleranceConfig::default());
    assert_eq!(config.breaker.failure_threshold, 5);
    assert_eq!(config.breaker.recovery_timeout_sec, 60);
    assert_eq!(config.breaker.success_threshold, 3);
    assert_eq!(config.retry.retry_budget_max_ratio, 0.1);
    assert_eq!(config.alerts.history_capacity, 1000);
}

#[test]
fn test_out_of_range_values_are_rejected() {
    let cases = [
        ("[breaker]\nfailure_threshold = 0", "breaker.failure_threshold"),
        ("[breaker]\ncall_timeout_sec = 0.0", "breaker.call_timeout_sec"),
        ("[retry]\nmax_attempts = 0", "retry.max_attempts"),
        ("[retry]\nbase_delay = 5.0\nmax_delay = 1.0", "retry.max_delay"),
        ("[retry]\nmultiplier = 0.0", "retry.multiplier"),
        ("[retry]\nretry_budget_max_ratio = 0.0", "retry.retry_budget_max_ratio"),
        ("[metrics]\ncapacity = 0", "metrics.capacity"),
        ("[alerts]\nevaluation_interval_sec = 0", "alerts.evaluation_interval_sec"),
        (
            "[[dependencies]]\nname = \"p\"\nretry = { max_attempts = 0 }",
            "dependencies.p.retry.max_attempts",
        ),
    ];

    for (source, expected) in cases {
        match FaultToleranceConfig::from_toml_str(source) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
            other => panic!("{source:?}: expected invalid {expected}, got {other:?}"),
        }
    }
}

#[test]
fn test_malformed_documents_fail_to_parse() {
    for source in [
        "[retry]\nstrategy = \"quadratic\"",
        "[[alerts.rules]]\nname = \"r\"\nmetric = \"m\"\ncondition = \"=>\"\nthreshold = 1.0\nlevel = \"info\"",
        "[breaker]\nfailure_threshold = \"three\"",
    ] {
        assert!(matches!(
            FaultToleranceConfig::from_toml_str(source),
            Err(ConfigError::Parse(_))
        ));
    }
}

#[test]
fn test_context_refuses_invalid_config() {
    let mut config = FaultToleranceConfig::default();
    config.breaker.success_threshold = 0;
    assert!(Resilience::from_config(config).is_err());
}

#[tokio::test]
async fn test_context_installs_configured_rules() {
    let config = FaultToleranceConfig::from_toml_str(FULL).expect("valid config");
    let ctx = Resilience::from_config(config).expect("valid config");

    let names: Vec<String> = ctx
        .alert_engine()
        .rules()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["slow_calls", "legacy"]);
    assert_eq!(ctx.alert_engine().interval(), Duration::from_secs(5));
    assert_eq!(ctx.metrics().capacity(), 50);
}
