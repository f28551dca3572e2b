use faultguard_rs::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
[alerts]
evaluation_interval_sec = 1

[[dependencies]]
name = "pricing-primary"
breaker = { failure_threshold = 2, recovery_timeout_sec = 5 }
retry = { max_attempts = 2, base_delay = 0.05, jitter = "none", retry_budget_enabled = true, retry_budget_max_ratio = 0.5 }

[[dependencies]]
name = "pricing-cache"
retry = { max_attempts = 1, non_retryable = ["invalid_request"] }
"#;

#[derive(Debug)]
enum PricingError {
    Down,
    BadSku(String),
}

impl fmt::Display for PricingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricingError::Down => f.write_str("pricing service unavailable"),
            PricingError::BadSku(sku) => write!(f, "unknown sku {sku}"),
        }
    }
}

impl std::error::Error for PricingError {}

impl Classify for PricingError {
    fn kind(&self) -> ErrorKind {
        match self {
            PricingError::Down => ErrorKind::Unavailable,
            PricingError::BadSku(_) => ErrorKind::InvalidRequest,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = FaultToleranceConfig::from_toml_str(CONFIG)?;
    let ctx = Resilience::from_config(config)?;
    ctx.alert_engine().add_callback(|alert| {
        println!("ALERT [{}] {}: {}", alert.level, alert.title, alert.message);
    });
    ctx.start();

    let invoker = ctx.invoker();
    let primary_calls = AtomicU32::new(0);

    for order in 1..=5 {
        let price = invoker
            .invoke_with_fallback(
                "pricing-primary",
                || {
                    primary_calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<f64, _>(PricingError::Down) }
                },
                "pricing-cache",
                || async { Ok(9.99) },
            )
            .await;

        match price {
            Ok(price) => println!("order {order}: price {price:.2}"),
            Err(err) => println!("order {order}: failed: {err}"),
        }
    }
    println!(
        "primary was called {} times",
        primary_calls.load(Ordering::SeqCst)
    );

    // A bad request is not worth a fallback.
    let result = invoker
        .invoke_with_fallback(
            "pricing-cache",
            || async { Err::<f64, _>(PricingError::BadSku("X-1".to_string())) },
            "pricing-primary",
            || async { Ok(0.0) },
        )
        .await;
    println!("bad sku: {:?}", result.map_err(|e| e.label()));

    // Let the alert loop observe the open breaker.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let health = invoker.health();
    println!("\nhealth: {:?} ({:.0}%)", health.status, health.score * 100.0);
    for (name, dependency) in &health.dependencies {
        println!(
            "  {name}: {} available={} success_rate={:.2}",
            dependency.state, dependency.available, dependency.success_rate
        );
    }

    ctx.trigger_alert(
        "Demo finished",
        "shutting down",
        AlertLevel::Info,
        "demo",
        BTreeMap::new(),
    );
    ctx.shutdown().await;
    Ok(())
}
