use faultguard_rs::prelude::*;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// Custom error type that implements Error trait
#[derive(Debug)]
struct ServiceError(String);

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service error: {}", self.0)
    }
}

impl Error for ServiceError {}

impl Classify for ServiceError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Unavailable
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Trip after 3 consecutive failures, probe again after 2 seconds
    let breaker = CircuitBreaker::builder("inventory")
        .failure_threshold(3)
        .success_threshold(2)
        .recovery_timeout_sec(2)
        .call_timeout(Duration::from_secs(1))
        .build();

    println!("Circuit initial state: {}", breaker.current_state());

    let counter = AtomicU32::new(0);
    let call_service = || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            // The first six calls fail, then the service recovers
            if n <= 6 {
                Err(ServiceError("External service error".to_string()))
            } else {
                Ok(format!("response #{n}"))
            }
        }
    };

    for i in 1..=12 {
        print!("Attempt {i}: ");

        match breaker.call(call_service).await {
            Ok(result) => println!("call succeeded with result: {result}"),
            Err(BreakerError::Open { retry_after, .. }) => {
                println!("circuit is open, retry in {retry_after:?}");
                tokio::time::sleep(Duration::from_millis(700)).await;
            }
            Err(BreakerError::Timeout { timeout, .. }) => {
                println!("call timed out after {timeout:?}");
            }
            Err(BreakerError::Operation(err)) => println!("call failed with error: {err}"),
        }

        println!("  state: {}", breaker.current_state());
    }

    let stats = breaker.stats();
    println!(
        "\nTotal calls: {}, success rate: {:.0}%",
        stats.total_calls(),
        stats.success_rate() * 100.0
    );

    let status = breaker.status();
    println!("Recent transitions:");
    for change in &status.recent_state_changes {
        println!("  {} -> {}", change.from, change.to);
    }

    // Retries inside one call
    let retrier = Retrier::new(RetryConfig {
        max_attempts: 4,
        base_delay: 0.05,
        strategy: BackoffStrategy::Exponential,
        jitter: Jitter::Equal,
        ..RetryConfig::default()
    });
    let flaky = AtomicU32::new(0);
    let result = retrier
        .execute(|| {
            let n = flaky.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ServiceError("temporarily unavailable".to_string()))
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;
    println!(
        "\nRetrier result: {:?} after {} attempts",
        result.ok(),
        flaky.load(Ordering::SeqCst)
    );
}
