use faultguard_rs::RetryBudget;
use std::time::Duration;

#[test]
fn test_ratio_gate() {
    let budget = RetryBudget::new(Duration::from_secs(3600), 0.1);
    for _ in 0..20 {
        budget.record_request();
    }

    budget.record_retry();
    assert!(budget.can_retry());
    assert!((budget.stats().ratio - 0.05).abs() < 1e-12);

    budget.record_retry();
    budget.record_retry();
    assert!(!budget.can_retry());

    let stats = budget.stats();
    assert_eq!((stats.requests, stats.retries), (20, 3));
    assert!((stats.ratio - 0.15).abs() < 1e-12);
    assert!(!stats.can_retry);
    assert_eq!(stats.ttl_sec, 3600);
}

#[test]
fn test_empty_budget_allows_retry() {
    let budget = RetryBudget::new(Duration::from_secs(60), 0.1);
    assert!(budget.can_retry());

    // Retries without any request in the window do not block.
    budget.record_retry();
    assert!(budget.can_retry());
}

#[test]
fn test_ratio_equal_to_cap_refuses() {
    let budget = RetryBudget::new(Duration::from_secs(60), 0.5);
    budget.record_request();
    budget.record_request();
    budget.record_retry();
    assert!(!budget.can_retry());
}

#[tokio::test(start_paused = true)]
async fn test_expired_entries_never_count() {
    let budget = RetryBudget::new(Duration::from_secs(10), 0.1);
    budget.record_request();
    for _ in 0..5 {
        budget.record_retry();
    }
    assert!(!budget.can_retry());

    tokio::time::advance(Duration::from_secs(11)).await;

    assert!(budget.can_retry());
    let stats = budget.stats();
    assert_eq!((stats.requests, stats.retries), (0, 0));

    // Fresh traffic is judged only against the new window.
    for _ in 0..10 {
        budget.record_request();
    }
    assert!(budget.can_retry());
    assert_eq!(budget.stats().ratio, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_window_slides() {
    let budget = RetryBudget::new(Duration::from_secs(10), 0.5);
    budget.record_request();
    budget.record_retry();

    tokio::time::advance(Duration::from_secs(6)).await;
    budget.record_request();
    budget.record_request();
    // 1 retry / 3 requests
    assert!(budget.can_retry());
    budget.record_retry();
    // 2 / 3
    assert!(!budget.can_retry());

    tokio::time::advance(Duration::from_secs(5)).await;
    // The first request and retry fell out: 1 / 2
    let stats = budget.stats();
    assert_eq!((stats.requests, stats.retries), (2, 1));
    assert!(!budget.can_retry());
}
