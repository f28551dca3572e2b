//! Prometheus text exposition of breaker and metric state.

use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::context::Resilience;

type GaugeFamily = Family<Vec<(String, String)>, Gauge<f64, AtomicU64>>;

/// Renders breaker state, breaker call counters and the latest value of every
/// registered metric in the Prometheus text format.
///
/// Metric values are exported as gauges under a `faultguard_` prefix, labelled
/// with the labels of their latest sample.
pub fn encode_text(ctx: &Resilience) -> Result<String, std::fmt::Error> {
    let mut registry = Registry::with_prefix("faultguard");

    let state = GaugeFamily::default();
    let calls = GaugeFamily::default();
    registry.register(
        "breaker_state",
        "Breaker state (0 closed, 1 open, 2 half-open)",
        state.clone(),
    );
    registry.register("breaker_calls", "Calls seen by each breaker", calls.clone());

    for (name, status) in ctx.all_breaker_status() {
        state
            .get_or_create(&vec![("breaker".to_string(), name.clone())])
            .set(status.state.as_gauge());
        for (outcome, count) in [
            ("success", status.stats.success_calls()),
            ("failure", status.stats.fail_calls()),
        ] {
            calls
                .get_or_create(&vec![
                    ("breaker".to_string(), name.clone()),
                    ("outcome".to_string(), outcome.to_string()),
                ])
                .set(count as f64);
        }
    }

    let metrics = ctx.metrics();
    for name in metrics.names() {
        let Some(metric) = metrics.get(&name) else {
            continue;
        };
        let family = GaugeFamily::default();
        registry.register(name.as_str(), metric.description(), family.clone());
        if let Some(sample) = metric.latest() {
            let labels: Vec<(String, String)> = sample.labels.into_iter().collect();
            family.get_or_create(&labels).set(sample.value);
        }
    }

    let mut out = String::new();
    encode(&mut out, &registry)?;
    Ok(out)
}
