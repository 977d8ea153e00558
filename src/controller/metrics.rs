//! Prometheus metrics for the emissions scheduler
//!
//! # Exported metrics
//! The extender's `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `emissions_carbon_index` (gauge): last carbon index read from the signal service.
//! - `emissions_carbon_fetch_total` (counter): carbon index reads labeled by result.
//! - `emissions_power_actions_total` (counter): power commands labeled by action and result.
//! - `emissions_evictions_total` (counter): eviction requests labeled by result.
//! - `emissions_admission_decisions_total` (counter): admission gate answers labeled by decision.
//! - `emissions_decision_errors_total` (counter): aborted decision cycles labeled by controller and kind.
//! - `emissions_decision_duration_seconds` (histogram): decision cycle duration labeled by controller.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::carbon_aware::CarbonSample;

/// Labels for counters keyed only by outcome
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    /// "ok" or an error kind
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PowerActionLabels {
    /// "on", "off", "cycle", or "session" when the cycle failed before a command was known
    pub action: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AdmissionLabels {
    /// "admit" or "reject"
    pub decision: String,
}

/// Labels for decision cycle metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    /// Entity kind, "node" or "workload"
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "auth", "fetch", "connect"
    pub kind: String,
}

pub static CARBON_INDEX: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static CARBON_FETCH_TOTAL: Lazy<Family<ResultLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static POWER_ACTIONS_TOTAL: Lazy<Family<PowerActionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static EVICTIONS_TOTAL: Lazy<Family<ResultLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static ADMISSION_DECISIONS_TOTAL: Lazy<Family<AdmissionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static DECISION_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking decision cycle duration (seconds)
pub static DECISION_DURATION_SECONDS: Lazy<Family<ControllerLabels, Histogram>> =
    Lazy::new(|| {
        fn decision_histogram() -> Histogram {
            // 1ms .. ~32s; a cycle includes one carbon fetch and at most one BMC round trip.
            Histogram::new(exponential_buckets(0.001, 2.0, 16))
        }

        Family::new_with_constructor(decision_histogram)
    });

/// Global metrics registry. Counter names are registered without the
/// `_total` suffix; the text encoder appends it.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "emissions_carbon_index",
        "Last carbon intensity index read from the signal service (0-100)",
        CARBON_INDEX.clone(),
    );
    registry.register(
        "emissions_carbon_fetch",
        "Total number of carbon index reads by result",
        CARBON_FETCH_TOTAL.clone(),
    );
    registry.register(
        "emissions_power_actions",
        "Total number of node power commands by action and result",
        POWER_ACTIONS_TOTAL.clone(),
    );
    registry.register(
        "emissions_evictions",
        "Total number of workload eviction requests by result",
        EVICTIONS_TOTAL.clone(),
    );
    registry.register(
        "emissions_admission_decisions",
        "Total number of admission gate answers by decision",
        ADMISSION_DECISIONS_TOTAL.clone(),
    );
    registry.register(
        "emissions_decision_errors",
        "Total number of aborted decision cycles",
        DECISION_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "emissions_decision_duration_seconds",
        "Duration of decision cycles in seconds",
        DECISION_DURATION_SECONDS.clone(),
    );

    registry
});

fn result_labels(result: &str) -> ResultLabels {
    ResultLabels {
        result: result.to_string(),
    }
}

/// Record one carbon index read; `None` means the read failed.
pub fn record_carbon_fetch(sample: Option<&CarbonSample>) {
    match sample {
        Some(sample) => {
            CARBON_INDEX.set(i64::from(sample.value));
            CARBON_FETCH_TOTAL.get_or_create(&result_labels("ok")).inc();
        }
        None => {
            CARBON_FETCH_TOTAL.get_or_create(&result_labels("error")).inc();
        }
    }
}

pub fn inc_power_action(action: &str, result: &str) {
    let labels = PowerActionLabels {
        action: action.to_string(),
        result: result.to_string(),
    };
    POWER_ACTIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_eviction(success: bool) {
    let result = if success { "ok" } else { "error" };
    EVICTIONS_TOTAL.get_or_create(&result_labels(result)).inc();
}

pub fn inc_admission(decision: &str) {
    let labels = AdmissionLabels {
        decision: decision.to_string(),
    };
    ADMISSION_DECISIONS_TOTAL.get_or_create(&labels).inc();
}

/// Increment the decision error counter.
pub fn inc_decision_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    DECISION_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Observe a decision cycle duration in seconds.
pub fn observe_decision_duration(controller: &str, seconds: f64) {
    let labels = ControllerLabels {
        controller: controller.to_string(),
    };
    DECISION_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Render the registry in the Prometheus text format
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn test_record_carbon_fetch_counts_results() {
        let ok_before = CARBON_FETCH_TOTAL.get_or_create(&result_labels("ok")).get();
        let sample = CarbonSample::new(42, Utc::now()).unwrap();
        record_carbon_fetch(Some(&sample));
        assert!(CARBON_FETCH_TOTAL.get_or_create(&result_labels("ok")).get() > ok_before);

        let before = CARBON_FETCH_TOTAL.get_or_create(&result_labels("error")).get();
        record_carbon_fetch(None);
        let after = CARBON_FETCH_TOTAL.get_or_create(&result_labels("error")).get();
        assert!(after > before);
    }

    #[test]
    fn test_counters_increment() {
        let labels = AdmissionLabels {
            decision: "reject".to_string(),
        };
        let before = ADMISSION_DECISIONS_TOTAL.get_or_create(&labels).get();
        inc_admission("reject");
        assert!(ADMISSION_DECISIONS_TOTAL.get_or_create(&labels).get() > before);

        inc_power_action("on", "ok");
        inc_eviction(false);
        inc_decision_error("node", "auth");
        observe_decision_duration("node", 0.25);
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        inc_eviction(true);
        let text = render().unwrap();
        assert!(text.contains("emissions_evictions_total"));
        assert!(text.contains("emissions_carbon_index"));
        assert!(text.contains("emissions_decision_duration_seconds"));
    }
}
