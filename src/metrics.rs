//! Prometheus metrics for admission decisions.

use crate::admission::Admission;
use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::io;

/// Labels for admission decision metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AdmissionLabels {
    /// "admitted" or "rejected"
    pub outcome: &'static str,
    /// Reason code, empty when admitted
    pub reason: &'static str,
}

/// Global metrics registry.
///
/// Initialized on first use and shared across all tasks. The registry is
/// only read when encoding; recording goes through the family's own map.
static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Metrics collector for the admission gate.
pub struct Metrics {
    registry: Registry,
    decisions_total: Family<AdmissionLabels, Counter>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let decisions_total = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "admission_decisions",
            "Connection admission decisions by outcome and reason",
            decisions_total.clone(),
        );

        Self {
            registry,
            decisions_total,
        }
    }

    /// Counts one admission decision.
    pub fn record_admission(admission: Admission) {
        METRICS
            .decisions_total
            .get_or_create(&Self::labels(admission))
            .inc();
    }

    /// Returns the current count for one decision kind.
    pub fn admission_count(admission: Admission) -> u64 {
        METRICS
            .decisions_total
            .get_or_create(&Self::labels(admission))
            .get()
    }

    fn labels(admission: Admission) -> AdmissionLabels {
        match admission {
            Admission::Admitted => AdmissionLabels {
                outcome: "admitted",
                reason: "",
            },
            Admission::Rejected(reason) => AdmissionLabels {
                outcome: "rejected",
                reason: reason.as_str(),
            },
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode() -> Result<String, io::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &METRICS.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}
