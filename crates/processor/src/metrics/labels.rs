//! Label sets for engine metrics

use prometheus_client::encoding::EncodeLabelSet;
use std::fmt;

/// Labels shared by every per-stream metric
#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StreamLabels {
    pub stream_id: String,
}

/// Backpressure counters carry the active policy
#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
    pub stream_id: String,
    pub policy: String,
}

/// Sink deliveries carry their outcome
#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeliveryLabels {
    pub stream_id: String,
    pub outcome: String,
}

/// Outcome of one sink delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    Delivered,
    Retried,
    Failed,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Delivered => write!(f, "delivered"),
            DeliveryOutcome::Retried => write!(f, "retried"),
            DeliveryOutcome::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_outcome_display() {
        assert_eq!(DeliveryOutcome::Delivered.to_string(), "delivered");
        assert_eq!(DeliveryOutcome::Failed.to_string(), "failed");
    }
}
