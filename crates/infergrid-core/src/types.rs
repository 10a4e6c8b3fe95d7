//! Domain types shared across InferGrid crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of a served model.
pub type ModelId = String;

/// Identifier of a backend node.
pub type NodeId = String;

/// Identifier of a scheduled request.
pub type RequestId = String;

// ── Priority ──────────────────────────────────────────────────────

/// Scheduling priority of a request. Dequeue order is strictly
/// `High` before `Normal` before `Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities in dequeue order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Position in the dequeue order (0 = first).
    pub fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a priority string is not one of `high`, `normal`, `low`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid priority: {0}")]
pub struct InvalidPriority(pub String);

impl FromStr for Priority {
    type Err = InvalidPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(InvalidPriority(s.to_string())),
        }
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

/// Resource usage reported by a backend node.
///
/// `cpu`, `memory` and `request_load` are percentages (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu: f64,
    pub memory: f64,
    #[serde(default)]
    pub request_load: f64,
    /// Observed request latency in milliseconds, if known.
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

/// Health classification of a backend node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl NodeStatus {
    /// Classify a node from its metrics.
    ///
    /// Unhealthy above 90% cpu or memory, degraded above 70%.
    pub fn classify(metrics: &NodeMetrics) -> Self {
        if metrics.cpu > 90.0 || metrics.memory > 90.0 {
            NodeStatus::Unhealthy
        } else if metrics.cpu > 70.0 || metrics.memory > 70.0 {
            NodeStatus::Degraded
        } else {
            NodeStatus::Healthy
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Healthy => "healthy",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

// ── Models ────────────────────────────────────────────────────────

/// Per-model serving metrics over one collection window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_id: ModelId,
    /// Unix epoch milliseconds at which the window closed.
    pub collected_at: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub rps: f64,
    /// Errors / requests over the window (0.0 when idle).
    pub error_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" normal ".parse::<Priority>().unwrap(), Priority::Normal);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
    }

    #[test]
    fn priority_rejects_unknown() {
        let err = "urgent".parse::<Priority>().unwrap_err();
        assert_eq!(err, InvalidPriority("urgent".to_string()));
    }

    #[test]
    fn priority_order_matches_dequeue_order() {
        let mut p = vec![Priority::Low, Priority::High, Priority::Normal];
        p.sort();
        assert_eq!(p, Priority::ALL.to_vec());
        assert_eq!(Priority::Low.index(), 2);
    }

    #[test]
    fn classify_thresholds() {
        let m = |cpu, memory| NodeMetrics { cpu, memory, ..Default::default() };
        assert_eq!(NodeStatus::classify(&m(10.0, 10.0)), NodeStatus::Healthy);
        assert_eq!(NodeStatus::classify(&m(70.0, 70.0)), NodeStatus::Healthy);
        assert_eq!(NodeStatus::classify(&m(71.0, 10.0)), NodeStatus::Degraded);
        assert_eq!(NodeStatus::classify(&m(10.0, 85.0)), NodeStatus::Degraded);
        assert_eq!(NodeStatus::classify(&m(95.0, 10.0)), NodeStatus::Unhealthy);
        assert_eq!(NodeStatus::classify(&m(10.0, 91.0)), NodeStatus::Unhealthy);
    }

    #[test]
    fn node_metrics_deserialize_with_defaults() {
        let m: NodeMetrics = serde_json::from_str(r#"{"cpu":12.5,"memory":40}"#).unwrap();
        assert_eq!(m.cpu, 12.5);
        assert_eq!(m.request_load, 0.0);
        assert_eq!(m.latency_ms, None);
    }

    #[test]
    fn epoch_millis_is_reasonable() {
        // After 2024-01-01.
        assert!(epoch_millis() > 1_704_067_200_000);
    }
}
