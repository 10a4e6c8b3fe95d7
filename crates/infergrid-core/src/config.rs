//! infergrid.toml configuration parser.
//!
//! Every section is optional; missing fields fall back to the defaults
//! below. Durations are human strings (`"500ms"`, `"30s"`, `"5m"`,
//! `"1h"`) and are parsed with [`parse_duration`] when the daemon wires
//! its components.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::types::NodeMetrics;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub scheduler: SchedulerSection,
    /// Per-model token-bucket settings, keyed by model id.
    pub rate_limits: BTreeMap<String, RateLimitSection>,
    pub cache: CacheSection,
    pub balancer: BalancerSection,
    pub metrics: MetricsSection,
    pub autoscale: AutoscaleSection,
    pub nodes: Vec<NodeSection>,
    pub models: Vec<ModelSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_concurrent_requests: usize,
    pub request_timeout: String,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub requests_per_second: f64,
    pub burst_limit: u32,
    pub max_queue_size: usize,
    pub time_window: String,
    pub quota_limit: Option<u64>,
    pub acquire_timeout: String,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_limit: 20,
            max_queue_size: 100,
            time_window: "60s".to_string(),
            quota_limit: None,
            acquire_timeout: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Memory tier budget in bytes.
    pub max_memory_size: u64,
    /// Disk tier budget in bytes.
    pub max_disk_size: u64,
    pub ttl: String,
    pub cleanup_interval: String,
    pub disk_dir: PathBuf,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_memory_size: 100 * 1024 * 1024,
            max_disk_size: 1024 * 1024 * 1024,
            ttl: "1h".to_string(),
            cleanup_interval: "5m".to_string(),
            disk_dir: PathBuf::from(".infergrid/cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSection {
    pub health_check_interval: String,
    /// Number of distribution records kept for per-node statistics.
    pub history_size: usize,
    /// Seed for weighted selection; random when absent.
    pub seed: Option<u64>,
}

impl Default for BalancerSection {
    fn default() -> Self {
        Self {
            health_check_interval: "30s".to_string(),
            history_size: 1000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub snapshot_interval: String,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            snapshot_interval: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSection {
    pub enabled: bool,
    pub evaluation_interval: String,
    /// Operations kept per model in the history ring.
    pub history_limit: usize,
    /// Metrics older than this are ignored by the periodic sweep.
    pub metrics_max_age: String,
    /// Metric the threshold policy scales on: "rps", "latency_p99", "error_rate".
    pub metric: String,
    pub target_value: f64,
    pub scale_up_window: String,
    pub scale_down_window: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
}

impl Default for AutoscaleSection {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval: "60s".to_string(),
            history_limit: 50,
            metrics_max_age: "5m".to_string(),
            metric: "rps".to_string(),
            target_value: 100.0,
            scale_up_window: "30s".to_string(),
            scale_down_window: "5m".to_string(),
            min_replicas: 1,
            max_replicas: 10,
        }
    }
}

/// A statically known backend node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub id: String,
    #[serde(flatten)]
    pub metrics: NodeMetrics,
}

/// A served model and its initial replica count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub id: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Latency of simulated execution in the daemon's `run` mode.
    #[serde(default)]
    pub simulated_latency: Option<String>,
}

fn default_replicas() -> u32 {
    1
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every duration string and numeric bound up front so bad
    /// config fails at startup rather than when a loop first ticks.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.max_concurrent_requests == 0 {
            bail!("scheduler.max_concurrent_requests must be at least 1");
        }
        parse_duration(&self.scheduler.request_timeout).context("scheduler.request_timeout")?;

        for (model, rl) in &self.rate_limits {
            if rl.requests_per_second <= 0.0 {
                bail!("rate_limits.{model}.requests_per_second must be positive");
            }
            if rl.burst_limit == 0 {
                bail!("rate_limits.{model}.burst_limit must be at least 1");
            }
            parse_duration(&rl.time_window)
                .with_context(|| format!("rate_limits.{model}.time_window"))?;
            parse_duration(&rl.acquire_timeout)
                .with_context(|| format!("rate_limits.{model}.acquire_timeout"))?;
        }

        parse_duration(&self.cache.ttl).context("cache.ttl")?;
        parse_duration(&self.cache.cleanup_interval).context("cache.cleanup_interval")?;
        parse_duration(&self.balancer.health_check_interval)
            .context("balancer.health_check_interval")?;
        parse_duration(&self.metrics.snapshot_interval).context("metrics.snapshot_interval")?;

        let a = &self.autoscale;
        parse_duration(&a.evaluation_interval).context("autoscale.evaluation_interval")?;
        parse_duration(&a.metrics_max_age).context("autoscale.metrics_max_age")?;
        parse_duration(&a.scale_up_window).context("autoscale.scale_up_window")?;
        parse_duration(&a.scale_down_window).context("autoscale.scale_down_window")?;
        if a.min_replicas == 0 || a.min_replicas > a.max_replicas {
            bail!("autoscale replicas must satisfy 1 <= min_replicas <= max_replicas");
        }

        for model in &self.models {
            if let Some(latency) = &model.simulated_latency {
                parse_duration(latency)
                    .with_context(|| format!("models.{}.simulated_latency", model.id))?;
            }
        }
        Ok(())
    }
}

/// Parse a duration string like "250ms", "30s", "5m", "1h".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, unit_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid duration: {s:?}"))?;
    Ok(Duration::from_millis(value * unit_ms))
}
