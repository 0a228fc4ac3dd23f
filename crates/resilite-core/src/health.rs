//! Health check types shared by the monitor and its consumers
//!
//! A monitoring tick produces one [`HealthMetrics`] sample and a
//! [`HealthCheckResult`] describing the [`HealthIssue`]s it found. Samples are
//! kept in a bounded history from which [`HealthTrends`] are derived.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status observed by a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Database is fully operational
    Healthy,
    /// Database answers but with problems
    Degraded,
    /// Database could not be reached
    Failed,
}

impl ConnectionStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ConnectionStatus::Healthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Healthy => "healthy",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monitoring sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub timestamp: DateTime<Utc>,
    pub connection_status: ConnectionStatus,
    pub response_time_ms: f64,
    pub error_count: u32,
    pub warning_count: u32,
    pub database_size_bytes: u64,
    pub corruption_detected: bool,
}

impl HealthMetrics {
    /// A sample for a probe that could not reach the database
    pub fn failed(response_time_ms: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            connection_status: ConnectionStatus::Failed,
            response_time_ms,
            error_count: 1,
            warning_count: 0,
            database_size_bytes: 0,
            corruption_detected: false,
        }
    }

    /// Whether this sample counts as an error for rate computation
    pub fn is_error(&self) -> bool {
        self.connection_status == ConnectionStatus::Failed
            || self.corruption_detected
            || self.error_count > 0
    }
}

/// How serious an issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// What part of the database an issue concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Performance,
    Corruption,
    Connection,
    Consistency,
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IssueType::Performance => "performance",
            IssueType::Corruption => "corruption",
            IssueType::Connection => "connection",
            IssueType::Consistency => "consistency",
        };
        f.write_str(name)
    }
}

/// A problem found by a health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub severity: IssueSeverity,
    pub issue_type: IssueType,
    pub message: String,
    pub details: serde_json::Value,
}

impl HealthIssue {
    pub fn new(severity: IssueSeverity, issue_type: IssueType, message: impl Into<String>) -> Self {
        Self {
            severity,
            issue_type,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == IssueSeverity::Critical
    }
}

/// Outcome of a single health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub metrics: HealthMetrics,
    pub issues: Vec<HealthIssue>,
    pub recommendations: Vec<String>,
}

impl HealthCheckResult {
    /// Issues at `Critical` severity
    pub fn critical_issues(&self) -> impl Iterator<Item = &HealthIssue> {
        self.issues.iter().filter(|issue| issue.is_critical())
    }

    /// The most severe issue, if any
    pub fn worst_severity(&self) -> Option<IssueSeverity> {
        self.issues.iter().map(|issue| issue.severity).max()
    }
}

/// Direction of a metric over the recent window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

impl Trend {
    /// Compare two halves of a window for a metric where lower is better.
    ///
    /// Changes within `tolerance` (relative to the older half, with an absolute
    /// floor of `min_delta`) count as stable.
    pub fn lower_is_better(older: f64, newer: f64, tolerance: f64, min_delta: f64) -> Self {
        let threshold = (older.abs() * tolerance).max(min_delta);
        if newer < older - threshold {
            Trend::Improving
        } else if newer > older + threshold {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }
}

/// Aggregates over the recent sample history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthTrends {
    pub sample_count: usize,
    pub average_response_time_ms: f64,
    /// Fraction of samples counted as errors (0.0-1.0)
    pub error_rate: f64,
    /// Percentage of samples with a healthy connection (0-100)
    pub percent_healthy: f64,
    pub response_time_trend: Trend,
    pub error_rate_trend: Trend,
}

impl HealthTrends {
    /// Compute trends from samples ordered oldest first
    pub fn from_samples(samples: &[HealthMetrics]) -> Self {
        if samples.is_empty() {
            return Self {
                sample_count: 0,
                average_response_time_ms: 0.0,
                error_rate: 0.0,
                percent_healthy: 100.0,
                response_time_trend: Trend::Stable,
                error_rate_trend: Trend::Stable,
            };
        }

        let count = samples.len() as f64;
        let average_response_time_ms = average_latency(samples);
        let overall_error_rate = error_rate(samples);
        let healthy = samples
            .iter()
            .filter(|s| s.connection_status.is_healthy())
            .count() as f64;

        let (response_time_trend, error_rate_trend) = if samples.len() < 4 {
            (Trend::Stable, Trend::Stable)
        } else {
            let (older, newer) = samples.split_at(samples.len() / 2);
            (
                Trend::lower_is_better(average_latency(older), average_latency(newer), 0.1, 1.0),
                Trend::lower_is_better(error_rate(older), error_rate(newer), 0.1, 0.05),
            )
        };

        Self {
            sample_count: samples.len(),
            average_response_time_ms,
            error_rate: overall_error_rate,
            percent_healthy: healthy / count * 100.0,
            response_time_trend,
            error_rate_trend,
        }
    }
}

fn average_latency(samples: &[HealthMetrics]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.response_time_ms).sum::<f64>() / samples.len() as f64
}

fn error_rate(samples: &[HealthMetrics]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().filter(|s| s.is_error()).count() as f64 / samples.len() as f64
}
