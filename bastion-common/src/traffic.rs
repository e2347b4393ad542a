//! Traffic metrics contract reported per application.
//!
//! `all_traffic` is derived from the three outcome counters and never
//! stored independently, so a `TrafficMetrics` value cannot disagree with
//! itself. Deserialization rejects payloads whose total does not add up.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of one proxied request as seen by the bouncer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficOutcome {
    Allowed,
    /// Banned
    Denied,
    /// Captcha
    Challenged,
}

impl TrafficOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficOutcome::Allowed => "allowed",
            TrafficOutcome::Denied => "denied",
            TrafficOutcome::Challenged => "challenged",
        }
    }

    /// Map a bouncer remediation name onto an outcome
    pub fn from_remediation(remediation: Option<&str>) -> Self {
        match remediation {
            Some("ban") => TrafficOutcome::Denied,
            Some("captcha") => TrafficOutcome::Challenged,
            _ => TrafficOutcome::Allowed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrafficMetricsError {
    #[error("all_traffic {reported} does not equal allowed+denied+challenged {computed}")]
    TotalMismatch { reported: u64, computed: u64 },
    #[error("traffic counter overflow")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawTrafficMetrics", into = "RawTrafficMetrics")]
pub struct TrafficMetrics {
    allowed: u64,
    denied: u64,
    challenged: u64,
}

#[derive(Serialize, Deserialize)]
struct RawTrafficMetrics {
    allowed: u64,
    denied: u64,
    challenged: u64,
    all_traffic: u64,
}

impl TrafficMetrics {
    pub fn new(allowed: u64, denied: u64, challenged: u64) -> Result<Self, TrafficMetricsError> {
        allowed
            .checked_add(denied)
            .and_then(|sum| sum.checked_add(challenged))
            .ok_or(TrafficMetricsError::Overflow)?;
        Ok(Self {
            allowed,
            denied,
            challenged,
        })
    }

    /// Tally a stream of outcomes
    pub fn from_outcomes<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = TrafficOutcome>,
    {
        outcomes.into_iter().fold(Self::default(), |mut acc, outcome| {
            acc.record(outcome);
            acc
        })
    }

    pub fn record(&mut self, outcome: TrafficOutcome) {
        match outcome {
            TrafficOutcome::Allowed => self.allowed = self.allowed.saturating_add(1),
            TrafficOutcome::Denied => self.denied = self.denied.saturating_add(1),
            TrafficOutcome::Challenged => self.challenged = self.challenged.saturating_add(1),
        }
    }

    pub fn allowed(&self) -> u64 {
        self.allowed
    }

    pub fn denied(&self) -> u64 {
        self.denied
    }

    pub fn challenged(&self) -> u64 {
        self.challenged
    }

    pub fn all_traffic(&self) -> u64 {
        self.allowed
            .saturating_add(self.denied)
            .saturating_add(self.challenged)
    }
}

impl TryFrom<RawTrafficMetrics> for TrafficMetrics {
    type Error = TrafficMetricsError;

    fn try_from(raw: RawTrafficMetrics) -> Result<Self, Self::Error> {
        let metrics = TrafficMetrics::new(raw.allowed, raw.denied, raw.challenged)?;
        if metrics.all_traffic() != raw.all_traffic {
            return Err(TrafficMetricsError::TotalMismatch {
                reported: raw.all_traffic,
                computed: metrics.all_traffic(),
            });
        }
        Ok(metrics)
    }
}

impl From<TrafficMetrics> for RawTrafficMetrics {
    fn from(metrics: TrafficMetrics) -> Self {
        RawTrafficMetrics {
            allowed: metrics.allowed,
            denied: metrics.denied,
            challenged: metrics.challenged,
            all_traffic: metrics.all_traffic(),
        }
    }
}
