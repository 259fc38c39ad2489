//! Analysis requests and their cache keys.
//!
//! LLM calls are metered, so requests whose metrics differ only in noise
//! should hit the same cache entry. Every metric is bucketed to two
//! significant digits before hashing: `12_340.17` and `12_389.90` both become
//! `12_000`, while `12_340` and `13_100` stay apart.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use finpulse_core::TenantId;

use crate::result::AiError;

/// What the LLM is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    /// Narrative summary of the period's figures.
    Summary,
    /// Flag unusual movements.
    Anomaly,
    /// Short-range cash-flow outlook.
    Forecast,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Anomaly => "anomaly",
            Self::Forecast => "forecast",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant-scoped analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub tenant_id: TenantId,
    pub kind: AnalysisKind,
    /// Named figures; ordered so the cache key is independent of insertion order.
    pub metrics: BTreeMap<String, f64>,
}

impl AnalysisRequest {
    pub fn new(tenant_id: TenantId, kind: AnalysisKind) -> Self {
        Self {
            tenant_id,
            kind,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), AiError> {
        if self.metrics.is_empty() {
            return Err(AiError::InvalidInput("no metrics supplied".to_string()));
        }
        if let Some((name, _)) = self.metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(AiError::InvalidInput(format!("metric {name} is not a finite number")));
        }
        Ok(())
    }

    /// Cache key: `ai:<kind>:<tenant>:<sha256 of bucketed metrics>`.
    ///
    /// The tenant stays in clear text so one tenant's entries can never serve
    /// another's request, even on a hash collision.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.metrics {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(bucket(*value).as_bytes());
            hasher.update(b";");
        }
        format!(
            "ai:{}:{}:{}",
            self.kind,
            self.tenant_id,
            hex::encode(hasher.finalize())
        )
    }
}

/// Canonical two-significant-digit bucket of `value`, as `<mantissa>e<exp>`.
///
/// Integer mantissa/exponent avoids float formatting drift between equal
/// buckets.
fn bucket(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let mut exp = value.abs().log10().floor() as i32 - 1;
    let mut mantissa = (value / 10f64.powi(exp)).round() as i64;
    // 99.6 rounds up to 100; renormalise to 10e(exp+1).
    if mantissa.abs() >= 100 {
        mantissa /= 10;
        exp += 1;
    }
    format!("{mantissa}e{exp}")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn tenant() -> TenantId {
        "0190f5a4-0000-7000-8000-000000000001".parse().unwrap()
    }

    #[test]
    fn bucketing_keeps_two_significant_digits() {
        assert_eq!(bucket(12_340.17), "12e3");
        assert_eq!(bucket(12_389.90), "12e3");
        assert_eq!(bucket(13_100.0), "13e3");
        assert_eq!(bucket(-0.0456), "-46e-3");
        assert_eq!(bucket(99.6), "10e1");
        assert_eq!(bucket(100.0), "10e1");
        assert_eq!(bucket(0.0), "0");
    }

    #[test]
    fn near_duplicate_requests_share_a_key() {
        let a = AnalysisRequest::new(tenant(), AnalysisKind::Summary)
            .with_metric("revenue", 12_340.17)
            .with_metric("expenses", 8_021.0);
        let b = AnalysisRequest::new(tenant(), AnalysisKind::Summary)
            .with_metric("expenses", 8_049.5)
            .with_metric("revenue", 12_389.90);

        assert_eq!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("ai:summary:0190f5a4-"));
    }

    #[test]
    fn kind_tenant_and_real_changes_split_keys() {
        let base = AnalysisRequest::new(tenant(), AnalysisKind::Summary).with_metric("revenue", 12_340.0);

        let other_kind = AnalysisRequest {
            kind: AnalysisKind::Forecast,
            ..base.clone()
        };
        let other_tenant = AnalysisRequest {
            tenant_id: TenantId::new(),
            ..base.clone()
        };
        let moved = base.clone().with_metric("revenue", 13_100.0);

        assert_ne!(base.cache_key(), other_kind.cache_key());
        assert_ne!(base.cache_key(), other_tenant.cache_key());
        assert_ne!(base.cache_key(), moved.cache_key());
    }

    #[test]
    fn validation_rejects_empty_and_non_finite_metrics() {
        let empty = AnalysisRequest::new(tenant(), AnalysisKind::Anomaly);
        assert!(matches!(empty.validate(), Err(AiError::InvalidInput(_))));

        let nan = empty.clone().with_metric("margin", f64::NAN);
        assert!(matches!(nan.validate(), Err(AiError::InvalidInput(msg)) if msg.contains("margin")));

        assert!(empty.with_metric("margin", 0.12).validate().is_ok());
    }

    proptest! {
        #[test]
        fn values_inside_one_bucket_collapse(
            mantissa in 11i64..99,
            exp in -3i32..7,
            noise in -0.45f64..0.45,
        ) {
            let scale = 10f64.powi(exp);
            let exact = mantissa as f64 * scale;
            let noisy = (mantissa as f64 + noise) * scale;

            let a = AnalysisRequest::new(tenant(), AnalysisKind::Summary).with_metric("m", exact);
            let b = AnalysisRequest::new(tenant(), AnalysisKind::Summary).with_metric("m", noisy);
            prop_assert_eq!(a.cache_key(), b.cache_key());
        }
    }
}
