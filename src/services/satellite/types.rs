use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Lifecycle states for a satellite biomass subscription. Transitions only
/// ever move toward a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Requested,
    Active,
    Cancelled,
    Expired,
    Failed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Requested => "requested",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "requested" => Some(SubscriptionStatus::Requested),
            "active" => Some(SubscriptionStatus::Active),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "expired" => Some(SubscriptionStatus::Expired),
            "failed" => Some(SubscriptionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired | SubscriptionStatus::Failed
        )
    }

    /// Legal forward transitions. Re-applying the current state is allowed
    /// so that sweeps stay idempotent.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            SubscriptionStatus::Requested => matches!(
                next,
                SubscriptionStatus::Active | SubscriptionStatus::Failed
            ),
            SubscriptionStatus::Active => matches!(
                next,
                SubscriptionStatus::Expired
                    | SubscriptionStatus::Cancelled
                    | SubscriptionStatus::Failed
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Subscription {
    /// Upstream-assigned identifier.
    pub subscription_id: String,
    pub policy_id: String,
    pub plot_id: String,
    pub geometry: JsonValue,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BiomassQuality {
    High,
    Medium,
    Low,
}

impl BiomassQuality {
    /// Cloud cover drives the per-sample quality tag.
    pub fn from_cloud_cover(cloud_cover: f64) -> Self {
        if cloud_cover < 0.1 {
            BiomassQuality::High
        } else if cloud_cover < 0.3 {
            BiomassQuality::Medium
        } else {
            BiomassQuality::Low
        }
    }

    pub fn score(&self) -> f64 {
        match self {
            BiomassQuality::High => 3.0,
            BiomassQuality::Medium => 2.0,
            BiomassQuality::Low => 1.0,
        }
    }

    /// Buckets a mean quality score back onto the tag scale.
    pub fn from_mean_score(score: f64) -> Self {
        if score >= 2.5 {
            BiomassQuality::High
        } else if score >= 1.5 {
            BiomassQuality::Medium
        } else {
            BiomassQuality::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BiomassQuality::High => "high",
            BiomassQuality::Medium => "medium",
            BiomassQuality::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(BiomassQuality::High),
            "medium" => Some(BiomassQuality::Medium),
            "low" => Some(BiomassQuality::Low),
            _ => None,
        }
    }
}

/// One delivered biomass observation. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BiomassSample {
    pub plot_id: String,
    pub observed_on: NaiveDate,
    /// Crop-vigour proxy in [0, 1].
    pub biomass_proxy: f64,
    pub cloud_cover: f64,
    pub data_quality: BiomassQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BiomassStress {
    Healthy,
    Moderate,
    Severe,
    Critical,
}

impl BiomassStress {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiomassStress::Healthy => "healthy",
            BiomassStress::Moderate => "moderate",
            BiomassStress::Severe => "severe",
            BiomassStress::Critical => "critical",
        }
    }
}

/// Reduced statistics over a subscription's delivered samples.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BiomassSummary {
    pub plot_id: String,
    pub subscription_id: String,
    pub current: f64,
    pub baseline: f64,
    pub min: f64,
    pub max: f64,
    /// Normalised regression slope, clamped to [-1, +1].
    pub trend: f64,
    /// (baseline - current) / baseline x 100; zero when the baseline is zero.
    pub deviation_percent: f64,
    pub last_updated: NaiveDate,
    pub overall_quality: BiomassQuality,
    pub stress: BiomassStress,
    pub sample_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotone_toward_terminal() {
        use SubscriptionStatus::*;
        assert!(Requested.can_transition_to(Active));
        assert!(Requested.can_transition_to(Failed));
        assert!(!Requested.can_transition_to(Expired));
        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Failed));
        assert!(!Active.can_transition_to(Requested));
        for terminal in [Cancelled, Expired, Failed] {
            assert!(terminal.is_terminal());
            for next in [Requested, Active, Cancelled, Expired, Failed] {
                if next != terminal {
                    assert!(!terminal.can_transition_to(next));
                }
            }
            // Idempotent re-application of the same state is a no-op, not an error.
            assert!(terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn cloud_cover_buckets_quality() {
        assert_eq!(BiomassQuality::from_cloud_cover(0.05), BiomassQuality::High);
        assert_eq!(BiomassQuality::from_cloud_cover(0.1), BiomassQuality::Medium);
        assert_eq!(BiomassQuality::from_cloud_cover(0.29), BiomassQuality::Medium);
        assert_eq!(BiomassQuality::from_cloud_cover(0.3), BiomassQuality::Low);
    }

    #[test]
    fn mean_score_buckets_at_2_5_and_1_5() {
        assert_eq!(BiomassQuality::from_mean_score(2.5), BiomassQuality::High);
        assert_eq!(BiomassQuality::from_mean_score(2.49), BiomassQuality::Medium);
        assert_eq!(BiomassQuality::from_mean_score(1.5), BiomassQuality::Medium);
        assert_eq!(BiomassQuality::from_mean_score(1.49), BiomassQuality::Low);
    }
}
