use crate::clients::ipfs::ContentStoreClient;
use crate::error::PipelineError;
use crate::ids::assessment_id;
use crate::services::satellite::types::BiomassSummary;
use crate::services::satellite::SubscriptionManager;
use crate::storage::timeseries::{Assessment, TimeseriesStore};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// Assembles the damage-evidence bundle for a (plot, policy, window):
/// latest overlapping weather index, optional biomass summary, a canonical
/// document pushed to the content-addressed store, and the assessment row.
/// This is the sole writer of the assessment table; the damage score itself
/// is computed by an external workflow that consumes the published document.
pub struct EvidenceBundler {
    store: TimeseriesStore,
    satellite: Arc<SubscriptionManager>,
    content: Arc<ContentStoreClient>,
}

#[derive(Debug, Clone)]
pub struct EvidenceRequest {
    pub plot_id: String,
    pub policy_id: String,
    pub farmer_address: String,
    pub window_days: u32,
}

#[derive(Debug)]
pub struct BundleOutcome {
    pub assessment: Assessment,
    /// False when a concurrent bundler already recorded this assessment and
    /// this invocation no-opped.
    pub created: bool,
}

impl EvidenceBundler {
    pub fn new(
        store: TimeseriesStore,
        satellite: Arc<SubscriptionManager>,
        content: Arc<ContentStoreClient>,
    ) -> Self {
        Self {
            store,
            satellite,
            content,
        }
    }

    pub async fn bundle(&self, request: &EvidenceRequest) -> Result<BundleOutcome, PipelineError> {
        let end = Utc::now();
        let start = end - Duration::days(i64::from(request.window_days));
        self.bundle_window(request, start, end).await
    }

    pub async fn bundle_window(
        &self,
        request: &EvidenceRequest,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<BundleOutcome, PipelineError> {
        if window_end <= window_start {
            return Err(PipelineError::Permanent(format!(
                "assessment window end {window_end} not after start {window_start}"
            )));
        }

        let weather_index = self
            .store
            .latest_index_overlapping(&request.plot_id, window_start, window_end)
            .await?
            .ok_or_else(|| {
                PipelineError::InsufficientData(format!(
                    "no weather index overlapping assessment window for plot {}",
                    request.plot_id
                ))
            })?;

        // Missing biomass is a recorded absence, not a failure.
        let biomass = match self
            .satellite
            .summary_for_window(
                &request.plot_id,
                window_start.date_naive(),
                window_end.date_naive(),
            )
            .await
        {
            Ok(summary) => Some(summary),
            Err(PipelineError::InsufficientData(reason)) => {
                tracing::info!(plot_id = %request.plot_id, reason, "bundling without biomass");
                None
            }
            Err(err) => return Err(err),
        };

        let id = assessment_id(
            &request.plot_id,
            &request.policy_id,
            window_start,
            window_end,
        );
        let document = Self::evidence_document(
            &id,
            request,
            window_start,
            window_end,
            &weather_index,
            biomass.as_ref(),
        )?;

        let cid = self
            .content
            .put_json(
                &format!("evidence_{id}.json"),
                &document,
                &[
                    ("assessment_id", id.as_str()),
                    ("plot_id", request.plot_id.as_str()),
                    ("type", "damage_evidence"),
                ],
            )
            .await?;

        let window_days = (window_end - window_start).num_days().max(1) as i32;
        let assessment = Assessment {
            assessment_id: id.clone(),
            plot_id: request.plot_id.clone(),
            policy_id: request.policy_id.clone(),
            farmer_address: request.farmer_address.clone(),
            window_start,
            window_end,
            window_days,
            evidence_cid: cid,
            outcome_ref: None,
            created_at: Utc::now(),
            archived_at: None,
        };

        let created = self.store.insert_assessment(&assessment).await?;
        if created {
            tracing::info!(
                assessment_id = %assessment.assessment_id,
                plot_id = %assessment.plot_id,
                evidence_cid = %assessment.evidence_cid,
                "assessment recorded"
            );
            return Ok(BundleOutcome {
                assessment,
                created: true,
            });
        }

        // A concurrent writer minted the same id; ours is a no-op.
        let existing = self.store.assessment(&id).await?.ok_or_else(|| {
            PipelineError::Fatal(format!("assessment {id} conflicted but is missing"))
        })?;
        tracing::info!(assessment_id = %id, "assessment already exists; no-op");
        Ok(BundleOutcome {
            assessment: existing,
            created: false,
        })
    }

    /// Canonical evidence document. Key order is normalised by the canonical
    /// serialiser and every timestamp is UTC, so equal inputs always produce
    /// equal bytes and therefore equal cids.
    fn evidence_document(
        assessment_id: &str,
        request: &EvidenceRequest,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        weather_index: &crate::services::weather_engine::types::WeatherIndex,
        biomass: Option<&BiomassSummary>,
    ) -> Result<JsonValue, PipelineError> {
        let weather = serde_json::to_value(weather_index).map_err(|err| {
            PipelineError::Fatal(format!("weather index failed to serialise: {err}"))
        })?;
        let biomass = match biomass {
            Some(summary) => serde_json::to_value(summary).map_err(|err| {
                PipelineError::Fatal(format!("biomass summary failed to serialise: {err}"))
            })?,
            None => JsonValue::Null,
        };

        Ok(json!({
            "schema_version": EVIDENCE_SCHEMA_VERSION,
            "assessment_id": assessment_id,
            "plot_id": request.plot_id,
            "policy_id": request.policy_id,
            "farmer_address": request.farmer_address,
            "window": {
                "start": window_start.to_rfc3339_opts(SecondsFormat::Secs, true),
                "end": window_end.to_rfc3339_opts(SecondsFormat::Secs, true),
                "days": (window_end - window_start).num_days().max(1),
            },
            "weather_index": weather,
            "biomass": biomass,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::{round_numbers, to_canonical_bytes};
    use crate::services::weather_engine::types::{
        DominantStress, DroughtIndex, DroughtSeverity, FloodIndex, FloodRisk, HeatStressIndex,
        HeatStressLevel, WeatherIndex,
    };
    use chrono::TimeZone;

    fn fixed_index(start: DateTime<Utc>, end: DateTime<Utc>) -> WeatherIndex {
        WeatherIndex {
            plot_id: "plot-P".to_string(),
            policy_id: Some("policy-Q".to_string()),
            window_start: start,
            window_end: end,
            drought: DroughtIndex {
                rainfall_deficit_mm: 42.0,
                consecutive_dry_days: 12,
                days_since_significant_rain: 9,
                soil_moisture_level: Some(22.5),
                soil_moisture_deficit: Some(77.5),
                et_demand: None,
                water_stress_ratio: None,
                score: 0.55,
                severity: DroughtSeverity::Moderate,
            },
            flood: FloodIndex {
                max_daily_rainfall_mm: 4.0,
                cumulative_3day_mm: 8.0,
                cumulative_7day_mm: 12.0,
                max_rainfall_intensity: 0.0,
                heavy_rain_hours: 0,
                consecutive_wet_days: 0,
                sustained_rainfall_hours: 2,
                soil_saturation_level: Some(24.0),
                score: 0.0,
                risk: FloodRisk::None,
            },
            heat: HeatStressIndex {
                max_temperature: 33.0,
                avg_max_temperature: 31.0,
                consecutive_hot_days: 0,
                extreme_heat_days: 0,
                heat_degree_days: 120.0,
                optimal_temp_days: 4,
                score: 0.2,
                level: HeatStressLevel::Mild,
            },
            composite_score: 0.55,
            dominant_stress: DominantStress::Drought,
            stations: vec!["wxm-001".to_string()],
            sample_count: 96,
            data_quality: 0.93,
            confidence: 0.85,
            is_anomaly: false,
            anomaly_score: None,
        }
    }

    #[test]
    fn equal_inputs_produce_byte_identical_documents() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let request = EvidenceRequest {
            plot_id: "plot-P".to_string(),
            policy_id: "policy-Q".to_string(),
            farmer_address: "0xfarmer".to_string(),
            window_days: 30,
        };
        let index = fixed_index(start, end);
        let id = assessment_id(&request.plot_id, &request.policy_id, start, end);

        let doc_a =
            EvidenceBundler::evidence_document(&id, &request, start, end, &index, None).unwrap();
        let doc_b =
            EvidenceBundler::evidence_document(&id, &request, start, end, &index, None).unwrap();

        let bytes_a = to_canonical_bytes(&round_numbers(doc_a));
        let bytes_b = to_canonical_bytes(&round_numbers(doc_b));
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn missing_biomass_is_recorded_as_null() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let request = EvidenceRequest {
            plot_id: "plot-P".to_string(),
            policy_id: "policy-Q".to_string(),
            farmer_address: "0xfarmer".to_string(),
            window_days: 30,
        };
        let index = fixed_index(start, end);
        let doc = EvidenceBundler::evidence_document("a1", &request, start, end, &index, None)
            .unwrap();
        assert!(doc["biomass"].is_null());
        assert_eq!(doc["window"]["days"], 30);
        assert_eq!(doc["weather_index"]["composite_score"], 0.55);
    }
}
