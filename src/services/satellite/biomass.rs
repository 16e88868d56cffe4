use super::types::{BiomassQuality, BiomassSample, BiomassStress, BiomassSummary};
use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use chrono::NaiveDate;
use serde::Deserialize;

/// Baseline is the mean of the first `min(BASELINE_OBSERVATIONS, n)` values.
const BASELINE_OBSERVATIONS: usize = 5;
/// Regression slope is normalised by this factor before clamping to [-1, 1].
const TREND_SLOPE_SCALE: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct ReducerParams {
    pub min_observations: u32,
    pub healthy_threshold: f64,
    pub moderate_stress: f64,
    pub severe_stress: f64,
}

impl ReducerParams {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            min_observations: config.biomass_min_observations,
            healthy_threshold: config.biomass_healthy_threshold,
            moderate_stress: config.biomass_moderate_stress,
            severe_stress: config.biomass_severe_stress,
        }
    }
}

impl Default for ReducerParams {
    fn default() -> Self {
        Self {
            min_observations: 3,
            healthy_threshold: 0.65,
            moderate_stress: 0.50,
            severe_stress: 0.35,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeliveryCsvRow {
    date: String,
    biomass_proxy: f64,
    #[serde(default)]
    cloud_cover: Option<f64>,
}

/// Parses one delivered CSV into samples. Malformed rows are skipped with a
/// warning; a delivery with no parsable rows at all is a schema problem and
/// therefore permanent.
pub fn parse_delivery_csv(plot_id: &str, bytes: &[u8]) -> Result<Vec<BiomassSample>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    for record in reader.deserialize::<DeliveryCsvRow>() {
        let row = match record {
            Ok(row) => row,
            Err(err) => {
                skipped += 1;
                tracing::warn!(plot_id, error = %err, "skipping malformed biomass row");
                continue;
            }
        };
        let Ok(observed_on) = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d") else {
            skipped += 1;
            tracing::warn!(plot_id, date = %row.date, "skipping biomass row with bad date");
            continue;
        };
        if !(0.0..=1.0).contains(&row.biomass_proxy) {
            skipped += 1;
            tracing::warn!(
                plot_id,
                biomass_proxy = row.biomass_proxy,
                "skipping biomass row outside [0, 1]"
            );
            continue;
        }
        let cloud_cover = row.cloud_cover.unwrap_or(0.0).clamp(0.0, 1.0);
        samples.push(BiomassSample {
            plot_id: plot_id.to_string(),
            observed_on,
            biomass_proxy: row.biomass_proxy,
            cloud_cover,
            data_quality: BiomassQuality::from_cloud_cover(cloud_cover),
        });
    }

    if samples.is_empty() && skipped > 0 {
        return Err(PipelineError::Permanent(format!(
            "biomass delivery for plot {plot_id} had no parsable rows ({skipped} skipped)"
        )));
    }
    Ok(samples)
}

fn stress_for(current: f64, params: &ReducerParams) -> BiomassStress {
    if current >= params.healthy_threshold {
        BiomassStress::Healthy
    } else if current >= params.moderate_stress {
        BiomassStress::Moderate
    } else if current >= params.severe_stress {
        BiomassStress::Severe
    } else {
        BiomassStress::Critical
    }
}

/// Reduces delivered samples into summary statistics: current/baseline/
/// min/max, a clamped regression trend, a NaN-safe deviation percentage and
/// a bucketed overall quality tag.
pub fn reduce(
    plot_id: &str,
    subscription_id: &str,
    samples: &[BiomassSample],
    params: &ReducerParams,
) -> Result<BiomassSummary, PipelineError> {
    if (samples.len() as u32) < params.min_observations {
        return Err(PipelineError::InsufficientData(format!(
            "plot {plot_id} has {} biomass observations, needs {}",
            samples.len(),
            params.min_observations
        )));
    }

    let mut sorted: Vec<BiomassSample> = samples.to_vec();
    sorted.sort_by_key(|sample| sample.observed_on);

    let values: Vec<f64> = sorted.iter().map(|sample| sample.biomass_proxy).collect();
    let current = *values.last().expect("non-empty after gate");
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    let max = values.iter().copied().fold(f64::MIN, f64::max);

    let k = BASELINE_OBSERVATIONS.min(values.len());
    let baseline = values[..k].iter().sum::<f64>() / k as f64;

    let trend = if values.len() > 1 {
        let n = values.len() as f64;
        let sum_x: f64 = (0..values.len()).map(|i| i as f64).sum();
        let sum_y: f64 = values.iter().sum();
        let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
        let sum_x2: f64 = (0..values.len()).map(|i| (i as f64).powi(2)).sum();
        let denominator = n * sum_x2 - sum_x.powi(2);
        if denominator == 0.0 {
            0.0
        } else {
            let slope = (n * sum_xy - sum_x * sum_y) / denominator;
            (slope * TREND_SLOPE_SCALE).clamp(-1.0, 1.0)
        }
    } else {
        0.0
    };

    let deviation_percent = if baseline == 0.0 {
        0.0
    } else {
        (baseline - current) / baseline * 100.0
    };

    let mean_quality_score = sorted
        .iter()
        .map(|sample| sample.data_quality.score())
        .sum::<f64>()
        / sorted.len() as f64;

    Ok(BiomassSummary {
        plot_id: plot_id.to_string(),
        subscription_id: subscription_id.to_string(),
        current,
        baseline,
        min,
        max,
        trend,
        deviation_percent,
        last_updated: sorted.last().expect("non-empty after gate").observed_on,
        overall_quality: BiomassQuality::from_mean_score(mean_quality_score),
        stress: stress_for(current, params),
        sample_count: sorted.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(date: &str, value: f64, cloud: f64) -> BiomassSample {
        BiomassSample {
            plot_id: "plot-1".to_string(),
            observed_on: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            biomass_proxy: value,
            cloud_cover: cloud,
            data_quality: BiomassQuality::from_cloud_cover(cloud),
        }
    }

    #[test]
    fn declining_series_reduces_as_expected() {
        let samples = vec![
            sample("2024-05-01", 0.80, 0.05),
            sample("2024-05-02", 0.78, 0.05),
            sample("2024-05-03", 0.76, 0.05),
            sample("2024-05-04", 0.70, 0.05),
            sample("2024-05-05", 0.60, 0.05),
        ];
        let summary = reduce("plot-1", "sub-1", &samples, &ReducerParams::default()).unwrap();

        assert_eq!(summary.current, 0.60);
        assert!((summary.baseline - 0.728).abs() < 1e-9);
        assert_eq!(summary.min, 0.60);
        assert_eq!(summary.max, 0.80);
        assert!(summary.trend < 0.0 && summary.trend >= -1.0);
        assert!((summary.deviation_percent - 17.582_417).abs() < 1e-3);
        assert_eq!(summary.overall_quality, BiomassQuality::High);
        assert_eq!(summary.last_updated, samples[4].observed_on);
    }

    #[test]
    fn reducer_sorts_before_reducing() {
        let shuffled = vec![
            sample("2024-05-05", 0.60, 0.05),
            sample("2024-05-01", 0.80, 0.05),
            sample("2024-05-03", 0.76, 0.05),
            sample("2024-05-02", 0.78, 0.05),
            sample("2024-05-04", 0.70, 0.05),
        ];
        let summary = reduce("plot-1", "sub-1", &shuffled, &ReducerParams::default()).unwrap();
        assert_eq!(summary.current, 0.60);
        assert!(summary.trend < 0.0);
    }

    #[test]
    fn zero_baseline_reports_zero_deviation() {
        let samples = vec![
            sample("2024-05-01", 0.0, 0.05),
            sample("2024-05-02", 0.0, 0.05),
            sample("2024-05-03", 0.0, 0.05),
        ];
        let summary = reduce("plot-1", "sub-1", &samples, &ReducerParams::default()).unwrap();
        assert_eq!(summary.deviation_percent, 0.0);
        assert_eq!(summary.stress, BiomassStress::Critical);
    }

    #[test]
    fn too_few_observations_is_insufficient_data() {
        let samples = vec![sample("2024-05-01", 0.7, 0.05)];
        let err = reduce("plot-1", "sub-1", &samples, &ReducerParams::default()).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
    }

    #[test]
    fn csv_parses_and_tags_quality() {
        let csv = b"date,biomass_proxy,cloud_cover\n\
            2024-05-01,0.80,0.05\n\
            2024-05-02,0.78,0.2\n\
            2024-05-03,0.10,0.6\n";
        let samples = parse_delivery_csv("plot-1", csv).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].data_quality, BiomassQuality::High);
        assert_eq!(samples[1].data_quality, BiomassQuality::Medium);
        assert_eq!(samples[2].data_quality, BiomassQuality::Low);
    }

    #[test]
    fn csv_skips_bad_rows_but_keeps_good_ones() {
        let csv = b"date,biomass_proxy,cloud_cover\n\
            not-a-date,0.80,0.05\n\
            2024-05-02,1.4,0.05\n\
            2024-05-03,0.70,0.05\n";
        let samples = parse_delivery_csv("plot-1", csv).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].biomass_proxy, 0.70);
    }

    #[test]
    fn fully_unparsable_csv_is_permanent() {
        let csv = b"date,biomass_proxy,cloud_cover\nnope,not,numbers\n";
        let err = parse_delivery_csv("plot-1", csv).unwrap_err();
        assert!(matches!(err, PipelineError::Permanent(_)));
    }

    #[test]
    fn stress_labels_follow_thresholds() {
        let params = ReducerParams::default();
        assert_eq!(stress_for(0.70, &params), BiomassStress::Healthy);
        assert_eq!(stress_for(0.55, &params), BiomassStress::Moderate);
        assert_eq!(stress_for(0.40, &params), BiomassStress::Severe);
        assert_eq!(stress_for(0.20, &params), BiomassStress::Critical);
    }
}
