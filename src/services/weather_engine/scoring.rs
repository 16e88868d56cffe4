use super::types::{
    DominantStress, DroughtIndex, DroughtSeverity, FloodIndex, FloodRisk, HeatStressIndex,
    HeatStressLevel, StationSample,
};
use super::{
    daily_max_temperature, daily_mean_temperature, daily_rainfall, days_since_significant_rain,
    heat_degree_days, longest_daily_run, max_cumulative_rainfall, sustained_rainfall_run,
    EngineParams, DRY_DAY_MM, HEAVY_RAIN_RATE_MM_H, SIGNIFICANT_RAIN_MM,
};

const ANOMALY_MIN_SAMPLES: usize = 30;
const ANOMALY_Z_THRESHOLD: f64 = 3.0;
const ANOMALY_RATIO_THRESHOLD: f64 = 0.1;
const OPTIMAL_TEMP_MIN_C: f64 = 20.0;
const OPTIMAL_TEMP_MAX_C: f64 = 30.0;

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn drought_index(
    params: &EngineParams,
    samples: &[StationSample],
    window_days: u32,
) -> DroughtIndex {
    let daily = daily_rainfall(samples);
    let actual_rainfall: f64 = daily.values().sum();
    let expected_rainfall = params.expected_daily_rainfall_mm * f64::from(window_days);
    let rainfall_deficit_mm = (expected_rainfall - actual_rainfall).max(0.0);

    let consecutive_dry_days = longest_daily_run(&daily, |mm| mm < DRY_DAY_MM);
    let days_since_rain = days_since_significant_rain(&daily);

    let soil_readings: Vec<f64> = samples
        .iter()
        .filter_map(|sample| sample.soil_moisture)
        .collect();
    let soil_moisture_level = (!soil_readings.is_empty()).then(|| mean(&soil_readings));
    let soil_moisture_deficit = soil_moisture_level.map(|level| 100.0 - level);

    // Simplified evapotranspiration demand, reported only when both soil
    // moisture and solar radiation are observed.
    let (et_demand, water_stress_ratio) = if soil_moisture_level.is_some() {
        let solar: Vec<f64> = samples
            .iter()
            .filter_map(|sample| sample.solar_radiation)
            .collect();
        if solar.is_empty() {
            (None, None)
        } else {
            let avg_temp = mean(
                &samples
                    .iter()
                    .map(|sample| sample.temperature)
                    .collect::<Vec<_>>(),
            );
            let et = 0.408 * mean(&solar) * (avg_temp + 17.8) / 100.0;
            let daily_actual = actual_rainfall / f64::from(window_days.max(1));
            (Some(et), Some(et / daily_actual.max(1.0)))
        }
    } else {
        (None, None)
    };

    let mut score = 0.0f64;
    if rainfall_deficit_mm > 0.0 {
        score += (rainfall_deficit_mm / 100.0).min(0.4);
    }
    if consecutive_dry_days >= params.drought_severe_days {
        score += (f64::from(consecutive_dry_days - params.drought_severe_days) / 20.0).min(0.3);
    }
    score += (f64::from(days_since_rain) / 30.0).min(0.2);
    if let Some(level) = soil_moisture_level {
        if level < 30.0 {
            score += 0.1;
        } else if level < 50.0 {
            score += 0.05;
        }
    }
    let score = score.min(1.0);

    DroughtIndex {
        rainfall_deficit_mm,
        consecutive_dry_days,
        days_since_significant_rain: days_since_rain,
        soil_moisture_level,
        soil_moisture_deficit,
        et_demand,
        water_stress_ratio,
        score,
        severity: DroughtSeverity::from_score(score),
    }
}

pub fn flood_index(params: &EngineParams, samples: &[StationSample]) -> FloodIndex {
    let daily = daily_rainfall(samples);
    let max_daily_rainfall_mm = daily.values().copied().fold(0.0, f64::max);
    let cumulative_3day_mm = max_cumulative_rainfall(&daily, 3);
    let cumulative_7day_mm = max_cumulative_rainfall(&daily, 7);

    let max_rainfall_intensity = samples
        .iter()
        .filter_map(|sample| sample.rainfall_rate)
        .fold(0.0, f64::max);
    let heavy_rain_hours = samples
        .iter()
        .filter(|sample| {
            sample
                .rainfall_rate
                .is_some_and(|rate| rate > HEAVY_RAIN_RATE_MM_H)
        })
        .count() as u32;

    let consecutive_wet_days = longest_daily_run(&daily, |mm| mm > SIGNIFICANT_RAIN_MM);
    let sustained_rainfall_hours = sustained_rainfall_run(samples);

    let soil_saturation_level = samples
        .iter()
        .filter_map(|sample| sample.soil_moisture)
        .fold(None::<f64>, |acc, value| {
            Some(acc.map_or(value, |current| current.max(value)))
        });

    let mut score = 0.0f64;
    if max_daily_rainfall_mm > params.flood_daily_threshold_mm {
        score += ((max_daily_rainfall_mm - params.flood_daily_threshold_mm) / 100.0).min(0.3);
    }
    if cumulative_3day_mm > params.flood_cumulative_3day_mm {
        score += ((cumulative_3day_mm - params.flood_cumulative_3day_mm) / 200.0).min(0.3);
    }
    if max_rainfall_intensity > params.flood_intensity_threshold {
        score += ((max_rainfall_intensity - params.flood_intensity_threshold) / 20.0).min(0.2);
    }
    if consecutive_wet_days >= 5 {
        score += (f64::from(consecutive_wet_days) / 10.0).min(0.1);
    }
    if soil_saturation_level.is_some_and(|level| level > 90.0) {
        score += 0.1;
    }
    let score = score.min(1.0);

    FloodIndex {
        max_daily_rainfall_mm,
        cumulative_3day_mm,
        cumulative_7day_mm,
        max_rainfall_intensity,
        heavy_rain_hours,
        consecutive_wet_days,
        sustained_rainfall_hours,
        soil_saturation_level,
        score,
        risk: FloodRisk::from_score(score),
    }
}

pub fn heat_stress_index(params: &EngineParams, samples: &[StationSample]) -> HeatStressIndex {
    let daily_max = daily_max_temperature(samples);
    let max_temperature = daily_max.values().copied().fold(f64::MIN, f64::max);
    let max_temperature = if daily_max.is_empty() {
        0.0
    } else {
        max_temperature
    };
    let avg_max_temperature = mean(&daily_max.values().copied().collect::<Vec<_>>());

    let consecutive_hot_days = longest_daily_run(&daily_max, |t| t > params.heat_threshold_celsius);
    let extreme_heat_days = daily_max
        .values()
        .filter(|t| **t > params.heat_extreme_celsius)
        .count() as u32;
    let optimal_temp_days = daily_max
        .values()
        .filter(|t| (OPTIMAL_TEMP_MIN_C..=OPTIMAL_TEMP_MAX_C).contains(*t))
        .count() as u32;

    let heat_degree_days = heat_degree_days(&daily_mean_temperature(samples));

    let mut score = 0.0f64;
    if max_temperature > params.heat_threshold_celsius {
        score += ((max_temperature - params.heat_threshold_celsius) / 15.0).min(0.3);
    }
    if avg_max_temperature > 30.0 {
        score += ((avg_max_temperature - 30.0) / 10.0).min(0.2);
    }
    if consecutive_hot_days >= params.heat_severe_days {
        score += (f64::from(consecutive_hot_days - params.heat_severe_days) / 10.0).min(0.3);
    }
    if extreme_heat_days > 0 {
        score += (f64::from(extreme_heat_days) / 5.0).min(0.2);
    }
    let score = score.min(1.0);

    HeatStressIndex {
        max_temperature,
        avg_max_temperature,
        consecutive_hot_days,
        extreme_heat_days,
        heat_degree_days,
        optimal_temp_days,
        score,
        level: HeatStressLevel::from_score(score),
    }
}

/// Composite rule: concurrent drought and heat compound; otherwise the
/// largest sub-index wins and becomes dominant only above 0.3.
pub fn composite_stress(drought: f64, flood: f64, heat: f64) -> (f64, DominantStress) {
    if drought >= 0.4 && heat >= 0.4 {
        return ((drought + heat * 0.5).min(1.0), DominantStress::Combined);
    }

    let max_score = drought.max(flood).max(heat);
    let dominant = if max_score == drought && drought > 0.3 {
        DominantStress::Drought
    } else if max_score == flood && flood > 0.3 {
        DominantStress::Flood
    } else if max_score == heat && heat > 0.3 {
        DominantStress::Heat
    } else {
        DominantStress::None
    };
    (max_score, dominant)
}

fn abs_z_scores(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let mu = mean(values);
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    let std = variance.sqrt();
    if std == 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| ((v - mu) / std).abs()).collect()
}

/// Statistical outlier flag: the share of |z| > 3 readings across
/// temperature and non-zero rainfall. Needs at least 30 samples.
pub fn detect_anomalies(samples: &[StationSample]) -> (bool, Option<f64>) {
    if samples.len() < ANOMALY_MIN_SAMPLES {
        return (false, None);
    }

    let temps: Vec<f64> = samples.iter().map(|sample| sample.temperature).collect();
    let wet: Vec<f64> = samples
        .iter()
        .map(|sample| sample.rainfall)
        .filter(|mm| *mm > 0.0)
        .collect();

    let temp_outliers = abs_z_scores(&temps)
        .iter()
        .filter(|z| **z > ANOMALY_Z_THRESHOLD)
        .count();
    let rain_outliers = abs_z_scores(&wet)
        .iter()
        .filter(|z| **z > ANOMALY_Z_THRESHOLD)
        .count();

    let ratio = (temp_outliers + rain_outliers) as f64 / samples.len() as f64;
    let anomaly_score = ratio.min(1.0);
    (anomaly_score > ANOMALY_RATIO_THRESHOLD, Some(anomaly_score))
}

pub fn mean_data_quality(samples: &[StationSample]) -> f64 {
    mean(
        &samples
            .iter()
            .map(|sample| sample.data_quality)
            .collect::<Vec<_>>(),
    )
}

/// Confidence blends observation quality (70%) with sample volume (30%,
/// saturating at 100 samples). Monotone in both inputs.
pub fn confidence(data_quality: f64, sample_count: usize) -> f64 {
    let quality_component = data_quality * 0.7;
    let quantity_component = ((sample_count as f64 / 100.0) * 0.3).min(0.3);
    (quality_component + quantity_component).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::daily_sample;
    use super::*;

    #[test]
    fn composite_compounds_drought_and_heat() {
        let (score, dominant) = composite_stress(0.6, 0.1, 0.5);
        assert!((score - 0.85).abs() < 1e-9);
        assert_eq!(dominant, DominantStress::Combined);

        // Compounding saturates at 1.
        let (score, _) = composite_stress(0.9, 0.0, 0.9);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn composite_takes_max_without_compounding() {
        let (score, dominant) = composite_stress(0.2, 0.55, 0.35);
        assert_eq!(score, 0.55);
        assert_eq!(dominant, DominantStress::Flood);

        let (score, dominant) = composite_stress(0.1, 0.15, 0.2);
        assert_eq!(score, 0.2);
        assert_eq!(dominant, DominantStress::None);

        // Drought over 0.4 alone does not compound.
        let (score, dominant) = composite_stress(0.5, 0.0, 0.39);
        assert_eq!(score, 0.5);
        assert_eq!(dominant, DominantStress::Drought);
    }

    #[test]
    fn confidence_is_monotone_and_bounded() {
        assert!(confidence(0.9, 50) > confidence(0.9, 10));
        assert!(confidence(0.9, 50) > confidence(0.5, 50));
        assert_eq!(confidence(1.0, 1000), 1.0);
        assert_eq!(confidence(0.0, 0), 0.0);
        // Quantity component saturates at 100 samples.
        assert_eq!(confidence(0.8, 100), confidence(0.8, 400));
    }

    #[test]
    fn anomaly_requires_minimum_samples() {
        let samples: Vec<_> = (0..10).map(|day| daily_sample(day, 22.0, 0.0)).collect();
        assert_eq!(detect_anomalies(&samples), (false, None));
    }

    #[test]
    fn uniform_series_is_not_anomalous() {
        let samples: Vec<_> = (0..40).map(|day| daily_sample(day, 40.0, 0.0)).collect();
        let (flag, score) = detect_anomalies(&samples);
        assert!(!flag);
        assert_eq!(score, Some(0.0));
    }

    #[test]
    fn spiky_series_raises_the_flag() {
        // Outliers in both temperature and rainfall push the combined
        // outlier share past the 10% threshold.
        let mut samples: Vec<_> = (0..40)
            .map(|idx| daily_sample(idx, 20.0 + (idx % 3) as f64 * 0.1, 1.0))
            .collect();
        for sample in samples.iter_mut().take(3) {
            sample.temperature = 90.0;
        }
        for sample in samples.iter_mut().skip(3).take(3) {
            sample.rainfall = 500.0;
        }
        let (flag, score) = detect_anomalies(&samples);
        assert!(flag, "score {score:?}");
        assert!(score.unwrap() > ANOMALY_RATIO_THRESHOLD);
    }

    #[test]
    fn drier_window_never_lowers_drought_score() {
        let params = EngineParams::default();
        let wet: Vec<_> = (0..20).map(|day| daily_sample(day, 22.0, 5.0)).collect();
        let dry: Vec<_> = (0..20).map(|day| daily_sample(day, 22.0, 0.0)).collect();
        let wet_index = drought_index(&params, &wet, 20);
        let dry_index = drought_index(&params, &dry, 20);
        assert!(dry_index.score >= wet_index.score);
    }

    #[test]
    fn wetter_window_never_lowers_flood_score() {
        let params = EngineParams::default();
        let light: Vec<_> = (0..10).map(|day| daily_sample(day, 22.0, 20.0)).collect();
        let heavy: Vec<_> = (0..10).map(|day| daily_sample(day, 22.0, 80.0)).collect();
        assert!(flood_index(&params, &heavy).score >= flood_index(&params, &light).score);
    }

    #[test]
    fn soil_moisture_tiers_step_the_drought_score() {
        let params = EngineParams::default();
        let with_soil = |level: f64| {
            let samples: Vec<_> = (0..5)
                .map(|day| {
                    let mut sample = daily_sample(day, 22.0, 5.0);
                    sample.soil_moisture = Some(level);
                    sample
                })
                .collect::<Vec<_>>();
            drought_index(&params, &samples, 5).score
        };
        let dry_soil = with_soil(20.0);
        let mid_soil = with_soil(40.0);
        let wet_soil = with_soil(70.0);
        assert!((dry_soil - wet_soil - 0.1).abs() < 1e-9);
        assert!((mid_soil - wet_soil - 0.05).abs() < 1e-9);
    }

    #[test]
    fn missing_optional_fields_contribute_zero() {
        let params = EngineParams::default();
        let samples: Vec<_> = (0..5).map(|day| daily_sample(day, 22.0, 5.0)).collect();
        let drought = drought_index(&params, &samples, 5);
        assert!(drought.soil_moisture_level.is_none());
        assert!(drought.et_demand.is_none());
        let flood = flood_index(&params, &samples);
        assert!(flood.soil_saturation_level.is_none());
        assert_eq!(flood.max_rainfall_intensity, 0.0);
    }
}
