pub mod scoring;
pub mod types;

use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use types::{StationSample, WeatherIndex};

/// Daily rainfall below this is a dry day, mm.
pub const DRY_DAY_MM: f64 = 1.0;
/// Daily rainfall above this counts as significant / wet, mm.
pub const SIGNIFICANT_RAIN_MM: f64 = 10.0;
/// Sample rainfall rate above this counts as heavy rain, mm/h.
pub const HEAVY_RAIN_RATE_MM_H: f64 = 5.0;
/// Base temperature for the heat-degree-day accumulator, degC.
pub const HEAT_DEGREE_BASE_C: f64 = 10.0;

/// Tunable thresholds for the index formulas, resolved once from config.
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Expected daily rainfall used for the deficit term, mm/day.
    pub expected_daily_rainfall_mm: f64,
    pub drought_severe_days: u32,
    pub flood_daily_threshold_mm: f64,
    /// Rainfall-rate threshold for the intensity term, mm/h.
    pub flood_intensity_threshold: f64,
    pub flood_cumulative_3day_mm: f64,
    pub heat_threshold_celsius: f64,
    pub heat_extreme_celsius: f64,
    pub heat_severe_days: u32,
}

impl EngineParams {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            expected_daily_rainfall_mm: config.drought_threshold_mm,
            drought_severe_days: config.drought_severe_days,
            flood_daily_threshold_mm: config.flood_threshold_mm,
            flood_intensity_threshold: config.flood_severe_mm,
            flood_cumulative_3day_mm: config.flood_cumulative_3day_mm,
            heat_threshold_celsius: config.heat_threshold_celsius,
            heat_extreme_celsius: config.heat_severe_celsius,
            heat_severe_days: 7,
        }
    }
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            expected_daily_rainfall_mm: 2.0,
            drought_severe_days: 14,
            flood_daily_threshold_mm: 30.0,
            flood_intensity_threshold: 10.0,
            flood_cumulative_3day_mm: 100.0,
            heat_threshold_celsius: 35.0,
            heat_extreme_celsius: 40.0,
            heat_severe_days: 7,
        }
    }
}

pub(crate) fn daily_rainfall(samples: &[StationSample]) -> BTreeMap<NaiveDate, f64> {
    let mut daily: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for sample in samples {
        *daily.entry(sample.timestamp.date_naive()).or_insert(0.0) += sample.rainfall;
    }
    daily
}

pub(crate) fn daily_max_temperature(samples: &[StationSample]) -> BTreeMap<NaiveDate, f64> {
    let mut daily: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for sample in samples {
        daily
            .entry(sample.timestamp.date_naive())
            .and_modify(|current| *current = current.max(sample.temperature))
            .or_insert(sample.temperature);
    }
    daily
}

pub(crate) fn daily_mean_temperature(samples: &[StationSample]) -> BTreeMap<NaiveDate, f64> {
    let mut sums: BTreeMap<NaiveDate, (f64, u32)> = BTreeMap::new();
    for sample in samples {
        let entry = sums.entry(sample.timestamp.date_naive()).or_insert((0.0, 0));
        entry.0 += sample.temperature;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(date, (sum, count))| (date, sum / f64::from(count)))
        .collect()
}

/// Longest run of consecutive days (dates ascending) satisfying `predicate`.
pub(crate) fn longest_daily_run<F>(daily: &BTreeMap<NaiveDate, f64>, predicate: F) -> u32
where
    F: Fn(f64) -> bool,
{
    let mut longest = 0u32;
    let mut current = 0u32;
    for value in daily.values() {
        if predicate(*value) {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Trailing days (latest first) without significant rain. A wet final day
/// yields zero; a fully dry window yields the day count.
pub(crate) fn days_since_significant_rain(daily: &BTreeMap<NaiveDate, f64>) -> u32 {
    for (idx, value) in daily.values().rev().enumerate() {
        if *value > SIGNIFICANT_RAIN_MM {
            return idx as u32;
        }
    }
    daily.len() as u32
}

/// Maximum rainfall summed over any `window_days` consecutive calendar days.
/// Windows shorter than `window_days` fall back to the whole-period sum;
/// callers rely on that fallback, so it is preserved as-is.
pub(crate) fn max_cumulative_rainfall(daily: &BTreeMap<NaiveDate, f64>, window_days: usize) -> f64 {
    let values: Vec<f64> = daily.values().copied().collect();
    if values.len() < window_days {
        return values.iter().sum();
    }
    values
        .windows(window_days)
        .map(|window| window.iter().sum::<f64>())
        .fold(0.0, f64::max)
}

/// Longest consecutive run of samples reporting any rainfall, in samples
/// (hourly feeds make this hours).
pub(crate) fn sustained_rainfall_run(samples: &[StationSample]) -> u32 {
    let mut longest = 0u32;
    let mut current = 0u32;
    for sample in samples {
        if sample.rainfall > 0.0 {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

pub(crate) fn heat_degree_days(daily_mean: &BTreeMap<NaiveDate, f64>) -> f64 {
    daily_mean
        .values()
        .filter(|mean| **mean > HEAT_DEGREE_BASE_C)
        .map(|mean| mean - HEAT_DEGREE_BASE_C)
        .sum()
}

fn assert_unit_interval(name: &str, value: f64) -> Result<(), PipelineError> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        return Err(PipelineError::Fatal(format!(
            "{name} out of range after computation: {value}"
        )));
    }
    Ok(())
}

/// Computes the full stress assessment for one plot over a closed window.
/// Pure: no I/O, no suspension. Fails `InsufficientData` on an empty window
/// and `Fatal` if any computed score escapes [0, 1].
pub fn compute_weather_index(
    params: &EngineParams,
    plot_id: &str,
    policy_id: Option<&str>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    samples: &[StationSample],
) -> Result<WeatherIndex, PipelineError> {
    if window_end <= window_start {
        return Err(PipelineError::Permanent(format!(
            "window end {window_end} not after start {window_start}"
        )));
    }
    if samples.is_empty() {
        return Err(PipelineError::InsufficientData(format!(
            "no station samples for plot {plot_id} in window"
        )));
    }

    let mut sorted: Vec<StationSample> = samples.to_vec();
    sorted.sort_by_key(|sample| sample.timestamp);

    let window_days = (window_end.date_naive() - window_start.date_naive()).num_days() + 1;
    let window_days = window_days.max(1) as u32;

    let drought = scoring::drought_index(params, &sorted, window_days);
    let flood = scoring::flood_index(params, &sorted);
    let heat = scoring::heat_stress_index(params, &sorted);

    assert_unit_interval("drought score", drought.score)?;
    assert_unit_interval("flood score", flood.score)?;
    assert_unit_interval("heat score", heat.score)?;

    let (composite_score, dominant_stress) =
        scoring::composite_stress(drought.score, flood.score, heat.score);
    assert_unit_interval("composite score", composite_score)?;

    let (is_anomaly, anomaly_score) = scoring::detect_anomalies(&sorted);
    let data_quality = scoring::mean_data_quality(&sorted);
    let confidence = scoring::confidence(data_quality, sorted.len());
    assert_unit_interval("confidence", confidence)?;

    let mut stations: Vec<String> = sorted
        .iter()
        .map(|sample| sample.station_id.clone())
        .collect();
    stations.sort();
    stations.dedup();

    Ok(WeatherIndex {
        plot_id: plot_id.to_string(),
        policy_id: policy_id.map(|value| value.to_string()),
        window_start,
        window_end,
        drought,
        flood,
        heat,
        composite_score,
        dominant_stress,
        stations,
        sample_count: sorted.len() as u32,
        data_quality,
        confidence,
        is_anomaly,
        anomaly_score: if is_anomaly { anomaly_score } else { None },
    })
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::types::StationSample;
    use chrono::{Duration, TimeZone, Utc};

    pub fn daily_sample(day: i64, temperature: f64, rainfall: f64) -> StationSample {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        StationSample {
            station_id: "wxm-001".to_string(),
            timestamp: base + Duration::days(day),
            latitude: -19.31,
            longitude: 31.43,
            temperature,
            feels_like: None,
            min_temperature: None,
            max_temperature: None,
            rainfall,
            rainfall_rate: None,
            humidity: 50.0,
            pressure: 1013.25,
            wind_speed: 2.0,
            wind_direction: None,
            wind_gust: None,
            solar_radiation: None,
            uv_index: None,
            soil_moisture: None,
            soil_temperature: None,
            data_quality: 0.95,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::daily_sample;
    use super::types::{DominantStress, FloodRisk};
    use super::*;
    use chrono::{Duration, TimeZone};

    fn window(days: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        (start, start + Duration::days(days - 1) + Duration::hours(23))
    }

    #[test]
    fn empty_window_is_insufficient_data() {
        let (start, end) = window(30);
        let err = compute_weather_index(&EngineParams::default(), "plot-1", None, start, end, &[])
            .unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let (start, end) = window(30);
        let samples = vec![daily_sample(0, 22.0, 2.0)];
        let err = compute_weather_index(&EngineParams::default(), "plot-1", None, end, start, &samples)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Permanent(_)));
    }

    #[test]
    fn severe_drought_window_compounds_with_heat() {
        let (start, end) = window(30);
        let samples: Vec<_> = (0..30)
            .map(|day| {
                let mut sample = daily_sample(day, 40.0, 0.0);
                sample.soil_moisture = Some(5.0);
                sample.humidity = 10.0;
                sample
            })
            .collect();

        let index = compute_weather_index(
            &EngineParams::default(),
            "plot-1",
            Some("policy-1"),
            start,
            end,
            &samples,
        )
        .unwrap();

        assert!(index.drought.score >= 0.9, "drought {}", index.drought.score);
        assert!(index.heat.score >= 0.7, "heat {}", index.heat.score);
        assert!(index.composite_score >= 0.9);
        assert_eq!(index.dominant_stress, DominantStress::Combined);
        // Uniformly hot and dry is severe, not statistically anomalous.
        assert!(!index.is_anomaly);
        assert_eq!(index.sample_count, 30);
    }

    #[test]
    fn heavy_rainfall_week_flags_flood() {
        let (start, end) = window(7);
        let samples: Vec<_> = (0..7)
            .map(|day| {
                let mut sample = daily_sample(day, 24.0, 50.0);
                sample.soil_moisture = Some(95.0);
                sample
            })
            .collect();

        let index =
            compute_weather_index(&EngineParams::default(), "plot-1", None, start, end, &samples)
                .unwrap();

        assert!(index.flood.score >= 0.6, "flood {}", index.flood.score);
        assert!(index.drought.score <= 0.1, "drought {}", index.drought.score);
        assert_eq!(index.dominant_stress, DominantStress::Flood);
        assert!(index.flood.risk >= FloodRisk::High);
    }

    #[test]
    fn quiet_plot_scores_low_everywhere() {
        let (start, end) = window(30);
        let samples: Vec<_> = (0..30)
            .map(|day| {
                let mut sample = daily_sample(day, 22.0, 2.0);
                sample.data_quality = 0.98;
                sample
            })
            .collect();

        let index =
            compute_weather_index(&EngineParams::default(), "plot-1", None, start, end, &samples)
                .unwrap();

        assert!(index.drought.score < 0.3);
        assert!(index.flood.score < 0.3);
        assert!(index.heat.score < 0.3);
        assert!(index.composite_score < 0.3);
        assert_eq!(index.dominant_stress, DominantStress::None);
    }

    #[test]
    fn all_scores_stay_in_unit_interval_for_extreme_inputs() {
        let (start, end) = window(60);
        let samples: Vec<_> = (0..60)
            .map(|day| {
                let mut sample = daily_sample(day, 55.0, if day % 2 == 0 { 0.0 } else { 400.0 });
                sample.rainfall_rate = Some(120.0);
                sample.soil_moisture = Some(if day % 2 == 0 { 1.0 } else { 99.0 });
                sample
            })
            .collect();

        let index =
            compute_weather_index(&EngineParams::default(), "plot-1", None, start, end, &samples)
                .unwrap();
        for score in [
            index.drought.score,
            index.flood.score,
            index.heat.score,
            index.composite_score,
            index.confidence,
        ] {
            assert!((0.0..=1.0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn hotter_sample_never_lowers_heat_score() {
        let (start, end) = window(14);
        let base: Vec<_> = (0..14).map(|day| daily_sample(day, 36.0, 0.0)).collect();
        let hotter: Vec<_> = base
            .iter()
            .cloned()
            .map(|mut sample| {
                sample.temperature += 6.0;
                sample
            })
            .collect();

        let params = EngineParams::default();
        let low = compute_weather_index(&params, "plot-1", None, start, end, &base).unwrap();
        let high = compute_weather_index(&params, "plot-1", None, start, end, &hotter).unwrap();
        assert!(high.heat.score >= low.heat.score);
    }

    #[test]
    fn cumulative_window_falls_back_to_whole_period_sum() {
        // Two days of data against a 3-day window: the fallback returns the
        // whole-period sum instead of erroring or padding.
        let samples = vec![daily_sample(0, 22.0, 40.0), daily_sample(1, 22.0, 30.0)];
        let daily = daily_rainfall(&samples);
        assert_eq!(max_cumulative_rainfall(&daily, 3), 70.0);

        let full = vec![
            daily_sample(0, 22.0, 40.0),
            daily_sample(1, 22.0, 30.0),
            daily_sample(2, 22.0, 0.0),
            daily_sample(3, 22.0, 50.0),
        ];
        let daily = daily_rainfall(&full);
        assert_eq!(max_cumulative_rainfall(&daily, 3), 80.0);
    }

    #[test]
    fn trailing_rain_counter_counts_from_window_end() {
        let mut samples: Vec<_> = (0..10).map(|day| daily_sample(day, 22.0, 0.0)).collect();
        samples[4].rainfall = 25.0;
        let daily = daily_rainfall(&samples);
        assert_eq!(days_since_significant_rain(&daily), 5);

        samples[9].rainfall = 25.0;
        let daily = daily_rainfall(&samples);
        assert_eq!(days_since_significant_rain(&daily), 0);
    }
}
