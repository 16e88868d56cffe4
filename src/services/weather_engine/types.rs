use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One atomic station reading. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct StationSample {
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature: f64,
    pub feels_like: Option<f64>,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    /// Accumulated rainfall for the sample interval, mm.
    pub rainfall: f64,
    /// Instantaneous rainfall rate, mm/h.
    pub rainfall_rate: Option<f64>,
    pub humidity: f64,
    pub pressure: f64,
    pub wind_speed: f64,
    pub wind_direction: Option<f64>,
    pub wind_gust: Option<f64>,
    pub solar_radiation: Option<f64>,
    pub uv_index: Option<f64>,
    /// Volumetric soil moisture, percent 0-100.
    pub soil_moisture: Option<f64>,
    pub soil_temperature: Option<f64>,
    pub data_quality: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Station {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DroughtSeverity {
    None,
    Mild,
    Moderate,
    Severe,
    Extreme,
}

impl DroughtSeverity {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 0.2 => DroughtSeverity::None,
            s if s < 0.4 => DroughtSeverity::Mild,
            s if s < 0.6 => DroughtSeverity::Moderate,
            s if s < 0.8 => DroughtSeverity::Severe,
            _ => DroughtSeverity::Extreme,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DroughtSeverity::None => "none",
            DroughtSeverity::Mild => "mild",
            DroughtSeverity::Moderate => "moderate",
            DroughtSeverity::Severe => "severe",
            DroughtSeverity::Extreme => "extreme",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FloodRisk {
    None,
    Low,
    Moderate,
    High,
    Critical,
}

impl FloodRisk {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 0.2 => FloodRisk::None,
            s if s < 0.4 => FloodRisk::Low,
            s if s < 0.6 => FloodRisk::Moderate,
            s if s < 0.8 => FloodRisk::High,
            _ => FloodRisk::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FloodRisk::None => "none",
            FloodRisk::Low => "low",
            FloodRisk::Moderate => "moderate",
            FloodRisk::High => "high",
            FloodRisk::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HeatStressLevel {
    None,
    Mild,
    Moderate,
    Severe,
    Extreme,
}

impl HeatStressLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 0.2 => HeatStressLevel::None,
            s if s < 0.4 => HeatStressLevel::Mild,
            s if s < 0.6 => HeatStressLevel::Moderate,
            s if s < 0.8 => HeatStressLevel::Severe,
            _ => HeatStressLevel::Extreme,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HeatStressLevel::None => "none",
            HeatStressLevel::Mild => "mild",
            HeatStressLevel::Moderate => "moderate",
            HeatStressLevel::Severe => "severe",
            HeatStressLevel::Extreme => "extreme",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DominantStress {
    Drought,
    Flood,
    Heat,
    Combined,
    None,
}

impl DominantStress {
    pub fn as_str(&self) -> &'static str {
        match self {
            DominantStress::Drought => "drought",
            DominantStress::Flood => "flood",
            DominantStress::Heat => "heat",
            DominantStress::Combined => "combined",
            DominantStress::None => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DroughtIndex {
    pub rainfall_deficit_mm: f64,
    pub consecutive_dry_days: u32,
    pub days_since_significant_rain: u32,
    pub soil_moisture_level: Option<f64>,
    pub soil_moisture_deficit: Option<f64>,
    pub et_demand: Option<f64>,
    pub water_stress_ratio: Option<f64>,
    pub score: f64,
    pub severity: DroughtSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FloodIndex {
    pub max_daily_rainfall_mm: f64,
    pub cumulative_3day_mm: f64,
    pub cumulative_7day_mm: f64,
    pub max_rainfall_intensity: f64,
    pub heavy_rain_hours: u32,
    pub consecutive_wet_days: u32,
    pub sustained_rainfall_hours: u32,
    pub soil_saturation_level: Option<f64>,
    pub score: f64,
    pub risk: FloodRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct HeatStressIndex {
    pub max_temperature: f64,
    pub avg_max_temperature: f64,
    pub consecutive_hot_days: u32,
    pub extreme_heat_days: u32,
    pub heat_degree_days: f64,
    pub optimal_temp_days: u32,
    pub score: f64,
    pub level: HeatStressLevel,
}

/// Derived stress assessment for one (plot, window). Insert-only: a
/// reprocessed window produces a new row rather than mutating this one.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WeatherIndex {
    pub plot_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub drought: DroughtIndex,
    pub flood: FloodIndex,
    pub heat: HeatStressIndex,
    pub composite_score: f64,
    pub dominant_stress: DominantStress,
    pub stations: Vec<String>,
    pub sample_count: u32,
    pub data_quality: f64,
    pub confidence: f64,
    pub is_anomaly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_labels_are_total_over_unit_interval() {
        for step in 0..=100 {
            let score = f64::from(step) / 100.0;
            // Must not panic anywhere in [0, 1].
            DroughtSeverity::from_score(score);
            FloodRisk::from_score(score);
            HeatStressLevel::from_score(score);
        }
        assert_eq!(DroughtSeverity::from_score(0.19), DroughtSeverity::None);
        assert_eq!(DroughtSeverity::from_score(0.2), DroughtSeverity::Mild);
        assert_eq!(DroughtSeverity::from_score(0.85), DroughtSeverity::Extreme);
        assert_eq!(FloodRisk::from_score(0.65), FloodRisk::High);
        assert_eq!(HeatStressLevel::from_score(0.45), HeatStressLevel::Moderate);
    }
}
