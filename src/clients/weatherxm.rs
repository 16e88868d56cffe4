use super::{decode_json, send_with_policy, RequestPolicy, TokenBucket};
use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use crate::services::weather_engine::types::{Station, StationSample};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Stations consulted per plot: the nearest few inside the search radius.
const MAX_STATIONS_PER_PLOT: usize = 3;

pub struct WeatherStationClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    policy: RequestPolicy,
    bucket: TokenBucket,
    radius_km: f64,
}

#[derive(Debug, Deserialize)]
struct StationsEnvelope {
    #[serde(default)]
    stations: Vec<Station>,
}

#[derive(Debug, Deserialize)]
struct SamplesEnvelope {
    #[serde(default)]
    data: Vec<RawSampleRecord>,
}

#[derive(Debug, Deserialize)]
struct RawSampleRecord {
    timestamp: String,
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    #[serde(default)]
    temperature: f64,
    #[serde(default)]
    feels_like: Option<f64>,
    #[serde(default)]
    temperature_min: Option<f64>,
    #[serde(default)]
    temperature_max: Option<f64>,
    #[serde(default)]
    precipitation: f64,
    #[serde(default)]
    precipitation_rate: Option<f64>,
    #[serde(default)]
    humidity: f64,
    #[serde(default)]
    pressure: Option<f64>,
    #[serde(default)]
    wind_speed: f64,
    #[serde(default)]
    wind_direction: Option<f64>,
    #[serde(default)]
    wind_gust: Option<f64>,
    #[serde(default)]
    solar_radiation: Option<f64>,
    #[serde(default)]
    uv_index: Option<f64>,
    #[serde(default)]
    soil_moisture: Option<f64>,
    #[serde(default)]
    soil_temperature: Option<f64>,
    #[serde(default)]
    quality: Option<f64>,
}

impl RawSampleRecord {
    fn into_sample(self, station_id: &str) -> Option<StationSample> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()?
            .with_timezone(&Utc);
        Some(StationSample {
            station_id: station_id.to_string(),
            timestamp,
            latitude: self.latitude,
            longitude: self.longitude,
            temperature: self.temperature,
            feels_like: self.feels_like,
            min_temperature: self.temperature_min,
            max_temperature: self.temperature_max,
            rainfall: self.precipitation.max(0.0),
            rainfall_rate: self.precipitation_rate.map(|rate| rate.max(0.0)),
            humidity: self.humidity.clamp(0.0, 100.0),
            pressure: self.pressure.unwrap_or(1013.25),
            wind_speed: self.wind_speed.max(0.0),
            wind_direction: self.wind_direction,
            wind_gust: self.wind_gust,
            solar_radiation: self.solar_radiation,
            uv_index: self.uv_index,
            soil_moisture: self.soil_moisture,
            soil_temperature: self.soil_temperature,
            data_quality: self.quality.unwrap_or(1.0).clamp(0.0, 1.0),
        })
    }
}

impl WeatherStationClient {
    pub fn from_config(config: &ProcessorConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: config.weatherxm_api_url.trim_end_matches('/').to_string(),
            api_key: config.weatherxm_api_key.clone(),
            policy: RequestPolicy::new(config.weatherxm_retry_attempts, config.weatherxm_timeout),
            bucket: TokenBucket::new(
                config.weatherxm_rate_limit_per_minute,
                config.weatherxm_rate_limit_per_minute,
            ),
            radius_km: config.weather_station_radius_km,
        }
    }

    pub fn default_radius_km(&self) -> f64 {
        self.radius_km
    }

    /// Stations within `radius_km` of the location, nearest first. An empty
    /// neighbourhood is an empty list, not an error.
    pub async fn nearby_stations(
        &self,
        latitude: f64,
        longitude: f64,
        radius_km: f64,
    ) -> Result<Vec<Station>, PipelineError> {
        self.bucket.acquire(self.policy.deadline).await?;
        let url = format!("{}/stations/nearby", self.base_url);
        let response = send_with_policy(&self.policy, "weatherxm.nearby_stations", || {
            self.http
                .get(&url)
                .bearer_auth(&self.api_key)
                .query(&[
                    ("lat", latitude.to_string()),
                    ("lon", longitude.to_string()),
                    ("radius", (radius_km * 1000.0).to_string()),
                ])
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;

        let envelope: StationsEnvelope =
            decode_json("weatherxm.nearby_stations", response).await?;
        let mut stations = envelope.stations;
        stations.sort_by(|a, b| {
            a.distance_km
                .unwrap_or(f64::MAX)
                .total_cmp(&b.distance_km.unwrap_or(f64::MAX))
        });
        Ok(stations)
    }

    pub async fn station_info(&self, station_id: &str) -> Result<Station, PipelineError> {
        self.bucket.acquire(self.policy.deadline).await?;
        let url = format!("{}/stations/{station_id}", self.base_url);
        let response = send_with_policy(&self.policy, "weatherxm.station_info", || {
            self.http
                .get(&url)
                .bearer_auth(&self.api_key)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;
        decode_json("weatherxm.station_info", response).await
    }

    /// Samples from one station over [start, end]. The upstream is not
    /// trusted to honour the range, so filtering also happens here.
    pub async fn station_samples(
        &self,
        station_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StationSample>, PipelineError> {
        self.bucket.acquire(self.policy.deadline).await?;
        let url = format!("{}/stations/{station_id}/data", self.base_url);
        let response = send_with_policy(&self.policy, "weatherxm.station_samples", || {
            self.http
                .get(&url)
                .bearer_auth(&self.api_key)
                .query(&[
                    ("start", start.to_rfc3339()),
                    ("end", end.to_rfc3339()),
                ])
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;

        let envelope: SamplesEnvelope =
            decode_json("weatherxm.station_samples", response).await?;
        let mut samples: Vec<StationSample> = envelope
            .data
            .into_iter()
            .filter_map(|record| record.into_sample(station_id))
            .filter(|sample| sample.timestamp >= start && sample.timestamp <= end)
            .collect();
        samples.sort_by_key(|sample| sample.timestamp);
        Ok(samples)
    }

    /// Last-hour reading from the nearest station, if any station covers the
    /// location.
    pub async fn current_for(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Option<StationSample>, PipelineError> {
        let stations = self
            .nearby_stations(latitude, longitude, self.radius_km)
            .await?;
        let Some(nearest) = stations.first() else {
            tracing::warn!(latitude, longitude, "no stations near location");
            return Ok(None);
        };

        let end = Utc::now();
        let start = end - Duration::hours(1);
        let samples = self.station_samples(&nearest.id, start, end).await?;
        Ok(samples.into_iter().last())
    }

    /// Merged window of samples from up to three nearest stations. A station
    /// that fails mid-sweep is skipped rather than failing the whole window.
    pub async fn samples_for_location(
        &self,
        latitude: f64,
        longitude: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StationSample>, PipelineError> {
        let stations = self
            .nearby_stations(latitude, longitude, self.radius_km)
            .await?;
        if stations.is_empty() {
            return Ok(Vec::new());
        }

        let mut merged = Vec::new();
        for station in stations.iter().take(MAX_STATIONS_PER_PLOT) {
            match self.station_samples(&station.id, start, end).await {
                Ok(samples) => merged.extend(samples),
                Err(err) => {
                    tracing::warn!(
                        station_id = %station.id,
                        error = %err,
                        "skipping station in window fetch"
                    );
                }
            }
        }
        merged.sort_by_key(|sample| sample.timestamp);
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_record_parses_rfc3339_and_clamps() {
        let record = RawSampleRecord {
            timestamp: "2024-03-01T12:00:00Z".to_string(),
            latitude: -19.0,
            longitude: 31.0,
            temperature: 28.5,
            feels_like: None,
            temperature_min: None,
            temperature_max: None,
            precipitation: -2.0,
            precipitation_rate: Some(-1.0),
            humidity: 140.0,
            pressure: None,
            wind_speed: -3.0,
            wind_direction: Some(90.0),
            wind_gust: None,
            solar_radiation: None,
            uv_index: None,
            soil_moisture: Some(40.0),
            soil_temperature: None,
            quality: Some(1.7),
        };
        let sample = record.into_sample("wxm-1").unwrap();
        assert_eq!(sample.rainfall, 0.0);
        assert_eq!(sample.rainfall_rate, Some(0.0));
        assert_eq!(sample.humidity, 100.0);
        assert_eq!(sample.pressure, 1013.25);
        assert_eq!(sample.wind_speed, 0.0);
        assert_eq!(sample.data_quality, 1.0);
    }

    #[test]
    fn raw_record_rejects_bad_timestamp() {
        let record = RawSampleRecord {
            timestamp: "yesterday".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            temperature: 0.0,
            feels_like: None,
            temperature_min: None,
            temperature_max: None,
            precipitation: 0.0,
            precipitation_rate: None,
            humidity: 0.0,
            pressure: None,
            wind_speed: 0.0,
            wind_direction: None,
            wind_gust: None,
            solar_radiation: None,
            uv_index: None,
            soil_moisture: None,
            soil_temperature: None,
            quality: None,
        };
        assert!(record.into_sample("wxm-1").is_none());
    }
}
