use anyhow::{bail, Context, Result};
use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, loaded once at startup. Invalid values abort the
/// process rather than falling back silently.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub database_url: String,
    pub redis_url: String,

    // WeatherXM upstream
    pub weatherxm_api_url: String,
    pub weatherxm_api_key: String,
    pub weatherxm_rate_limit_per_minute: u32,
    pub weatherxm_timeout: Duration,
    pub weatherxm_retry_attempts: u32,

    // Planet upstream
    pub planet_api_key: String,
    pub planet_subscriptions_url: String,
    pub planet_timeout: Duration,
    pub planet_biomass_product: String,

    // Pinata / IPFS upstream
    pub pinata_jwt: String,
    pub pinata_api_url: String,
    pub pinata_gateway: String,

    // Weather engine parameters
    pub weather_station_radius_km: f64,
    pub drought_threshold_mm: f64,
    pub drought_severe_days: u32,
    pub flood_threshold_mm: f64,
    pub flood_severe_mm: f64,
    pub flood_cumulative_3day_mm: f64,
    pub heat_threshold_celsius: f64,
    pub heat_severe_celsius: f64,

    // Biomass reducer parameters
    pub biomass_baseline_window_days: u32,
    pub biomass_min_observations: u32,
    pub biomass_max_cloud_cover: f64,
    pub biomass_healthy_threshold: f64,
    pub biomass_moderate_stress: f64,
    pub biomass_severe_stress: f64,

    // Scheduler / worker pool
    pub queue_concurrency: usize,
    pub job_poll_interval: Duration,
    pub dedup_ttl: Duration,
    pub task_soft_time_limit: Duration,
    pub task_time_limit: Duration,

    // Retention
    pub weather_data_retention_days: u32,
    pub biomass_data_retention_days: u32,
    pub assessment_retention_days: u32,

    // Query-cache TTLs
    pub cache_weather_ttl: Duration,
    pub cache_satellite_ttl: Duration,
    pub cache_damage_ttl: Duration,

    // Command surface
    pub damage_assess_rate_per_hour: u32,
    pub command_rate_per_hour: u32,
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(name: &str) -> Result<String> {
    env_trimmed(name).with_context(|| format!("{name} must be set"))
}

fn optional_or(name: &str, default: &str) -> String {
    env_trimmed(name).unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_trimmed(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}

fn unit_interval(name: &str, value: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        bail!("{name} must be within [0, 1], got {value}");
    }
    Ok(value)
}

fn positive<T: PartialOrd + Default + Debug + Copy>(name: &str, value: T) -> Result<T> {
    if value <= T::default() {
        bail!("{name} must be positive, got {value:?}");
    }
    Ok(value)
}

fn valid_url(name: &str, value: String) -> Result<String> {
    url::Url::parse(&value).with_context(|| format!("{name} is not a valid url: {value:?}"))?;
    Ok(value)
}

impl ProcessorConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: required("DATABASE_URL")?,
            redis_url: optional_or("REDIS_URL", "redis://localhost:6379/0"),

            weatherxm_api_url: valid_url(
                "WEATHERXM_API_URL",
                optional_or("WEATHERXM_API_URL", "https://api.weatherxm.com/v1"),
            )?,
            weatherxm_api_key: required("WEATHERXM_API_KEY")?,
            weatherxm_rate_limit_per_minute: positive(
                "WEATHERXM_RATE_LIMIT",
                parse_or("WEATHERXM_RATE_LIMIT", 100u32)?,
            )?,
            weatherxm_timeout: Duration::from_secs(positive(
                "WEATHERXM_TIMEOUT_SECONDS",
                parse_or("WEATHERXM_TIMEOUT_SECONDS", 30u64)?,
            )?),
            weatherxm_retry_attempts: positive(
                "WEATHERXM_RETRY_ATTEMPTS",
                parse_or("WEATHERXM_RETRY_ATTEMPTS", 3u32)?,
            )?,

            planet_api_key: required("PLANET_API_KEY")?,
            planet_subscriptions_url: valid_url(
                "PLANET_SUBSCRIPTIONS_URL",
                optional_or(
                    "PLANET_SUBSCRIPTIONS_URL",
                    "https://api.planet.com/subscriptions/v1",
                ),
            )?,
            planet_timeout: Duration::from_secs(positive(
                "PLANET_TIMEOUT_SECONDS",
                parse_or("PLANET_TIMEOUT_SECONDS", 60u64)?,
            )?),
            planet_biomass_product: optional_or("PLANET_BIOMASS_PRODUCT", "BIOMASS-PROXY_V4.0_10"),

            pinata_jwt: required("PINATA_JWT")?,
            pinata_api_url: valid_url(
                "PINATA_API_URL",
                optional_or("PINATA_API_URL", "https://api.pinata.cloud"),
            )?,
            pinata_gateway: optional_or("PINATA_GATEWAY", "gateway.pinata.cloud"),

            weather_station_radius_km: positive(
                "WEATHER_STATION_RADIUS_KM",
                parse_or("WEATHER_STATION_RADIUS_KM", 50.0f64)?,
            )?,
            drought_threshold_mm: positive(
                "DROUGHT_THRESHOLD_MM",
                parse_or("DROUGHT_THRESHOLD_MM", 2.0f64)?,
            )?,
            drought_severe_days: positive(
                "DROUGHT_SEVERE_DAYS",
                parse_or("DROUGHT_SEVERE_DAYS", 14u32)?,
            )?,
            flood_threshold_mm: positive(
                "FLOOD_THRESHOLD_MM",
                parse_or("FLOOD_THRESHOLD_MM", 30.0f64)?,
            )?,
            flood_severe_mm: positive("FLOOD_SEVERE_MM", parse_or("FLOOD_SEVERE_MM", 10.0f64)?)?,
            flood_cumulative_3day_mm: positive(
                "FLOOD_CUMULATIVE_3DAY",
                parse_or("FLOOD_CUMULATIVE_3DAY", 100.0f64)?,
            )?,
            heat_threshold_celsius: parse_or("HEAT_THRESHOLD_CELSIUS", 35.0f64)?,
            heat_severe_celsius: parse_or("HEAT_SEVERE_CELSIUS", 40.0f64)?,

            biomass_baseline_window_days: positive(
                "BIOMASS_BASELINE_WINDOW_DAYS",
                parse_or("BIOMASS_BASELINE_WINDOW_DAYS", 30u32)?,
            )?,
            biomass_min_observations: positive(
                "BIOMASS_MIN_OBSERVATIONS",
                parse_or("BIOMASS_MIN_OBSERVATIONS", 3u32)?,
            )?,
            biomass_max_cloud_cover: unit_interval(
                "BIOMASS_MAX_CLOUD_COVER",
                parse_or("BIOMASS_MAX_CLOUD_COVER", 0.3f64)?,
            )?,
            biomass_healthy_threshold: unit_interval(
                "BIOMASS_HEALTHY_THRESHOLD",
                parse_or("BIOMASS_HEALTHY_THRESHOLD", 0.65f64)?,
            )?,
            biomass_moderate_stress: unit_interval(
                "BIOMASS_MODERATE_STRESS",
                parse_or("BIOMASS_MODERATE_STRESS", 0.50f64)?,
            )?,
            biomass_severe_stress: unit_interval(
                "BIOMASS_SEVERE_STRESS",
                parse_or("BIOMASS_SEVERE_STRESS", 0.35f64)?,
            )?,

            queue_concurrency: positive(
                "QUEUE_CONCURRENCY",
                parse_or("QUEUE_CONCURRENCY", 4usize)?,
            )?,
            job_poll_interval: Duration::from_millis(positive(
                "JOB_POLL_INTERVAL_MS",
                parse_or("JOB_POLL_INTERVAL_MS", 500u64)?,
            )?),
            dedup_ttl: Duration::from_secs(positive(
                "DEDUP_TTL_SECONDS",
                parse_or("DEDUP_TTL_SECONDS", 300u64)?,
            )?),
            task_soft_time_limit: Duration::from_secs(positive(
                "TASK_SOFT_TIME_LIMIT_SECONDS",
                parse_or("TASK_SOFT_TIME_LIMIT_SECONDS", 240u64)?,
            )?),
            task_time_limit: Duration::from_secs(positive(
                "TASK_TIME_LIMIT_SECONDS",
                parse_or("TASK_TIME_LIMIT_SECONDS", 300u64)?,
            )?),

            weather_data_retention_days: positive(
                "WEATHER_DATA_RETENTION_DAYS",
                parse_or("WEATHER_DATA_RETENTION_DAYS", 730u32)?,
            )?,
            biomass_data_retention_days: positive(
                "BIOMASS_DATA_RETENTION_DAYS",
                parse_or("BIOMASS_DATA_RETENTION_DAYS", 1095u32)?,
            )?,
            assessment_retention_days: positive(
                "ASSESSMENT_RETENTION_DAYS",
                parse_or("ASSESSMENT_RETENTION_DAYS", 365u32)?,
            )?,

            cache_weather_ttl: Duration::from_secs(positive(
                "CACHE_WEATHER_TTL",
                parse_or("CACHE_WEATHER_TTL", 3600u64)?,
            )?),
            cache_satellite_ttl: Duration::from_secs(positive(
                "CACHE_SATELLITE_TTL",
                parse_or("CACHE_SATELLITE_TTL", 86_400u64)?,
            )?),
            cache_damage_ttl: Duration::from_secs(positive(
                "CACHE_DAMAGE_TTL",
                parse_or("CACHE_DAMAGE_TTL", 86_400u64)?,
            )?),

            damage_assess_rate_per_hour: positive(
                "DAMAGE_ASSESS_RATE_PER_HOUR",
                parse_or("DAMAGE_ASSESS_RATE_PER_HOUR", 5u32)?,
            )?,
            command_rate_per_hour: positive(
                "COMMAND_RATE_PER_HOUR",
                parse_or("COMMAND_RATE_PER_HOUR", 30u32)?,
            )?,
        };

        if config.task_soft_time_limit >= config.task_time_limit {
            bail!(
                "TASK_SOFT_TIME_LIMIT_SECONDS ({:?}) must be below TASK_TIME_LIMIT_SECONDS ({:?})",
                config.task_soft_time_limit,
                config.task_time_limit
            );
        }
        if config.biomass_severe_stress > config.biomass_moderate_stress
            || config.biomass_moderate_stress > config.biomass_healthy_threshold
        {
            bail!("biomass stress thresholds must be ordered severe <= moderate <= healthy");
        }
        if config.heat_severe_celsius <= config.heat_threshold_celsius {
            bail!("HEAT_SEVERE_CELSIUS must exceed HEAT_THRESHOLD_CELSIUS");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_interval_rejects_out_of_range() {
        assert!(unit_interval("X", 1.2).is_err());
        assert!(unit_interval("X", -0.1).is_err());
        assert!(unit_interval("X", f64::NAN).is_err());
        assert_eq!(unit_interval("X", 0.3).unwrap(), 0.3);
    }

    #[test]
    fn positive_rejects_zero() {
        assert!(positive("X", 0u32).is_err());
        assert_eq!(positive("X", 3u32).unwrap(), 3);
    }
}
