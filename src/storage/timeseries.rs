use crate::services::satellite::types::{
    BiomassQuality, BiomassSample, Subscription, SubscriptionStatus,
};
use crate::services::weather_engine::types::{StationSample, WeatherIndex};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};

/// Typed surface over the time-series and relational tables. Callers never
/// see SQL or row shapes; sample and derived tables are insert-only,
/// subscription status updates are monotone.
#[derive(Clone)]
pub struct TimeseriesStore {
    pool: PgPool,
}

#[derive(Debug, Clone, FromRow, serde::Serialize, utoipa::ToSchema)]
pub struct PlotRow {
    pub plot_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, FromRow, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct Assessment {
    pub assessment_id: String,
    pub plot_id: String,
    pub policy_id: String,
    pub farmer_address: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub window_days: i32,
    pub evidence_cid: String,
    pub outcome_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PolicyRef {
    pub policy_id: String,
    pub farmer_address: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct IntegrationStatusRow {
    pub category: String,
    pub name: String,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
    pub metadata: SqlJson<JsonValue>,
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: String,
    policy_id: String,
    plot_id: String,
    geometry: SqlJson<JsonValue>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Subscription {
        let status = SubscriptionStatus::parse(&self.status).unwrap_or_else(|| {
            tracing::warn!(
                subscription_id = %self.subscription_id,
                status = %self.status,
                "unknown subscription status; treating as failed"
            );
            SubscriptionStatus::Failed
        });
        Subscription {
            subscription_id: self.subscription_id,
            policy_id: self.policy_id,
            plot_id: self.plot_id,
            geometry: self.geometry.0,
            start_at: self.start_at,
            end_at: self.end_at,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow)]
struct BiomassRow {
    plot_id: String,
    observed_on: NaiveDate,
    biomass_proxy: f64,
    cloud_cover: f64,
    data_quality: String,
}

impl BiomassRow {
    fn into_sample(self) -> BiomassSample {
        let data_quality =
            BiomassQuality::parse(&self.data_quality).unwrap_or(BiomassQuality::Low);
        BiomassSample {
            plot_id: self.plot_id,
            observed_on: self.observed_on,
            biomass_proxy: self.biomass_proxy,
            cloud_cover: self.cloud_cover,
            data_quality,
        }
    }
}

#[derive(FromRow)]
struct IndexRow {
    data: SqlJson<WeatherIndex>,
}

impl TimeseriesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ---- plots ----

    pub async fn upsert_plot(
        &self,
        plot_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO plots (plot_id, latitude, longitude, created_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (plot_id)
            DO UPDATE SET latitude = EXCLUDED.latitude, longitude = EXCLUDED.longitude
            "#,
        )
        .bind(plot_id)
        .bind(latitude)
        .bind(longitude)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn plot(&self, plot_id: &str) -> Result<Option<PlotRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT plot_id, latitude, longitude
            FROM plots
            WHERE plot_id = $1
            "#,
        )
        .bind(plot_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Plots eligible for periodic sweeps: anything with a sample in the
    /// lookback window, plus recently registered plots that have not been
    /// seeded yet. Restart-safe because the store is the source of truth.
    pub async fn active_plots(&self, lookback_days: i64) -> Result<Vec<PlotRow>, sqlx::Error> {
        let cutoff = Utc::now() - Duration::days(lookback_days);
        sqlx::query_as(
            r#"
            SELECT p.plot_id, p.latitude, p.longitude
            FROM plots p
            WHERE p.created_at >= $1
               OR EXISTS (
                    SELECT 1 FROM station_samples s
                    WHERE s.plot_id = p.plot_id AND s.ts >= $1
               )
            ORDER BY p.plot_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
    }

    // ---- station samples ----

    pub async fn append_samples(
        &self,
        plot_id: &str,
        samples: &[StationSample],
    ) -> Result<u64, sqlx::Error> {
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            let result = sqlx::query(
                r#"
                INSERT INTO station_samples (
                    plot_id, station_id, ts, latitude, longitude,
                    temperature, feels_like, min_temperature, max_temperature,
                    rainfall, rainfall_rate, humidity, pressure,
                    wind_speed, wind_direction, wind_gust,
                    solar_radiation, uv_index, soil_moisture, soil_temperature,
                    data_quality
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21)
                ON CONFLICT (plot_id, station_id, ts) DO NOTHING
                "#,
            )
            .bind(plot_id)
            .bind(&sample.station_id)
            .bind(sample.timestamp)
            .bind(sample.latitude)
            .bind(sample.longitude)
            .bind(sample.temperature)
            .bind(sample.feels_like)
            .bind(sample.min_temperature)
            .bind(sample.max_temperature)
            .bind(sample.rainfall)
            .bind(sample.rainfall_rate)
            .bind(sample.humidity)
            .bind(sample.pressure)
            .bind(sample.wind_speed)
            .bind(sample.wind_direction)
            .bind(sample.wind_gust)
            .bind(sample.solar_radiation)
            .bind(sample.uv_index)
            .bind(sample.soil_moisture)
            .bind(sample.soil_temperature)
            .bind(sample.data_quality)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn sample_range(
        &self,
        plot_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StationSample>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT
                station_id, ts AS timestamp, latitude, longitude,
                temperature, feels_like, min_temperature, max_temperature,
                rainfall, rainfall_rate, humidity, pressure,
                wind_speed, wind_direction, wind_gust,
                solar_radiation, uv_index, soil_moisture, soil_temperature,
                data_quality
            FROM station_samples
            WHERE plot_id = $1 AND ts >= $2 AND ts <= $3
            ORDER BY ts ASC
            "#,
        )
        .bind(plot_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_samples_older_than(&self, retention_days: i64) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query("DELETE FROM station_samples WHERE ts < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- weather indices ----

    pub async fn insert_index(&self, index: &WeatherIndex) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO weather_indices (
                plot_id, policy_id, window_start, window_end,
                composite_score, dominant_stress, data, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            "#,
        )
        .bind(&index.plot_id)
        .bind(&index.policy_id)
        .bind(index.window_start)
        .bind(index.window_end)
        .bind(index.composite_score)
        .bind(index.dominant_stress.as_str())
        .bind(SqlJson(index))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent index whose window overlaps [start, end].
    pub async fn latest_index_overlapping(
        &self,
        plot_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<WeatherIndex>, sqlx::Error> {
        let row: Option<IndexRow> = sqlx::query_as(
            r#"
            SELECT data
            FROM weather_indices
            WHERE plot_id = $1 AND window_start <= $2 AND window_end >= $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(plot_id)
        .bind(end)
        .bind(start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.data.0))
    }

    pub async fn latest_index(&self, plot_id: &str) -> Result<Option<WeatherIndex>, sqlx::Error> {
        let row: Option<IndexRow> = sqlx::query_as(
            r#"
            SELECT data
            FROM weather_indices
            WHERE plot_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(plot_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.data.0))
    }

    /// Plots whose latest index crosses the composite threshold; feeds the
    /// trigger-check sweep.
    pub async fn plots_with_composite_at_least(
        &self,
        threshold: f64,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, f64)>, sqlx::Error> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (plot_id) plot_id, composite_score
            FROM weather_indices
            WHERE created_at >= $1
            ORDER BY plot_id, created_at DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter(|(_, score)| *score >= threshold)
            .collect())
    }

    // ---- subscriptions ----

    pub async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                subscription_id, policy_id, plot_id, geometry,
                start_at, end_at, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, now(), now())
            ON CONFLICT (subscription_id) DO NOTHING
            "#,
        )
        .bind(&subscription.subscription_id)
        .bind(&subscription.policy_id)
        .bind(&subscription.plot_id)
        .bind(SqlJson(subscription.geometry.clone()))
        .bind(subscription.start_at)
        .bind(subscription.end_at)
        .bind(subscription.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, sqlx::Error> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, policy_id, plot_id, geometry,
                   start_at, end_at, status, created_at, updated_at
            FROM subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRow::into_subscription))
    }

    pub async fn active_subscription_for_plot(
        &self,
        plot_id: &str,
    ) -> Result<Option<Subscription>, sqlx::Error> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, policy_id, plot_id, geometry,
                   start_at, end_at, status, created_at, updated_at
            FROM subscriptions
            WHERE plot_id = $1 AND status IN ('requested', 'active')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(plot_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRow::into_subscription))
    }

    pub async fn non_terminal_subscriptions(&self) -> Result<Vec<Subscription>, sqlx::Error> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, policy_id, plot_id, geometry,
                   start_at, end_at, status, created_at, updated_at
            FROM subscriptions
            WHERE status IN ('requested', 'active')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect())
    }

    pub async fn subscriptions_ended_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, sqlx::Error> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, policy_id, plot_id, geometry,
                   start_at, end_at, status, created_at, updated_at
            FROM subscriptions
            WHERE status IN ('requested', 'active') AND end_at <= $1
            ORDER BY end_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect())
    }

    /// Monotone status update: the row changes only if its current status is
    /// one this transition may leave from. Returns whether a row changed, so
    /// a terminal re-run is a visible no-op.
    pub async fn update_subscription_status(
        &self,
        subscription_id: &str,
        allowed_from: &[SubscriptionStatus],
        to: SubscriptionStatus,
    ) -> Result<bool, sqlx::Error> {
        let from: Vec<&str> = allowed_from.iter().map(SubscriptionStatus::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, updated_at = now()
            WHERE subscription_id = $1 AND status = ANY($3)
            "#,
        )
        .bind(subscription_id)
        .bind(to.as_str())
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- biomass ----

    pub async fn upsert_biomass_samples(
        &self,
        samples: &[BiomassSample],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            sqlx::query(
                r#"
                INSERT INTO biomass_samples (
                    plot_id, observed_on, biomass_proxy, cloud_cover, data_quality, created_at
                )
                VALUES ($1, $2, $3, $4, $5, now())
                ON CONFLICT (plot_id, observed_on)
                DO UPDATE SET
                    biomass_proxy = EXCLUDED.biomass_proxy,
                    cloud_cover = EXCLUDED.cloud_cover,
                    data_quality = EXCLUDED.data_quality
                "#,
            )
            .bind(&sample.plot_id)
            .bind(sample.observed_on)
            .bind(sample.biomass_proxy)
            .bind(sample.cloud_cover)
            .bind(sample.data_quality.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn biomass_range(
        &self,
        plot_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<BiomassSample>, sqlx::Error> {
        let rows: Vec<BiomassRow> = sqlx::query_as(
            r#"
            SELECT plot_id, observed_on, biomass_proxy, cloud_cover, data_quality
            FROM biomass_samples
            WHERE plot_id = $1 AND observed_on >= $2 AND observed_on <= $3
            ORDER BY observed_on ASC
            "#,
        )
        .bind(plot_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BiomassRow::into_sample).collect())
    }

    pub async fn recent_biomass(
        &self,
        plot_id: &str,
        limit: i64,
    ) -> Result<Vec<BiomassSample>, sqlx::Error> {
        let rows: Vec<BiomassRow> = sqlx::query_as(
            r#"
            SELECT plot_id, observed_on, biomass_proxy, cloud_cover, data_quality
            FROM (
                SELECT plot_id, observed_on, biomass_proxy, cloud_cover, data_quality
                FROM biomass_samples
                WHERE plot_id = $1
                ORDER BY observed_on DESC
                LIMIT $2
            ) recent
            ORDER BY observed_on ASC
            "#,
        )
        .bind(plot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BiomassRow::into_sample).collect())
    }

    /// Keeps only the newest `keep` rows for the plot; the upstream retains
    /// full history and is re-fetched on demand.
    pub async fn prune_biomass_rolling(
        &self,
        plot_id: &str,
        keep: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM biomass_samples
            WHERE plot_id = $1
              AND observed_on < (
                  SELECT min(observed_on) FROM (
                      SELECT observed_on FROM biomass_samples
                      WHERE plot_id = $1
                      ORDER BY observed_on DESC
                      LIMIT $2
                  ) newest
              )
            "#,
        )
        .bind(plot_id)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_biomass_older_than(
        &self,
        retention_days: i64,
    ) -> Result<u64, sqlx::Error> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).date_naive();
        let result = sqlx::query("DELETE FROM biomass_samples WHERE observed_on < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Plots whose recent biomass window looks untrustworthy: too many
    /// low-quality samples or excessive mean cloud cover.
    pub async fn plots_with_poor_biomass_quality(
        &self,
        window_days: i64,
        max_low_quality: i64,
        max_mean_cloud: f64,
    ) -> Result<Vec<String>, sqlx::Error> {
        let cutoff = (Utc::now() - Duration::days(window_days)).date_naive();
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT plot_id
            FROM biomass_samples
            WHERE observed_on >= $1
            GROUP BY plot_id
            HAVING count(*) FILTER (WHERE data_quality = 'low') > $2
                OR avg(cloud_cover) > $3
            "#,
        )
        .bind(cutoff)
        .bind(max_low_quality)
        .bind(max_mean_cloud)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(plot_id,)| plot_id).collect())
    }

    // ---- assessments ----

    /// Insert-if-absent keyed by the content-derived assessment id. Returns
    /// false when a concurrent writer already produced the row.
    pub async fn insert_assessment(&self, assessment: &Assessment) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO damage_assessments (
                assessment_id, plot_id, policy_id, farmer_address,
                window_start, window_end, window_days, evidence_cid, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (assessment_id) DO NOTHING
            "#,
        )
        .bind(&assessment.assessment_id)
        .bind(&assessment.plot_id)
        .bind(&assessment.policy_id)
        .bind(&assessment.farmer_address)
        .bind(assessment.window_start)
        .bind(assessment.window_end)
        .bind(assessment.window_days)
        .bind(&assessment.evidence_cid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn assessment(
        &self,
        assessment_id: &str,
    ) -> Result<Option<Assessment>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT assessment_id, plot_id, policy_id, farmer_address,
                   window_start, window_end, window_days, evidence_cid,
                   outcome_ref, created_at, archived_at
            FROM damage_assessments
            WHERE assessment_id = $1
            "#,
        )
        .bind(assessment_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn recent_assessments(
        &self,
        plot_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Assessment>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT assessment_id, plot_id, policy_id, farmer_address,
                   window_start, window_end, window_days, evidence_cid,
                   outcome_ref, created_at, archived_at
            FROM damage_assessments
            WHERE plot_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(plot_id)
        .bind(limit.clamp(1, 100))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn archive_assessments_older_than(
        &self,
        retention_days: i64,
    ) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query(
            r#"
            UPDATE damage_assessments
            SET archived_at = now()
            WHERE archived_at IS NULL AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- policies (read-only; owned by the policy service) ----

    pub async fn active_policy_for_plot(
        &self,
        plot_id: &str,
    ) -> Result<Option<PolicyRef>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT policy_id, farmer_address
            FROM policies
            WHERE plot_id = $1 AND active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(plot_id)
        .fetch_optional(&self.pool)
        .await
    }

    // ---- integration status ----

    pub async fn record_integration_status(
        &self,
        category: &str,
        name: &str,
        status: &str,
        metadata: JsonValue,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO integration_status (category, name, status, recorded_at, metadata)
            VALUES ($1, $2, $3, now(), $4)
            "#,
        )
        .bind(category)
        .bind(name)
        .bind(status)
        .bind(SqlJson(metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_integration_status(
        &self,
    ) -> Result<Vec<IntegrationStatusRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT DISTINCT ON (category, name)
                category, name, status, recorded_at, metadata
            FROM integration_status
            ORDER BY category, name, recorded_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }
}
