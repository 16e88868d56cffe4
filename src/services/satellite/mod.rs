pub mod biomass;
pub mod types;

use crate::clients::planet::{SatelliteClient, UpstreamSubscriptionState};
use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use crate::storage::timeseries::TimeseriesStore;
use biomass::ReducerParams;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use types::{BiomassSample, BiomassSummary, Subscription, SubscriptionStatus};

/// Rolling number of biomass rows kept per plot; older samples live
/// upstream and are re-fetched on demand.
const ROLLING_SAMPLES_PER_PLOT: i64 = 10;
/// Lookback window for the data-quality watch, days.
const QUALITY_WATCH_WINDOW_DAYS: i64 = 7;
/// Low-quality samples tolerated inside the watch window.
const QUALITY_WATCH_MAX_LOW: i64 = 3;

/// Owns the subscription lifecycle and the biomass cache. The only component
/// allowed to mutate subscription status.
pub struct SubscriptionManager {
    store: TimeseriesStore,
    client: Arc<SatelliteClient>,
    reducer_params: ReducerParams,
    max_cloud_cover: f64,
}

#[derive(Debug, Default)]
pub struct StatusSweepOutcome {
    pub checked: usize,
    pub transitioned: usize,
    pub failed_polls: usize,
}

impl SubscriptionManager {
    pub fn new(store: TimeseriesStore, client: Arc<SatelliteClient>, config: &ProcessorConfig) -> Self {
        Self {
            store,
            client,
            reducer_params: ReducerParams::from_config(config),
            max_cloud_cover: config.biomass_max_cloud_cover,
        }
    }

    pub fn reducer_params(&self) -> &ReducerParams {
        &self.reducer_params
    }

    /// Creates the upstream subscription and records it. The row passes
    /// through `requested` and lands on `active` once the upstream accepted
    /// the request.
    pub async fn create_subscription(
        &self,
        policy_id: &str,
        plot_id: &str,
        geometry: &JsonValue,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Subscription, PipelineError> {
        if end_at <= start_at {
            return Err(PipelineError::Permanent(format!(
                "subscription window end {end_at} not after start {start_at}"
            )));
        }
        if let Some(existing) = self.store.active_subscription_for_plot(plot_id).await? {
            tracing::info!(
                plot_id,
                subscription_id = %existing.subscription_id,
                "plot already has a live subscription"
            );
            return Ok(existing);
        }

        let name = format!("policy-{policy_id}-plot-{plot_id}");
        let subscription_id = self
            .client
            .create(&name, geometry, start_at, end_at)
            .await?;

        let now = Utc::now();
        let subscription = Subscription {
            subscription_id: subscription_id.clone(),
            policy_id: policy_id.to_string(),
            plot_id: plot_id.to_string(),
            geometry: geometry.clone(),
            start_at,
            end_at,
            status: SubscriptionStatus::Requested,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_subscription(&subscription).await?;
        self.store
            .update_subscription_status(
                &subscription_id,
                &[SubscriptionStatus::Requested],
                SubscriptionStatus::Active,
            )
            .await?;

        tracing::info!(plot_id, policy_id, subscription_id = %subscription_id, "subscription created");
        self.store
            .subscription(&subscription_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Fatal(format!(
                    "subscription {subscription_id} vanished after insert"
                ))
            })
    }

    fn map_upstream_state(
        current: SubscriptionStatus,
        upstream: UpstreamSubscriptionState,
    ) -> Option<SubscriptionStatus> {
        let target = match upstream {
            // Still being prepared upstream; nothing to record yet.
            UpstreamSubscriptionState::Preparing => return None,
            UpstreamSubscriptionState::Running => SubscriptionStatus::Active,
            UpstreamSubscriptionState::Completed => SubscriptionStatus::Expired,
            UpstreamSubscriptionState::Cancelled => SubscriptionStatus::Cancelled,
            UpstreamSubscriptionState::Failed => SubscriptionStatus::Failed,
        };
        (current != target).then_some(target)
    }

    /// Aligns one subscription with the upstream state. Idempotent: terminal
    /// rows are untouched, and the monotone update ignores stale writes.
    pub async fn sync_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<SubscriptionStatus>, PipelineError> {
        if subscription.status.is_terminal() {
            return Ok(None);
        }

        let upstream = match self.client.status(&subscription.subscription_id).await {
            Ok(state) => state,
            Err(err @ PipelineError::Permanent(_)) => {
                // The upstream no longer recognises the subscription.
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    error = %err,
                    "marking subscription failed after permanent poll error"
                );
                self.store
                    .update_subscription_status(
                        &subscription.subscription_id,
                        &[SubscriptionStatus::Requested, SubscriptionStatus::Active],
                        SubscriptionStatus::Failed,
                    )
                    .await?;
                return Ok(Some(SubscriptionStatus::Failed));
            }
            Err(err) => return Err(err),
        };

        let Some(target) = Self::map_upstream_state(subscription.status, upstream) else {
            return Ok(None);
        };
        if !subscription.status.can_transition_to(target) {
            return Ok(None);
        }

        let updated = self
            .store
            .update_subscription_status(
                &subscription.subscription_id,
                &[SubscriptionStatus::Requested, SubscriptionStatus::Active],
                target,
            )
            .await?;
        Ok(updated.then_some(target))
    }

    pub async fn sweep_statuses(&self) -> Result<StatusSweepOutcome, PipelineError> {
        let subscriptions = self.store.non_terminal_subscriptions().await?;
        let mut outcome = StatusSweepOutcome {
            checked: subscriptions.len(),
            ..Default::default()
        };
        for subscription in &subscriptions {
            match self.sync_subscription(subscription).await {
                Ok(Some(status)) => {
                    outcome.transitioned += 1;
                    tracing::info!(
                        subscription_id = %subscription.subscription_id,
                        status = status.as_str(),
                        "subscription transitioned"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    outcome.failed_polls += 1;
                    tracing::warn!(
                        subscription_id = %subscription.subscription_id,
                        error = %err,
                        "subscription status poll failed"
                    );
                }
            }
        }
        Ok(outcome)
    }

    /// Explicit cancel command. Terminal subscriptions no-op.
    pub async fn cancel(&self, subscription_id: &str) -> Result<bool, PipelineError> {
        let Some(subscription) = self.store.subscription(subscription_id).await? else {
            return Err(PipelineError::InsufficientData(format!(
                "unknown subscription {subscription_id}"
            )));
        };
        if subscription.status.is_terminal() {
            return Ok(false);
        }

        self.client.cancel(subscription_id).await?;
        self.store
            .update_subscription_status(
                subscription_id,
                &[SubscriptionStatus::Requested, SubscriptionStatus::Active],
                SubscriptionStatus::Cancelled,
            )
            .await?;
        Ok(true)
    }

    /// Daily end-date sweep: anything past its end instant is expired, with
    /// a best-effort upstream cancel so the provider stops delivering.
    pub async fn expire_ended(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        let ended = self.store.subscriptions_ended_before(now).await?;
        let mut expired = 0usize;
        for subscription in &ended {
            if let Err(err) = self.client.cancel(&subscription.subscription_id).await {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    error = %err,
                    "upstream cancel failed during expiry sweep"
                );
            }
            let updated = self
                .store
                .update_subscription_status(
                    &subscription.subscription_id,
                    &[SubscriptionStatus::Requested, SubscriptionStatus::Active],
                    SubscriptionStatus::Expired,
                )
                .await?;
            if updated {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Pulls all deliveries for a subscription, parses the CSVs, refreshes
    /// the rolling cache and returns the reduced summary.
    pub async fn refresh_biomass(
        &self,
        subscription: &Subscription,
    ) -> Result<BiomassSummary, PipelineError> {
        let deliveries = self.client.results(&subscription.subscription_id).await?;
        if deliveries.is_empty() {
            return Err(PipelineError::InsufficientData(format!(
                "subscription {} has no deliveries yet",
                subscription.subscription_id
            )));
        }

        let mut samples: Vec<BiomassSample> = Vec::new();
        for delivery in &deliveries {
            let bytes = match self.client.fetch_delivery(delivery).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(
                        subscription_id = %subscription.subscription_id,
                        delivery_id = %delivery.id,
                        error = %err,
                        "skipping unfetchable delivery"
                    );
                    continue;
                }
            };
            match biomass::parse_delivery_csv(&subscription.plot_id, &bytes) {
                Ok(parsed) => samples.extend(parsed),
                Err(err) => {
                    tracing::warn!(
                        subscription_id = %subscription.subscription_id,
                        delivery_id = %delivery.id,
                        error = %err,
                        "skipping unparsable delivery"
                    );
                }
            }
        }

        // The same observation date can arrive in several deliveries; the
        // latest delivery wins.
        samples.sort_by_key(|sample| sample.observed_on);
        samples.dedup_by_key(|sample| sample.observed_on);

        let summary = biomass::reduce(
            &subscription.plot_id,
            &subscription.subscription_id,
            &samples,
            &self.reducer_params,
        )?;

        self.store.upsert_biomass_samples(&samples).await?;
        self.store
            .prune_biomass_rolling(&subscription.plot_id, ROLLING_SAMPLES_PER_PLOT)
            .await?;

        Ok(summary)
    }

    /// Summary over the cached rows for a plot window; used by the evidence
    /// bundler and the query surface.
    pub async fn summary_for_window(
        &self,
        plot_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BiomassSummary, PipelineError> {
        let subscription_id = self
            .store
            .active_subscription_for_plot(plot_id)
            .await?
            .map(|subscription| subscription.subscription_id)
            .unwrap_or_default();
        let samples = self.store.biomass_range(plot_id, start, end).await?;
        biomass::reduce(plot_id, &subscription_id, &samples, &self.reducer_params)
    }

    /// Daily data-quality watch: plots whose recent window is dominated by
    /// clouds or low-quality deliveries.
    pub async fn poor_quality_plots(&self) -> Result<Vec<String>, PipelineError> {
        Ok(self
            .store
            .plots_with_poor_biomass_quality(
                QUALITY_WATCH_WINDOW_DAYS,
                QUALITY_WATCH_MAX_LOW,
                self.max_cloud_cover,
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_states_map_onto_lifecycle() {
        use SubscriptionStatus::*;
        use UpstreamSubscriptionState as Up;

        assert_eq!(
            SubscriptionManager::map_upstream_state(Active, Up::Completed),
            Some(Expired)
        );
        assert_eq!(
            SubscriptionManager::map_upstream_state(Active, Up::Cancelled),
            Some(Cancelled)
        );
        assert_eq!(
            SubscriptionManager::map_upstream_state(Active, Up::Failed),
            Some(Failed)
        );
        assert_eq!(
            SubscriptionManager::map_upstream_state(Requested, Up::Running),
            Some(Active)
        );
        // Already aligned: nothing to do.
        assert_eq!(
            SubscriptionManager::map_upstream_state(Active, Up::Running),
            None
        );
        assert_eq!(
            SubscriptionManager::map_upstream_state(Requested, Up::Preparing),
            None
        );
    }
}
