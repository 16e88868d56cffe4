use crate::clients::ipfs::ContentStoreClient;
use crate::config::ProcessorConfig;
use crate::jobs::JobService;
use crate::services::events::EventBus;
use crate::services::satellite::SubscriptionManager;
use crate::storage::cache::CacheStore;
use crate::storage::timeseries::TimeseriesStore;
use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;

/// Explicit root context: every handler and task receives typed handles from
/// here instead of reaching for process-wide state.
#[derive(Clone)]
pub struct AppState {
    pub config: ProcessorConfig,
    pub db: PgPool,
    pub store: TimeseriesStore,
    pub cache: CacheStore,
    pub events: EventBus,
    pub jobs: Arc<JobService>,
    pub satellite: Arc<SubscriptionManager>,
    pub content: Arc<ContentStoreClient>,
    pub http: reqwest::Client,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
