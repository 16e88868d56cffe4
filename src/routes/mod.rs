pub mod damage;
pub mod health;
pub mod metrics;
pub mod planet;
pub mod tasks;
pub mod weather;
pub mod ws;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(metrics::router())
        .merge(tasks::router())
        .merge(ws::router())
        .nest(
            "/v1",
            Router::new()
                .merge(weather::router())
                .merge(damage::router())
                .merge(planet::router()),
        )
        .with_state(state)
}
