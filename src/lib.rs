use std::sync::Arc;

use axum::Router;

use cache::ResponseCache;
use rate_limit::AdmissionController;
use routes::catalog::Catalog;

pub mod cache;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod middleware;
pub mod policy;
pub mod rate_limit;
pub mod routes;
pub mod tasks;
pub mod utils;

pub use gatekeeper::Gatekeeper;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub admission: Arc<AdmissionController>,
    pub cache: Arc<ResponseCache>,
}

impl AppState {
    pub fn new(catalog: Arc<Catalog>, gatekeeper: &Gatekeeper) -> Self {
        Self {
            catalog,
            admission: gatekeeper.admission(),
            cache: gatekeeper.cache(),
        }
    }
}

/// 组装完整路由：`/api` 经过网关中间件，`/internal` 直接访问
pub fn build_router(state: AppState, gatekeeper: &Gatekeeper) -> Router {
    let api = gatekeeper.apply(routes::api_routes());

    Router::new()
        .merge(api)
        .merge(routes::internal_routes())
        .layer(axum::middleware::from_fn(middleware::log_errors))
        .with_state(state)
}
