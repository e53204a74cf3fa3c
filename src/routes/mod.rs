pub mod catalog;
pub mod internal;

use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_data: Option<T>,
}

pub fn success_to_api_response<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: error_codes::SUCCESS,
        msg: "success".into(),
        resp_data: Some(data),
    })
}

pub fn error_to_api_response<T>(code: i32, msg: String) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code,
        msg,
        resp_data: None,
    })
}

pub mod error_codes {
    pub const SUCCESS: i32 = 0;
    pub const VALIDATION_ERROR: i32 = 1000;
    pub const NOT_FOUND: i32 = 1004;
}

/// 车辆目录路由，由网关中间件包装
///
/// 使用完整路径注册而不是 `nest`，中间件看到的 URI 才与策略模式一致。
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/vehicles",
            get(catalog::list_vehicles).post(catalog::create_vehicle),
        )
        .route("/api/vehicles/{id}", get(catalog::get_vehicle))
        .route("/api/search", get(catalog::search))
        .route("/api/stats", get(catalog::stats))
}

/// 内部运维路由，不经过限流与缓存
pub fn internal_routes() -> Router<AppState> {
    Router::new()
        .route("/internal/guard/stats", get(internal::guard_stats))
        .route("/internal/health", get(internal::health))
}
