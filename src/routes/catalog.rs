use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;

use super::{error_codes, error_to_api_response, success_to_api_response};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Uuid,
    pub make: String,
    pub model: String,
    pub year: u16,
    pub price: u32,
    pub listed_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateVehicleRequest {
    pub make: String,
    pub model: String,
    pub year: u16,
    pub price: u32,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

#[derive(Debug, Serialize)]
pub struct CatalogStats {
    pub total: usize,
    pub average_price: u32,
    pub newest_year: Option<u16>,
}

/// 内存中的车辆目录，仅作为被包装的下游服务
#[derive(Default)]
pub struct Catalog {
    vehicles: RwLock<Vec<Vehicle>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_samples() -> Self {
        let catalog = Self::new();
        for (make, model, year, price) in [
            ("Toyota", "Corolla", 2021, 18_500),
            ("Honda", "Civic", 2022, 21_000),
            ("Ford", "Mustang", 2019, 27_900),
        ] {
            catalog.add(CreateVehicleRequest {
                make: make.into(),
                model: model.into(),
                year,
                price,
            });
        }
        catalog
    }

    pub fn add(&self, req: CreateVehicleRequest) -> Vehicle {
        let vehicle = Vehicle {
            id: Uuid::new_v4(),
            make: req.make,
            model: req.model,
            year: req.year,
            price: req.price,
            listed_at: Utc::now(),
        };
        self.vehicles.write().push(vehicle.clone());
        vehicle
    }

    pub fn list(&self) -> Vec<Vehicle> {
        self.vehicles.read().clone()
    }

    pub fn find(&self, id: Uuid) -> Option<Vehicle> {
        self.vehicles.read().iter().find(|v| v.id == id).cloned()
    }

    pub fn search(&self, needle: &str) -> Vec<Vehicle> {
        let needle = needle.to_lowercase();
        self.vehicles
            .read()
            .iter()
            .filter(|v| {
                v.make.to_lowercase().contains(&needle) || v.model.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> CatalogStats {
        let vehicles = self.vehicles.read();
        let total = vehicles.len();
        let sum: u64 = vehicles.iter().map(|v| v.price as u64).sum();
        CatalogStats {
            total,
            average_price: if total == 0 { 0 } else { (sum / total as u64) as u32 },
            newest_year: vehicles.iter().map(|v| v.year).max(),
        }
    }
}

pub async fn list_vehicles(State(state): State<AppState>) -> impl IntoResponse {
    success_to_api_response(state.catalog.list())
}

pub async fn get_vehicle(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.catalog.find(id) {
        Some(vehicle) => (StatusCode::OK, success_to_api_response(Some(vehicle))),
        None => (
            StatusCode::NOT_FOUND,
            error_to_api_response(error_codes::NOT_FOUND, "vehicle not found".to_string()),
        ),
    }
}

#[axum::debug_handler]
pub async fn create_vehicle(
    State(state): State<AppState>,
    Json(req): Json<CreateVehicleRequest>,
) -> impl IntoResponse {
    if req.make.trim().is_empty() || req.model.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_to_api_response(
                error_codes::VALIDATION_ERROR,
                "make and model are required".to_string(),
            ),
        );
    }
    let vehicle = state.catalog.add(req);
    (StatusCode::CREATED, success_to_api_response(Some(vehicle)))
}

pub async fn search(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> impl IntoResponse {
    success_to_api_response(state.catalog.search(&query.q))
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    success_to_api_response(state.catalog.stats())
}
