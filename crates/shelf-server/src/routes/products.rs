//! Product CRUD endpoints.
//!
//! Handlers only touch the store. Subscribers learn about changes through the
//! change feed, never from these handlers directly.

use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use tracing::info;

use shelf_proto::{Product, ProductId};

use crate::config::MAX_BODY_SIZE;
use crate::error::ApiError;
use crate::AppState;

/// Product routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/products", get(list_products).post(create_product))
        .route(
            "/products/:id",
            get(get_product).put(update_product).delete(delete_product),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
}

async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<Product>>, ApiError> {
    Ok(Json(state.store.all().await?))
}

/// Create a product. The client must not pick the id.
async fn create_product(
    State(state): State<AppState>,
    payload: Result<Json<Product>, JsonRejection>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let Json(product) = payload?;
    if product.product_id != 0 {
        return Err(ApiError::BadRequest(
            "productId must be 0; use PUT to modify an existing product".to_string(),
        ));
    }

    let product = state.store.create(product).await?;
    info!(product_id = product.product_id, "product created");
    Ok((StatusCode::CREATED, Json(product)))
}

async fn get_product(
    State(state): State<AppState>,
    id: Result<Path<ProductId>, PathRejection>,
) -> Result<Json<Product>, ApiError> {
    let Path(id) = id?;
    state
        .store
        .find_by_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

/// Replace a product's attributes. The id in the path wins over the body.
async fn update_product(
    State(state): State<AppState>,
    id: Result<Path<ProductId>, PathRejection>,
    payload: Result<Json<Product>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id?;
    let Json(product) = payload?;

    if !state.store.update_by_id(id, product.with_id(id)).await? {
        return Err(not_found(id));
    }
    info!(product_id = id, "product updated");
    Ok(StatusCode::ACCEPTED)
}

async fn delete_product(
    State(state): State<AppState>,
    id: Result<Path<ProductId>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id?;

    if !state.store.delete_by_id(id).await? {
        return Err(not_found(id));
    }
    info!(product_id = id, "product deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn not_found(id: ProductId) -> ApiError {
    ApiError::NotFound(format!("product {id} not found"))
}
