use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use stockledger_core::{PageRequest, ProductId, StockKey};
use stockledger_inventory::{AdjustmentRequest, MovementFilter};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{ActorContext, MerchantContext};

pub fn router() -> Router {
    Router::new()
        .route("/adjust", post(adjust_stock))
        .route("/products/:product_id", get(get_product_stock))
        .route("/low-stock", get(list_low_stock))
        .route("/movements", get(list_movements))
}

pub async fn adjust_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(merchant): Extension<MerchantContext>,
    Extension(actor): Extension<ActorContext>,
    Json(body): Json<dto::AdjustInventoryRequest>,
) -> axum::response::Response {
    let Some(product_id) = dto::non_blank(Some(body.product_id)) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "product_id cannot be empty",
        );
    };

    let key = StockKey::new(
        merchant.merchant_id().clone(),
        dto::store_id(body.store_id),
        ProductId::new(product_id),
        dto::variant_id(body.variant_id),
    );

    let request = AdjustmentRequest::new(key, body.quantity_change, body.reason)
        .with_reference(body.reference_type, body.reference_id)
        .with_actor(actor.actor_id().cloned());

    match services.engine.adjust(request).await {
        Ok(balance) => (StatusCode::OK, Json(dto::balance_to_json(&balance))).into_response(),
        Err(e) => errors::adjust_error_to_response(e),
    }
}

/// Balance for one product; an unknown key reads as a zero balance.
pub async fn get_product_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(merchant): Extension<MerchantContext>,
    Path(product_id): Path<String>,
    Query(query): Query<dto::BalanceQuery>,
) -> axum::response::Response {
    let Some(product_id) = dto::non_blank(Some(product_id)) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "product_id cannot be empty",
        );
    };

    let key = StockKey::new(
        merchant.merchant_id().clone(),
        dto::store_id(query.store_id),
        ProductId::new(product_id),
        dto::variant_id(query.variant_id),
    );

    match services.engine.balance(&key).await {
        Ok(balance) => (StatusCode::OK, Json(dto::balance_to_json(&balance))).into_response(),
        Err(e) => errors::adjust_error_to_response(e),
    }
}

pub async fn list_low_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(merchant): Extension<MerchantContext>,
    Query(query): Query<dto::LowStockQuery>,
) -> axum::response::Response {
    let store = dto::store_id(query.store_id);
    let page = PageRequest::new(query.page, query.page_size);

    match services
        .engine
        .ledger()
        .list_low_stock(merchant.merchant_id(), store.as_ref(), page)
        .await
    {
        Ok(result) => (
            StatusCode::OK,
            Json(dto::paged_to_json(&result, dto::balance_to_json)),
        )
            .into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn list_movements(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(merchant): Extension<MerchantContext>,
    Query(query): Query<dto::MovementsQuery>,
) -> axum::response::Response {
    let movement_type = match dto::parse_movement_type(query.movement_type) {
        Ok(t) => t,
        Err(res) => return res,
    };

    let filter = MovementFilter {
        product_id: dto::non_blank(query.product_id).map(ProductId::new),
        store_id: dto::store_id(query.store_id),
        movement_type,
        created_from: query.from,
        created_to: query.to,
        ..MovementFilter::for_merchant(merchant.merchant_id().clone())
    };
    let page = PageRequest::new(query.page, query.page_size);

    match services.engine.ledger().list_movements(&filter, page).await {
        Ok(result) => (
            StatusCode::OK,
            Json(dto::paged_to_json(&result, dto::movement_to_json)),
        )
            .into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}
