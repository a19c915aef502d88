use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

use super::products::parse_id;
use crate::auth::Session;
use crate::checkout::{self, PlaceOrderRequest};
use crate::error::ApiError;
use crate::models::{Order, OrderResponse, PaymentResult};
use crate::state::AppState;
use crate::store::OrderStore;

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderCreated {
    pub message: String,
    pub order: OrderResponse,
}

fn order_responses(orders: Vec<Order>) -> Vec<OrderResponse> {
    orders.into_iter().map(OrderResponse::from).collect()
}

async fn owned_order(
    state: &AppState,
    session: &Session,
    id: &str,
) -> Result<Order, ApiError> {
    let order = state
        .store
        .find_order(parse_id(id)?)
        .await?
        .ok_or_else(|| ApiError::NotFound("Order Not Found".into()))?;

    if !session.can_access(order.user) {
        debug!("User {} denied access to order {}", session.user_id, id);
        return Err(ApiError::Forbidden("Not your order".into()));
    }
    Ok(order)
}

pub async fn create_order(
    state: web::Data<AppState>,
    session: Session,
    request: web::Json<PlaceOrderRequest>,
) -> Result<HttpResponse, ApiError> {
    request.validate()?;

    let order = checkout::place_order(
        state.store.as_ref(),
        &state.settings.pricing,
        session.user_id,
        request.into_inner(),
    )
    .await?;

    Ok(HttpResponse::Created().json(OrderCreated {
        message: "New Order Created".into(),
        order: order.into(),
    }))
}

pub async fn list_orders(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let orders = state.store.list_orders().await?;
    debug!("Retrieved {} orders", orders.len());
    Ok(HttpResponse::Ok().json(order_responses(orders)))
}

pub async fn my_orders(
    state: web::Data<AppState>,
    session: Session,
) -> Result<HttpResponse, ApiError> {
    let orders = state.store.list_orders_for_user(session.user_id).await?;
    Ok(HttpResponse::Ok().json(order_responses(orders)))
}

pub async fn get_order(
    state: web::Data<AppState>,
    session: Session,
    id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let order = owned_order(&state, &session, &id).await?;
    Ok(HttpResponse::Ok().json(OrderResponse::from(order)))
}

pub async fn pay_order(
    state: web::Data<AppState>,
    session: Session,
    id: web::Path<String>,
    payment: web::Json<PaymentResult>,
) -> Result<HttpResponse, ApiError> {
    let order = owned_order(&state, &session, &id).await?;
    let order_id = order.id.ok_or_else(|| ApiError::NotFound("Order Not Found".into()))?;

    // Existence and ownership are settled, so a miss means another payment won.
    let order = state
        .store
        .mark_order_paid(order_id, payment.into_inner())
        .await?
        .ok_or_else(|| ApiError::BadRequest("Order already paid".into()))?;

    info!("Order paid: {}", id);
    Ok(HttpResponse::Ok().json(OrderResponse::from(order)))
}

pub async fn deliver_order(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let order_id = parse_id(&id)?;
    if let Some(order) = state.store.mark_order_delivered(order_id).await? {
        info!("Order delivered: {}", id);
        return Ok(HttpResponse::Ok().json(OrderResponse::from(order)));
    }

    match state.store.find_order(order_id).await? {
        Some(_) => Err(ApiError::BadRequest("Order already delivered".into())),
        None => Err(ApiError::NotFound("Order Not Found".into())),
    }
}
