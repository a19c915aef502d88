//! Order placement: validates a cart against live stock, snapshots prices and
//! hands the finished order to the store, which decrements stock and writes
//! the order as one unit.

use mongodb::bson::{oid::ObjectId, DateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use validator::Validate;

use crate::error::ApiError;
use crate::models::{LineItem, Order, Product, ShippingAddress};
use crate::store::{CatalogStore, OrderStore, Store, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct PricingRules {
    pub tax_rate: Decimal,
    /// Orders whose items total strictly more than this ship free.
    pub free_shipping_threshold: Decimal,
    pub shipping_fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub tax_price: Decimal,
    pub total_price: Decimal,
}

impl PricingRules {
    pub fn totals(&self, items: &[LineItem]) -> OrderTotals {
        let items_price = items
            .iter()
            .map(|item| item.price * Decimal::from(item.quantity))
            .sum::<Decimal>()
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let shipping_price = if items_price > self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.shipping_fee
        };
        let tax_price = (items_price * self.tax_rate)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

        OrderTotals {
            items_price,
            shipping_price,
            tax_price,
            total_price: items_price + shipping_price + tax_price,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemRequest {
    #[serde(alias = "_id")]
    pub product: String,
    pub quantity: u32,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    #[validate(length(min = 1))]
    pub order_items: Vec<OrderItemRequest>,
    #[validate]
    pub shipping_address: ShippingAddress,
    #[validate(length(min = 1))]
    pub payment_method: String,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Order has no items")]
    EmptyOrder,

    #[error("Quantity for product {0} must be at least 1")]
    InvalidQuantity(String),

    #[error("Invalid ID format: {0}")]
    InvalidProductId(String),

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("{0} is out of stock")]
    OutOfStock(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::ProductNotFound(_) => ApiError::NotFound(err.to_string()),
            CheckoutError::Store(e) => ApiError::Store(e),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

/// Parses ids, rejects zero quantities and folds repeated products into one
/// line so the stock check sees the full requested amount.
fn merge_lines(items: &[OrderItemRequest]) -> Result<Vec<(ObjectId, u32)>, CheckoutError> {
    if items.is_empty() {
        return Err(CheckoutError::EmptyOrder);
    }

    let mut lines: Vec<(ObjectId, u32)> = Vec::with_capacity(items.len());
    for item in items {
        let id = ObjectId::parse_str(&item.product)
            .map_err(|_| CheckoutError::InvalidProductId(item.product.clone()))?;
        if item.quantity == 0 {
            return Err(CheckoutError::InvalidQuantity(item.product.clone()));
        }
        match lines.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, quantity)) => *quantity = quantity.saturating_add(item.quantity),
            None => lines.push((id, item.quantity)),
        }
    }
    Ok(lines)
}

fn snapshot(product: &Product, id: ObjectId, quantity: u32) -> LineItem {
    LineItem {
        product: id,
        name: product.name.clone(),
        slug: product.slug.clone(),
        image: product.image.clone(),
        quantity,
        price: product.price,
    }
}

/// Places an order for `user`. Either the whole order is written and every
/// product's stock drops by its quantity, or nothing changes.
pub async fn place_order(
    store: &dyn Store,
    pricing: &PricingRules,
    user: ObjectId,
    request: PlaceOrderRequest,
) -> Result<Order, CheckoutError> {
    let lines = merge_lines(&request.order_items)?;
    let ids: Vec<ObjectId> = lines.iter().map(|(id, _)| *id).collect();

    debug!("Placing order for user {} with {} line(s)", user, lines.len());

    let products = store.find_products(&ids).await?;

    let mut items = Vec::with_capacity(lines.len());
    for (id, quantity) in &lines {
        let product = products
            .iter()
            .find(|p| p.id == Some(*id))
            .ok_or_else(|| CheckoutError::ProductNotFound(id.to_hex()))?;
        if product.count_in_stock < *quantity {
            debug!(
                "Rejecting order: {} has {} in stock, {} requested",
                product.name, product.count_in_stock, quantity
            );
            return Err(CheckoutError::OutOfStock(product.name.clone()));
        }
        items.push(snapshot(product, *id, *quantity));
    }

    let totals = pricing.totals(&items);
    let now = DateTime::now();
    let order = Order {
        id: None,
        user,
        order_items: items,
        shipping_address: request.shipping_address,
        payment_method: request.payment_method,
        payment_result: None,
        items_price: totals.items_price,
        shipping_price: totals.shipping_price,
        tax_price: totals.tax_price,
        total_price: totals.total_price,
        is_paid: false,
        paid_at: None,
        is_delivered: false,
        delivered_at: None,
        created_at: now,
        updated_at: now,
    };

    let order = store.place_order(order).await.map_err(|e| match e {
        StoreError::InsufficientStock(id) => {
            let name = products
                .iter()
                .find(|p| p.id == Some(id))
                .map(|p| p.name.clone())
                .unwrap_or_else(|| id.to_hex());
            CheckoutError::OutOfStock(name)
        }
        other => CheckoutError::Store(other),
    })?;

    info!(
        "Order {} placed for user {}, total {}",
        order.id.map(|id| id.to_hex()).unwrap_or_default(),
        user,
        order.total_price
    );
    Ok(order)
}
