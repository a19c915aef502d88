//! Persistence seams for catalog, accounts and orders.
//!
//! Handlers only see [`Store`]; production wires in [`MongoStore`], tests use
//! the in-memory store.

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use thiserror::Error;

use crate::models::{
    Order, Page, PaymentResult, Product, ProductQuery, UpdateProductRequest, User, UserChanges,
};

#[cfg(test)]
pub mod memory;
mod mongo;

pub use mongo::MongoStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] mongodb::bson::ser::Error),

    #[error("duplicate {0}")]
    Duplicate(String),

    #[error("insufficient stock for product {0}")]
    InsufficientStock(ObjectId),

    #[error("write conflict persisted after retrying")]
    Conflict,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// First slug that appears more than once in a batch.
pub(crate) fn first_duplicate_slug(products: &[Product]) -> Option<&str> {
    products
        .iter()
        .enumerate()
        .find(|(i, product)| products[..*i].iter().any(|p| p.slug == product.slug))
        .map(|(_, product)| product.slug.as_str())
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_products(&self) -> StoreResult<Vec<Product>>;
    async fn search_products(&self, query: &ProductQuery) -> StoreResult<Page<Product>>;
    async fn product_categories(&self) -> StoreResult<Vec<String>>;
    async fn find_product(&self, id: ObjectId) -> StoreResult<Option<Product>>;
    async fn find_product_by_slug(&self, slug: &str) -> StoreResult<Option<Product>>;
    /// Loads every product whose id is in `ids`; missing ids are simply absent.
    async fn find_products(&self, ids: &[ObjectId]) -> StoreResult<Vec<Product>>;
    async fn insert_product(&self, product: Product) -> StoreResult<Product>;
    /// Inserts the whole batch or nothing. A slug repeated in the batch or
    /// already stored fails with [`StoreError::Duplicate`].
    async fn insert_products(&self, products: Vec<Product>) -> StoreResult<usize>;
    async fn update_product(
        &self,
        id: ObjectId,
        update: &UpdateProductRequest,
    ) -> StoreResult<Option<Product>>;
    async fn delete_product(&self, id: ObjectId) -> StoreResult<bool>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list_users(&self) -> StoreResult<Vec<User>>;
    async fn find_user(&self, id: ObjectId) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn insert_user(&self, user: User) -> StoreResult<User>;
    async fn update_user(&self, id: ObjectId, changes: &UserChanges) -> StoreResult<Option<User>>;
    async fn delete_user(&self, id: ObjectId) -> StoreResult<bool>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Decrements stock for every line item and inserts the order as one unit.
    ///
    /// Each decrement only applies while `countInStock >= quantity`. When any
    /// line cannot be satisfied nothing is written and
    /// [`StoreError::InsufficientStock`] names the product.
    async fn place_order(&self, order: Order) -> StoreResult<Order>;
    async fn find_order(&self, id: ObjectId) -> StoreResult<Option<Order>>;
    async fn list_orders(&self) -> StoreResult<Vec<Order>>;
    async fn list_orders_for_user(&self, user: ObjectId) -> StoreResult<Vec<Order>>;
    /// Records the payment only while the order is unpaid. `None` means the
    /// order is missing or was already paid.
    async fn mark_order_paid(
        &self,
        id: ObjectId,
        payment: PaymentResult,
    ) -> StoreResult<Option<Order>>;
    /// Same contract as [`OrderStore::mark_order_paid`] for delivery.
    async fn mark_order_delivered(&self, id: ObjectId) -> StoreResult<Option<Order>>;
}

pub trait Store: CatalogStore + AccountStore + OrderStore {}

impl<T> Store for T where T: CatalogStore + AccountStore + OrderStore {}
