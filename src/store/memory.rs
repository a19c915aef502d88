use async_trait::async_trait;
use mongodb::bson::{oid::ObjectId, DateTime};
use regex::RegexBuilder;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};

use super::{first_duplicate_slug, AccountStore, CatalogStore, OrderStore, StoreError, StoreResult};
use crate::models::{
    Order, Page, PaymentResult, Product, ProductQuery, SortOrder, UpdateProductRequest, User,
    UserChanges,
};

#[derive(Default)]
struct State {
    products: Vec<Product>,
    users: Vec<User>,
    orders: Vec<Order>,
}

/// Mutex-guarded store for tests. One lock covers all collections, so
/// `place_order` checks and applies stock changes atomically.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_order_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent order insert fail after the stock check.
    pub fn fail_order_writes(&self) {
        self.fail_order_writes.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn matches(product: &Product, query: &ProductQuery) -> bool {
    if let Some(text) = &query.text {
        let pattern = RegexBuilder::new(&regex::escape(text))
            .case_insensitive(true)
            .build();
        match pattern {
            Ok(pattern) if pattern.is_match(&product.name) => {}
            _ => return false,
        }
    }
    if query.category.as_ref().is_some_and(|c| c != &product.category) {
        return false;
    }
    if query.brand.as_ref().is_some_and(|b| b != &product.brand) {
        return false;
    }
    if query.min_price.is_some_and(|min| product.price < min) {
        return false;
    }
    if query.max_price.is_some_and(|max| product.price > max) {
        return false;
    }
    true
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        Ok(self.lock().products.clone())
    }

    async fn search_products(&self, query: &ProductQuery) -> StoreResult<Page<Product>> {
        let mut found: Vec<Product> = self
            .lock()
            .products
            .iter()
            .filter(|product| matches(product, query))
            .cloned()
            .collect();

        match query.order {
            SortOrder::Featured => {}
            SortOrder::Lowest => found.sort_by(|a, b| a.price.cmp(&b.price)),
            SortOrder::Highest => found.sort_by(|a, b| b.price.cmp(&a.price)),
            SortOrder::Newest => found.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }

        let total = found.len() as u64;
        let items = found
            .into_iter()
            .skip(query.skip() as usize)
            .take(query.page_size as usize)
            .collect();
        Ok(Page::new(items, total, query.page, query.page_size))
    }

    async fn product_categories(&self) -> StoreResult<Vec<String>> {
        let mut categories: Vec<String> =
            self.lock().products.iter().map(|p| p.category.clone()).collect();
        categories.sort();
        categories.dedup();
        Ok(categories)
    }

    async fn find_product(&self, id: ObjectId) -> StoreResult<Option<Product>> {
        Ok(self.lock().products.iter().find(|p| p.id == Some(id)).cloned())
    }

    async fn find_product_by_slug(&self, slug: &str) -> StoreResult<Option<Product>> {
        Ok(self.lock().products.iter().find(|p| p.slug == slug).cloned())
    }

    async fn find_products(&self, ids: &[ObjectId]) -> StoreResult<Vec<Product>> {
        Ok(self
            .lock()
            .products
            .iter()
            .filter(|p| p.id.is_some_and(|id| ids.contains(&id)))
            .cloned()
            .collect())
    }

    async fn insert_product(&self, mut product: Product) -> StoreResult<Product> {
        let mut state = self.lock();
        if state.products.iter().any(|p| p.slug == product.slug) {
            return Err(StoreError::Duplicate("product slug".into()));
        }
        product.id = Some(ObjectId::new());
        state.products.push(product.clone());
        Ok(product)
    }

    async fn insert_products(&self, products: Vec<Product>) -> StoreResult<usize> {
        let mut state = self.lock();
        let taken = first_duplicate_slug(&products).is_some()
            || products
                .iter()
                .any(|product| state.products.iter().any(|p| p.slug == product.slug));
        if taken {
            return Err(StoreError::Duplicate("product slug".into()));
        }
        let count = products.len();
        state.products.extend(products.into_iter().map(|mut p| {
            p.id = Some(ObjectId::new());
            p
        }));
        Ok(count)
    }

    async fn update_product(
        &self,
        id: ObjectId,
        update: &UpdateProductRequest,
    ) -> StoreResult<Option<Product>> {
        let mut state = self.lock();
        if let Some(slug) = &update.slug {
            if state.products.iter().any(|p| &p.slug == slug && p.id != Some(id)) {
                return Err(StoreError::Duplicate("product slug".into()));
            }
        }
        Ok(state.products.iter_mut().find(|p| p.id == Some(id)).map(|product| {
            update.apply(product);
            product.updated_at = DateTime::now();
            product.clone()
        }))
    }

    async fn delete_product(&self, id: ObjectId) -> StoreResult<bool> {
        let mut state = self.lock();
        let before = state.products.len();
        state.products.retain(|p| p.id != Some(id));
        Ok(state.products.len() < before)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(self.lock().users.clone())
    }

    async fn find_user(&self, id: ObjectId) -> StoreResult<Option<User>> {
        Ok(self.lock().users.iter().find(|u| u.id == Some(id)).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self.lock().users.iter().find(|u| u.email == email).cloned())
    }

    async fn insert_user(&self, mut user: User) -> StoreResult<User> {
        let mut state = self.lock();
        if state.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Duplicate("email".into()));
        }
        user.id = Some(ObjectId::new());
        state.users.push(user.clone());
        Ok(user)
    }

    async fn update_user(&self, id: ObjectId, changes: &UserChanges) -> StoreResult<Option<User>> {
        let mut state = self.lock();
        if let Some(email) = &changes.email {
            if state.users.iter().any(|u| &u.email == email && u.id != Some(id)) {
                return Err(StoreError::Duplicate("email".into()));
            }
        }
        Ok(state.users.iter_mut().find(|u| u.id == Some(id)).map(|user| {
            if let Some(name) = &changes.name {
                user.name = name.clone();
            }
            if let Some(email) = &changes.email {
                user.email = email.clone();
            }
            if let Some(password_hash) = &changes.password_hash {
                user.password_hash = password_hash.clone();
            }
            if let Some(is_admin) = changes.is_admin {
                user.is_admin = is_admin;
            }
            user.updated_at = DateTime::now();
            user.clone()
        }))
    }

    async fn delete_user(&self, id: ObjectId) -> StoreResult<bool> {
        let mut state = self.lock();
        let before = state.users.len();
        state.users.retain(|u| u.id != Some(id));
        Ok(state.users.len() < before)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn place_order(&self, mut order: Order) -> StoreResult<Order> {
        let mut state = self.lock();

        for item in &order.order_items {
            let available = state
                .products
                .iter()
                .find(|p| p.id == Some(item.product))
                .map(|p| p.count_in_stock);
            if available.map_or(true, |count| count < item.quantity) {
                return Err(StoreError::InsufficientStock(item.product));
            }
        }

        if self.fail_order_writes.load(Ordering::SeqCst) {
            let failure = std::io::Error::other("order write rejected");
            return Err(StoreError::Database(failure.into()));
        }

        let now = DateTime::now();
        for item in &order.order_items {
            if let Some(product) = state.products.iter_mut().find(|p| p.id == Some(item.product)) {
                product.count_in_stock -= item.quantity;
                product.updated_at = now;
            }
        }

        order.id = Some(ObjectId::new());
        state.orders.push(order.clone());
        Ok(order)
    }

    async fn find_order(&self, id: ObjectId) -> StoreResult<Option<Order>> {
        Ok(self.lock().orders.iter().find(|o| o.id == Some(id)).cloned())
    }

    async fn list_orders(&self) -> StoreResult<Vec<Order>> {
        let mut orders = self.lock().orders.clone();
        orders.reverse();
        Ok(orders)
    }

    async fn list_orders_for_user(&self, user: ObjectId) -> StoreResult<Vec<Order>> {
        Ok(self
            .lock()
            .orders
            .iter()
            .rev()
            .filter(|o| o.user == user)
            .cloned()
            .collect())
    }

    async fn mark_order_paid(
        &self,
        id: ObjectId,
        payment: PaymentResult,
    ) -> StoreResult<Option<Order>> {
        let now = DateTime::now();
        let mut state = self.lock();
        let unpaid = state.orders.iter_mut().find(|o| o.id == Some(id) && !o.is_paid);
        Ok(unpaid.map(|order| {
            order.is_paid = true;
            order.paid_at = Some(now);
            order.payment_result = Some(payment);
            order.updated_at = now;
            order.clone()
        }))
    }

    async fn mark_order_delivered(&self, id: ObjectId) -> StoreResult<Option<Order>> {
        let now = DateTime::now();
        let mut state = self.lock();
        let pending = state.orders.iter_mut().find(|o| o.id == Some(id) && !o.is_delivered);
        Ok(pending.map(|order| {
            order.is_delivered = true;
            order.delivered_at = Some(now);
            order.updated_at = now;
            order.clone()
        }))
    }
}
