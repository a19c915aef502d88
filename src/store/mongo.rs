use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, to_bson, DateTime, Document},
    error::{
        ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument},
    Client, ClientSession, Collection, IndexModel,
};
use std::future::Future;
use tracing::{debug, error, info, warn};

use super::{
    first_duplicate_slug, AccountStore, CatalogStore, OrderStore, StoreError, StoreResult,
};
use crate::config::MongoConfig;
use crate::models::{
    Order, Page, PaymentResult, Product, ProductQuery, SortOrder, UpdateProductRequest, User,
    UserChanges,
};

const DUPLICATE_KEY: i32 = 11000;
const TRANSACTION_ATTEMPTS: u32 = 5;
const COMMIT_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    products: Collection<Product>,
    users: Collection<User>,
    orders: Collection<Order>,
}

impl MongoStore {
    pub fn new(config: MongoConfig) -> Self {
        MongoStore {
            products: config.database.collection("products"),
            users: config.database.collection("users"),
            orders: config.database.collection("orders"),
            client: config.client,
        }
    }

    pub async fn ensure_indexes(&self) -> StoreResult<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.users
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "email": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;
        self.products
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "slug": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;

        info!("MongoDB indexes in place");
        Ok(())
    }

    async fn abort(session: &mut ClientSession) {
        if let Err(e) = session.abort_transaction().await {
            error!("Failed to abort transaction: {}", e);
        }
    }

    /// Commits, retrying while the server cannot say whether the commit landed.
    async fn commit(session: &mut ClientSession) -> StoreResult<()> {
        let mut attempt = 1;
        loop {
            match session.commit_transaction().await {
                Err(e)
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                        && attempt < COMMIT_ATTEMPTS =>
                {
                    debug!("Retrying commit after attempt {}: {}", attempt, e);
                    attempt += 1;
                }
                result => return result.map_err(StoreError::from),
            }
        }
    }

    /// Applies every stock decrement and the order insert inside the
    /// session's open transaction.
    async fn stage_order(
        &self,
        session: &mut ClientSession,
        order: &Order,
    ) -> StoreResult<Option<ObjectId>> {
        for item in &order.order_items {
            let quantity = i64::from(item.quantity);
            let update = self
                .products
                .update_one_with_session(
                    doc! { "_id": item.product, "countInStock": { "$gte": quantity } },
                    doc! {
                        "$inc": { "countInStock": -quantity },
                        "$set": { "updatedAt": DateTime::now() },
                    },
                    None,
                    session,
                )
                .await?;
            if update.matched_count != 1 {
                debug!("Stock check failed for product {}", item.product);
                return Err(StoreError::InsufficientStock(item.product));
            }
        }

        let inserted = self
            .orders
            .insert_one_with_session(order, None, session)
            .await?;
        Ok(inserted.inserted_id.as_object_id())
    }

    async fn place_order_once(&self, order: &Order) -> StoreResult<Option<ObjectId>> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        match self.stage_order(&mut session, order).await {
            Ok(id) => {
                Self::commit(&mut session).await?;
                Ok(id)
            }
            Err(e) => {
                Self::abort(&mut session).await;
                Err(e)
            }
        }
    }

    async fn insert_products_once(&self, products: &[Product]) -> StoreResult<usize> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        match self
            .products
            .insert_many_with_session(products, None, &mut session)
            .await
        {
            Ok(result) => {
                Self::commit(&mut session).await?;
                Ok(result.inserted_ids.len())
            }
            Err(e) => {
                Self::abort(&mut session).await;
                Err(classify(e, "product slug"))
            }
        }
    }
}

fn is_transient(err: &StoreError) -> bool {
    matches!(err, StoreError::Database(e) if e.contains_label(TRANSIENT_TRANSACTION_ERROR))
}

/// Runs `op` until it succeeds, fails with an error `retryable` rejects, or
/// `attempts` runs are used up. Exhaustion surfaces as [`StoreError::Conflict`].
async fn with_retries<T, F, Fut>(
    attempts: u32,
    retryable: impl Fn(&StoreError) -> bool,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if retryable(&e) => {
                if attempt >= attempts {
                    warn!("Giving up after {} attempts: {}", attempt, e);
                    return Err(StoreError::Conflict);
                }
                debug!("Retrying transaction after attempt {}: {}", attempt, e);
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .as_ref()
            .map(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY))
            .unwrap_or(false),
        _ => false,
    }
}

fn classify(err: mongodb::error::Error, what: &str) -> StoreError {
    if is_duplicate_key(&err) {
        StoreError::Duplicate(what.to_string())
    } else {
        StoreError::Database(err)
    }
}

fn after_update() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build()
}

fn search_filter(query: &ProductQuery) -> StoreResult<Document> {
    let mut filter = doc! {};

    if let Some(text) = &query.text {
        filter.insert("name", doc! { "$regex": regex::escape(text), "$options": "i" });
    }
    if let Some(category) = &query.category {
        filter.insert("category", category);
    }
    if let Some(brand) = &query.brand {
        filter.insert("brand", brand);
    }

    let mut price = doc! {};
    if let Some(min) = query.min_price {
        price.insert("$gte", to_bson(&min)?);
    }
    if let Some(max) = query.max_price {
        price.insert("$lte", to_bson(&max)?);
    }
    if !price.is_empty() {
        filter.insert("price", price);
    }

    Ok(filter)
}

fn sort_document(order: SortOrder) -> Document {
    match order {
        SortOrder::Featured => doc! { "_id": 1 },
        SortOrder::Lowest => doc! { "price": 1, "_id": 1 },
        SortOrder::Highest => doc! { "price": -1, "_id": 1 },
        SortOrder::Newest => doc! { "createdAt": -1, "_id": -1 },
    }
}

fn product_changes(update: &UpdateProductRequest) -> StoreResult<Document> {
    let mut changes = doc! {};

    if let Some(name) = &update.name {
        changes.insert("name", name);
    }
    if let Some(slug) = &update.slug {
        changes.insert("slug", slug);
    }
    if let Some(category) = &update.category {
        changes.insert("category", category);
    }
    if let Some(brand) = &update.brand {
        changes.insert("brand", brand);
    }
    if let Some(image) = &update.image {
        changes.insert("image", image);
    }
    if let Some(description) = &update.description {
        changes.insert("description", description);
    }
    if let Some(price) = update.price {
        changes.insert("price", to_bson(&price)?);
    }
    if let Some(count_in_stock) = update.count_in_stock {
        changes.insert("countInStock", i64::from(count_in_stock));
    }
    changes.insert("updatedAt", DateTime::now());

    Ok(changes)
}

#[async_trait]
impl CatalogStore for MongoStore {
    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        let mut products = Vec::new();
        let mut cursor = self.products.find(None, None).await?;

        while let Some(product) = cursor.try_next().await? {
            products.push(product);
        }

        Ok(products)
    }

    async fn search_products(&self, query: &ProductQuery) -> StoreResult<Page<Product>> {
        let filter = search_filter(query)?;
        debug!("Searching products with filter {}", filter);

        let total = self.products.count_documents(filter.clone(), None).await?;
        let options = FindOptions::builder()
            .sort(sort_document(query.order))
            .skip(query.skip())
            .limit(i64::try_from(query.page_size).unwrap_or(i64::MAX))
            .build();
        let products = self
            .products
            .find(filter, options)
            .await?
            .try_collect()
            .await?;

        Ok(Page::new(products, total, query.page, query.page_size))
    }

    async fn product_categories(&self) -> StoreResult<Vec<String>> {
        let values = self.products.distinct("category", None, None).await?;
        let mut categories: Vec<String> = values
            .into_iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect();
        categories.sort();
        Ok(categories)
    }

    async fn find_product(&self, id: ObjectId) -> StoreResult<Option<Product>> {
        Ok(self.products.find_one(doc! { "_id": id }, None).await?)
    }

    async fn find_product_by_slug(&self, slug: &str) -> StoreResult<Option<Product>> {
        Ok(self.products.find_one(doc! { "slug": slug }, None).await?)
    }

    async fn find_products(&self, ids: &[ObjectId]) -> StoreResult<Vec<Product>> {
        let products = self
            .products
            .find(doc! { "_id": { "$in": ids.to_vec() } }, None)
            .await?
            .try_collect()
            .await?;
        Ok(products)
    }

    async fn insert_product(&self, mut product: Product) -> StoreResult<Product> {
        let result = self
            .products
            .insert_one(&product, None)
            .await
            .map_err(|e| classify(e, "product slug"))?;
        product.id = result.inserted_id.as_object_id();
        Ok(product)
    }

    async fn insert_products(&self, products: Vec<Product>) -> StoreResult<usize> {
        if products.is_empty() {
            return Ok(0);
        }
        if let Some(slug) = first_duplicate_slug(&products) {
            debug!("Batch repeats slug {}", slug);
            return Err(StoreError::Duplicate("product slug".into()));
        }

        let batch = products.as_slice();
        with_retries(TRANSACTION_ATTEMPTS, is_transient, move || {
            self.insert_products_once(batch)
        })
        .await
    }

    async fn update_product(
        &self,
        id: ObjectId,
        update: &UpdateProductRequest,
    ) -> StoreResult<Option<Product>> {
        let changes = product_changes(update)?;
        self.products
            .find_one_and_update(doc! { "_id": id }, doc! { "$set": changes }, after_update())
            .await
            .map_err(|e| classify(e, "product slug"))
    }

    async fn delete_product(&self, id: ObjectId) -> StoreResult<bool> {
        let result = self.products.delete_one(doc! { "_id": id }, None).await?;
        Ok(result.deleted_count > 0)
    }
}

#[async_trait]
impl AccountStore for MongoStore {
    async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(self.users.find(None, None).await?.try_collect().await?)
    }

    async fn find_user(&self, id: ObjectId) -> StoreResult<Option<User>> {
        Ok(self.users.find_one(doc! { "_id": id }, None).await?)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self.users.find_one(doc! { "email": email }, None).await?)
    }

    async fn insert_user(&self, mut user: User) -> StoreResult<User> {
        let result = self
            .users
            .insert_one(&user, None)
            .await
            .map_err(|e| classify(e, "email"))?;
        user.id = result.inserted_id.as_object_id();
        Ok(user)
    }

    async fn update_user(&self, id: ObjectId, changes: &UserChanges) -> StoreResult<Option<User>> {
        let mut set = doc! { "updatedAt": DateTime::now() };
        if let Some(name) = &changes.name {
            set.insert("name", name);
        }
        if let Some(email) = &changes.email {
            set.insert("email", email);
        }
        if let Some(password_hash) = &changes.password_hash {
            set.insert("passwordHash", password_hash);
        }
        if let Some(is_admin) = changes.is_admin {
            set.insert("isAdmin", is_admin);
        }

        self.users
            .find_one_and_update(doc! { "_id": id }, doc! { "$set": set }, after_update())
            .await
            .map_err(|e| classify(e, "email"))
    }

    async fn delete_user(&self, id: ObjectId) -> StoreResult<bool> {
        let result = self.users.delete_one(doc! { "_id": id }, None).await?;
        Ok(result.deleted_count > 0)
    }
}

#[async_trait]
impl OrderStore for MongoStore {
    async fn place_order(&self, mut order: Order) -> StoreResult<Order> {
        let staged = &order;
        let id = with_retries(TRANSACTION_ATTEMPTS, is_transient, move || {
            self.place_order_once(staged)
        })
        .await?;
        order.id = id;
        Ok(order)
    }

    async fn find_order(&self, id: ObjectId) -> StoreResult<Option<Order>> {
        Ok(self.orders.find_one(doc! { "_id": id }, None).await?)
    }

    async fn list_orders(&self) -> StoreResult<Vec<Order>> {
        let options = FindOptions::builder().sort(doc! { "createdAt": -1 }).build();
        Ok(self.orders.find(None, options).await?.try_collect().await?)
    }

    async fn list_orders_for_user(&self, user: ObjectId) -> StoreResult<Vec<Order>> {
        let options = FindOptions::builder().sort(doc! { "createdAt": -1 }).build();
        Ok(self
            .orders
            .find(doc! { "user": user }, options)
            .await?
            .try_collect()
            .await?)
    }

    async fn mark_order_paid(
        &self,
        id: ObjectId,
        payment: PaymentResult,
    ) -> StoreResult<Option<Order>> {
        let now = DateTime::now();
        let update = doc! {
            "$set": {
                "isPaid": true,
                "paidAt": now,
                "paymentResult": to_bson(&payment)?,
                "updatedAt": now,
            }
        };
        Ok(self
            .orders
            .find_one_and_update(doc! { "_id": id, "isPaid": false }, update, after_update())
            .await?)
    }

    async fn mark_order_delivered(&self, id: ObjectId) -> StoreResult<Option<Order>> {
        let now = DateTime::now();
        let update = doc! {
            "$set": { "isDelivered": true, "deliveredAt": now, "updatedAt": now }
        };
        Ok(self
            .orders
            .find_one_and_update(
                doc! { "_id": id, "isDelivered": false },
                update,
                after_update(),
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn search_filter_escapes_text_and_bounds_price() {
        let query = ProductQuery {
            text: Some("shirt (slim)".into()),
            category: Some("Shirts".into()),
            min_price: Some(Decimal::new(10, 0)),
            max_price: Some(Decimal::new(50, 0)),
            ..Default::default()
        };

        let filter = search_filter(&query).unwrap();

        let name = filter.get_document("name").unwrap();
        assert_eq!(name.get_str("$regex").unwrap(), r"shirt \(slim\)");
        assert_eq!(filter.get_str("category").unwrap(), "Shirts");
        let price = filter.get_document("price").unwrap();
        assert_eq!(price.get_f64("$gte").unwrap(), 10.0);
        assert_eq!(price.get_f64("$lte").unwrap(), 50.0);
        assert!(filter.get("brand").is_none());
    }

    fn write_conflict() -> StoreError {
        let failure = std::io::Error::other("write conflict");
        StoreError::Database(failure.into())
    }

    #[tokio::test]
    async fn retries_until_the_operation_succeeds() {
        let mut calls = 0;
        let result = with_retries(
            TRANSACTION_ATTEMPTS,
            |e| matches!(e, StoreError::Database(_)),
            || {
                calls += 1;
                let outcome = if calls < 3 { Err(write_conflict()) } else { Ok(calls) };
                async move { outcome }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn persistent_conflicts_become_conflict_errors() {
        let mut calls = 0;
        let result: StoreResult<()> = with_retries(
            TRANSACTION_ATTEMPTS,
            |e| matches!(e, StoreError::Database(_)),
            || {
                calls += 1;
                async { Err(write_conflict()) }
            },
        )
        .await;

        assert!(matches!(result, Err(StoreError::Conflict)));
        assert_eq!(calls, TRANSACTION_ATTEMPTS);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let mut calls = 0;
        let product = ObjectId::new();
        let result: StoreResult<()> = with_retries(TRANSACTION_ATTEMPTS, is_transient, || {
            calls += 1;
            async move { Err(StoreError::InsufficientStock(product)) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::InsufficientStock(id)) if id == product));
        assert_eq!(calls, 1);
        assert!(!is_transient(&write_conflict()));
    }

    #[test]
    fn product_changes_only_set_supplied_fields() {
        let update = UpdateProductRequest {
            name: Some("Renamed".into()),
            count_in_stock: Some(4),
            ..Default::default()
        };

        let changes = product_changes(&update).unwrap();

        assert_eq!(changes.get_str("name").unwrap(), "Renamed");
        assert_eq!(changes.get_i64("countInStock").unwrap(), 4);
        assert!(changes.contains_key("updatedAt"));
        assert!(!changes.contains_key("price"));
        assert!(!changes.contains_key("slug"));
        assert_eq!(changes.len(), 3);
    }
}
