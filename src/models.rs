use chrono::{DateTime, Utc};
use mongodb::bson::{oid::ObjectId, DateTime as BsonDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub slug: String,
    pub category: String,
    pub brand: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub description: String,
    pub price: Decimal,
    pub count_in_stock: u32,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    #[validate(length(min = 1))]
    pub name: String,
    pub slug: Option<String>,
    #[validate(length(min = 1))]
    pub category: String,
    #[validate(length(min = 1))]
    pub brand: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub description: String,
    #[validate(custom = "non_negative_price")]
    pub price: Decimal,
    pub count_in_stock: u32,
}

/// Partial product edit; absent fields are left untouched.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProductRequest {
    #[validate(length(min = 1))]
    pub name: Option<String>,
    #[validate(length(min = 1))]
    pub slug: Option<String>,
    #[validate(length(min = 1))]
    pub category: Option<String>,
    pub brand: Option<String>,
    pub image: Option<String>,
    pub description: Option<String>,
    #[validate(custom = "non_negative_price")]
    pub price: Option<Decimal>,
    pub count_in_stock: Option<u32>,
}

impl UpdateProductRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.slug.is_none()
            && self.category.is_none()
            && self.brand.is_none()
            && self.image.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.count_in_stock.is_none()
    }

    pub fn apply(&self, product: &mut Product) {
        if let Some(name) = &self.name {
            product.name = name.clone();
        }
        if let Some(slug) = &self.slug {
            product.slug = slug.clone();
        }
        if let Some(category) = &self.category {
            product.category = category.clone();
        }
        if let Some(brand) = &self.brand {
            product.brand = brand.clone();
        }
        if let Some(image) = &self.image {
            product.image = image.clone();
        }
        if let Some(description) = &self.description {
            product.description = description.clone();
        }
        if let Some(price) = self.price {
            product.price = price;
        }
        if let Some(count_in_stock) = self.count_in_stock {
            product.count_in_stock = count_in_stock;
        }
    }
}

fn non_negative_price(price: &Decimal) -> Result<(), ValidationError> {
    if price.is_sign_negative() && !price.is_zero() {
        return Err(ValidationError::new("negative_price"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Featured,
    Lowest,
    Highest,
    Newest,
}

/// Catalog search filter, built from the query string of `/api/products/search`.
#[derive(Debug, Clone, Default)]
pub struct ProductQuery {
    pub text: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub order: SortOrder,
    pub page: u64,
    pub page_size: u64,
}

impl ProductQuery {
    /// Largest offset the database accepts.
    pub const MAX_SKIP: u64 = i64::MAX as u64;

    pub fn skip(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u64, page_size: u64) -> Self {
        let pages = if page_size == 0 { 0 } else { total.div_ceil(page_size) };
        Page { items, total, page, pages }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
}

/// Field changes for a user record; `None` keeps the stored value.
#[derive(Debug, Default, Clone)]
pub struct UserChanges {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub is_admin: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product: ObjectId,
    pub name: String,
    pub slug: String,
    pub image: String,
    pub quantity: u32,
    pub price: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    #[validate(length(min = 1))]
    pub full_name: String,
    #[validate(length(min = 1))]
    pub address: String,
    #[validate(length(min = 1))]
    pub city: String,
    #[validate(length(min = 1))]
    pub postal_code: String,
    #[validate(length(min = 1))]
    pub country: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub update_time: String,
    #[serde(default)]
    pub email_address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user: ObjectId,
    pub order_items: Vec<LineItem>,
    pub shipping_address: ShippingAddress,
    pub payment_method: String,
    pub payment_result: Option<PaymentResult>,
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub tax_price: Decimal,
    pub total_price: Decimal,
    pub is_paid: bool,
    pub paid_at: Option<BsonDateTime>,
    pub is_delivered: bool,
    pub delivered_at: Option<BsonDateTime>,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
}

fn hex(id: &Option<ObjectId>) -> String {
    id.map(|id| id.to_hex()).unwrap_or_default()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductResponse {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub slug: String,
    pub category: String,
    pub brand: String,
    pub image: String,
    pub description: String,
    pub price: Decimal,
    pub count_in_stock: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Product> for ProductResponse {
    fn from(product: Product) -> Self {
        ProductResponse {
            id: hex(&product.id),
            name: product.name,
            slug: product.slug,
            category: product.category,
            brand: product.brand,
            image: product.image,
            description: product.description,
            price: product.price,
            count_in_stock: product.count_in_stock,
            created_at: product.created_at.to_chrono(),
            updated_at: product.updated_at.to_chrono(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            id: hex(&user.id),
            name: user.name,
            email: user.email,
            is_admin: user.is_admin,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemResponse {
    pub product: String,
    pub name: String,
    pub slug: String,
    pub image: String,
    pub quantity: u32,
    pub price: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(rename = "_id")]
    pub id: String,
    pub user: String,
    pub order_items: Vec<LineItemResponse>,
    pub shipping_address: ShippingAddress,
    pub payment_method: String,
    pub payment_result: Option<PaymentResult>,
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub tax_price: Decimal,
    pub total_price: Decimal,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        OrderResponse {
            id: hex(&order.id),
            user: order.user.to_hex(),
            order_items: order
                .order_items
                .into_iter()
                .map(|item| LineItemResponse {
                    product: item.product.to_hex(),
                    name: item.name,
                    slug: item.slug,
                    image: item.image,
                    quantity: item.quantity,
                    price: item.price,
                })
                .collect(),
            shipping_address: order.shipping_address,
            payment_method: order.payment_method,
            payment_result: order.payment_result,
            items_price: order.items_price,
            shipping_price: order.shipping_price,
            tax_price: order.tax_price,
            total_price: order.total_price,
            is_paid: order.is_paid,
            paid_at: order.paid_at.map(|at| at.to_chrono()),
            is_delivered: order.is_delivered,
            delivered_at: order.delivered_at.map(|at| at.to_chrono()),
            created_at: order.created_at.to_chrono(),
            updated_at: order.updated_at.to_chrono(),
        }
    }
}
