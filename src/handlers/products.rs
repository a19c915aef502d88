use actix_web::{web, HttpResponse};
use mongodb::bson::{doc, oid::ObjectId, DateTime};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, info};
use validator::Validate;

use crate::error::ApiError;
use crate::models::{
    CreateProductRequest, Page, Product, ProductQuery, ProductResponse, SortOrder,
    UpdateProductRequest,
};
use crate::state::AppState;
use crate::store::CatalogStore;

static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

pub fn slugify(name: &str) -> String {
    NON_SLUG
        .replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

pub(crate) fn parse_id(id: &str) -> Result<ObjectId, ApiError> {
    ObjectId::parse_str(id).map_err(|_| {
        debug!("Invalid ID format: {}", id);
        ApiError::invalid_id(id)
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    /// `min-max`, either side may be empty.
    pub price: Option<String>,
    pub order: Option<SortOrder>,
    pub page: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPage {
    pub products: Vec<ProductResponse>,
    pub count_products: u64,
    pub page: u64,
    pub pages: u64,
}

impl From<Page<Product>> for ProductPage {
    fn from(page: Page<Product>) -> Self {
        ProductPage {
            products: page.items.into_iter().map(ProductResponse::from).collect(),
            count_products: page.total,
            page: page.page,
            pages: page.pages,
        }
    }
}

/// Empty strings and the client's `all` placeholder mean "no filter".
fn filter_value(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && v != "all")
}

fn price_bound(raw: &str) -> Result<Option<Decimal>, ApiError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ApiError::BadRequest(format!("Invalid price filter: {}", raw)))
}

/// Defaults to the first page and rejects pages whose offset cannot be skipped.
pub(crate) fn page_number(page: Option<u64>, page_size: u64) -> Result<u64, ApiError> {
    let page = page.unwrap_or(1).max(1);
    match (page - 1).checked_mul(page_size) {
        Some(skip) if skip <= ProductQuery::MAX_SKIP => Ok(page),
        _ => Err(ApiError::BadRequest(format!("Page {} is out of range", page))),
    }
}

impl SearchParams {
    pub fn into_query(self, page_size: u64) -> Result<ProductQuery, ApiError> {
        let (min_price, max_price) = match filter_value(self.price) {
            Some(range) => {
                let (min, max) = range
                    .split_once('-')
                    .ok_or_else(|| ApiError::BadRequest(format!("Invalid price filter: {}", range)))?;
                (price_bound(min)?, price_bound(max)?)
            }
            None => (None, None),
        };

        Ok(ProductQuery {
            text: filter_value(self.query),
            category: filter_value(self.category),
            brand: filter_value(self.brand),
            min_price,
            max_price,
            order: self.order.unwrap_or_default(),
            page: page_number(self.page, page_size)?,
            page_size,
        })
    }
}

pub async fn create_product(
    state: web::Data<AppState>,
    product: web::Json<CreateProductRequest>,
) -> Result<HttpResponse, ApiError> {
    product.validate()?;
    let product = product.into_inner();

    debug!("Creating new product: {:?}", product);

    let now = DateTime::now();
    let slug = product
        .slug
        .filter(|slug| !slug.is_empty())
        .unwrap_or_else(|| slugify(&product.name));
    let new_product = Product {
        id: None,
        name: product.name,
        slug,
        category: product.category,
        brand: product.brand,
        image: product.image,
        description: product.description,
        price: product.price,
        count_in_stock: product.count_in_stock,
        created_at: now,
        updated_at: now,
    };

    let created = state.store.insert_product(new_product).await?;

    info!("Product created successfully with ID: {:?}", created.id);
    Ok(HttpResponse::Created().json(ProductResponse::from(created)))
}

pub async fn get_product(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    debug!("Fetching product with ID: {}", id);

    let object_id = parse_id(&id)?;
    let product = state
        .store
        .find_product(object_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Product Not Found".into()))?;

    Ok(HttpResponse::Ok().json(ProductResponse::from(product)))
}

pub async fn get_product_by_slug(
    state: web::Data<AppState>,
    slug: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    debug!("Fetching product with slug: {}", slug);

    let product = state
        .store
        .find_product_by_slug(&slug)
        .await?
        .ok_or_else(|| ApiError::NotFound("Product Not Found".into()))?;

    Ok(HttpResponse::Ok().json(ProductResponse::from(product)))
}

pub async fn list_products(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    debug!("Fetching products");

    let products: Vec<ProductResponse> = state
        .store
        .list_products()
        .await?
        .into_iter()
        .map(ProductResponse::from)
        .collect();

    info!("Retrieved {} products", products.len());
    Ok(HttpResponse::Ok().json(products))
}

pub async fn list_categories(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let categories = state.store.product_categories().await?;
    Ok(HttpResponse::Ok().json(categories))
}

pub async fn search_products(
    state: web::Data<AppState>,
    params: web::Query<SearchParams>,
) -> Result<HttpResponse, ApiError> {
    let query = params.into_inner().into_query(state.settings.page_size)?;
    debug!("Searching products: {:?}", query);

    let page = state.store.search_products(&query).await?;

    Ok(HttpResponse::Ok().json(ProductPage::from(page)))
}

pub async fn admin_products(
    state: web::Data<AppState>,
    params: web::Query<PageParams>,
) -> Result<HttpResponse, ApiError> {
    let query = ProductQuery {
        page: page_number(params.page, state.settings.page_size)?,
        page_size: state.settings.page_size,
        ..Default::default()
    };

    let page = state.store.search_products(&query).await?;

    Ok(HttpResponse::Ok().json(ProductPage::from(page)))
}

pub async fn update_product(
    state: web::Data<AppState>,
    id: web::Path<String>,
    update: web::Json<UpdateProductRequest>,
) -> Result<HttpResponse, ApiError> {
    debug!("Updating product {}: {:?}", id, update);

    update.validate()?;
    if update.is_empty() {
        return Err(ApiError::BadRequest("No fields to update".into()));
    }
    let object_id = parse_id(&id)?;

    let product = state
        .store
        .update_product(object_id, &update)
        .await?
        .ok_or_else(|| ApiError::NotFound("Product Not Found".into()))?;

    info!("Product updated successfully: {}", id);
    Ok(HttpResponse::Ok().json(ProductResponse::from(product)))
}

pub async fn delete_product(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    debug!("Deleting product: {}", id);

    let object_id = parse_id(&id)?;
    if !state.store.delete_product(object_id).await? {
        return Err(ApiError::NotFound("Product Not Found".into()));
    }

    info!("Product deleted successfully: {}", id);
    Ok(HttpResponse::Ok().json(doc! { "message": "Product Deleted" }))
}
