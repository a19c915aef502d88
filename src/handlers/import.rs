use actix_multipart::{Multipart, MultipartError};
use actix_web::{error::BlockingError, web, HttpResponse};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, DateTime};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::{debug, error, info};

use super::products::slugify;
use crate::error::ApiError;
use crate::models::Product;
use crate::state::AppState;
use crate::store::CatalogStore;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductRow {
    name: String,
    #[serde(default)]
    slug: Option<String>,
    category: String,
    brand: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    description: String,
    price: Decimal,
    count_in_stock: u32,
}

fn bad_upload(e: MultipartError) -> ApiError {
    debug!("Rejected upload: {}", e);
    ApiError::BadRequest(format!("Invalid upload: {}", e))
}

fn spool_error(e: std::io::Error) -> ApiError {
    error!("Failed to spool upload: {}", e);
    ApiError::Internal("Failed to buffer upload".into())
}

fn blocking_error(e: BlockingError) -> ApiError {
    error!("Import worker failed: {}", e);
    ApiError::Internal("Failed to process upload".into())
}

/// Reads product rows from CSV. The first bad row fails the whole import.
pub(crate) fn parse_products<R: Read>(source: R) -> Result<Vec<Product>, ApiError> {
    let mut reader = csv::Reader::from_reader(source);
    let now = DateTime::now();
    let mut products = Vec::new();

    for (index, row) in reader.deserialize::<ProductRow>().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let row = row.map_err(|e| ApiError::BadRequest(format!("Row {}: {}", line, e)))?;

        if row.name.trim().is_empty() {
            return Err(ApiError::BadRequest(format!("Row {}: name is required", line)));
        }
        if row.price.is_sign_negative() && !row.price.is_zero() {
            return Err(ApiError::BadRequest(format!("Row {}: price must not be negative", line)));
        }

        let slug = row
            .slug
            .filter(|slug| !slug.trim().is_empty())
            .unwrap_or_else(|| slugify(&row.name));
        products.push(Product {
            id: None,
            name: row.name,
            slug,
            category: row.category,
            brand: row.brand,
            image: row.image,
            description: row.description,
            price: row.price,
            count_in_stock: row.count_in_stock,
            created_at: now,
            updated_at: now,
        });
    }

    Ok(products)
}

pub async fn import_products(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let limit = state.settings.import_max_bytes;
    let mut spool = web::block(tempfile::tempfile)
        .await
        .map_err(blocking_error)?
        .map_err(spool_error)?;
    let mut size = 0;
    let mut received = false;

    while let Some(mut field) = payload.try_next().await.map_err(bad_upload)? {
        let is_file = field
            .content_disposition()
            .and_then(|disposition| disposition.get_filename())
            .is_some();
        if !is_file {
            continue;
        }

        while let Some(chunk) = field.try_next().await.map_err(bad_upload)? {
            size += chunk.len();
            if size > limit {
                debug!("Rejected upload over {} bytes", limit);
                return Err(ApiError::PayloadTooLarge(format!(
                    "Upload exceeds {} bytes",
                    limit
                )));
            }
            spool = web::block(move || spool.write_all(&chunk).map(|()| spool))
                .await
                .map_err(blocking_error)?
                .map_err(spool_error)?;
        }
        received = true;
        break;
    }

    if !received {
        return Err(ApiError::BadRequest("No CSV file uploaded".into()));
    }

    let products = web::block(move || {
        spool.seek(SeekFrom::Start(0)).map_err(spool_error)?;
        parse_products(spool)
    })
    .await
    .map_err(blocking_error)??;
    debug!("Importing {} products", products.len());

    let imported = state.store.insert_products(products).await?;

    info!("Imported {} products", imported);
    Ok(HttpResponse::Created().json(doc! {
        "message": "Products imported",
        "imported": imported as i64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{
        admin_token, create_product, init_app, state, state_with,
    };
    use actix_multipart::test::create_form_data_payload_and_headers;
    use actix_web::{http::StatusCode, test as actix_test, web::Bytes};

    const CSV: &str = "name,slug,category,brand,image,description,price,countInStock\n\
                       Nike Slim Shirt,,Shirts,Nike,/images/p1.jpg,high quality shirt,120,10\n\
                       Adidas Fit Pants,adidas-pants,Pants,Adidas,,,65.5,0\n";

    #[test]
    fn parses_rows_and_derives_missing_slugs() {
        let products = parse_products(CSV.as_bytes()).unwrap();

        assert_eq!(products.len(), 2);
        assert_eq!(products[0].slug, "nike-slim-shirt");
        assert_eq!(products[0].count_in_stock, 10);
        assert_eq!(products[1].slug, "adidas-pants");
        assert_eq!(products[1].price, Decimal::new(655, 1));
        assert_eq!(products[1].image, "");
    }

    #[test]
    fn reports_the_failing_line() {
        let csv = "name,category,brand,price,countInStock\nCap,Hats,Nike,12,3\nBoots,Shoes,Nike,twelve,3\n";

        let err = parse_products(csv.as_bytes()).unwrap_err();

        assert!(err.to_string().starts_with("Row 3:"));
    }

    #[test]
    fn rejects_negative_stock() {
        let csv = "name,category,brand,price,countInStock\nCap,Hats,Nike,12,-3\n";
        assert!(parse_products(csv.as_bytes()).is_err());
    }

    async fn upload(state: &AppState, csv: &'static str) -> actix_test::TestRequest {
        let (body, headers) = create_form_data_payload_and_headers(
            "file",
            Some("products.csv".into()),
            None,
            Bytes::from_static(csv.as_bytes()),
        );
        let mut req = actix_test::TestRequest::post()
            .uri("/api/products/import")
            .insert_header(("Authorization", admin_token(state).await));
        for (name, value) in headers.iter() {
            req = req.insert_header((name.clone(), value.clone()));
        }
        req.set_payload(body)
    }

    #[actix_web::test]
    async fn admin_uploads_csv() {
        let state = state();
        let app = init_app!(state);

        let req = upload(&state, CSV).await;
        let resp = actix_test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(json["imported"], 2);

        let req = actix_test::TestRequest::get()
            .uri("/api/products/slug/adidas-pants")
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn colliding_slug_imports_nothing() {
        let state = state();
        let app = init_app!(state);
        create_product(&state, "Adidas Pants", "Pants", Decimal::new(50, 0), 1).await;

        let req = upload(&state, CSV).await;
        let resp = actix_test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let products = state.store.list_products().await.unwrap();
        assert_eq!(products.len(), 1);

        let repeated = "name,slug,category,brand,price,countInStock\n\
                        Cap,cap,Hats,Nike,12,3\n\
                        Cap Two,cap,Hats,Nike,14,3\n";
        let req = upload(&state, repeated).await;
        let resp = actix_test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.store.list_products().await.unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn oversized_uploads_are_refused() {
        let state = state_with(|settings| settings.import_max_bytes = 16);
        let app = init_app!(state);

        let req = upload(&state, CSV).await;
        let resp = actix_test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(state.store.list_products().await.unwrap().is_empty());
    }
}
