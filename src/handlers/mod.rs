pub mod import;
pub mod orders;
pub mod products;
pub mod users;

use actix_web::{web, HttpResponse};
use tracing::debug;

use crate::auth::{self, Authenticate};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn paypal_client_id(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain")
        .body(state.settings.paypal_client_id.clone())
}

fn rejected<E: std::fmt::Display>(kind: &str, err: E) -> actix_web::Error {
    debug!("Rejected {}: {}", kind, err);
    ApiError::BadRequest(err.to_string()).into()
}

/// Registers extractor error handlers and every `/api` route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _| rejected("body", err)))
        .app_data(web::QueryConfig::default().error_handler(|err, _| rejected("query", err)))
        .app_data(web::PathConfig::default().error_handler(|err, _| rejected("path", err)))
        .service(
            web::scope("/api/products")
                .service(
                    web::resource("")
                        .route(web::get().to(products::list_products))
                        .route(
                            web::post()
                                .to(products::create_product)
                                .wrap(Authenticate::admin()),
                        ),
                )
                .service(
                    web::resource("/import")
                        .wrap(Authenticate::admin())
                        .route(web::post().to(import::import_products)),
                )
                .route("/categories", web::get().to(products::list_categories))
                .route("/search", web::get().to(products::search_products))
                .service(
                    web::resource("/admin")
                        .wrap(Authenticate::admin())
                        .route(web::get().to(products::admin_products)),
                )
                .route("/slug/{slug}", web::get().to(products::get_product_by_slug))
                .service(
                    web::resource("/{id}")
                        .route(web::get().to(products::get_product))
                        .route(
                            web::put()
                                .to(products::update_product)
                                .wrap(Authenticate::admin()),
                        )
                        .route(
                            web::delete()
                                .to(products::delete_product)
                                .wrap(Authenticate::admin()),
                        ),
                ),
        )
        .service(
            web::scope("/api/users")
                .service(
                    web::resource("")
                        .wrap(Authenticate::admin())
                        .route(web::get().to(users::list_users)),
                )
                .route("/signup", web::post().to(auth::register))
                .route("/signin", web::post().to(auth::login))
                .route("/refresh", web::post().to(auth::refresh_token))
                .service(
                    web::resource("/profile")
                        .wrap(Authenticate::user())
                        .route(web::put().to(users::update_profile)),
                )
                .service(
                    web::resource("/{id}")
                        .wrap(Authenticate::admin())
                        .route(web::get().to(users::get_user))
                        .route(web::put().to(users::update_user))
                        .route(web::delete().to(users::delete_user)),
                ),
        )
        .service(
            web::scope("/api/orders")
                .service(
                    web::resource("")
                        .route(
                            web::post()
                                .to(orders::create_order)
                                .wrap(Authenticate::user()),
                        )
                        .route(
                            web::get()
                                .to(orders::list_orders)
                                .wrap(Authenticate::admin()),
                        ),
                )
                .service(
                    web::resource("/mine")
                        .wrap(Authenticate::user())
                        .route(web::get().to(orders::my_orders)),
                )
                .service(
                    web::resource("/{id}")
                        .wrap(Authenticate::user())
                        .route(web::get().to(orders::get_order)),
                )
                .service(
                    web::resource("/{id}/pay")
                        .wrap(Authenticate::user())
                        .route(web::put().to(orders::pay_order)),
                )
                .service(
                    web::resource("/{id}/deliver")
                        .wrap(Authenticate::admin())
                        .route(web::put().to(orders::deliver_order)),
                ),
        )
        .route("/api/keys/paypal", web::get().to(paypal_client_id));
}
