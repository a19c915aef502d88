mod auth;
mod checkout;
mod config;
mod error;
mod handlers;
mod models;
mod state;
mod store;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use config::{MongoConfig, Settings};
use state::AppState;
use std::{io, sync::Arc};
use store::MongoStore;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{self, EnvFilter};

fn startup_error<E: std::fmt::Display>(context: &str, err: E) -> io::Error {
    io::Error::other(format!("{}: {}", context, err))
}

fn cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        return Cors::permissive();
    }
    origins
        .iter()
        .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        .allow_any_method()
        .allow_any_header()
        .max_age(3600)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(Level::INFO.into())
        .add_directive("actix_web=info".parse().map_err(|e| startup_error("log filter", e))?)
        .add_directive("storefront_api=debug".parse().map_err(|e| startup_error("log filter", e))?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting storefront API server");

    let settings = Settings::from_env().map_err(|e| startup_error("configuration", e))?;
    if settings.cors_origins.is_empty() {
        warn!("CORS_ORIGINS not set, accepting requests from any origin");
    }

    let mongo_config = MongoConfig::init(&settings)
        .await
        .map_err(|e| startup_error("MongoDB", e))?;
    let store = MongoStore::new(mongo_config);
    store
        .ensure_indexes()
        .await
        .map_err(|e| startup_error("MongoDB indexes", e))?;

    info!("MongoDB connection established");

    let address = settings.bind_address();
    let state = web::Data::new(AppState::new(Arc::new(store), settings));

    info!("Listening on {}:{}", address.0, address.1);
    HttpServer::new(move || {
        App::new()
            .wrap(cors(&state.settings.cors_origins))
            .wrap(TracingLogger::default())
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .bind(address)?
    .run()
    .await
}
