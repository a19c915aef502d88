use chrono::Duration;
use dotenv::dotenv;
use mongodb::{Client, Database};
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use std::{env, str::FromStr};
use thiserror::Error;
use tracing::warn;

use crate::checkout::PricingRules;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub mongo_uri: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub refresh_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub bcrypt_cost: u32,
    pub paypal_client_id: String,
    pub cors_origins: Vec<String>,
    pub page_size: u64,
    /// Upper bound on a spooled CSV upload.
    pub import_max_bytes: usize,
    pub pricing: PricingRules,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = lookup("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set, tokens will not survive a restart");
            random_secret()
        });
        let refresh_secret = lookup("REFRESH_SECRET").unwrap_or_else(|| {
            warn!("REFRESH_SECRET not set, refresh tokens will not survive a restart");
            random_secret()
        });

        let cors_origins = lookup("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Settings {
            host: string("HOST", "127.0.0.1"),
            port: parse(&lookup, "PORT", 5000)?,
            mongo_uri: string("MONGODB_URI", "mongodb://localhost:27017"),
            database_name: string("DATABASE_NAME", "storefront"),
            jwt_secret,
            refresh_secret,
            access_token_ttl: Duration::hours(parse(&lookup, "ACCESS_TOKEN_HOURS", 2)?),
            refresh_token_ttl: Duration::days(parse(&lookup, "REFRESH_TOKEN_DAYS", 7)?),
            bcrypt_cost: parse(&lookup, "BCRYPT_COST", bcrypt::DEFAULT_COST)?,
            paypal_client_id: string("PAYPAL_CLIENT_ID", "sb"),
            cors_origins,
            page_size: parse(&lookup, "PAGE_SIZE", 3)?,
            import_max_bytes: parse(&lookup, "IMPORT_MAX_BYTES", 5 * 1024 * 1024)?,
            pricing: PricingRules {
                tax_rate: parse(&lookup, "TAX_RATE", Decimal::new(15, 2))?,
                free_shipping_threshold: parse(&lookup, "FREE_SHIPPING_THRESHOLD", Decimal::new(100, 0))?,
                shipping_fee: parse(&lookup, "SHIPPING_FEE", Decimal::new(10, 0))?,
            },
        })
    }

    pub fn bind_address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn random_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

pub struct MongoConfig {
    pub client: Client,
    pub database: Database,
}

impl MongoConfig {
    pub async fn init(settings: &Settings) -> Result<Self, mongodb::error::Error> {
        let client = Client::with_uri_str(&settings.mongo_uri).await?;
        let database = client.database(&settings.database_name);

        Ok(MongoConfig { client, database })
    }
}
