use actix_web::{
    body::EitherBody,
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error, FromRequest, HttpMessage, HttpRequest, HttpResponse,
};
use bcrypt::{hash, verify};
use chrono::Utc;
use futures_util::future::{ok, ready, Ready};
use jsonwebtoken::{decode, encode, errors::Error as JwtError, DecodingKey, EncodingKey, Header, Validation};
use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, error, info};
use validator::Validate;

use crate::config::Settings;
use crate::error::ApiError;
use crate::models::{User, UserResponse};
use crate::state::AppState;
use crate::store::AccountStore;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 2))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 6))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    #[serde(alias = "refresh_token")]
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub refresh_token: String,
    pub user: UserResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
    pub exp: i64,
    pub iat: i64,
}

/// Authenticated caller, resolved from the bearer token by [`Authenticate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: ObjectId,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
}

impl Session {
    fn from_claims(claims: Claims) -> Option<Self> {
        Some(Session {
            user_id: ObjectId::parse_str(&claims.sub).ok()?,
            name: claims.name,
            email: claims.email,
            is_admin: claims.is_admin,
        })
    }

    /// Owners may act on their own records; admins on anyone's.
    pub fn can_access(&self, owner: ObjectId) -> bool {
        self.is_admin || self.user_id == owner
    }
}

impl FromRequest for Session {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Session>()
                .cloned()
                .ok_or_else(|| ApiError::Unauthorized("Not authenticated".into())),
        )
    }
}

pub async fn hash_password(password: String, cost: u32) -> Result<String, ApiError> {
    web::block(move || hash(password.as_bytes(), cost))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| {
            error!("Failed to hash password: {}", e);
            ApiError::Internal("Password hashing failed".into())
        })
}

async fn verify_password(password: String, password_hash: String) -> Result<bool, ApiError> {
    web::block(move || verify(password, &password_hash))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| {
            error!("Password verification error: {}", e);
            ApiError::Internal("Password verification failed".into())
        })
}

pub fn generate_tokens(settings: &Settings, user: &User) -> Result<(String, String), ApiError> {
    let user_id = user
        .id
        .ok_or_else(|| ApiError::Internal("user has no id".into()))?;
    let now = Utc::now();
    let claims = |ttl: chrono::Duration| Claims {
        sub: user_id.to_hex(),
        name: user.name.clone(),
        email: user.email.clone(),
        is_admin: user.is_admin,
        exp: (now + ttl).timestamp(),
        iat: now.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims(settings.access_token_ttl),
        &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Token generation error: {}", e);
        ApiError::Internal("Token generation failed".into())
    })?;

    let refresh_token = encode(
        &Header::default(),
        &claims(settings.refresh_token_ttl),
        &EncodingKey::from_secret(settings.refresh_secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Refresh token generation error: {}", e);
        ApiError::Internal("Refresh token generation failed".into())
    })?;

    Ok((token, refresh_token))
}

fn decode_claims(token: &str, secret: &str) -> Result<Claims, JwtError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

pub fn verify_token(settings: &Settings, token: &str) -> Result<Claims, JwtError> {
    decode_claims(token, &settings.jwt_secret)
}

fn auth_response(settings: &Settings, user: User) -> Result<AuthResponse, ApiError> {
    let (token, refresh_token) = generate_tokens(settings, &user)?;
    Ok(AuthResponse {
        token,
        refresh_token,
        user: user.into(),
    })
}

pub async fn register(
    state: web::Data<AppState>,
    user_data: web::Json<RegisterRequest>,
) -> Result<HttpResponse, ApiError> {
    user_data.validate()?;
    let RegisterRequest { name, email, password } = user_data.into_inner();
    let email = email.to_lowercase();

    if state.store.find_user_by_email(&email).await?.is_some() {
        return Err(ApiError::BadRequest("Email already registered".into()));
    }

    let password_hash = hash_password(password, state.settings.bcrypt_cost).await?;
    let now = DateTime::now();
    let user = state
        .store
        .insert_user(User {
            id: None,
            name,
            email,
            password_hash,
            is_admin: false,
            created_at: now,
            updated_at: now,
        })
        .await?;

    info!("Created new user with ID: {:?}", user.id);
    Ok(HttpResponse::Created().json(auth_response(&state.settings, user)?))
}

pub async fn login(
    state: web::Data<AppState>,
    credentials: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let LoginRequest { email, password } = credentials.into_inner();
    let invalid = || ApiError::Unauthorized("Invalid email or password".into());

    let user = state
        .store
        .find_user_by_email(&email.to_lowercase())
        .await?
        .ok_or_else(invalid)?;

    if !verify_password(password, user.password_hash.clone()).await? {
        debug!("Password mismatch for {}", user.email);
        return Err(invalid());
    }

    Ok(HttpResponse::Ok().json(auth_response(&state.settings, user)?))
}

pub async fn refresh_token(
    state: web::Data<AppState>,
    req: web::Json<RefreshTokenRequest>,
) -> Result<HttpResponse, ApiError> {
    let claims = decode_claims(&req.refresh_token, &state.settings.refresh_secret).map_err(|e| {
        debug!("Refresh token rejected: {}", e);
        ApiError::Unauthorized("Invalid refresh token".into())
    })?;

    let user_id = ObjectId::parse_str(&claims.sub)
        .map_err(|_| ApiError::Unauthorized("Invalid refresh token".into()))?;

    // Reload so a revoked admin flag or deleted account takes effect on refresh.
    let user = state
        .store
        .find_user(user_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Account no longer exists".into()))?;

    Ok(HttpResponse::Ok().json(auth_response(&state.settings, user)?))
}

/// Rejects requests without a valid bearer token and stores the resolved
/// [`Session`] in the request extensions. Built with [`Authenticate::admin`]
/// it also requires the admin flag.
#[derive(Debug, Clone, Copy)]
pub struct Authenticate {
    admin_only: bool,
}

impl Authenticate {
    pub fn user() -> Self {
        Authenticate { admin_only: false }
    }

    pub fn admin() -> Self {
        Authenticate { admin_only: true }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authenticate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthenticateMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthenticateMiddleware {
            service,
            admin_only: self.admin_only,
        })
    }
}

pub struct AuthenticateMiddleware<S> {
    service: S,
    admin_only: bool,
}

impl<S> AuthenticateMiddleware<S> {
    fn resolve(&self, req: &ServiceRequest) -> Result<Session, ApiError> {
        let state = req
            .app_data::<web::Data<AppState>>()
            .ok_or_else(|| ApiError::Internal("application state missing".into()))?;

        let auth_header = req
            .headers()
            .get("Authorization")
            .ok_or_else(|| ApiError::Unauthorized("No token".into()))?;
        let auth_str = auth_header
            .to_str()
            .map_err(|_| ApiError::Unauthorized("Invalid authorization header".into()))?;
        let token = auth_str
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("Invalid authorization header format".into()))?;

        let session = verify_token(&state.settings, token)
            .ok()
            .and_then(Session::from_claims)
            .ok_or_else(|| ApiError::Unauthorized("Invalid token".into()))?;

        if self.admin_only && !session.is_admin {
            debug!("Non-admin {} denied {}", session.email, req.path());
            return Err(ApiError::Forbidden("Invalid admin token".into()));
        }

        Ok(session)
    }
}

impl<S, B> Service<ServiceRequest> for AuthenticateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        match self.resolve(&req) {
            Ok(session) => {
                req.extensions_mut().insert(session);
                let fut = self.service.call(req);
                Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
            }
            Err(err) => {
                let response = req.error_response(err).map_into_right_body();
                Box::pin(ready(Ok(response)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut settings = Settings::from_lookup(|_| None).unwrap();
        settings.jwt_secret = "access".into();
        settings.refresh_secret = "refresh".into();
        settings
    }

    fn user(is_admin: bool) -> User {
        let now = DateTime::now();
        User {
            id: Some(ObjectId::new()),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            password_hash: String::new(),
            is_admin,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn access_token_round_trips_into_session() {
        let settings = settings();
        let user = user(true);
        let (token, _) = generate_tokens(&settings, &user).unwrap();

        let session = Session::from_claims(verify_token(&settings, &token).unwrap()).unwrap();

        assert_eq!(session.user_id, user.id.unwrap());
        assert_eq!(session.email, "ada@example.com");
        assert!(session.is_admin);
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let settings = settings();
        let (_, refresh) = generate_tokens(&settings, &user(false)).unwrap();

        assert!(verify_token(&settings, &refresh).is_err());
        assert!(decode_claims(&refresh, &settings.refresh_secret).is_ok());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let mut settings = settings();
        settings.access_token_ttl = chrono::Duration::hours(-1);
        let (token, _) = generate_tokens(&settings, &user(false)).unwrap();

        assert!(verify_token(&settings, &token).is_err());
    }

    #[test]
    fn owners_and_admins_can_access() {
        let owner = ObjectId::new();
        let session = Session {
            user_id: owner,
            name: "Ada".into(),
            email: "ada@example.com".into(),
            is_admin: false,
        };
        assert!(session.can_access(owner));
        assert!(!session.can_access(ObjectId::new()));

        let admin = Session { is_admin: true, ..session };
        assert!(admin.can_access(ObjectId::new()));
    }

    #[actix_web::test]
    async fn passwords_hash_and_verify() {
        let hashed = hash_password("secret1".into(), 4).await.unwrap();
        assert!(verify_password("secret1".into(), hashed.clone()).await.unwrap());
        assert!(!verify_password("wrong".into(), hashed).await.unwrap());
    }
}
