use actix_web::{web, HttpResponse};
use mongodb::bson::doc;
use serde::Deserialize;
use tracing::{debug, info};
use validator::Validate;

use super::products::parse_id;
use crate::auth::{generate_tokens, hash_password, AuthResponse, Session};
use crate::error::ApiError;
use crate::models::{UserChanges, UserResponse};
use crate::state::AppState;
use crate::store::AccountStore;

#[derive(Debug, Deserialize, Validate)]
pub struct ProfileUpdate {
    #[validate(length(min = 2))]
    pub name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 6))]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AdminUserUpdate {
    #[validate(length(min = 2))]
    pub name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    pub is_admin: Option<bool>,
}

pub async fn update_profile(
    state: web::Data<AppState>,
    session: Session,
    update: web::Json<ProfileUpdate>,
) -> Result<HttpResponse, ApiError> {
    update.validate()?;
    let ProfileUpdate { name, email, password } = update.into_inner();

    let password_hash = match password {
        Some(password) => Some(hash_password(password, state.settings.bcrypt_cost).await?),
        None => None,
    };
    let changes = UserChanges {
        name,
        email: email.map(|email| email.to_lowercase()),
        password_hash,
        is_admin: None,
    };

    let user = state
        .store
        .update_user(session.user_id, &changes)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    info!("Profile updated for user {}", session.user_id);

    // Name and email live in the token, so hand back a fresh pair.
    let (token, refresh_token) = generate_tokens(&state.settings, &user)?;
    Ok(HttpResponse::Ok().json(AuthResponse {
        token,
        refresh_token,
        user: user.into(),
    }))
}

pub async fn list_users(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let users: Vec<UserResponse> = state
        .store
        .list_users()
        .await?
        .into_iter()
        .map(UserResponse::from)
        .collect();

    debug!("Retrieved {} users", users.len());
    Ok(HttpResponse::Ok().json(users))
}

pub async fn get_user(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = state
        .store
        .find_user(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::NotFound("User Not Found".into()))?;

    Ok(HttpResponse::Ok().json(UserResponse::from(user)))
}

pub async fn update_user(
    state: web::Data<AppState>,
    id: web::Path<String>,
    update: web::Json<AdminUserUpdate>,
) -> Result<HttpResponse, ApiError> {
    update.validate()?;
    let object_id = parse_id(&id)?;
    let AdminUserUpdate { name, email, is_admin } = update.into_inner();

    let changes = UserChanges {
        name,
        email: email.map(|email| email.to_lowercase()),
        password_hash: None,
        is_admin,
    };

    let user = state
        .store
        .update_user(object_id, &changes)
        .await?
        .ok_or_else(|| ApiError::NotFound("User Not Found".into()))?;

    info!("User updated: {}", id);
    Ok(HttpResponse::Ok().json(doc! {
        "message": "User Updated",
        "user": { "_id": object_id.to_hex(), "name": &user.name, "email": &user.email, "isAdmin": user.is_admin },
    }))
}

pub async fn delete_user(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let object_id = parse_id(&id)?;

    let user = state
        .store
        .find_user(object_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User Not Found".into()))?;

    if user.is_admin {
        return Err(ApiError::BadRequest("Can Not Delete Admin User".into()));
    }

    state.store.delete_user(object_id).await?;

    info!("User deleted: {}", id);
    Ok(HttpResponse::Ok().json(doc! { "message": "User Deleted" }))
}
