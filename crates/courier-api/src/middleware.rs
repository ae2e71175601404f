use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};

use courier_types::api::DeviceClaims;

/// Shared JWT secret, injected once at router construction.
#[derive(Clone)]
pub struct JwtSecret(pub Arc<str>);

/// Extract and validate the device JWT from the Authorization header.
/// Claims resolve to (account, device); everything downstream trusts them.
pub async fn require_auth(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let secret = req
        .extensions()
        .get::<JwtSecret>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<DeviceClaims>(
        token,
        &DecodingKey::from_secret(secret.0.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}
