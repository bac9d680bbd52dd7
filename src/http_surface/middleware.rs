//! Bearer-auth extraction and error-to-response mapping shared by every
//! control-plane route.

use hyper::{Body, Request, Response};

use crate::error::BrokerError;
use crate::identity::Identity;

pub fn bearer_token(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(hyper::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub async fn authenticate(
    req: &Request<Body>,
    validator: &crate::identity::LocalValidator,
) -> Result<Identity, BrokerError> {
    use crate::identity::TokenValidator;
    let token = bearer_token(req)
        .ok_or_else(|| BrokerError::AuthFailure("missing bearer token".into()))?;
    validator.validate(token).await
}

pub fn require_admin(identity: &Identity) -> Result<(), BrokerError> {
    if identity.roles.contains("admin") {
        Ok(())
    } else {
        Err(BrokerError::Forbidden("admin role required".into()))
    }
}

pub fn json_response(status: u16, body: serde_json::Value) -> Response<Body> {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub fn error_response(e: &BrokerError) -> Response<Body> {
    json_response(
        e.http_status(),
        serde_json::json!({ "error": e.to_string() }),
    )
}
