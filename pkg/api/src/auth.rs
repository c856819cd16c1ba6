use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::AppState;

/// Information about the authenticated entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub name: String,
}

/// Middleware: Authenticates the request using a Bearer token.
/// The configured server token maps to the `admin` identity; every other
/// token is rejected.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(&req).ok_or(StatusCode::UNAUTHORIZED)?;

    if token != state.token {
        warn!("Invalid Bearer token provided for {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    debug!("Authenticated {} {}", req.method(), req.uri().path());
    req.extensions_mut().insert(AuthUser {
        name: "admin".to_string(),
    });
    Ok(next.run(req).await)
}

fn bearer_token(req: &Request) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}
