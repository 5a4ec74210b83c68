//! Webfinger endpoint
//!
//! `GET /.well-known/webfinger?resource=acct:<name>@<host>` (or a local
//! actor URL) returns a JRD document pointing at the actor. Responses
//! are cached by resource string with no expiry and invalidated when a
//! user changes.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;

use crate::error::AppError;
use crate::AppState;

/// Create the well-known router
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// Resolve a webfinger resource string to a local user name.
///
/// Accepts `acct:name@host` (canonical or masquerade host) and local
/// actor URLs; everything else is a foreign request and rejected.
fn resource_to_name(resource: &str, base_url: &str, domain: &str, masq: &str) -> Option<String> {
    let orig = resource.strip_prefix("acct:").unwrap_or(resource);
    if let Some(idx) = orig.rfind('/') {
        let name = &orig[idx + 1..];
        if format!("{}/u/{}", base_url, name) != orig {
            tracing::info!(%resource, "foreign request rejected");
            return None;
        }
        return Some(name.to_string());
    }
    if let Some((name, host)) = orig.split_once('@') {
        if host != domain && host != masq {
            tracing::info!(%resource, "foreign request rejected");
            return None;
        }
        return Some(name.to_string());
    }
    Some(orig.to_string())
}

async fn webfinger(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let resource = params.get("resource").ok_or(AppError::NotFound)?.clone();

    if let Some(cached) = state
        .finger_cache
        .lock()
        .expect("finger cache poisoned")
        .get(&resource)
        .cloned()
    {
        return Ok(jrd_response(cached));
    }

    let name = resource_to_name(
        &resource,
        &state.config.server.base_url(),
        &state.config.server.domain,
        state.config.server.masq(),
    )
    .ok_or(AppError::NotFound)?;
    let user = state.db.user_by_name(&name).await?.ok_or(AppError::NotFound)?;

    let jrd = serde_json::json!({
        "subject": format!("acct:{}@{}", user.name, state.config.server.masq()),
        "aliases": [user.url],
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": user.url,
            },
        ],
    });
    let body = serde_json::to_vec(&jrd).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    state
        .finger_cache
        .lock()
        .expect("finger cache poisoned")
        .insert(resource, body.clone());
    Ok(jrd_response(body))
}

fn jrd_response(body: Vec<u8>) -> Response {
    (
        [("content-type", crate::federation::JRD_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::resource_to_name;

    const BASE: &str = "https://example.com";

    #[test]
    fn acct_resources_resolve_for_local_hosts() {
        assert_eq!(
            resource_to_name("acct:alice@example.com", BASE, "example.com", "example.com"),
            Some("alice".to_string())
        );
        assert_eq!(
            resource_to_name("acct:alice@masq.example", BASE, "example.com", "masq.example"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn foreign_hosts_are_rejected() {
        assert_eq!(
            resource_to_name("acct:alice@evil.example", BASE, "example.com", "example.com"),
            None
        );
    }

    #[test]
    fn local_actor_urls_resolve() {
        assert_eq!(
            resource_to_name("https://example.com/u/alice", BASE, "example.com", "example.com"),
            Some("alice".to_string())
        );
        assert_eq!(
            resource_to_name("https://evil.example/u/alice", BASE, "example.com", "example.com"),
            None
        );
    }
}
