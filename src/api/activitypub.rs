//! ActivityPub endpoints
//!
//! - Actor documents
//! - Inbox (activity ingest)
//! - Outbox and the empty collections
//! - Raw attachment serving
//! - Rendered object documents

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use http::HeaderMap;

use crate::data::User;
use crate::error::AppError;
use crate::federation::signature::{verify_request, SignatureError, VerifyOptions};
use crate::federation::{
    friend_or_foe, inbound::is_crappola, originate, shape, AS2_CONTENT_TYPE,
};
use crate::metrics::SIGNATURE_FAILURES;
use crate::AppState;

/// Inbound payloads larger than this are refused
const MAX_INBOX_PAYLOAD: usize = 1024 * 1024;

/// Create the ActivityPub router
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/u/:name", get(actor))
        .route("/u/:name/inbox", post(inbox))
        .route("/u/:name/outbox", get(outbox))
        .route("/u/:name/followers", get(followers))
        .route("/u/:name/following", get(following))
        .route("/u/:name/h/:token", get(object_document))
        .route("/d/:xid", get(attachment))
        .route("/metrics", get(metrics))
}

async fn load_user(state: &AppState, name: &str) -> Result<User, AppError> {
    state.db.user_by_name(name).await?.ok_or(AppError::NotFound)
}

fn wants_as2(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|accept| {
            accept.contains("application/activity+json") || accept.contains("application/ld+json")
        })
        .unwrap_or(false)
}

/// GET /u/:name
///
/// The AS2 Person document. The HTML profile belongs to the view layer,
/// which does not live here; requests without an AS2 Accept are turned
/// away.
async fn actor(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !wants_as2(&headers) {
        return Err(AppError::WrongContentType);
    }
    let user = load_user(&state, &name).await?;
    let doc = state.outbound.actor_document(&user);
    let body = serde_json::to_vec(&doc).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    Ok(([("content-type", AS2_CONTENT_TYPE)], body).into_response())
}

/// POST /u/:name/inbox
///
/// Activity ingest: content-type and size checks, pre-filters, then
/// signature verification with a one-shot key re-fetch, then dispatch.
/// Processing happens in the background once the request is vetted.
async fn inbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AppError> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !friend_or_foe(content_type) {
        return Err(AppError::WrongContentType);
    }
    let user = load_user(&state, &name).await?;
    if body.len() > MAX_INBOX_PAYLOAD {
        return Err(AppError::Capacity("inbox payload over 1MiB".to_string()));
    }

    let activity: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Corrupt(format!("bad payload: {e}")))?;

    if is_crappola(&activity, &state.config.server.domain) {
        return Ok(());
    }
    let what = shape::first_of_many(&activity, "type")
        .unwrap_or_default()
        .to_string();
    let who = shape::get_string(&activity, "actor")
        .unwrap_or_default()
        .to_string();
    if state.inbound.reject_actor(&user, &who).await {
        return Ok(());
    }

    // Verify the signature; an unknown key gets dropped and re-fetched
    // exactly once.
    let url = url::Url::parse(&format!(
        "{}/u/{}/inbox",
        state.config.server.base_url(),
        name
    ))
    .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    let resolver = state.resolver.clone();
    let verify = |resolver: std::sync::Arc<crate::federation::identity::Resolver>| {
        let url = url.clone();
        let headers = headers.clone();
        let body = body.clone();
        async move {
            verify_request(
                "POST",
                &url,
                &headers,
                &body,
                VerifyOptions::default(),
                move |keyname| {
                    let resolver = resolver.clone();
                    async move { resolver.public_key(&keyname).await }
                },
            )
            .await
        }
    };
    let keyname = match verify(resolver.clone()).await {
        Ok(keyname) => keyname,
        // A missing key, or a stale one after rotation: drop it and
        // verify once more against a fresh fetch.
        Err(
            error @ (SignatureError::UnknownKey { .. } | SignatureError::BadSignature(_)),
        ) => {
            let Some(keyname) = crate::federation::track::request_actor(&headers) else {
                return Err(signature_failure(&headers, error));
            };
            state.resolver.forget_key(&keyname).await;
            match verify(resolver).await {
                Ok(keyname) => keyname,
                Err(error) => return Err(signature_failure(&headers, error)),
            }
        }
        Err(error) => return Err(signature_failure(&headers, error)),
    };

    // The signing key must belong to the claimed actor's origin.
    let origin = originate(&keyname);
    if origin.is_empty() || origin != originate(&who) {
        tracing::info!(%keyname, actor = %who, "keyname actor mismatch");
        if state.config.federation.collect_forwards && what == "Create" {
            // Forwarded create: fetch the object from its own origin
            // instead of trusting the relay.
            if let Some(xid) = shape::string_or_id(&activity, "object") {
                let xid = xid.to_string();
                tracing::debug!(%keyname, %xid, "getting forwarded create");
                let inbound = state.inbound.clone();
                let fetcher = state.fetcher.clone();
                let user = user.clone();
                tokio::spawn(async move {
                    if let Ok(fetched) = fetcher.get_json_hard(None, &xid).await {
                        let origin = originate(&fetched.final_url);
                        inbound
                            .save_object(&user, (*fetched.value).clone(), &origin)
                            .await;
                    }
                });
            }
        }
        return Ok(());
    }

    let inbound = state.inbound.clone();
    tokio::spawn(async move {
        if let Err(error) = inbound.process(&user, activity, origin).await {
            tracing::info!(%error, "error processing activity");
        }
    });
    Ok(())
}

fn signature_failure(headers: &HeaderMap, error: SignatureError) -> AppError {
    let reason = match &error {
        SignatureError::UnknownKey { .. } => "unknown_key",
        SignatureError::BadSignature(_) => "bad_signature",
        SignatureError::DigestMismatch => "digest_mismatch",
        SignatureError::DateOutOfRange => "date_out_of_range",
        SignatureError::MissingRequiredHeader(_) => "missing_header",
        SignatureError::Malformed(_) => "malformed",
    };
    SIGNATURE_FAILURES.with_label_values(&[reason]).inc();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    tracing::info!(%error, %forwarded, "inbox message failed signature");
    AppError::BadSignature(error)
}

/// GET /u/:name/outbox
///
/// The 20 most recent public records as activities.
async fn outbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let user = load_user(&state, &name).await?;
    let records = state.db.recent_public_records(user.id, 20).await?;

    let items: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            let (mut activity, _) = state.outbound.build_activity(&user, record, &[]);
            activity["@context"] = serde_json::json!(crate::federation::AS2_CONTEXT);
            activity
        })
        .collect();

    let collection = serde_json::json!({
        "@context": crate::federation::AS2_CONTEXT,
        "id": format!("{}/outbox", user.url),
        "attributedTo": user.url,
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    });
    let body =
        serde_json::to_vec(&collection).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    Ok(([("content-type", AS2_CONTENT_TYPE)], body).into_response())
}

/// GET /u/:name/followers and /following
///
/// Peers get empty collections; the real lists are nobody's business.
async fn empty_collection(state: &AppState, name: &str, suffix: &str) -> Result<Response, AppError> {
    let user = load_user(state, name).await?;
    let collection = serde_json::json!({
        "@context": crate::federation::AS2_CONTEXT,
        "id": format!("{}/{}", user.url, suffix),
        "attributedTo": user.url,
        "type": "OrderedCollection",
        "totalItems": 0,
        "orderedItems": [],
    });
    let body =
        serde_json::to_vec(&collection).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    Ok(([("content-type", AS2_CONTENT_TYPE)], body).into_response())
}

async fn followers(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    empty_collection(&state, &name, "followers").await
}

async fn following(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    empty_collection(&state, &name, "following").await
}

/// GET /u/:name/h/:token
///
/// A public record's object document. Fetches are sampled so Updates
/// can be pushed back to interested peers.
async fn object_document(
    State(state): State<AppState>,
    Path((name, token)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !wants_as2(&headers) {
        return Err(AppError::WrongContentType);
    }
    let xid = format!(
        "{}/u/{}/h/{}",
        state.config.server.base_url(),
        name,
        token
    );
    let body = state
        .outbound
        .rendered_object(&xid)
        .await
        .ok_or(AppError::NotFound)?;
    state.outbound.track_fetch(&xid, &headers);
    Ok(([("content-type", AS2_CONTENT_TYPE)], body).into_response())
}

/// GET /d/:xid
///
/// Raw attachment bytes with nosniff and a long cache.
async fn attachment(
    State(state): State<AppState>,
    Path(xid): Path<String>,
) -> Result<Response, AppError> {
    let (media, data) = state.db.file_data(&xid).await?.ok_or(AppError::NotFound)?;
    Ok((
        [
            ("content-type", media.as_str()),
            ("x-content-type-options", "nosniff"),
            ("cache-control", "max-age=432000"),
        ],
        data,
    )
        .into_response())
}

/// GET /metrics
async fn metrics() -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
        .into_response()
}
