//! Gaggle - a single-tenant, multi-user ActivityPub server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                       │
//! │  - webfinger, actor documents, inbox, outbox, attachments   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Federation Core                       │
//! │  - HTTP signatures, fetch cache, identity resolver          │
//! │  - inbound normalization, outbound builder, delivery queue  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Data Layer                           │
//! │  - SQLite (sqlx): users, records, files, deliveries         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for the federation endpoints
//! - `federation`: signatures, fetching, identity, inbound/outbound
//! - `content`: HTML cleanup and recognition helpers
//! - `chat`: authenticated-box helpers for direct messages
//! - `data`: database layer
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod chat;
pub mod config;
pub mod content;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;

use data::{User, UserId};
use federation::delivery::DeliveryEngine;
use federation::fetch::Fetcher;
use federation::identity::Resolver;
use federation::inbound::Inbound;
use federation::outbound::Outbound;
use federation::track::Tracker;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,
    /// Database connection pool
    pub db: Arc<data::Database>,
    /// Outbound HTTP stack with the single-flight cache
    pub fetcher: Arc<Fetcher>,
    /// Identity/key/inbox resolution
    pub resolver: Arc<Resolver>,
    /// Inbound activity pipeline
    pub inbound: Arc<Inbound>,
    /// Outbound document builder and broadcast
    pub outbound: Arc<Outbound>,
    /// Delivery engine and retry queue
    pub delivery: Arc<DeliveryEngine>,
    /// Fetch sampler for Update push-back
    pub tracker: Tracker,
    /// Webfinger response cache, invalidated on user update
    pub finger_cache: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
    /// Termination broadcast observed by background services
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite
    /// 2. Build the HTTP stack and resolver
    /// 3. Ensure the primary user exists
    /// 4. Wire the delivery engine, inbound, and outbound pipelines
    pub async fn new(
        config: config::AppConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let fetcher = Arc::new(Fetcher::new(
            config.federation.clone(),
            &config.server.domain,
        )?);
        let resolver = Arc::new(Resolver::new(db.clone(), fetcher.clone()));

        let user = Self::ensure_primary_user(&db, &config).await?;
        if let Ok(seckey) = federation::signature::decode_private_key(&user.private_key_pem) {
            resolver.set_signer(data::KeyInfo {
                keyname: user.keyname(),
                seckey,
            });
        }

        let delivery = Arc::new(DeliveryEngine::new(
            db.clone(),
            resolver.clone(),
            config.federation.clone(),
            &config.server.domain,
        )?);
        let tracker = Tracker::spawn(db.clone(), shutdown.clone());
        let inbound = Arc::new(Inbound::new(
            db.clone(),
            resolver.clone(),
            fetcher.clone(),
            delivery.clone(),
            config.federation.clone(),
            config.server.domain.clone(),
        ));
        let outbound = Arc::new(Outbound::new(
            db.clone(),
            resolver.clone(),
            delivery.clone(),
            tracker.clone(),
            config.federation.clone(),
            config.server.base_url(),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            fetcher,
            resolver,
            inbound,
            outbound,
            delivery,
            tracker,
            finger_cache: Arc::new(StdMutex::new(HashMap::new())),
            shutdown,
        })
    }

    /// Create the primary account on first start: RSA keypair for
    /// signatures, box keypair for chat.
    async fn ensure_primary_user(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<User, error::AppError> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let name = &config.server.primary_user;
        if let Some(user) = db.user_by_name(name).await? {
            tracing::info!(username = %user.name, "Primary account exists");
            return Ok(user);
        }

        tracing::info!(username = %name, "Creating primary account...");
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 4096)
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);
        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let (chat_pubkey, chat_seckey) = chat::generate_keys();
        let mut user = User {
            id: UserId(0),
            name: name.clone(),
            display_name: name.clone(),
            about: String::new(),
            url: format!("{}/u/{}", config.server.base_url(), name),
            public_key_pem,
            private_key_pem,
            options: data::UserOptions {
                chat_pubkey,
                chat_seckey,
                ..Default::default()
            },
        };
        user.id = db.save_user(&user).await?;
        tracing::info!(username = %user.name, url = %user.url, "Primary account created");
        Ok(user)
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    axum::Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
