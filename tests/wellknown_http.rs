//! Webfinger and actor document round-trip over real HTTP.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use gaggle::config::{AppConfig, DatabaseConfig, FederationConfig, LoggingConfig, ServerConfig};
use gaggle::data::{Database, KeyInfo, User, UserId, UserOptions};
use gaggle::federation::delivery::DeliveryEngine;
use gaggle::federation::fetch::Fetcher;
use gaggle::federation::identity::Resolver;
use gaggle::federation::inbound::Inbound;
use gaggle::federation::outbound::Outbound;
use gaggle::federation::signature;
use gaggle::federation::track::Tracker;
use gaggle::AppState;

fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "gaggle.test".to_string(),
            masq_domain: None,
            protocol: "https".to_string(),
            primary_user: "alice".to_string(),
        },
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
        },
        federation: FederationConfig {
            fast_timeout_secs: 1,
            slow_timeout_secs: 1,
            max_deliveries: 8,
            collect_forwards: true,
            devel: false,
            convert_avif: false,
            accept_avif: false,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

async fn test_state() -> AppState {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let config = test_config();
    let db = Arc::new(Database::connect_memory().await.expect("db"));
    let fetcher = Arc::new(
        Fetcher::new(config.federation.clone(), &config.server.domain).expect("fetcher"),
    );
    let resolver = Arc::new(Resolver::new(db.clone(), fetcher.clone()));
    let delivery = Arc::new(
        DeliveryEngine::new(
            db.clone(),
            resolver.clone(),
            config.federation.clone(),
            &config.server.domain,
        )
        .expect("delivery"),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    // The sender must outlive the state; leak it for the test's
    // lifetime.
    std::mem::forget(shutdown_tx);
    let tracker = Tracker::spawn(db.clone(), shutdown_rx.clone());
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

    let private_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("keygen");
    let public_key = rsa::RsaPublicKey::from(&private_key);
    let mut user = User {
        id: UserId(0),
        name: "alice".to_string(),
        display_name: "Alice".to_string(),
        about: "<p>just here for the geese".to_string(),
        url: format!("{}/u/alice", config.server.base_url()),
        public_key_pem: public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("pem"),
        private_key_pem: private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("pem")
            .to_string(),
        options: UserOptions::default(),
    };
    user.id = db.save_user(&user).await.expect("save user");
    let seckey = signature::decode_private_key(&user.private_key_pem).expect("decode");
    resolver.set_signer(KeyInfo {
        keyname: user.keyname(),
        seckey,
    });

    AppState {
        config: Arc::new(config),
        db,
        fetcher,
        resolver,
        inbound,
        outbound,
        delivery,
        tracker,
        finger_cache: Arc::new(StdMutex::new(HashMap::new())),
        shutdown: shutdown_rx,
    }
}

async fn serve(state: AppState) -> String {
    let app = gaggle::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn webfinger_points_at_actor_with_working_key() {
    let state = test_state().await;
    let base = serve(state).await;
    let client = reqwest::Client::new();

    // Webfinger resolves the account.
    let jrd: serde_json::Value = client
        .get(format!("{}/.well-known/webfinger", base))
        .query(&[("resource", "acct:alice@gaggle.test")])
        .send()
        .await
        .expect("webfinger request")
        .json()
        .await
        .expect("jrd json");
    assert_eq!(jrd["subject"], "acct:alice@gaggle.test");
    let href = jrd["links"][0]["href"].as_str().expect("self link");
    assert_eq!(href, "https://gaggle.test/u/alice");
    assert_eq!(jrd["links"][0]["rel"], "self");

    // The actor document serves over AS2 and carries a
    // usable public key.
    let response = client
        .get(format!("{}/u/alice", base))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .expect("actor request");
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .contains("ld+json"));
    let actor: serde_json::Value = response.json().await.expect("actor json");
    assert_eq!(actor["preferredUsername"], "alice");
    assert_eq!(actor["publicKey"]["owner"], "https://gaggle.test/u/alice");
    let pem = actor["publicKey"]["publicKeyPem"].as_str().expect("pem");
    signature::decode_public_key(pem).expect("usable key");

    // Non-AS2 requests are not served here.
    let response = client
        .get(format!("{}/u/alice", base))
        .header("Accept", "text/html")
        .send()
        .await
        .expect("html request");
    assert_eq!(response.status(), 406);
}

#[tokio::test]
async fn webfinger_rejects_foreign_hosts() {
    let state = test_state().await;
    let base = serve(state).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/.well-known/webfinger", base))
        .query(&[("resource", "acct:alice@elsewhere.example")])
        .send()
        .await
        .expect("webfinger request");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn inbox_refuses_unsigned_posts() {
    let state = test_state().await;
    let base = serve(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/u/alice/inbox", base))
        .header(
            "Content-Type",
            "application/activity+json",
        )
        .body(r#"{"type":"Create","actor":"https://remote.example/u/bob","object":{"type":"Note","id":"https://remote.example/h/1"}}"#)
        .send()
        .await
        .expect("inbox post");
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn inbox_refuses_wrong_content_type() {
    let state = test_state().await;
    let base = serve(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/u/alice/inbox", base))
        .header("Content-Type", "text/plain")
        .body("hello")
        .send()
        .await
        .expect("inbox post");
    assert_eq!(response.status(), 406);
}

#[tokio::test]
async fn outbox_lists_recent_public_records() {
    let state = test_state().await;
    let user = state.db.user_by_name("alice").await.unwrap().unwrap();
    let record = gaggle::data::Record {
        userid: user.id,
        xid: format!("{}/h/OB1", user.url),
        kind: gaggle::data::RecordKind::Honk,
        honker: user.url.clone(),
        convoy: "data:,ob".to_string(),
        audience: vec!["https://www.w3.org/ns/activitystreams#Public".to_string()],
        public: true,
        noise: "<p>first post".to_string(),
        whofore: gaggle::data::Whofore::Public,
        date: chrono::Utc::now(),
        ..Default::default()
    };
    state.db.save_record(&record).await.unwrap();

    let base = serve(state).await;
    let client = reqwest::Client::new();
    let outbox: serde_json::Value = client
        .get(format!("{}/u/alice/outbox", base))
        .send()
        .await
        .expect("outbox request")
        .json()
        .await
        .expect("outbox json");
    assert_eq!(outbox["type"], "OrderedCollection");
    assert_eq!(outbox["totalItems"], 1);
    assert_eq!(outbox["orderedItems"][0]["type"], "Create");

    // Followers collection stays empty for strangers.
    let followers: serde_json::Value = client
        .get(format!("{}/u/alice/followers", base))
        .send()
        .await
        .expect("followers request")
        .json()
        .await
        .expect("followers json");
    assert_eq!(followers["totalItems"], 0);
}
