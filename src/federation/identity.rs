//! Identity resolution
//!
//! Learns an actor's inboxes, public key, handle, and chat key from an
//! actor document or webfinger, persists them in the identity table,
//! and serves lookups through bounded in-memory caches. Dead actors
//! (404/410) are remembered so further resolves short-circuit.

use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};

use crate::data::{Database, KeyInfo};
use crate::error::AppError;

use super::fetch::Fetcher;
use super::shape;
use super::signature::{decode_public_key, PublicKey, SignatureError};
use super::{originate, CHAT_KEY_PROP};

/// Identity table property names
const PROP_BOXES: &str = "boxes";
const PROP_PUBKEY: &str = "pubkey";
const PROP_HANDLE: &str = "handle";
const PROP_FISHNAME: &str = "fishname";

/// Marker for actors that answered 404/410
const DEAD: &str = "dead";
/// Marker for lookups that failed and should not be repeated
const FAILED: &str = "failed";

/// An actor's delivery endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boxes {
    pub inbox: String,
    pub outbox: String,
    pub shared: String,
}

/// Identity/key/inbox resolution layer
pub struct Resolver {
    db: Arc<Database>,
    fetcher: Arc<Fetcher>,
    /// Key used to sign resolution fetches; the first local user's
    signer: StdMutex<Option<KeyInfo>>,
    keys: StdMutex<LruCache<String, Option<PublicKey>>>,
    boxes: StdMutex<LruCache<String, Option<Boxes>>>,
    handles: StdMutex<LruCache<String, String>>,
    chat_keys: StdMutex<LruCache<String, Option<crypto_box::PublicKey>>>,
}

impl Resolver {
    pub fn new(db: Arc<Database>, fetcher: Arc<Fetcher>) -> Self {
        Self {
            db,
            fetcher,
            signer: StdMutex::new(None),
            keys: StdMutex::new(LruCache::new(NonZeroUsize::new(4096).expect("nonzero"))),
            boxes: StdMutex::new(LruCache::new(NonZeroUsize::new(1024).expect("nonzero"))),
            handles: StdMutex::new(LruCache::new(NonZeroUsize::new(1024).expect("nonzero"))),
            chat_keys: StdMutex::new(LruCache::new(NonZeroUsize::new(512).expect("nonzero"))),
        }
    }

    /// Install the signing identity used for resolution fetches.
    pub fn set_signer(&self, ki: KeyInfo) {
        *self.signer.lock().expect("signer poisoned") = Some(ki);
    }

    fn signer(&self) -> Option<KeyInfo> {
        self.signer.lock().expect("signer poisoned").clone()
    }

    /// Resolve an actor's inbox/outbox/sharedInbox. `None` means the
    /// actor is unreachable or marked dead.
    pub async fn boxes(&self, actor_xid: &str) -> Option<Boxes> {
        if let Some(cached) = self
            .boxes
            .lock()
            .expect("boxes cache poisoned")
            .get(actor_xid)
            .cloned()
        {
            return cached;
        }

        let resolved = self.boxes_uncached(actor_xid).await;
        self.boxes
            .lock()
            .expect("boxes cache poisoned")
            .put(actor_xid.to_string(), resolved.clone());
        resolved
    }

    async fn boxes_uncached(&self, actor_xid: &str) -> Option<Boxes> {
        let mut info = self.db.get_identity(actor_xid, PROP_BOXES).await.ok()?;
        if info.is_none() {
            tracing::debug!(ident = %actor_xid, "need to get boxes");
            let signer = self.signer();
            match self
                .fetcher
                .get_json(signer.as_ref(), actor_xid, self.fetcher.slow_timeout())
                .await
            {
                Ok(fetched) => {
                    self.ingest(&originate(actor_xid), &fetched.value).await;
                    info = self.db.get_identity(actor_xid, PROP_BOXES).await.ok()?;
                }
                Err(AppError::Transport(message)) => {
                    tracing::debug!(ident = %actor_xid, error = %message, "error getting boxes");
                    if message == "http get status: 410" || message == "http get status: 404" {
                        let _ = self.db.save_identity(actor_xid, DEAD, PROP_BOXES).await;
                    }
                    return None;
                }
                Err(error) => {
                    tracing::debug!(ident = %actor_xid, %error, "error getting boxes");
                    return None;
                }
            }
        }

        let info = info?;
        if info == DEAD {
            return None;
        }
        let mut parts = info.split(' ');
        Some(Boxes {
            inbox: parts.next().unwrap_or_default().to_string(),
            outbox: parts.next().unwrap_or_default().to_string(),
            shared: parts.next().unwrap_or_default().to_string(),
        })
    }

    /// Resolve a public key by keyname, fetching the actor document on
    /// a miss. A remembered failure yields `UnknownKey`.
    pub async fn public_key(&self, keyname: &str) -> Result<PublicKey, SignatureError> {
        if let Some(cached) = self
            .keys
            .lock()
            .expect("key cache poisoned")
            .get(keyname)
            .cloned()
        {
            return cached.ok_or_else(|| SignatureError::UnknownKey {
                keyname: keyname.to_string(),
            });
        }

        let resolved = self.public_key_uncached(keyname).await;
        self.keys
            .lock()
            .expect("key cache poisoned")
            .put(keyname.to_string(), resolved.clone());
        resolved.ok_or_else(|| SignatureError::UnknownKey {
            keyname: keyname.to_string(),
        })
    }

    async fn public_key_uncached(&self, keyname: &str) -> Option<PublicKey> {
        let mut data = self.db.get_identity(keyname, PROP_PUBKEY).await.ok()?;
        if data.is_none() {
            tracing::debug!(%keyname, "hitting the webs for missing pubkey");
            let signer = self.signer();
            match self
                .fetcher
                .get_json(signer.as_ref(), keyname, self.fetcher.slow_timeout())
                .await
            {
                Ok(fetched) => {
                    self.ingest(&originate(keyname), &fetched.value).await;
                    data = self.db.get_identity(keyname, PROP_PUBKEY).await.ok()?;
                }
                Err(error) => {
                    tracing::info!(%keyname, %error, "error getting pubkey");
                    let _ = self.db.save_identity(keyname, FAILED, PROP_PUBKEY).await;
                    return None;
                }
            }
            if data.is_none() {
                tracing::info!(%keyname, "key not found after ingesting");
                let _ = self.db.save_identity(keyname, FAILED, PROP_PUBKEY).await;
                return None;
            }
        }

        let data = data?;
        if data == FAILED {
            tracing::info!(%keyname, "lookup previously failed key");
            return None;
        }
        match decode_public_key(&data) {
            Ok(key) => Some(key),
            Err(error) => {
                tracing::info!(%keyname, %error, "error decoding pubkey");
                None
            }
        }
    }

    /// Drop a cached key so the next verification re-fetches it. Keeps
    /// rows a concurrent re-fetch just wrote.
    pub async fn forget_key(&self, keyname: &str) {
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(30);
        let _ = self
            .db
            .delete_identity_before(keyname, PROP_PUBKEY, cutoff)
            .await;
        self.keys.lock().expect("key cache poisoned").pop(keyname);
    }

    /// Short handle for an actor; falls back to the last URL path
    /// segment when nothing better is known.
    pub async fn handle(&self, actor_xid: &str) -> String {
        if let Some(cached) = self
            .handles
            .lock()
            .expect("handle cache poisoned")
            .get(actor_xid)
            .cloned()
        {
            return cached;
        }

        let mut handle = self
            .db
            .get_identity(actor_xid, PROP_HANDLE)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        if handle.is_empty() {
            tracing::debug!(xid = %actor_xid, "need to get a handle");
            let signer = self.signer();
            if let Ok(fetched) = self
                .fetcher
                .get_json(signer.as_ref(), actor_xid, self.fetcher.fast_timeout())
                .await
            {
                self.ingest(&originate(actor_xid), &fetched.value).await;
                handle = self
                    .db
                    .get_identity(actor_xid, PROP_HANDLE)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default();
            }
        }
        if handle.is_empty() {
            handle = actor_xid
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(actor_xid)
                .to_string();
            let _ = self.db.save_identity(actor_xid, &handle, PROP_HANDLE).await;
        }

        self.handles
            .lock()
            .expect("handle cache poisoned")
            .put(actor_xid.to_string(), handle.clone());
        handle
    }

    /// `handle@host` and `handle` for display; empty for broadcast
    /// addresses.
    pub async fn handles(&self, actor_xid: &str) -> (String, String) {
        if actor_xid.is_empty()
            || actor_xid == super::THE_WHOLE_WORLD
            || actor_xid.ends_with("/followers")
        {
            return (String::new(), String::new());
        }
        let handle = self.handle(actor_xid).await;
        if handle == actor_xid {
            return (actor_xid.to_string(), actor_xid.to_string());
        }
        let full = format!("{}@{}", handle, originate(actor_xid));
        (handle, full)
    }

    /// Webfinger: `name@host` (with or without a leading `@`) to actor
    /// XID.
    pub async fn finger(&self, name: &str) -> Option<String> {
        let name = name.strip_prefix('@').unwrap_or(name);
        let (_, host) = name.split_once('@')?;

        if let Ok(Some(href)) = self.db.get_identity(name, PROP_FISHNAME).await {
            return Some(href);
        }

        tracing::debug!(%name, "going fishing");
        let url = format!(
            "https://{}/.well-known/webfinger?resource=acct:{}",
            host, name
        );
        let signer = self.signer();
        let fetched = match self
            .fetcher
            .get_json(signer.as_ref(), &url, self.fetcher.fast_timeout())
            .await
        {
            Ok(fetched) => fetched,
            Err(error) => {
                tracing::info!(%name, %error, "failed to go fish");
                return None;
            }
        };

        let links = fetched.value.get("links")?.as_array()?.clone();
        for link in &links {
            let rel = shape::get_string(link, "rel").unwrap_or_default();
            let link_type = shape::get_string(link, "type").unwrap_or_default();
            if rel == "self" && super::friend_or_foe(link_type) {
                if let Some(href) = shape::get_string(link, "href") {
                    let _ = self.db.save_identity(name, href, PROP_FISHNAME).await;
                    return Some(href.to_string());
                }
            }
        }
        None
    }

    /// A peer's chat box key, if advertised.
    pub async fn chat_key(&self, actor_xid: &str) -> Option<crypto_box::PublicKey> {
        if let Some(cached) = self
            .chat_keys
            .lock()
            .expect("chat key cache poisoned")
            .get(actor_xid)
            .cloned()
        {
            return cached;
        }

        let resolved = self.chat_key_uncached(actor_xid).await;
        self.chat_keys
            .lock()
            .expect("chat key cache poisoned")
            .put(actor_xid.to_string(), resolved.clone());
        resolved
    }

    async fn chat_key_uncached(&self, actor_xid: &str) -> Option<crypto_box::PublicKey> {
        let mut data = self.db.get_identity(actor_xid, CHAT_KEY_PROP).await.ok()?;
        if data.is_none() {
            tracing::debug!(xid = %actor_xid, "hitting the webs for missing chatkey");
            let signer = self.signer();
            match self
                .fetcher
                .get_json(signer.as_ref(), actor_xid, self.fetcher.slow_timeout())
                .await
            {
                Ok(fetched) => {
                    self.ingest(&originate(actor_xid), &fetched.value).await;
                    data = self.db.get_identity(actor_xid, CHAT_KEY_PROP).await.ok()?;
                }
                Err(error) => {
                    tracing::info!(xid = %actor_xid, %error, "error getting chatkey");
                    let _ = self
                        .db
                        .save_identity(actor_xid, FAILED, CHAT_KEY_PROP)
                        .await;
                    return None;
                }
            }
        }
        let data = data?;
        if data == FAILED {
            return None;
        }
        crate::chat::key_from_b64(&data).ok()
    }

    /// Learn whatever an actor document offers: public key, boxes,
    /// handle, chat key. Fields are only persisted when the document id
    /// originates from the host it was fetched from, which keeps a
    /// malicious peer from injecting keys for someone else's actor.
    pub async fn ingest(&self, origin: &str, doc: &Value) {
        let Some(ident) = shape::get_string(doc, "id") else {
            return;
        };
        if originate(ident) != origin {
            return;
        }

        if let Some(keyobj) = shape::get_map(doc, "publicKey") {
            self.ingest_public_key(origin, keyobj).await;
        }
        self.ingest_boxes(origin, doc).await;
        self.ingest_handle(origin, doc).await;
        if let Some(chatkey) = shape::get_string(doc, CHAT_KEY_PROP) {
            let _ = self.db.save_identity(ident, chatkey, CHAT_KEY_PROP).await;
            self.chat_keys
                .lock()
                .expect("chat key cache poisoned")
                .pop(ident);
        }
    }

    async fn ingest_public_key(&self, origin: &str, keyobj: &Value) {
        let Some(keyname) = shape::get_string(keyobj, "id") else {
            tracing::info!(%origin, "bad key origin");
            return;
        };
        if self
            .db
            .get_identity(keyname, PROP_PUBKEY)
            .await
            .ok()
            .flatten()
            .is_some()
        {
            return;
        }
        if originate(keyname) != origin {
            tracing::info!(%origin, %keyname, "bad key origin");
            return;
        }
        let Some(owner) = shape::get_string(keyobj, "owner") else {
            tracing::info!(%keyname, "error finding pubkey owner");
            return;
        };
        let Some(data) = shape::get_string(keyobj, "publicKeyPem") else {
            tracing::info!(%keyname, "error finding pubkey");
            return;
        };
        if originate(owner) != origin {
            tracing::info!(%owner, %origin, "bad key owner");
            return;
        }
        if let Err(error) = decode_public_key(data) {
            tracing::info!(%keyname, %error, "error decoding pubkey");
            return;
        }
        tracing::debug!(%keyname, "ingesting a needed pubkey");
        if let Err(error) = self.db.save_identity(keyname, data, PROP_PUBKEY).await {
            tracing::error!(%keyname, %error, "error saving key");
        }
        self.keys.lock().expect("key cache poisoned").pop(keyname);
    }

    async fn ingest_boxes(&self, origin: &str, doc: &Value) {
        let Some(ident) = shape::get_string(doc, "id") else {
            return;
        };
        if originate(ident) != origin {
            return;
        }
        if self
            .db
            .get_identity(ident, PROP_BOXES)
            .await
            .ok()
            .flatten()
            .is_some()
        {
            return;
        }
        let inbox = shape::get_string(doc, "inbox").unwrap_or_default();
        let outbox = shape::get_string(doc, "outbox").unwrap_or_default();
        let shared = doc
            .get("endpoints")
            .and_then(|e| e.get("sharedInbox"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !inbox.is_empty() {
            tracing::debug!(%ident, "ingesting boxes");
            let info = format!("{} {} {}", inbox, outbox, shared);
            let _ = self.db.save_identity(ident, &info, PROP_BOXES).await;
            self.boxes.lock().expect("boxes cache poisoned").pop(ident);
        }
    }

    async fn ingest_handle(&self, origin: &str, doc: &Value) {
        let Some(xid) = shape::get_string(doc, "id") else {
            return;
        };
        if originate(xid) != origin {
            return;
        }
        if self
            .db
            .get_identity(xid, PROP_HANDLE)
            .await
            .ok()
            .flatten()
            .is_some()
        {
            return;
        }
        if let Some(handle) = shape::get_string(doc, "preferredUsername") {
            if !handle.is_empty() {
                let _ = self.db.save_identity(xid, handle, PROP_HANDLE).await;
                self.handles
                    .lock()
                    .expect("handle cache poisoned")
                    .pop(xid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;
    use serde_json::json;

    async fn resolver() -> Resolver {
        let db = Arc::new(Database::connect_memory().await.expect("db"));
        let config = FederationConfig {
            fast_timeout_secs: 1,
            slow_timeout_secs: 1,
            max_deliveries: 4,
            collect_forwards: true,
            devel: true,
            convert_avif: false,
            accept_avif: false,
        };
        let fetcher = Arc::new(Fetcher::new(config, "example.com").expect("fetcher"));
        Resolver::new(db, fetcher)
    }

    fn actor_doc(id: &str, pem: &str) -> serde_json::Value {
        json!({
            "id": id,
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": format!("{}/inbox", id),
            "outbox": format!("{}/outbox", id),
            "endpoints": { "sharedInbox": "https://remote.example/inbox" },
            "publicKey": {
                "id": format!("{}#key", id),
                "owner": id,
                "publicKeyPem": pem,
            }
        })
    }

    fn test_pem() -> String {
        use rsa::pkcs8::EncodePublicKey;
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        rsa::RsaPublicKey::from(&key)
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
    }

    #[tokio::test]
    async fn ingest_learns_boxes_handle_and_key() {
        let resolver = resolver().await;
        let pem = test_pem();
        let doc = actor_doc("https://remote.example/u/bob", &pem);
        resolver.ingest("remote.example", &doc).await;

        let boxes = resolver
            .boxes("https://remote.example/u/bob")
            .await
            .expect("boxes learned");
        assert_eq!(boxes.inbox, "https://remote.example/u/bob/inbox");
        assert_eq!(boxes.shared, "https://remote.example/inbox");

        assert_eq!(resolver.handle("https://remote.example/u/bob").await, "bob");

        resolver
            .public_key("https://remote.example/u/bob#key")
            .await
            .expect("key learned");
    }

    #[tokio::test]
    async fn ingest_refuses_cross_origin_documents() {
        let resolver = resolver().await;
        let pem = test_pem();
        let doc = actor_doc("https://remote.example/u/bob", &pem);

        // Fetched from evil.example but claims remote.example identity.
        resolver.ingest("evil.example", &doc).await;
        assert!(resolver
            .db
            .get_identity("https://remote.example/u/bob", "boxes")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ingest_refuses_cross_origin_key_owner() {
        let resolver = resolver().await;
        let pem = test_pem();
        let mut doc = actor_doc("https://remote.example/u/bob", &pem);
        doc["publicKey"]["owner"] = json!("https://evil.example/u/mallory");
        resolver.ingest("remote.example", &doc).await;

        assert!(resolver
            .db
            .get_identity("https://remote.example/u/bob#key", "pubkey")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dead_actor_short_circuits() {
        let resolver = resolver().await;
        resolver
            .db
            .save_identity("https://gone.example/u/x", "dead", "boxes")
            .await
            .unwrap();
        assert!(resolver.boxes("https://gone.example/u/x").await.is_none());
    }

    #[tokio::test]
    async fn handle_falls_back_to_path_segment() {
        let resolver = resolver().await;
        // No identity row and the fetch will fail (devel, unreachable);
        // the trailing path segment is used and remembered.
        resolver
            .db
            .save_identity("https://remote.example/u/carol", "", "handle")
            .await
            .unwrap();
        let handle = resolver.handle("https://remote.example/u/carol").await;
        assert_eq!(handle, "carol");
    }

    #[tokio::test]
    async fn handles_hides_broadcast_addresses() {
        let resolver = resolver().await;
        let (short, full) = resolver.handles(super::super::THE_WHOLE_WORLD).await;
        assert!(short.is_empty() && full.is_empty());
        let (short, full) = resolver
            .handles("https://remote.example/u/bob/followers")
            .await;
        assert!(short.is_empty() && full.is_empty());
    }
}
