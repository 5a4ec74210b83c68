//! Outbound documents and broadcast
//!
//! Turns local Records into activity documents, expands audiences into
//! inbox URLs, and hands the results to the delivery engine. Rendered
//! public objects are kept in a small write-through cache keyed by xid.

use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;

use crate::config::FederationConfig;
use crate::data::{Database, Record, RecordKind, User};
use crate::error::AppError;

use super::delivery::DeliveryEngine;
use super::identity::Resolver;
use super::track::Tracker;
use super::{
    new_ending, one_of_a_kind, short_xid, AS2_CONTEXT, CHAT_KEY_PROP, SECURITY_CONTEXT,
    THE_WHOLE_WORLD,
};

lazy_static! {
    static ref RE_EMUS: Regex = Regex::new(r"^:[[:alnum:]_-]+:$").expect("regex");
}

/// Outbound pipeline
pub struct Outbound {
    db: Arc<Database>,
    resolver: Arc<Resolver>,
    delivery: Arc<DeliveryEngine>,
    tracker: Tracker,
    config: FederationConfig,
    base_url: String,
    rendered: StdMutex<LruCache<String, Vec<u8>>>,
}

impl Outbound {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<Resolver>,
        delivery: Arc<DeliveryEngine>,
        tracker: Tracker,
        config: FederationConfig,
        base_url: String,
    ) -> Self {
        Self {
            db,
            resolver,
            delivery,
            tracker,
            config,
            base_url,
            rendered: StdMutex::new(LruCache::new(NonZeroUsize::new(128).expect("nonzero"))),
        }
    }

    /// Attachment documents for a record's files. Emoji attachments
    /// travel as tags, not attachments. With avif conversion enabled,
    /// jpegs advertise an alternative link pair.
    fn attachment_documents(&self, record: &Record) -> Vec<Value> {
        let mut documents = Vec::new();
        for donk in &record.attachments {
            if RE_EMUS.is_match(&donk.name) {
                continue;
            }
            let mut jd = json!({
                "name": donk.name,
                "summary": html_escape::encode_text(&donk.desc).into_owned(),
                "type": "Document",
            });
            if self.config.convert_avif && donk.media == "image/jpeg" {
                jd["url"] = json!([
                    {
                        "type": "Link",
                        "mediaType": "image/jpeg",
                        "href": donk.url,
                    },
                    {
                        "type": "Link",
                        "mediaType": "image/avif",
                        "href": new_ending(&donk.url, ".avif"),
                    },
                ]);
            } else {
                jd["mediaType"] = json!(donk.media);
                jd["url"] = json!(donk.url);
            }
            documents.push(jd);
        }
        documents
    }

    /// Emoji tags for `:name:` attachments referenced by the content.
    fn emoji_tags(&self, record: &Record) -> Vec<Value> {
        record
            .attachments
            .iter()
            .filter(|donk| RE_EMUS.is_match(&donk.name))
            .map(|donk| {
                json!({
                    "id": donk.url,
                    "type": "Emoji",
                    "name": donk.name,
                    "icon": {
                        "type": "Image",
                        "mediaType": donk.media,
                        "url": donk.url,
                    },
                })
            })
            .collect()
    }

    /// Build the activity envelope and nested object for a record.
    ///
    /// The returned pair is (activity, object); the object is present
    /// only for record-like kinds. `replies` lists child records for
    /// the replies collection.
    pub fn build_activity(
        &self,
        user: &User,
        record: &Record,
        replies: &[Record],
    ) -> (Value, Option<Value>) {
        let dt = record.date.to_rfc3339();
        let mut audience = record.audience.clone();
        if record.public && record.honker == user.url {
            audience.push(format!("{}/followers", user.url));
        }
        let audience = one_of_a_kind(audience);

        let mut activity = json!({
            "id": format!("{}/{}/{}", user.url, record.kind.as_str(), short_xid(&record.xid)),
            "actor": record.honker,
            "published": dt,
        });
        if let Some(primary) = audience.first() {
            activity["to"] = json!(primary);
        }
        if audience.len() > 1 {
            activity["cc"] = json!(audience[1..]);
        }

        let mut object = None;
        match record.kind {
            RecordKind::Honk | RecordKind::Event | RecordKind::Update | RecordKind::Qonk => {
                activity["type"] = json!("Create");
                let mut jo = json!({
                    "id": record.xid,
                    "type": "Note",
                    "published": dt,
                    "url": record.xid,
                    "attributedTo": record.honker,
                });
                if record.kind == RecordKind::Update {
                    activity["type"] = json!("Update");
                    jo["updated"] = json!(Utc::now().to_rfc3339());
                }
                if !record.rid.is_empty() {
                    jo["inReplyTo"] = json!(record.rid);
                }
                if !record.convoy.is_empty() {
                    jo["context"] = json!(record.convoy);
                    jo["conversation"] = json!(record.convoy);
                }
                if let Some(primary) = audience.first() {
                    jo["to"] = json!(primary);
                }
                if audience.len() > 1 {
                    jo["cc"] = json!(audience[1..]);
                }
                if !record.public {
                    jo["directMessage"] = json!(true);
                }
                if !record.precis.is_empty() {
                    jo["sensitive"] = json!(true);
                    jo["summary"] = json!(record.precis);
                }

                let reply_ids: Vec<&str> = replies.iter().map(|r| r.xid.as_str()).collect();
                if !reply_ids.is_empty() {
                    jo["replies"] = json!({
                        "type": "Collection",
                        "totalItems": reply_ids.len(),
                        "items": reply_ids,
                    });
                }

                let mut tags: Vec<Value> = Vec::new();
                for mention in &record.mentions {
                    tags.push(json!({
                        "type": "Mention",
                        "name": mention.handle,
                        "href": mention.xid,
                    }));
                }
                for ont in &record.onties {
                    let ont = ont.to_lowercase();
                    tags.push(json!({
                        "type": "Hashtag",
                        "href": format!("{}/o/{}", self.base_url, &ont[1..]),
                        "name": ont,
                    }));
                }
                tags.extend(self.emoji_tags(record));
                if !tags.is_empty() {
                    jo["tag"] = json!(tags);
                }

                if let Some(place) = &record.place {
                    let mut location = json!({"type": "Place"});
                    if !place.name.is_empty() {
                        location["name"] = json!(place.name);
                    }
                    if place.latitude != 0.0 {
                        location["latitude"] = json!(place.latitude);
                    }
                    if place.longitude != 0.0 {
                        location["longitude"] = json!(place.longitude);
                    }
                    if !place.url.is_empty() {
                        location["url"] = json!(place.url);
                    }
                    jo["location"] = location;
                }
                if let Some(time) = &record.time {
                    jo["startTime"] = json!(time.start.to_rfc3339());
                    if time.duration_secs != 0 {
                        jo["duration"] = json!(format_iso_duration(time.duration_secs));
                    }
                }

                // Type overrides stack: a linked record is a Page, rich
                // markup upgrades it to an Article, and events are
                // Events no matter what. The Link attachment rides
                // along either way.
                let mut attachments = self.attachment_documents(record);
                if !record.link.is_empty() {
                    jo["type"] = json!("Page");
                    attachments.push(json!({
                        "type": "Link",
                        "href": record.link,
                    }));
                }
                if crate::content::too_fancy(&record.noise) {
                    jo["type"] = json!("Article");
                }
                if record.kind == RecordKind::Event {
                    jo["type"] = json!("Event");
                }
                if !attachments.is_empty() {
                    jo["attachment"] = json!(attachments);
                }
                jo["content"] = json!(record.noise);
                activity["object"] = jo.clone();
                object = Some(jo);
            }
            RecordKind::Bonk => {
                activity["type"] = json!("Announce");
                if !record.convoy.is_empty() {
                    activity["context"] = json!(record.convoy);
                }
                activity["object"] = json!(record.xid);
            }
            RecordKind::Unbonk => {
                let mut b = json!({
                    "id": format!("{}/bonk/{}", user.url, short_xid(&record.xid)),
                    "type": "Announce",
                    "actor": user.url,
                    "object": record.xid,
                });
                if !record.convoy.is_empty() {
                    b["context"] = json!(record.convoy);
                }
                activity["type"] = json!("Undo");
                activity["object"] = b;
            }
            RecordKind::Zonk => {
                activity["type"] = json!("Delete");
                activity["object"] = json!(record.xid);
            }
            RecordKind::Ack => {
                activity["type"] = json!("Read");
                activity["object"] = json!(record.xid);
                if !record.convoy.is_empty() {
                    activity["context"] = json!(record.convoy);
                }
            }
            RecordKind::React => {
                activity["type"] = json!("EmojiReact");
                activity["object"] = json!(record.xid);
                if !record.convoy.is_empty() {
                    activity["context"] = json!(record.convoy);
                }
                activity["content"] = json!(record.noise);
            }
            RecordKind::Deack => {
                let mut b = json!({
                    "id": format!("{}/ack/{}", user.url, short_xid(&record.xid)),
                    "type": "Read",
                    "actor": user.url,
                    "object": record.xid,
                });
                if !record.convoy.is_empty() {
                    b["context"] = json!(record.convoy);
                }
                activity["type"] = json!("Undo");
                activity["object"] = b;
            }
            RecordKind::Chonk | RecordKind::Move => {
                // Chonks federate through their own builder; moves are
                // markers that never leave the house.
                activity["type"] = json!("Note");
            }
        }

        (activity, object)
    }

    /// Expand an audience into delivery recipients.
    ///
    /// Shared inboxes are prefixed with `%` so the delivery engine
    /// skips the inbox-of-actor lookup. One recipient per distinct
    /// shared inbox, however many actors live behind it.
    pub async fn expand_recipients(
        &self,
        user: &User,
        addresses: &[String],
        use_shared: bool,
    ) -> HashSet<String> {
        let mut rcpts = HashSet::new();
        let mut to_resolve = Vec::new();
        for a in addresses {
            if a.is_empty()
                || a == THE_WHOLE_WORLD
                || *a == user.url
                || a.ends_with("/followers")
            {
                continue;
            }
            if a.starts_with('%') {
                rcpts.insert(a.clone());
                continue;
            }
            to_resolve.push(a.clone());
        }

        let resolutions = futures::future::join_all(
            to_resolve
                .iter()
                .map(|a| async { (a.clone(), self.resolver.boxes(a).await) }),
        )
        .await;
        for (a, boxes) in resolutions {
            match boxes {
                Some(boxes) if use_shared && !boxes.shared.is_empty() => {
                    rcpts.insert(format!("%{}", boxes.shared));
                }
                _ => {
                    rcpts.insert(a);
                }
            }
        }
        rcpts
    }

    /// Federate a record to its audience.
    pub async fn broadcast(&self, user: &User, record: &Record) -> Result<(), AppError> {
        let (mut activity, _) = self.build_activity(user, record, &[]);
        activity["@context"] = json!(AS2_CONTEXT);
        let msg = serde_json::to_vec(&activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let mut audience = record.audience.clone();
        if record.public {
            for sub in self.db.subscribers(user.id).await? {
                if sub.xid != user.url {
                    audience.push(sub.xid);
                }
            }
            if record.kind == RecordKind::Update {
                audience.extend(self.tracker.backtracks(&self.db, &record.xid).await);
            }
        }

        let rcpts = self.expand_recipients(user, &audience, record.public).await;
        if let Some(activity_type) = activity.get("type").and_then(Value::as_str) {
            crate::metrics::ACTIVITIES_SENT
                .with_label_values(&[activity_type])
                .inc();
        }
        for rcpt in rcpts {
            self.delivery.enqueue(user.id, rcpt, msg.clone());
        }
        self.invalidate_rendered(&record.xid);
        Ok(())
    }

    /// Build and send a direct chat message.
    pub async fn send_chat(&self, user: &User, chonk: &crate::data::Chonk) -> Result<(), AppError> {
        let dt = chonk.date.to_rfc3339();
        let mut content = chonk.noise.clone();
        let mut jo = json!({
            "id": chonk.xid,
            "type": "ChatMessage",
            "published": dt,
            "attributedTo": user.url,
            "to": [chonk.target],
        });

        if !user.options.chat_seckey.is_empty() {
            if let Some(peer_key) = self.resolver.chat_key(&chonk.target).await {
                match crate::chat::secret_from_b64(&user.options.chat_seckey)
                    .and_then(|sec| crate::chat::encrypt_string(&content, &sec, &peer_key))
                {
                    Ok(sealed) => {
                        content = sealed;
                        jo[CHAT_KEY_PROP] = json!(user.options.chat_pubkey);
                    }
                    Err(error) => tracing::info!(%error, "failure encrypting chonk"),
                }
            }
        }
        jo["content"] = json!(content);

        let activity = json!({
            "@context": AS2_CONTEXT,
            "id": format!("{}/honk/{}", user.url, short_xid(&chonk.xid)),
            "type": "Create",
            "actor": user.url,
            "published": dt,
            "to": [chonk.target],
            "object": jo,
        });
        let msg = serde_json::to_vec(&activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        crate::metrics::ACTIVITIES_SENT
            .with_label_values(&["Create"])
            .inc();
        self.delivery.enqueue(user.id, chonk.target.clone(), msg);
        Ok(())
    }

    /// Ask to follow an actor.
    pub fn send_follow(&self, user: &User, target_xid: &str, owner: &str, folxid: &str) {
        if target_xid.is_empty() {
            tracing::info!("can't subscribe to empty");
            return;
        }
        let activity = json!({
            "@context": AS2_CONTEXT,
            "id": format!("{}/sub/{}", user.url, folxid),
            "type": "Follow",
            "actor": user.url,
            "to": owner,
            "object": target_xid,
            "published": Utc::now().to_rfc3339(),
        });
        self.delivery.enqueue(
            user.id,
            owner.to_string(),
            serde_json::to_vec(&activity).unwrap_or_default(),
        );
    }

    /// Take a follow back.
    pub fn send_unfollow(&self, user: &User, target_xid: &str, owner: &str, folxid: &str) {
        let activity = json!({
            "@context": AS2_CONTEXT,
            "id": format!("{}/unsub/{}", user.url, folxid),
            "type": "Undo",
            "actor": user.url,
            "to": owner,
            "object": {
                "id": format!("{}/sub/{}", user.url, folxid),
                "type": "Follow",
                "actor": user.url,
                "to": owner,
                "object": target_xid,
            },
            "published": Utc::now().to_rfc3339(),
        });
        self.delivery.enqueue(
            user.id,
            owner.to_string(),
            serde_json::to_vec(&activity).unwrap_or_default(),
        );
    }

    /// Announce a profile edit to every subscriber.
    pub async fn update_profile(&self, user: &User) -> Result<(), AppError> {
        let activity = json!({
            "@context": AS2_CONTEXT,
            "id": format!("{}/upme/{}/{}", user.url, user.name, Utc::now().timestamp()),
            "actor": user.url,
            "published": Utc::now().to_rfc3339(),
            "to": THE_WHOLE_WORLD,
            "type": "Update",
            "object": self.actor_document(user),
        });
        let msg = serde_json::to_vec(&activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let audience: Vec<String> = self
            .db
            .subscribers(user.id)
            .await?
            .into_iter()
            .map(|sub| sub.xid)
            .filter(|xid| *xid != user.url)
            .collect();
        for rcpt in self.expand_recipients(user, &audience, true).await {
            self.delivery.enqueue(user.id, rcpt, msg.clone());
        }
        Ok(())
    }

    /// The AS2 Person document for a local user.
    pub fn actor_document(&self, user: &User) -> Value {
        let mut doc = json!({
            "@context": [AS2_CONTEXT, SECURITY_CONTEXT],
            "id": user.url,
            "type": "Person",
            "inbox": format!("{}/inbox", user.url),
            "outbox": format!("{}/outbox", user.url),
            "followers": format!("{}/followers", user.url),
            "following": format!("{}/following", user.url),
            "name": user.display_name,
            "preferredUsername": user.name,
            "summary": user.about,
            "url": user.url,
            "publicKey": {
                "id": user.keyname(),
                "owner": user.url,
                "publicKeyPem": user.public_key_pem,
            },
        });
        let tags: Vec<Value> = user
            .options
            .hashtags
            .iter()
            .map(|o| {
                let o = o.to_lowercase();
                json!({
                    "type": "Hashtag",
                    "href": format!("{}/o/{}", self.base_url, o.trim_start_matches('#')),
                    "name": o,
                })
            })
            .collect();
        if !tags.is_empty() {
            doc["tag"] = json!(tags);
        }
        if !user.options.avatar.is_empty() {
            doc["icon"] = json!({
                "type": "Image",
                "mediaType": "image/png",
                "url": user.options.avatar,
            });
        }
        if !user.options.banner.is_empty() {
            doc["image"] = json!({
                "type": "Image",
                "mediaType": "image/jpg",
                "url": user.options.banner,
            });
        }
        if !user.options.chat_pubkey.is_empty() {
            doc[CHAT_KEY_PROP] = json!(user.options.chat_pubkey);
        }
        doc
    }

    /// Rendered bytes of a public record's object document, cached.
    pub async fn rendered_object(&self, xid: &str) -> Option<Vec<u8>> {
        if let Some(cached) = self
            .rendered
            .lock()
            .expect("rendered cache poisoned")
            .get(xid)
            .cloned()
        {
            return Some(cached);
        }

        let record = self.db.any_record_by_xid(xid).await.ok()??;
        if !record.public {
            return None;
        }
        let user = self.db.user_by_id(record.userid).await.ok()??;
        let children: Vec<Record> = self
            .db
            .records_by_convoy(record.userid, &record.convoy)
            .await
            .ok()?
            .into_iter()
            .filter(|child| child.rid == record.xid && child.public)
            .collect();

        let (_, object) = self.build_activity(&user, &record, &children);
        let mut object = object?;
        object["@context"] = json!(AS2_CONTEXT);
        let bytes = serde_json::to_vec(&object).ok()?;
        self.rendered
            .lock()
            .expect("rendered cache poisoned")
            .put(xid.to_string(), bytes.clone());
        Some(bytes)
    }

    /// Drop a cached rendering after a record mutation.
    pub fn invalidate_rendered(&self, xid: &str) {
        self.rendered
            .lock()
            .expect("rendered cache poisoned")
            .pop(xid);
    }

    /// Track a fetch of one of our records for later Update pushes.
    pub fn track_fetch(&self, xid: &str, headers: &http::HeaderMap) {
        self.tracker.track(xid, headers);
    }
}

/// Seconds to the `PT...` form peers expect.
fn format_iso_duration(mut secs: i64) -> String {
    let mut out = String::from("PT");
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}M", minutes));
    }
    if secs > 0 || out == "PT" {
        out.push_str(&format!("{}S", secs));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_duration_formats() {
        assert_eq!(format_iso_duration(3600), "PT1H");
        assert_eq!(format_iso_duration(5400), "PT1H30M");
        assert_eq!(format_iso_duration(45), "PT45S");
        assert_eq!(format_iso_duration(0), "PT0S");
    }
}
