//! Inbound activity processing
//!
//! Entry point for signature-verified payloads addressed to a local
//! user: pre-filters, dispatch by activity type, and the recursive
//! normalization of foreign objects into Records. Normalization walks
//! reply chains and quoted objects through the fetch cache, bounded by
//! a depth counter that doubles as the cycle guard.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

use crate::config::FederationConfig;
use crate::content;
use crate::data::{
    flags, Attachment, Chonk, Contact, ContactFlavor, Database, FileMeta, Filter, KeyInfo, Mention,
    Place, Record, RecordKind, TimeWindow, User, Whofore,
};
use crate::error::AppError;

use super::delivery::DeliveryEngine;
use super::fetch::{Fetcher, MAX_FETCH_SIZE};
use super::identity::Resolver;
use super::shape;
use super::signature::decode_private_key;
use super::{
    loud_and_proud, one_of_a_kind, originate, random_xid, AS2_CONTEXT, CHAT_KEY_PROP,
    THE_WHOLE_WORLD, TINY_WORLD,
};

/// Fetch depth bound; also the quote-expansion cycle guard
const MAX_DEPTH: usize = 10;
/// Recursion bound past which normalization gives up entirely
const MAX_RECURSION: usize = MAX_DEPTH + 5;
/// Content longer than this is truncated
const MAX_NOISE: usize = 90_001;
/// Attachments beyond this many are noted but not localized
const MAX_LOCALIZED_ATTACHMENTS: usize = 5;
/// PDFs above this size are referenced, not stored
const MAX_PDF_SIZE: usize = 1_000_000;
/// Non-image, non-pdf attachments above this size are referenced only
const MAX_MISC_SIZE: usize = 100_000;
/// Ceiling on the unknown-activity debug file
const MAX_DUMP_SIZE: u64 = 1024 * 1024;

/// Pre-filter: activities dropped before any further parsing.
///
/// Self-deletes of unknown accounts, Likes and their relatives, and
/// reactions to objects that are not ours.
pub fn is_crappola(activity: &Value, server_name: &str) -> bool {
    let mut what = shape::first_of_many(activity, "type").unwrap_or_default();
    if what == "Delete" {
        let actor = shape::get_string(activity, "actor").unwrap_or_default();
        let object = shape::get_string(activity, "object").unwrap_or_default();
        if !actor.is_empty() && actor == object {
            tracing::debug!(from = %actor, "crappola");
            return true;
        }
    }
    let mut inner = activity;
    if what == "Announce" || what == "Undo" {
        if let Some(obj) = shape::get_map(activity, "object") {
            inner = obj;
            what = shape::first_of_many(inner, "type").unwrap_or_default();
        }
    }
    if what == "Like" || what == "Dislike" || what == "Listen" {
        return true;
    }
    if what == "EmojiReact" {
        let object = shape::string_or_id(inner, "object").unwrap_or_default();
        if originate(object) != server_name {
            return true;
        }
    }
    false
}

struct CompiledFilter {
    actor: String,
    include_audience: bool,
    text: Option<Regex>,
    reject: bool,
    skip_media: bool,
    is_announce: bool,
}

impl CompiledFilter {
    fn from(filter: &Filter) -> Self {
        Self {
            actor: filter.actor.clone(),
            include_audience: filter.include_audience,
            text: if filter.text.is_empty() {
                None
            } else {
                Regex::new(&filter.text).ok()
            },
            reject: filter.reject,
            skip_media: filter.skip_media,
            is_announce: filter.is_announce,
        }
    }

    fn matches_actor(&self, xid: &str) -> bool {
        if self.actor.is_empty() {
            return false;
        }
        self.actor == xid || (self.include_audience && originate(xid) == self.actor)
    }

    fn matches_record(&self, record: &Record) -> bool {
        if self.matches_actor(&record.honker) || self.matches_actor(&record.oonker) {
            return true;
        }
        if let Some(re) = &self.text {
            if re.is_match(&record.noise) || re.is_match(&record.precis) {
                return true;
            }
            if record.attachments.iter().any(|d| re.is_match(&d.name)) {
                return true;
            }
        }
        false
    }
}

/// Inbound activity processor
pub struct Inbound {
    db: Arc<Database>,
    resolver: Arc<Resolver>,
    fetcher: Arc<Fetcher>,
    delivery: Arc<DeliveryEngine>,
    config: FederationConfig,
    server_name: String,
}

impl Inbound {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<Resolver>,
        fetcher: Arc<Fetcher>,
        delivery: Arc<DeliveryEngine>,
        config: FederationConfig,
        server_name: String,
    ) -> Self {
        Self {
            db,
            resolver,
            fetcher,
            delivery,
            config,
            server_name,
        }
    }

    async fn compiled_filters(&self, user: &User) -> Vec<CompiledFilter> {
        self.db
            .filters_for(user.id)
            .await
            .unwrap_or_default()
            .iter()
            .map(CompiledFilter::from)
            .collect()
    }

    /// Should this actor's traffic be refused outright?
    pub async fn reject_actor(&self, user: &User, who: &str) -> bool {
        let filters = self.compiled_filters(user).await;
        filters
            .iter()
            .any(|f| f.reject && !f.is_announce && f.matches_actor(who))
    }

    /// Process a verified activity from `origin` addressed to `user`.
    pub async fn process(
        &self,
        user: &User,
        activity: Value,
        origin: String,
    ) -> Result<(), AppError> {
        let what = shape::first_of_many(&activity, "type").unwrap_or_default();
        let who = shape::get_string(&activity, "actor")
            .unwrap_or_default()
            .to_string();
        crate::metrics::ACTIVITIES_RECEIVED
            .with_label_values(&[what])
            .inc();

        match what {
            "Ping" => {
                let id = shape::get_string(&activity, "id").unwrap_or_default();
                tracing::info!(from = %who, %id, "ping");
                self.send_pong(user, &who, id).await;
            }
            "Pong" => {
                let obj = shape::string_or_id(&activity, "object").unwrap_or_default();
                tracing::info!(from = %who, id = %obj, "pong");
            }
            "Follow" => {
                let obj = shape::string_or_id(&activity, "object").unwrap_or_default();
                if obj != user.url {
                    tracing::info!(what = %obj, "can't follow");
                    return Ok(());
                }
                self.follow_me(user, &who, &activity).await?;
            }
            "Accept" => {
                self.accepted_follow(user, &who).await?;
            }
            "Reject" => {
                self.rejected_follow(user, &who).await?;
            }
            "Update" => {
                if let Some(obj) = shape::get_map(&activity, "object") {
                    match shape::first_of_many(obj, "type").unwrap_or_default() {
                        // Person updates flow through actor re-ingest;
                        // Question tallies are intentionally stateless.
                        "Person" | "Service" | "Question" => return Ok(()),
                        _ => {}
                    }
                }
                self.save_object(user, activity, &origin).await;
            }
            "Undo" => {
                let Some(obj) = shape::get_map(&activity, "object") else {
                    if let Some(folxid) = shape::get_string(&activity, "object") {
                        if originate(folxid) == origin {
                            self.unfollow_me_by_folxid(user, folxid).await?;
                        }
                    }
                    return Ok(());
                };
                match shape::first_of_many(obj, "type").unwrap_or_default() {
                    "Follow" => self.unfollow_me(user, &who).await?,
                    "Announce" => {
                        let xid = shape::string_or_id(obj, "object").unwrap_or_default();
                        tracing::debug!(%xid, "undo announce");
                    }
                    "Like" => {}
                    other => tracing::info!(what = %other, "unknown undo"),
                }
            }
            "EmojiReact" => {
                if let Some(object) = shape::get_string(&activity, "object") {
                    if originate(object) != self.server_name {
                        return Ok(());
                    }
                    let content = shape::get_string(&activity, "content").unwrap_or_default();
                    self.add_reaction(user, object, &who, content).await?;
                }
            }
            _ => {
                self.save_object(user, activity, &origin).await;
            }
        }
        Ok(())
    }

    async fn send_pong(&self, user: &User, who: &str, ping_id: &str) {
        let pong = serde_json::json!({
            "@context": AS2_CONTEXT,
            "type": "Pong",
            "id": format!("{}/pong/{}", user.url, random_xid()),
            "actor": user.url,
            "to": who,
            "object": ping_id,
        });
        self.delivery.enqueue(
            user.id,
            who.to_string(),
            serde_json::to_vec(&pong).unwrap_or_default(),
        );
    }

    /// Register a subscriber and answer with an Accept.
    async fn follow_me(&self, user: &User, who: &str, req: &Value) -> Result<(), AppError> {
        let folxid = shape::get_string(req, "id").unwrap_or_default();
        tracing::info!(%who, %folxid, "updating honker follow");
        let existing = self.db.contact_by_xid(user.id, who).await?;
        match existing {
            Some(contact)
                if matches!(contact.flavor, ContactFlavor::Dub | ContactFlavor::Undub) =>
            {
                tracing::info!(%who, "duplicate follow request");
                self.db
                    .update_contact_flavor(
                        user.id,
                        who,
                        &[ContactFlavor::Undub, ContactFlavor::Dub],
                        ContactFlavor::Dub,
                        folxid,
                    )
                    .await?;
            }
            _ => {
                let handle = self.resolver.handle(who).await;
                self.db
                    .save_contact(&Contact {
                        id: 0,
                        userid: user.id,
                        name: handle,
                        xid: who.to_string(),
                        flavor: ContactFlavor::Dub,
                        folxid: folxid.to_string(),
                    })
                    .await?;
            }
        }

        let accept = serde_json::json!({
            "@context": AS2_CONTEXT,
            "id": format!("{}/dub/{}", user.url, random_xid()),
            "type": "Accept",
            "actor": user.url,
            "to": who,
            "published": Utc::now().to_rfc3339(),
            "object": req,
        });
        self.delivery.enqueue(
            user.id,
            who.to_string(),
            serde_json::to_vec(&accept).unwrap_or_default(),
        );
        Ok(())
    }

    async fn unfollow_me(&self, user: &User, who: &str) -> Result<(), AppError> {
        tracing::info!(%who, "updating honker undo");
        self.db
            .update_contact_flavor(
                user.id,
                who,
                &[ContactFlavor::Dub],
                ContactFlavor::Undub,
                "",
            )
            .await?;
        Ok(())
    }

    async fn unfollow_me_by_folxid(&self, user: &User, folxid: &str) -> Result<(), AppError> {
        if let Some(contact) = self.db.contact_by_folxid(user.id, folxid).await? {
            self.unfollow_me(user, &contact.xid).await?;
        }
        Ok(())
    }

    /// Our outgoing follow was accepted: presub becomes sub.
    async fn accepted_follow(&self, user: &User, who: &str) -> Result<(), AppError> {
        tracing::info!(%who, "updating honker accept");
        let changed = self
            .db
            .update_contact_flavor(
                user.id,
                who,
                &[ContactFlavor::Presub, ContactFlavor::Sub],
                ContactFlavor::Sub,
                "",
            )
            .await?;
        if changed == 0 {
            tracing::error!(%who, "can't get honker name");
        }
        Ok(())
    }

    /// Our outgoing follow was rejected: presub or sub becomes unsub.
    async fn rejected_follow(&self, user: &User, who: &str) -> Result<(), AppError> {
        tracing::info!(%who, "updating honker reject");
        self.db
            .update_contact_flavor(
                user.id,
                who,
                &[ContactFlavor::Presub, ContactFlavor::Sub],
                ContactFlavor::Unsub,
                "",
            )
            .await?;
        Ok(())
    }

    /// Record an emoji reaction to one of our records.
    async fn add_reaction(
        &self,
        user: &User,
        object: &str,
        who: &str,
        content: &str,
    ) -> Result<(), AppError> {
        let Some(target) = self.db.record_by_xid(user.id, object).await? else {
            return Ok(());
        };
        self.db
            .set_record_flags(user.id, object, target.flags | flags::REACTED)
            .await?;
        let react = Record {
            userid: user.id,
            xid: format!("{}#react-{}", object, random_xid()),
            rid: object.to_string(),
            convoy: target.convoy.clone(),
            kind: RecordKind::React,
            honker: who.to_string(),
            audience: vec![user.url.clone()],
            noise: content::escape_plain(content),
            date: Utc::now(),
            ..Record::default()
        };
        self.db.save_record(&react).await?;
        Ok(())
    }

    /// Normalize an object (and whatever it drags in) into Records.
    pub async fn save_object(&self, user: &User, item: Value, origin: &str) -> Option<Record> {
        self.save_object_as(user, item, origin, false).await
    }

    /// As `save_object`, with `myown` marking collection imports of our
    /// own writing.
    pub async fn save_object_as(
        &self,
        user: &User,
        item: Value,
        origin: &str,
        myown: bool,
    ) -> Option<Record> {
        let filters = self.compiled_filters(user).await;
        let signer = decode_private_key(&user.private_key_pem)
            .ok()
            .map(|seckey| KeyInfo {
                keyname: user.keyname(),
                seckey,
            });
        let mut saver = Saver {
            inbound: self,
            user,
            signer,
            filters,
            depth: 0,
            going_up: 0,
            current_tid: String::new(),
        };
        let record = saver
            .save(item, origin.to_string(), false, String::new(), myown)
            .await;
        if let Some(record) = &record {
            // Warm the handle caches for display.
            for actor in [record.honker.clone(), record.oonker.clone()] {
                if !actor.is_empty() {
                    let resolver = self.resolver.clone();
                    tokio::spawn(async move {
                        resolver.handle(&actor).await;
                    });
                }
            }
        }
        record
    }

    /// Unknown activity types are logged and appended to a bounded
    /// debug file for later staring.
    fn dump_activity(&self, item: &Value) {
        use std::io::Write;
        let path = "saved_inbox.json";
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > MAX_DUMP_SIZE {
                return;
            }
        }
        let Ok(mut fd) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        else {
            tracing::error!("error opening inbox dump");
            return;
        };
        let _ = writeln!(fd, "{}", item);
    }
}

/// One normalization run; the depth counters live here.
struct Saver<'a> {
    inbound: &'a Inbound,
    user: &'a User,
    signer: Option<KeyInfo>,
    filters: Vec<CompiledFilter>,
    depth: usize,
    going_up: usize,
    current_tid: String,
}

impl<'a> Saver<'a> {
    fn db(&self) -> &Database {
        &self.inbound.db
    }

    fn reject_origin(&self, url: &str, is_announce: bool) -> bool {
        let origin = originate(url);
        self.filters.iter().any(|f| {
            f.reject
                && (f.is_announce == is_announce || !f.is_announce)
                && !f.actor.is_empty()
                && (f.actor == url || f.actor == origin)
        })
    }

    fn skip_media(&self, record: &Record) -> bool {
        self.filters
            .iter()
            .any(|f| f.skip_media && f.matches_record(record))
    }

    fn reject_record(&self, record: &Record) -> bool {
        self.filters
            .iter()
            .any(|f| f.reject && f.matches_record(record))
    }

    async fn need_record_id(&self, xid: &str, is_announce: bool) -> bool {
        if !xid.starts_with("https://") {
            return false;
        }
        if xid.starts_with(&format!("{}/", self.user.url)) {
            return false;
        }
        if self.reject_origin(xid, is_announce) {
            tracing::info!(%xid, "rejecting origin");
            return false;
        }
        if self.db().is_zonked(self.user.id, xid).await.unwrap_or(false) {
            tracing::info!(%xid, "already zonked");
            return false;
        }
        !matches!(self.db().record_by_xid(self.user.id, xid).await, Ok(Some(_)))
    }

    async fn eradicate(&self, xid: &str) {
        if let Ok(Some(_)) = self.db().record_by_xid(self.user.id, xid).await {
            if let Err(error) = self.db().delete_record(self.user.id, xid).await {
                tracing::error!(%error, "error eradicating");
                return;
            }
            if let Err(error) = self.db().save_zonk(self.user.id, xid).await {
                tracing::error!(%error, "error eradicating");
            }
        }
    }

    async fn save(
        &mut self,
        item: Value,
        origin: String,
        is_update: bool,
        bonker: String,
        myown: bool,
    ) -> Option<Record> {
        self.save_boxed(item, origin, is_update, bonker, myown).await
    }

    fn save_boxed<'b>(
        &'b mut self,
        item: Value,
        origin: String,
        is_update: bool,
        bonker: String,
        myown: bool,
    ) -> futures::future::BoxFuture<'b, Option<Record>>
    where
        'a: 'b,
    {
        use futures::FutureExt;
        self.save_inner(item, origin, is_update, bonker, myown)
            .boxed()
    }

    /// Fetch an ancestor or referenced reply and run it through the
    /// saver, bounded by depth.
    async fn save_one_more(&mut self, xid: &str) {
        tracing::debug!(%xid, "getting onemore");
        if self.depth >= MAX_DEPTH {
            tracing::info!(%xid, "in too deep");
            return;
        }
        let fetched = match self
            .inbound
            .fetcher
            .get_json_hard(self.signer.as_ref(), xid)
            .await
        {
            Ok(fetched) => fetched,
            Err(error) => {
                tracing::info!(%xid, %error, "error getting onemore");
                return;
            }
        };
        let origin = originate(xid);
        self.save((*fetched.value).clone(), origin, false, String::new(), false)
            .await;
    }

    /// Expand recognized quote links into trailing blockquotes.
    async fn qutify(&mut self, quote_url: &str, mut noise: String) -> String {
        if self.depth >= MAX_DEPTH {
            tracing::info!("in too deep");
            return noise;
        }
        for link in content::find_quote_links(&noise, quote_url) {
            tracing::debug!(from = %link, "trying to get a quote");
            let mut prefix = String::new();
            if link == quote_url {
                prefix = format!(r#"<p><a href="{}">{}</a>"#, link, link);
            }
            if let Ok(Some(existing)) = self.db().record_by_xid(self.user.id, &link).await {
                tracing::debug!(xid = %link, "already had it");
                noise = format!("{}{}<blockquote>{}</blockquote>", noise, prefix, existing.noise);
                continue;
            }
            let fetched = match self
                .inbound
                .fetcher
                .get_json(self.signer.as_ref(), &link, self.inbound.fetcher.fast_timeout())
                .await
            {
                Ok(fetched) => fetched,
                Err(error) => {
                    tracing::debug!(%error, "unable to fetch quote");
                    continue;
                }
            };
            match shape::get_string(&fetched.value, "content") {
                Some(quoted) => {
                    noise = format!(
                        "{}{}<blockquote>{}</blockquote>",
                        noise,
                        prefix,
                        content::sanitize(quoted)
                    );
                }
                None => tracing::debug!("apparently no content"),
            }
            // Save the quoted object, but never expand its own quotes.
            let prev_depth = self.depth;
            self.depth = MAX_DEPTH;
            let origin = originate(&fetched.final_url);
            self.save(
                (*fetched.value).clone(),
                origin,
                false,
                String::new(),
                false,
            )
            .await;
            self.depth = prev_depth;
        }
        noise
    }

    /// Localize an attachment if allowed, or keep it as a reference.
    async fn save_attachment(
        &self,
        url: &str,
        name: &str,
        desc: &str,
        media: &str,
        localize: bool,
    ) -> Option<Attachment> {
        if url.is_empty() {
            return None;
        }
        if let Ok(Some(existing)) = self.db().find_file_by_url(url).await {
            return Some(existing);
        }
        tracing::info!(%url, "saving attachment");

        let mut media = media.to_string();
        let mut data: Option<Arc<Vec<u8>>> = None;
        let mut meta = FileMeta::default();
        let mut localize = localize;
        if localize {
            match self.inbound.fetcher.get_bytes(url).await {
                Ok(bytes) => {
                    if bytes.len() == MAX_FETCH_SIZE {
                        tracing::info!("truncation likely");
                    }
                    if media.starts_with("image") {
                        meta.length = bytes.len() as i64;
                        data = Some(bytes);
                    } else if media == "application/pdf" {
                        if bytes.len() > MAX_PDF_SIZE {
                            tracing::info!("not saving large pdf");
                            localize = false;
                        } else {
                            meta.length = bytes.len() as i64;
                            data = Some(bytes);
                        }
                    } else if bytes.len() > MAX_MISC_SIZE {
                        tracing::info!("not saving large attachment");
                        localize = false;
                    } else {
                        meta.length = bytes.len() as i64;
                        data = Some(bytes);
                    }
                }
                Err(error) => {
                    tracing::info!(%url, %error, "error fetching attachment");
                    localize = false;
                }
            }
        }
        if media.is_empty() {
            media = "image".to_string();
        }

        match self
            .db()
            .save_file(
                &random_xid(),
                name,
                desc,
                url,
                &media,
                localize && data.is_some(),
                data.as_ref().map(|d| d.as_slice()),
                meta,
            )
            .await
        {
            Ok(attachment) => Some(attachment),
            Err(error) => {
                tracing::error!(%url, %error, "error saving file");
                None
            }
        }
    }

    async fn save_inner(
        &mut self,
        item: Value,
        origin: String,
        is_update: bool,
        bonker: String,
        myown: bool,
    ) -> Option<Record> {
        let mut origin = origin;
        let mut is_update = is_update;
        let mut bonker = bonker;

        let id = shape::get_string(&item, "id").unwrap_or_default().to_string();
        let typ = shape::first_of_many(&item, "type")
            .unwrap_or_default()
            .to_string();
        let mut dt = shape::get_string(&item, "published")
            .unwrap_or_default()
            .to_string();
        if dt.is_empty() {
            dt = Utc::now().to_rfc3339();
        }

        if self.depth >= MAX_RECURSION {
            tracing::info!("went too deep in saver");
            return None;
        }
        self.depth += 1;
        let result = self
            .dispatch(item, &mut origin, &mut is_update, &mut bonker, myown, id, typ, dt)
            .await;
        self.depth -= 1;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &mut self,
        item: Value,
        origin: &mut String,
        is_update: &mut bool,
        bonker: &mut String,
        myown: bool,
        id: String,
        typ: String,
        dt: String,
    ) -> Option<Record> {
        let mut what = typ.as_str();
        let mut xid = String::new();
        let mut obj: Option<Value> = None;
        let mut was_page = false;
        let mut prefer_orig = false;

        match what {
            "Delete" => {
                let xid = shape::string_or_id(&item, "object").unwrap_or_default();
                if xid.is_empty() {
                    return None;
                }
                if originate(xid) != *origin {
                    tracing::info!(%xid, %origin, "forged delete");
                    return None;
                }
                tracing::info!(%xid, "eradicating");
                self.eradicate(xid).await;
                return None;
            }
            "Tombstone" => {
                let xid = shape::get_string(&item, "id").unwrap_or_default();
                if xid.is_empty() {
                    return None;
                }
                if originate(xid) != *origin {
                    tracing::info!(%xid, %origin, "forged delete");
                    return None;
                }
                tracing::info!(%xid, "eradicating");
                self.eradicate(xid).await;
                return None;
            }
            "Remove" => {
                let xid = shape::string_or_id(&item, "object").unwrap_or_default();
                let target = shape::get_string(&item, "target").unwrap_or_default();
                tracing::info!(%xid, %target, "remove");
                return None;
            }
            "Announce" => {
                let mut inner = None;
                if let Some(wrapped) = shape::get_map(&item, "object") {
                    // Peek ahead some: announced Creates and Updates
                    // unwrap to the object inside.
                    let mut wrapped = wrapped.clone();
                    let inner_type = shape::first_of_many(&wrapped, "type").unwrap_or_default();
                    if inner_type == "Create" || inner_type == "Update" {
                        if inner_type == "Update" {
                            *is_update = true;
                        }
                        if let Some(nested) = shape::get_map(&wrapped, "object") {
                            wrapped = nested.clone();
                        } else {
                            xid = shape::get_string(&wrapped, "object")
                                .unwrap_or_default()
                                .to_string();
                        }
                    }
                    if xid.is_empty() {
                        xid = shape::get_string(&wrapped, "id")
                            .unwrap_or_default()
                            .to_string();
                    }
                    inner = Some(wrapped);
                } else {
                    xid = shape::get_string(&item, "object")
                        .unwrap_or_default()
                        .to_string();
                }
                if !*is_update && !self.need_record_id(&xid, true).await {
                    return None;
                }
                *bonker = shape::get_string(&item, "actor")
                    .unwrap_or_default()
                    .to_string();
                if originate(bonker) != *origin {
                    tracing::info!(who = %bonker, %origin, "out of bounds actor in bonk");
                    return None;
                }
                *origin = originate(&xid);
                let announced = if inner.is_some() && originate(&id) == *origin {
                    tracing::debug!(%xid, "using object in announce");
                    inner.unwrap_or_default()
                } else {
                    tracing::debug!(%xid, "getting bonk");
                    match self
                        .inbound
                        .fetcher
                        .get_json_hard(self.signer.as_ref(), &xid)
                        .await
                    {
                        Ok(fetched) => (*fetched.value).clone(),
                        Err(error) => {
                            tracing::info!(%xid, %error, "error getting bonk");
                            return None;
                        }
                    }
                };
                let origin = origin.clone();
                let bonker = bonker.clone();
                return self
                    .save_boxed(announced, origin, *is_update, bonker, false)
                    .await;
            }
            "Update" | "Create" => {
                if what == "Update" {
                    *is_update = true;
                }
                let inner = match shape::get_map(&item, "object") {
                    Some(inner) => inner.clone(),
                    None => {
                        let xid = shape::get_string(&item, "object").unwrap_or_default();
                        tracing::debug!(%xid, "getting created record");
                        if originate(xid) != *origin {
                            tracing::info!(%xid, %origin, "out of bounds object in create");
                            return None;
                        }
                        match self
                            .inbound
                            .fetcher
                            .get_json_hard(self.signer.as_ref(), xid)
                            .await
                        {
                            Ok(fetched) => (*fetched.value).clone(),
                            Err(error) => {
                                tracing::info!(%error, "error getting creation");
                                return None;
                            }
                        }
                    }
                };
                let origin = origin.clone();
                let bonker = bonker.clone();
                return self
                    .save_boxed(inner, origin, *is_update, bonker, myown)
                    .await;
            }
            "Read" | "Add" => {
                if let Some(xid) = shape::get_string(&item, "object") {
                    if !self.need_record_id(xid, false).await {
                        tracing::debug!(%xid, "don't need referenced obj");
                        return None;
                    }
                    let fetched = match self
                        .inbound
                        .fetcher
                        .get_json_hard(self.signer.as_ref(), xid)
                        .await
                    {
                        Ok(fetched) => fetched,
                        Err(error) => {
                            tracing::info!(%error, "error getting referenced obj");
                            return None;
                        }
                    };
                    let origin = originate(xid);
                    return self
                        .save_boxed((*fetched.value).clone(), origin, false, String::new(), false)
                        .await;
                }
                return None;
            }
            "Move" => {
                obj = Some(item.clone());
                what = "move";
            }
            "Page" | "Audio" | "Video" | "Image" | "Question" | "Commit" | "Article" | "Note" => {
                if what == "Page" {
                    was_page = true;
                }
                if what == "Image" || what == "Video" {
                    prefer_orig = true;
                }
                obj = Some(item.clone());
                what = "honk";
            }
            "Event" => {
                obj = Some(item.clone());
                what = "event";
            }
            "ChatMessage" => {
                bonker.clear();
                obj = Some(item.clone());
                what = "chonk";
            }
            "Like" | "Dislike" => return None,
            unknown => {
                tracing::info!(what = %unknown, "unknown activity");
                self.inbound.dump_activity(&item);
                return None;
            }
        }

        let mut kind = match what {
            "event" => RecordKind::Event,
            "chonk" => RecordKind::Chonk,
            "move" => RecordKind::Move,
            _ => RecordKind::Honk,
        };
        if !bonker.is_empty() {
            kind = RecordKind::Bonk;
        }

        if let Some(obj) = &obj {
            if let Some(found) = shape::get_string(obj, "id") {
                xid = found.to_string();
            }
        }
        if xid.is_empty() {
            tracing::info!("don't know what xid is");
            return None;
        }
        if originate(&xid) != *origin {
            if !self.inbound.config.devel && !origin.is_empty() {
                tracing::info!(%xid, %origin, "original sin");
                return None;
            }
        }

        let mut record = Record {
            userid: self.user.id,
            xid: xid.clone(),
            kind,
            date: DateTime::parse_from_rfc3339(&dt)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            ..Record::default()
        };
        record.honker = shape::get_string(&item, "actor").unwrap_or_default().to_string();
        if record.honker.is_empty() {
            record.honker = shape::extract_attributed_to(&item).unwrap_or_default();
        }
        if myown && record.honker != self.user.url {
            tracing::info!(honker = %record.honker, user = %self.user.url, "not allowing local impersonation");
            return None;
        }
        if originate(&record.honker) != *origin {
            tracing::info!(honker = %record.honker, %origin, "out of bounds honker");
            return None;
        }

        let obj = obj.unwrap_or_default();
        if record.honker.is_empty() {
            record.honker = shape::extract_attributed_to(&obj).unwrap_or_default();
        }
        if !bonker.is_empty() {
            record.oonker = std::mem::replace(&mut record.honker, bonker.clone());
        }
        if record.oonker == record.honker {
            record.oonker.clear();
        }
        let mut audience = Vec::new();
        shape::collect_addresses(&obj, &mut audience);
        audience.push(record.honker.clone());
        let mut audience = one_of_a_kind(audience);
        for a in audience.iter_mut() {
            if a == TINY_WORLD {
                *a = THE_WHOLE_WORLD.to_string();
            }
        }
        record.public = loud_and_proud(&audience);
        record.audience = audience;

        // Content coalescing.
        let object_type = shape::first_of_many(&obj, "type").unwrap_or_default().to_string();
        let mut url = shape::get_string(&obj, "url").unwrap_or_default().to_string();
        if let Some(published) = shape::get_string(&obj, "published") {
            record.date = DateTime::parse_from_rfc3339(published)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(record.date);
        }
        let mut noise = shape::get_string(&obj, "content").unwrap_or_default().to_string();
        if shape::get_string(&obj, "mediaType") == Some("text/plain") {
            if typ == "Commit" {
                noise = content::highlight_diff(&noise);
            } else {
                noise = content::escape_plain(&noise);
            }
        } else {
            noise = content::sanitize(&noise);
        }
        noise = content::ensure_paragraph(noise);
        if let Some(desc) = shape::get_map(&obj, "description") {
            let mut extra = shape::get_string(desc, "content").unwrap_or_default().to_string();
            if shape::get_string(desc, "mediaType") == Some("text/plain") {
                extra = content::escape_plain(&extra);
            } else {
                extra = content::sanitize(&extra);
            }
            noise = content::ensure_paragraph(format!("{}{}", extra, noise));
        }
        let mut precis = shape::get_string(&obj, "summary").unwrap_or_default().to_string();
        if let Some(name) = shape::get_string(&obj, "name") {
            if !precis.is_empty() {
                noise = format!("{}<p>{}", precis, noise);
            }
            precis = content::escape_plain(name);
        }
        if obj.get("sensitive").and_then(Value::as_bool).unwrap_or(false) && precis.is_empty() {
            precis = "unspecified horror".to_string();
        }
        if was_page && !url.is_empty() {
            noise = format!(r#"{}<p><a href="{}">{}</a>"#, noise, url, url);
            url = xid.clone();
        }
        if self.user.options.inline_quotes {
            let quote_url = shape::get_string(&obj, "quoteUrl").unwrap_or_default().to_string();
            noise = self.qutify(&quote_url, noise).await;
        }
        record.rid = shape::string_or_id(&obj, "inReplyTo").unwrap_or_default().to_string();
        record.convoy = shape::get_string(&obj, "context")
            .or_else(|| shape::get_string(&obj, "conversation"))
            .unwrap_or_default()
            .to_string();
        if object_type == "Question" {
            if record.kind == RecordKind::Honk {
                record.kind = RecordKind::Qonk;
            }
            noise = content::append_poll_choices(noise, &obj);
        }
        if object_type == "Move" {
            let target = shape::get_string(&obj, "target").unwrap_or_default();
            let escaped = content::escape_plain(target);
            noise = format!(r#"{}<p>Moved to <a href="{}">{}</a>"#, noise, escaped, escaped);
        }
        if noise.len() > MAX_NOISE {
            tracing::info!("content too long. truncating");
            noise.truncate(MAX_NOISE);
        }
        record.noise = noise;
        record.precis = precis;
        if self.reject_record(&record) {
            tracing::debug!(%xid, "fast reject");
            return None;
        }

        // Attachments.
        let skip_media = self.skip_media(&record);
        let mut num_atts = 0usize;
        let mut attachments: Vec<Attachment> = Vec::new();
        let mut trailing_links = String::new();

        {
            let mut process_attachment = |att: &Value| -> Option<(String, String, String, String, bool)> {
                let at = shape::get_string(att, "type").unwrap_or_default().to_string();
                let mut media = shape::get_string(att, "mediaType").unwrap_or_default().to_string();
                let mut u = shape::get_string(att, "url")
                    .or_else(|| shape::get_string(att, "href"))
                    .unwrap_or_default()
                    .to_string();
                if u.is_empty() {
                    match att.get("url") {
                        Some(Value::Array(items)) => {
                            // Alternative links; choose by media type
                            // priority.
                            let mut priority = -1i32;
                            for item in items {
                                match item {
                                    Value::String(s) => {
                                        if u.is_empty() {
                                            u = s.clone();
                                        }
                                    }
                                    Value::Object(_) => {
                                        let m = shape::get_string(item, "mediaType").unwrap_or_default();
                                        let p = match m {
                                            "image/jpeg" => 1,
                                            "image/avif" if self.inbound.config.accept_avif => 2,
                                            _ => 0,
                                        };
                                        if p > priority {
                                            priority = p;
                                            u = shape::get_string(item, "href").unwrap_or_default().to_string();
                                            media = m.to_string();
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Some(inner @ Value::Object(_)) => {
                            u = shape::get_string(inner, "href").unwrap_or_default().to_string();
                            if media.is_empty() {
                                media = shape::get_string(inner, "mediaType").unwrap_or_default().to_string();
                            }
                        }
                        _ => {}
                    }
                }
                let name = shape::get_string(att, "name").unwrap_or_default().to_string();
                let mut desc = html_escape::decode_html_entities(
                    shape::get_string(att, "summary").unwrap_or_default(),
                )
                .into_owned();
                if desc.is_empty() {
                    desc = name.clone();
                }
                let mut localize = false;
                if at == "Document" || at == "Image" {
                    media = media.to_ascii_lowercase();
                    tracing::debug!(%media, url = %u, "attachment");
                    if media == "text/plain"
                        || media == "application/pdf"
                        || media.starts_with("image")
                    {
                        if num_atts >= MAX_LOCALIZED_ATTACHMENTS {
                            tracing::info!(kind = %at, "excessive attachment");
                        } else {
                            localize = true;
                        }
                    }
                } else if at == "Link" {
                    if was_page {
                        trailing_links
                            .push_str(&format!(r#"<p><a href="{}">{}</a>"#, u, u));
                        return None;
                    }
                    if u == id {
                        return None;
                    }
                } else {
                    tracing::info!(kind = %at, "unknown attachment");
                }
                if skip_media {
                    localize = false;
                }
                num_atts += 1;
                Some((u, name, desc, media, localize))
            };

            let mut candidates: Vec<(String, String, String, String, bool)> = Vec::new();
            if let Some(img) = shape::get_map(&obj, "image") {
                candidates.extend(process_attachment(img));
            }
            let mut used_orig = false;
            if prefer_orig {
                if let Some(Value::Array(urls)) = obj.get("url") {
                    for att in urls {
                        if !att.is_object() {
                            tracing::info!("attachment that wasn't map?");
                            continue;
                        }
                        candidates.extend(process_attachment(att));
                    }
                }
                used_orig = !candidates.is_empty();
            }
            if !used_orig {
                for att in shape::one_for_all(&obj, "attachment") {
                    if !att.is_object() {
                        tracing::info!("attachment that wasn't map?");
                        continue;
                    }
                    candidates.extend(process_attachment(att));
                }
            }
            drop(process_attachment);

            for (u, name, desc, media, localize) in candidates {
                if let Some(att) = self.save_attachment(&u, &name, &desc, &media, localize).await {
                    attachments.push(att);
                }
            }
        }
        record.noise.push_str(&trailing_links);

        // Tags.
        let mut mentions: Vec<Mention> = Vec::new();
        for tag in shape::one_for_all(&obj, "tag") {
            let tt = shape::get_string(tag, "type").unwrap_or_default();
            let name = shape::get_string(tag, "name").unwrap_or_default().to_string();
            let mut desc = html_escape::decode_html_entities(
                shape::get_string(tag, "summary").unwrap_or_default(),
            )
            .into_owned();
            if desc.is_empty() {
                desc = name.clone();
            }
            match tt {
                "Emoji" => {
                    if let Some(icon) = shape::get_map(tag, "icon") {
                        let media = shape::get_string(icon, "mediaType").unwrap_or("image/png");
                        let u = shape::get_string(icon, "url").unwrap_or_default();
                        if let Some(att) =
                            self.save_attachment(u, &name, &desc, media, !skip_media).await
                        {
                            attachments.push(att);
                        }
                    }
                }
                "Hashtag" => {
                    if name.is_empty() || name == "#" {
                        // skip it
                    } else {
                        let name = name.to_lowercase();
                        let name = if name.starts_with('#') {
                            name
                        } else {
                            format!("#{}", name)
                        };
                        record.onties.push(name);
                    }
                }
                "Place" => {
                    record.place = Some(Place {
                        name,
                        latitude: tag.get("latitude").and_then(Value::as_f64).unwrap_or(0.0),
                        longitude: tag.get("longitude").and_then(Value::as_f64).unwrap_or(0.0),
                        url: shape::get_string(tag, "url").unwrap_or_default().to_string(),
                    });
                }
                "Mention" => {
                    let mut m = Mention {
                        handle: name,
                        xid: shape::get_string(tag, "href").unwrap_or_default().to_string(),
                    };
                    if m.handle.is_empty() {
                        m.handle = m.xid.clone();
                    }
                    if !m.xid.is_empty() {
                        mentions.push(m);
                    }
                }
                _ => {}
            }
        }
        record.onties = one_of_a_kind(std::mem::take(&mut record.onties));

        if let Some(start) = shape::get_string(&obj, "startTime") {
            if let Ok(start) = DateTime::parse_from_rfc3339(start) {
                let end = shape::get_string(&obj, "endTime")
                    .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
                    .map(|e| e.with_timezone(&Utc));
                let duration_secs = shape::get_string(&obj, "duration")
                    .and_then(parse_iso_duration)
                    .unwrap_or(0);
                record.time = Some(TimeWindow {
                    start: start.with_timezone(&Utc),
                    end,
                    duration_secs,
                });
            }
        }
        if let Some(location) = shape::get_map(&obj, "location") {
            if shape::get_string(location, "type") == Some("Place") {
                record.place = Some(Place {
                    name: shape::get_string(location, "name").unwrap_or_default().to_string(),
                    latitude: location.get("latitude").and_then(Value::as_f64).unwrap_or(0.0),
                    longitude: location
                        .get("longitude")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                    url: shape::get_string(location, "url").unwrap_or_default().to_string(),
                });
            }
        }

        // Child replies referenced by the object.
        let mut replies: Vec<String> = Vec::new();
        if let Some(replyobj) = shape::get_map(&obj, "replies") {
            let items = match replyobj.get("items") {
                Some(Value::Array(items)) => items.clone(),
                _ => shape::get_map(replyobj, "first")
                    .and_then(|first| first.get("items"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            };
            for repl in items {
                if let Value::String(s) = repl {
                    replies.push(s);
                }
            }
        }

        if self.current_tid.is_empty() {
            self.current_tid = record.convoy.clone();
        }

        record.mentions = mentions;
        record.attachments = attachments;
        if originate(&url) == originate(&record.xid) {
            record.url = url;
        }
        if myown {
            record.whofore = if record.public {
                Whofore::Public
            } else {
                Whofore::Private
            };
        } else if record.mentions.iter().any(|m| m.xid == self.user.url) {
            record.whofore = Whofore::AtMe;
        }

        if record.kind == RecordKind::Chonk {
            return self.save_chonk(&obj, record).await;
        }

        if *is_update {
            tracing::debug!(xid = %record.xid, "something has changed!");
            match self.db().record_by_xid(self.user.id, &record.xid).await {
                Ok(Some(prev)) => {
                    record.id = prev.id;
                    if let Err(error) = self.db().update_record(&record).await {
                        tracing::error!(%error, "error updating record");
                    }
                    return Some(record);
                }
                _ => {
                    tracing::info!(xid = %record.xid, "didn't find old version for update");
                    *is_update = false;
                }
            }
        }

        if !*is_update
            && (myown
                || (!self.reject_record(&record)
                    && self.need_record_id(&record.xid, false).await))
        {
            if !record.rid.is_empty() && record.public {
                if self.need_record_id(&record.rid, false).await {
                    self.going_up += 1;
                    let rid = record.rid.clone();
                    self.save_one_more(&rid).await;
                    self.going_up -= 1;
                }
                if record.convoy.is_empty() {
                    if let Ok(Some(parent)) =
                        self.db().record_by_xid(self.user.id, &record.rid).await
                    {
                        record.convoy = parent.convoy;
                    }
                }
            }
            if record.convoy.is_empty() {
                record.convoy = self.current_tid.clone();
            }
            if record.convoy.is_empty() {
                record.convoy = record.xid.clone();
                self.current_tid = record.convoy.clone();
            }
            tracing::info!(xid = %record.xid, "saving record");
            match self.db().save_record(&record).await {
                Ok(id) => {
                    record.id = id;
                    self.maybe_auto_ack(&record).await;
                }
                Err(error) => {
                    tracing::error!(%error, "error saving record");
                    return None;
                }
            }
        }

        if self.going_up == 0 {
            let replies = {
                let mut needed = Vec::new();
                for replid in &replies {
                    if self.need_record_id(replid, false).await {
                        tracing::debug!(%replid, "missing a reply");
                        needed.push(replid.clone());
                    }
                }
                needed
            };
            for replid in replies {
                self.save_one_more(&replid).await;
            }
        }

        Some(record)
    }

    /// Direct messages bypass the feed entirely.
    async fn save_chonk(&mut self, obj: &Value, record: Record) -> Option<Record> {
        // Undo the paragraph damage above.
        let mut noise = record.noise.as_str();
        noise = noise.strip_prefix("<p>").unwrap_or(noise);
        noise = noise.strip_suffix("</p>").unwrap_or(noise);
        let mut noise = noise.to_string();
        let mut target = shape::first_of_many(obj, "to").unwrap_or_default().to_string();
        if target == self.user.url {
            target = record.honker.clone();
        }
        if shape::get_string(obj, CHAT_KEY_PROP).is_some() {
            if let Some(peer_key) = self.inbound.resolver.chat_key(&record.honker).await {
                match crate::chat::secret_from_b64(&self.user.options.chat_seckey)
                    .and_then(|sec| crate::chat::decrypt_string(&noise, &sec, &peer_key))
                {
                    Ok(plain) => {
                        tracing::debug!(from = %record.honker, "successful decrypt");
                        noise = plain;
                    }
                    Err(_) => tracing::info!("failed to decrypt chonk"),
                }
            }
        }
        let chonk = Chonk {
            id: 0,
            userid: record.userid,
            xid: record.xid.clone(),
            who: record.honker.clone(),
            target,
            date: record.date,
            noise,
            attachments: record.attachments.clone(),
        };
        if let Err(error) = self.db().save_chonk(&chonk).await {
            tracing::error!(%error, "error saving chonk");
        }
        None
    }

    /// Acknowledge a reply to one of our records, when enabled.
    async fn maybe_auto_ack(&self, record: &Record) {
        if !self.user.options.auto_ack || record.rid.is_empty() {
            return;
        }
        let Ok(Some(parent)) = self.db().record_by_xid(self.user.id, &record.rid).await else {
            return;
        };
        if parent.honker != self.user.url {
            return;
        }
        let ack = serde_json::json!({
            "@context": AS2_CONTEXT,
            "id": format!("{}/ack/{}", self.user.url, super::short_xid(&record.xid)),
            "type": "Read",
            "actor": self.user.url,
            "to": record.honker,
            "object": record.xid,
            "published": Utc::now().to_rfc3339(),
        });
        self.inbound.delivery.enqueue(
            self.user.id,
            record.honker.clone(),
            serde_json::to_vec(&ack).unwrap_or_default(),
        );
    }
}

/// `PT5M`-style durations to seconds; only the simple forms.
fn parse_iso_duration(raw: &str) -> Option<i64> {
    let rest = raw.strip_prefix("PT")?;
    let mut total = 0i64;
    let mut number = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let n: i64 = number.parse().ok()?;
            number.clear();
            total += match c.to_ascii_uppercase() {
                'H' => n * 3600,
                'M' => n * 60,
                'S' => n,
                _ => return None,
            };
        }
    }
    Some(total)
}
