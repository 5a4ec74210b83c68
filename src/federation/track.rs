//! Back-tracker
//!
//! Samples which peers fetch our records so Updates can be pushed back
//! to them later. Observations buffer in memory and flush to the store
//! every few minutes, on demand before a read, and at shutdown.

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::data::Database;

const FLUSH_INTERVAL: Duration = Duration::from_secs(4 * 60);

lazy_static! {
    static ref RE_KEYHOLDER: Regex = Regex::new(r#"keyId="([^"]+)""#).expect("regex");
}

/// The actor named by a request's Signature header, if any.
pub fn request_actor(headers: &http::HeaderMap) -> Option<String> {
    let signature = headers.get("signature")?.to_str().ok()?;
    RE_KEYHOLDER
        .captures(signature)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

struct Observation {
    xid: String,
    who: String,
}

enum Command {
    Track(Observation),
    Dump(oneshot::Sender<()>),
}

/// Fetch sampler handle
#[derive(Clone)]
pub struct Tracker {
    tx: mpsc::Sender<Command>,
}

impl Tracker {
    /// Spawn the sampler task. It drains to the store on the flush
    /// interval, on dump requests, and when shutdown is signalled.
    pub fn spawn(db: Arc<Database>, mut shutdown: watch::Receiver<bool>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(16);
        tokio::spawn(async move {
            let mut pending: Vec<Observation> = Vec::new();
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(Command::Track(obs)) => pending.push(obs),
                        Some(Command::Dump(done)) => {
                            flush(&db, &mut pending).await;
                            let _ = done.send(());
                        }
                        None => {
                            flush(&db, &mut pending).await;
                            return;
                        }
                    },
                    _ = ticker.tick() => flush(&db, &mut pending).await,
                    _ = shutdown.changed() => {
                        flush(&db, &mut pending).await;
                        return;
                    }
                }
            }
        });
        Self { tx }
    }

    /// Record that `who` fetched `xid`. Observations are best-effort;
    /// a full buffer drops them.
    pub fn track(&self, xid: &str, headers: &http::HeaderMap) {
        if let Some(who) = request_actor(headers) {
            let _ = self.tx.try_send(Command::Track(Observation {
                xid: xid.to_string(),
                who,
            }));
        }
    }

    /// Flush buffered observations so a subsequent read sees them.
    pub async fn dump(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Dump(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Peers that previously fetched `xid`, as delivery recipients.
    /// Key fragments are stripped; bare hostnames become shared-inbox
    /// URLs with the `%` already-resolved marker.
    pub async fn backtracks(&self, db: &Database, xid: &str) -> Vec<String> {
        self.dump().await;
        let Ok(Some(raw)) = db.tracks_for(xid).await else {
            return Vec::new();
        };
        raw.split(' ')
            .filter(|f| !f.is_empty())
            .map(|f| {
                let f = match f.rfind('#') {
                    Some(idx) => &f[..idx],
                    None => f,
                };
                if f.starts_with("https://") {
                    f.to_string()
                } else {
                    format!("%https://{}/inbox", f)
                }
            })
            .collect()
    }
}

async fn flush(db: &Database, pending: &mut Vec<Observation>) {
    if pending.is_empty() {
        return;
    }
    let mut by_xid: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for obs in pending.drain(..) {
        by_xid.entry(obs.xid).or_default().push(obs.who);
    }
    let mut count = 0;
    for (xid, who) in by_xid {
        count += who.len();
        if let Err(error) = db.merge_tracks(&xid, &who).await {
            tracing::error!(%error, "savetracks error");
        }
    }
    tracing::debug!(count, "saved fetches");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with_signature(keyname: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!(
                r#"keyId="{}",algorithm="rsa-sha256",headers="date",signature="eA==""#,
                keyname
            ))
            .unwrap(),
        );
        headers
    }

    #[test]
    fn request_actor_extracts_key_id() {
        let headers = headers_with_signature("https://remote.example/u/bob#key");
        assert_eq!(
            request_actor(&headers).as_deref(),
            Some("https://remote.example/u/bob#key")
        );
        assert_eq!(request_actor(&http::HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn tracked_fetches_surface_in_backtracks() {
        let db = Arc::new(Database::connect_memory().await.expect("db"));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = Tracker::spawn(db.clone(), shutdown_rx);

        let headers = headers_with_signature("https://remote.example/u/bob#key");
        tracker.track("https://local.example/u/alice/h/X1", &headers);
        tracker.track("https://local.example/u/alice/h/X1", &headers);

        let rcpts = tracker
            .backtracks(&db, "https://local.example/u/alice/h/X1")
            .await;
        // Fragment stripped, deduplicated.
        assert_eq!(rcpts, vec!["https://remote.example/u/bob"]);
    }

    #[tokio::test]
    async fn bare_hostname_tracks_become_shared_inboxes() {
        let db = Arc::new(Database::connect_memory().await.expect("db"));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = Tracker::spawn(db.clone(), shutdown_rx);

        db.merge_tracks("xid", &["peer.example".to_string()])
            .await
            .unwrap();
        let rcpts = tracker.backtracks(&db, "xid").await;
        assert_eq!(rcpts, vec!["%https://peer.example/inbox"]);
    }
}
