//! Activity delivery
//!
//! Signed POSTs to peer inboxes with a retry queue behind them.
//! Messages to a recipient are delivered strictly in enqueue order; a
//! down peer accumulates its backlog in a single pending row which is
//! retried on an exponential schedule and abandoned after a capped
//! number of tries.

use chrono::Utc;
use lru::LruCache;
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};

use crate::config::FederationConfig;
use crate::data::{Database, Delivery, KeyInfo, UserId};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_PENDING, DELIVERIES_TOTAL};

use super::identity::Resolver;
use super::limiter::KeyedLimiter;
use super::signature::{decode_private_key, sign_request_gated};
use super::AS2_CONTENT_TYPE;

/// Tries value meaning "retry tomorrow, then give up soon"
pub const NEARLY_DEAD: i64 = 15;
/// No retry happens past this many tries
pub const MAX_TRIES: i64 = 16;
/// Pause between messages of a coalesced batch
const BATCH_GAP: Duration = Duration::from_secs(2);
/// Scheduler poll interval
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of a single POST
enum PostError {
    /// HTTP status that is not success
    Status(u16),
    /// Network-level failure
    Net(String),
}

impl PostError {
    /// 400/422 means the peer understood us and said no; drop that
    /// message and continue with the rest of the batch.
    fn let_it_slide(&self) -> bool {
        matches!(self, Self::Status(400) | Self::Status(422))
    }

    /// A hostname that does not resolve is as good as dead; skip the
    /// early retry slots.
    fn lethal_dose(&self) -> i64 {
        match self {
            Self::Net(message)
                if message.contains("no such host") || message.contains("dns error") =>
            {
                NEARLY_DEAD
            }
            _ => 0,
        }
    }
}

impl std::fmt::Display for PostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(code) => write!(f, "http post status: {code}"),
            Self::Net(message) => write!(f, "{message}"),
        }
    }
}

/// The retry schedule: minutes at first, then hours, then half-days,
/// then the grave. `tries` is the count after the failing attempt.
pub fn retry_delay(tries: i64) -> Option<Duration> {
    match tries {
        i64::MIN..=3 => Some(Duration::from_secs(tries.max(1) as u64 * 5 * 60)),
        4..=6 => Some(Duration::from_secs((tries as u64 - 3) * 3600)),
        7..=MAX_TRIES => Some(Duration::from_secs(12 * 3600)),
        _ => None,
    }
}

/// Delivery engine
pub struct DeliveryEngine {
    db: Arc<Database>,
    resolver: Arc<Resolver>,
    client: reqwest::Client,
    config: FederationConfig,
    user_agent: String,
    /// Global fan-out cap with per-recipient serialization
    garage: KeyedLimiter,
    /// Guards the append-or-create check and due-row extraction
    queue_mutex: Mutex<()>,
    wake: Notify,
    keys: StdMutex<LruCache<UserId, Option<KeyInfo>>>,
}

impl DeliveryEngine {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<Resolver>,
        config: FederationConfig,
        server_name: &str,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .connect_timeout(config.fast_timeout())
            .build()?;
        let garage = KeyedLimiter::new(config.max_deliveries);
        Ok(Self {
            db,
            resolver,
            client,
            config,
            user_agent: format!("gaggle/0.1; {}", server_name),
            garage,
            queue_mutex: Mutex::new(()),
            wake: Notify::new(),
            keys: StdMutex::new(LruCache::new(NonZeroUsize::new(64).expect("nonzero"))),
        })
    }

    async fn key_for(&self, userid: UserId) -> Option<KeyInfo> {
        if let Some(cached) = self.keys.lock().expect("key cache poisoned").get(&userid) {
            return cached.clone();
        }
        let loaded = match self.db.user_by_id(userid).await {
            Ok(Some(user)) => decode_private_key(&user.private_key_pem)
                .ok()
                .map(|seckey| KeyInfo {
                    keyname: user.keyname(),
                    seckey,
                }),
            _ => None,
        };
        self.keys
            .lock()
            .expect("key cache poisoned")
            .put(userid, loaded.clone());
        loaded
    }

    /// Queue a message for a recipient. If the recipient already has a
    /// pending row the message is appended to it; otherwise an
    /// immediate delivery attempt starts in the background.
    pub fn enqueue(self: &Arc<Self>, userid: UserId, recipient: String, msg: Vec<u8>) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.delinquent(userid, &recipient, &msg).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(%error, rcpt = %recipient, "error checking pending");
                    return;
                }
            }
            engine
                .attempt(Delivery {
                    id: 0,
                    due: Utc::now(),
                    userid,
                    recipient,
                    tries: 0,
                    messages: vec![msg],
                })
                .await;
        });
    }

    /// Append to an existing pending row, atomically with the check
    /// for its existence. Returns true when the message was parked.
    async fn delinquent(
        &self,
        userid: UserId,
        recipient: &str,
        msg: &[u8],
    ) -> Result<bool, AppError> {
        let _guard = self.queue_mutex.lock().await;
        let Some((id, mut data)) = self.db.pending_delivery(userid, recipient).await? else {
            return Ok(false);
        };
        data.push(0);
        data.extend_from_slice(msg);
        self.db.append_pending(id, &data).await?;
        Ok(true)
    }

    /// One delivery attempt for a batch, serialized per recipient.
    async fn attempt(&self, mut delivery: Delivery) {
        let recipient = delivery.recipient.clone();
        let _guard = self.garage.start_key(&recipient).await;

        let Some(ki) = self.key_for(delivery.userid).await else {
            tracing::error!(userid = %delivery.userid, "lost key for delivery");
            return;
        };

        // A % prefix means the box indirection already happened.
        let inbox = if let Some(direct) = recipient.strip_prefix('%') {
            direct.to_string()
        } else {
            match self.resolver.boxes(&recipient).await {
                Some(boxes) => boxes.inbox,
                None => {
                    tracing::debug!(rcpt = %recipient, "failed getting inbox");
                    if delivery.tries < NEARLY_DEAD {
                        delivery.tries = NEARLY_DEAD;
                    }
                    self.say_it_again(delivery).await;
                    return;
                }
            }
        };

        for i in 0..delivery.messages.len() {
            if i > 0 {
                tokio::time::sleep(BATCH_GAP).await;
            }
            let msg = &delivery.messages[i];
            match self.post_msg(&ki, &inbox, msg).await {
                Ok(()) => {
                    DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
                }
                Err(error) => {
                    tracing::debug!(%inbox, %error, "failed to post json");
                    let dose = error.lethal_dose();
                    if dose > delivery.tries {
                        delivery.tries = dose;
                    }
                    if error.let_it_slide() {
                        DELIVERIES_TOTAL.with_label_values(&["slide"]).inc();
                        tracing::debug!(%inbox, %error, "whatever myever");
                        continue;
                    }
                    DELIVERIES_TOTAL.with_label_values(&["failure"]).inc();
                    delivery.messages.drain(..i);
                    self.say_it_again(delivery).await;
                    return;
                }
            }
        }
    }

    async fn post_msg(&self, ki: &KeyInfo, inbox: &str, msg: &[u8]) -> Result<(), PostError> {
        let url = url::Url::parse(inbox).map_err(|e| PostError::Net(format!("bad inbox: {e}")))?;
        let signed = sign_request_gated(
            &ki.keyname,
            &ki.seckey,
            "POST",
            &url,
            Some(msg),
            Some(AS2_CONTENT_TYPE),
        )
        .await
        .map_err(|e| PostError::Net(format!("signing failed: {e}")))?;

        let mut request = self
            .client
            .post(url)
            .header("User-Agent", &self.user_agent)
            .header("Content-Type", AS2_CONTENT_TYPE)
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .timeout(self.config.post_timeout());
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let response = request
            .body(msg.to_vec())
            .send()
            .await
            .map_err(|e| PostError::Net(e.to_string()))?;
        match response.status().as_u16() {
            200 | 201 | 202 => {
                tracing::info!(url = %inbox, code = response.status().as_u16(), "successful post");
                Ok(())
            }
            code => {
                let peek = response.text().await.unwrap_or_default();
                tracing::debug!(mesg = %peek.chars().take(240).collect::<String>(), "post failure");
                Err(PostError::Status(code))
            }
        }
    }

    /// Park the unsent tail for a later retry, or give up past the cap.
    async fn say_it_again(&self, mut delivery: Delivery) {
        delivery.tries += 1;
        let Some(delay) = retry_delay(delivery.tries) else {
            tracing::info!(rcpt = %delivery.recipient, "he's dead jim");
            DELIVERIES_TOTAL.with_label_values(&["gave_up"]).inc();
            return;
        };
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..=delay.as_secs() / 10));
        let due = Utc::now()
            + chrono::Duration::from_std(delay + jitter).unwrap_or_else(|_| chrono::Duration::zero());
        let data = Delivery::encode_messages(&delivery.messages);

        // Two racing first attempts must still produce a single row per
        // recipient, so the existence check and the write share the
        // queue mutex.
        let _guard = self.queue_mutex.lock().await;
        let result = match self
            .db
            .pending_delivery(delivery.userid, &delivery.recipient)
            .await
        {
            Ok(Some((id, mut existing))) => {
                existing.push(0);
                existing.extend_from_slice(&data);
                self.db.append_pending(id, &existing).await
            }
            Ok(None) => self
                .db
                .insert_delivery(due, delivery.userid, &delivery.recipient, delivery.tries, &data)
                .await
                .map(|_| ()),
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            tracing::error!(%error, "error saving pending delivery");
        }
        self.wake.notify_one();
    }

    /// Scheduler loop: polls for due rows every few seconds or when an
    /// enqueue wakes it, extracts each due row atomically, and runs the
    /// delivery attempt.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut wait = POLL_INTERVAL;
        loop {
            tokio::select! {
                _ = self.wake.notified() => {
                    // Let a burst of enqueues settle before polling.
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    tracing::info!("delivery scheduler draining");
                    return;
                }
            }

            let times = match self.db.delivery_times().await {
                Ok(times) => times,
                Err(error) => {
                    tracing::error!(%error, "error listing pending deliveries");
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    continue;
                }
            };
            DELIVERIES_PENDING.set(times.len() as i64);

            let now = Utc::now();
            let mut next_time = now + chrono::Duration::hours(24);
            for (id, due) in times {
                if due <= now {
                    let extracted = {
                        let _guard = self.queue_mutex.lock().await;
                        self.db.extract_delivery(id).await
                    };
                    match extracted {
                        Ok(Some(delivery)) => {
                            tracing::info!(
                                rcpt = %delivery.recipient,
                                tries = delivery.tries,
                                "redeliverating"
                            );
                            self.attempt(delivery).await;
                        }
                        Ok(None) => {}
                        Err(error) => {
                            tracing::error!(id, %error, "error extracting delivery");
                        }
                    }
                } else if due < next_time {
                    next_time = due;
                }
            }

            let now = Utc::now();
            wait = POLL_INTERVAL
                + (next_time - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_steps_minutes_then_hours_then_half_days() {
        assert_eq!(retry_delay(1), Some(Duration::from_secs(5 * 60)));
        assert_eq!(retry_delay(2), Some(Duration::from_secs(10 * 60)));
        assert_eq!(retry_delay(3), Some(Duration::from_secs(15 * 60)));
        assert_eq!(retry_delay(4), Some(Duration::from_secs(3600)));
        assert_eq!(retry_delay(5), Some(Duration::from_secs(2 * 3600)));
        assert_eq!(retry_delay(6), Some(Duration::from_secs(3 * 3600)));
        for tries in 7..=16 {
            assert_eq!(retry_delay(tries), Some(Duration::from_secs(12 * 3600)));
        }
        assert_eq!(retry_delay(17), None);
        assert_eq!(retry_delay(99), None);
    }

    #[test]
    fn retry_schedule_is_monotonic() {
        let mut previous = Duration::ZERO;
        for tries in 1..=16 {
            let delay = retry_delay(tries).expect("delay exists");
            assert!(delay >= previous, "schedule decreased at {tries}");
            previous = delay;
        }
    }

    #[test]
    fn slide_statuses_are_permanent_failures() {
        assert!(PostError::Status(400).let_it_slide());
        assert!(PostError::Status(422).let_it_slide());
        assert!(!PostError::Status(500).let_it_slide());
        assert!(!PostError::Net("connection refused".into()).let_it_slide());
    }

    #[test]
    fn unresolvable_hosts_are_nearly_dead() {
        assert_eq!(
            PostError::Net("dns error: failed to lookup address".into()).lethal_dose(),
            NEARLY_DEAD
        );
        assert_eq!(PostError::Net("connection refused".into()).lethal_dose(), 0);
        assert_eq!(PostError::Status(503).lethal_dose(), 0);
    }
}
