//! Fetch cache & HTTP client
//!
//! All outbound GETs go through a single shared client and a
//! single-flight cache keyed by URL: at most one concurrent fetch per
//! key, with other callers blocking on the in-flight result. Entries
//! expire after a short window so bursts coalesce but nothing persists.

use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::FederationConfig;
use crate::data::KeyInfo;
use crate::error::AppError;
use crate::metrics::{FETCH_CACHE_HITS, FETCH_CACHE_MISSES};

use super::signature::sign_request_gated;
use super::{friend_or_foe, AS2_ACCEPT, JRD_CONTENT_TYPE};

/// Byte ceiling for object fetches
pub const MAX_OBJECT_SIZE: usize = 1024 * 1024;
/// Byte ceiling for binary fetches (attachments)
pub const MAX_FETCH_SIZE: usize = 14 * 1024 * 1024;
/// How long a cache entry satisfies callers
const DECK_TTL: Duration = Duration::from_millis(250);
/// Redirect hop limit
const MAX_REDIRECTS: usize = 5;

/// Single-flight, time-bounded cache
///
/// Concurrent misses for the same key coalesce into one fill; the
/// fill's result satisfies every waiter and later callers within the
/// TTL window.
pub struct FlightDeck<V> {
    name: &'static str,
    ttl: Duration,
    slots: StdMutex<HashMap<String, Arc<Mutex<Slot<V>>>>>,
}

struct Slot<V> {
    filled_at: Option<Instant>,
    value: Option<V>,
}

impl<V: Clone> FlightDeck<V> {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Slot<V>>> {
        let mut slots = self.slots.lock().expect("flight deck poisoned");
        if slots.len() > 256 {
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        slots
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    filled_at: None,
                    value: None,
                }))
            })
            .clone()
    }

    /// Return the cached value if fresh, otherwise run `fill` while
    /// holding the key's slot so concurrent callers wait on this one.
    pub async fn get_with<F, Fut>(&self, key: &str, fill: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = V>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let (Some(filled_at), Some(value)) = (guard.filled_at, guard.value.as_ref()) {
            if filled_at.elapsed() < self.ttl {
                FETCH_CACHE_HITS.with_label_values(&[self.name]).inc();
                return value.clone();
            }
        }
        FETCH_CACHE_MISSES.with_label_values(&[self.name]).inc();
        let value = fill().await;
        guard.filled_at = Some(Instant::now());
        guard.value = Some(value.clone());
        value
    }
}

/// A fetched and parsed document plus the URL it finally came from
#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub value: Arc<Value>,
    pub final_url: String,
}

/// The shared outbound HTTP stack
pub struct Fetcher {
    client: reqwest::Client,
    config: FederationConfig,
    user_agent: String,
    devel: bool,
    json_deck: FlightDeck<Result<FetchedJson, String>>,
    bytes_deck: FlightDeck<Result<Arc<Vec<u8>>, String>>,
}

impl Fetcher {
    pub fn new(config: FederationConfig, server_name: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.fast_timeout())
            .build()?;
        let devel = config.devel;
        Ok(Self {
            client,
            config,
            user_agent: format!("gaggle/0.1; {}", server_name),
            devel,
            json_deck: FlightDeck::new("objects", DECK_TTL),
            bytes_deck: FlightDeck::new("binaries", DECK_TTL),
        })
    }

    pub fn slow_timeout(&self) -> Duration {
        self.config.slow_timeout()
    }

    pub fn fast_timeout(&self) -> Duration {
        self.config.fast_timeout()
    }

    /// Fetch and parse an AS2 (or JRD) document through the
    /// single-flight cache.
    pub async fn get_json(
        &self,
        signer: Option<&KeyInfo>,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedJson, AppError> {
        let result = self
            .json_deck
            .get_with(url, || self.fetch_json_once(signer, url, timeout))
            .await;
        result.map_err(AppError::Transport)
    }

    /// Hard-mode fetch: retry exactly once after a 60-120 s sleep when
    /// the peer answers 429/502 or the request times out.
    pub async fn get_json_hard(
        &self,
        signer: Option<&KeyInfo>,
        url: &str,
    ) -> Result<FetchedJson, AppError> {
        let timeout = self.config.slow_timeout();
        match self.get_json(signer, url, timeout).await {
            Ok(fetched) => Ok(fetched),
            Err(AppError::Transport(message))
                if message == "http get status: 429"
                    || message == "http get status: 502"
                    || message.contains("timeout") =>
            {
                let nap = Duration::from_secs(60 + rand::thread_rng().gen_range(0..60));
                tracing::info!(%url, error = %message, "trying again after error");
                tokio::time::sleep(nap).await;
                let retry = self.get_json(signer, url, timeout).await;
                match &retry {
                    Ok(_) => tracing::info!(%url, "retry success"),
                    Err(_) => tracing::info!(%url, "still couldn't get it"),
                }
                retry
            }
            Err(error) => Err(error),
        }
    }

    async fn fetch_json_once(
        &self,
        signer: Option<&KeyInfo>,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedJson, String> {
        let webfinger = url.contains(".well-known/webfinger?resource");
        let accept = if webfinger { JRD_CONTENT_TYPE } else { AS2_ACCEPT };

        let mut current = url.to_string();
        for _hop in 0..=MAX_REDIRECTS {
            let parsed = url::Url::parse(&current).map_err(|e| format!("bad url: {e}"))?;
            let mut request = self
                .client
                .get(parsed.clone())
                .header("Accept", accept)
                .header("User-Agent", &self.user_agent)
                .timeout(timeout);

            if let Some(ki) = signer.filter(|_| !self.devel) {
                let signed =
                    sign_request_gated(&ki.keyname, &ki.seckey, "GET", &parsed, None, None)
                        .await
                        .map_err(|e| format!("signing failed: {e}"))?;
                request = request
                    .header("Date", signed.date)
                    .header("Signature", signed.signature);
            }

            let response = request.send().await.map_err(describe_reqwest_error)?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| "redirect without location".to_string())?;
                current = parsed
                    .join(location)
                    .map_err(|e| format!("bad redirect: {e}"))?
                    .to_string();
                continue;
            }

            match status.as_u16() {
                200 | 201 | 202 => {}
                code => return Err(format!("http get status: {code}")),
            }

            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !webfinger && !friend_or_foe(&content_type) {
                return Err(format!("incompatible content type {content_type}"));
            }

            let body = read_limited(response, MAX_OBJECT_SIZE).await?;
            let value: Value =
                serde_json::from_slice(&body).map_err(|e| format!("bad json: {e}"))?;
            return Ok(FetchedJson {
                value: Arc::new(value),
                final_url: current,
            });
        }
        Err(format!("stopped after {MAX_REDIRECTS} redirects"))
    }

    /// Fetch raw bytes (attachments, emoji icons) through the
    /// single-flight cache. Bounded at 14 MiB.
    pub async fn get_bytes(&self, url: &str) -> Result<Arc<Vec<u8>>, AppError> {
        let result = self
            .bytes_deck
            .get_with(url, || async {
                let response = self
                    .client
                    .get(url)
                    .header("User-Agent", &self.user_agent)
                    .timeout(Duration::from_secs(60))
                    .send()
                    .await
                    .map_err(describe_reqwest_error)?;
                match response.status().as_u16() {
                    200 | 201 | 202 => {}
                    code => return Err(format!("http get status: {code}")),
                }
                let body = read_limited(response, MAX_FETCH_SIZE).await?;
                Ok(Arc::new(body))
            })
            .await;
        result.map_err(AppError::Transport)
    }
}

fn describe_reqwest_error(error: reqwest::Error) -> String {
    if error.is_timeout() {
        format!("timeout: {error}")
    } else {
        error.to_string()
    }
}

/// Read a body through a byte ceiling; reaching the ceiling is logged
/// as likely truncation.
async fn read_limited(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>, String> {
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(describe_reqwest_error)? {
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            tracing::info!(limit, "truncation likely");
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn flight_deck_coalesces_concurrent_fills() {
        let deck = Arc::new(FlightDeck::<usize>::new("test", Duration::from_millis(250)));
        let fills = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let deck = deck.clone();
            let fills = fills.clone();
            tasks.push(tokio::spawn(async move {
                deck.get_with("same-url", || async {
                    fills.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    42
                })
                .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.expect("task"), 42);
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flight_deck_expires_entries() {
        let deck = FlightDeck::<usize>::new("test", Duration::from_millis(10));
        let fills = AtomicUsize::new(0);

        let fill = || async {
            fills.fetch_add(1, Ordering::SeqCst);
            1
        };
        deck.get_with("url", fill).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        deck.get_with("url", || async {
            fills.fetch_add(1, Ordering::SeqCst);
            2
        })
        .await;
        assert_eq!(fills.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flight_deck_distinct_keys_fill_independently() {
        let deck = FlightDeck::<&'static str>::new("test", Duration::from_millis(250));
        let a = deck.get_with("a", || async { "a" }).await;
        let b = deck.get_with("b", || async { "b" }).await;
        assert_eq!((a, b), ("a", "b"));
    }
}
