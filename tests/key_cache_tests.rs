//! Key cache tests
//!
//! Covers refresh coalescing under concurrency, the stale grace window seen
//! through token verification, and the remote JWKS source.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::{claims_for, sign};
use tool_gate::auth::keys::parse_jwks;
use tool_gate::auth::{
    AuthError, CacheStatus, KeyCache, KeyError, KeyFetcher, KeyOrigin, TokenVerifier, VerificationKey,
};
use tool_gate::config::{AuthConfig, AuthMode, KeyCacheConfig};

const JWKS: &str = include_str!("fixtures/dev_jwks.json");

/// Fetcher that counts calls, can be switched to fail, and takes `delay`.
struct ScriptedFetcher {
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
}

impl ScriptedFetcher {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay,
        })
    }
}

#[async_trait]
impl KeyFetcher for ScriptedFetcher {
    async fn fetch(&self) -> Result<Vec<VerificationKey>, KeyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
            Err(KeyError::Parse("provider outage".into()))
        } else {
            parse_jwks(JWKS.as_bytes())
        }
    }

    fn origin(&self) -> KeyOrigin {
        KeyOrigin::Remote
    }
}

/// ttl 5m, max_stale 10m
fn timing() -> KeyCacheConfig {
    KeyCacheConfig {
        ttl: Duration::from_secs(300),
        max_stale: Duration::from_secs(600),
        min_refresh_interval: Duration::from_secs(30),
        cold_start_wait: Duration::from_secs(2),
    }
}

fn verifier_over(cache: Arc<KeyCache>) -> TokenVerifier {
    TokenVerifier::new(cache, &AuthConfig::default()).unwrap()
}

/// A token valid for an hour from `now`.
fn long_lived_token(now: DateTime<Utc>) -> String {
    let mut claims = claims_for("alice", &["ReadOnly"], now);
    claims["exp"] = json!(now.timestamp() + 3600);
    sign(&claims)
}

/// Concurrent callers past TTL trigger exactly one refresh
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stale_reads_coalesce_into_one_refresh() {
    let fetcher = ScriptedFetcher::new(Duration::from_millis(50));
    let cache = Arc::new(KeyCache::new(fetcher.clone(), &timing()));
    let t0 = Utc::now();
    cache.prime(t0).await.unwrap();

    let later = t0 + TimeDelta::seconds(301);
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(later).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.refresh_attempts(), 2);
}

/// Concurrent callers on an empty cache wait for the single cold-start fetch
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cold_start_callers_share_one_fetch() {
    let fetcher = ScriptedFetcher::new(Duration::from_millis(100));
    let cache = Arc::new(KeyCache::new(fetcher.clone(), &timing()));
    let now = Utc::now();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(now).await.map(|keys| keys.len()) })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

/// Remote fails with a 2 minute stale cache: verification still succeeds
#[tokio::test]
async fn test_failed_refresh_serves_stale_keys() {
    // GIVEN: keys fetched at t0
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    let cache = Arc::new(KeyCache::new(fetcher.clone(), &timing()));
    let verifier = verifier_over(Arc::clone(&cache));
    let t0 = Utc::now();
    let token = long_lived_token(t0);
    assert!(verifier.verify(&token, t0).await.is_ok());

    // WHEN: the provider goes down and the set is 2 minutes past TTL
    fetcher.fail.store(true, Ordering::SeqCst);
    let now = t0 + TimeDelta::seconds(420);
    let result = verifier.verify(&token, now).await;

    // THEN: the stale set verifies the token
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert!(matches!(cache.status(now), CacheStatus::Stale { age_secs: 420, .. }));
}

/// Past ttl + max_stale every credential fails until a refresh succeeds
#[tokio::test]
async fn test_expired_cache_is_unavailable_until_refresh() {
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    let cache = Arc::new(KeyCache::new(fetcher.clone(), &timing()));
    let verifier = verifier_over(Arc::clone(&cache));
    let t0 = Utc::now();
    let token = long_lived_token(t0);
    assert!(verifier.verify(&token, t0).await.is_ok());

    fetcher.fail.store(true, Ordering::SeqCst);
    let past_grace = t0 + TimeDelta::seconds(901);
    for offset in [0, 5, 60] {
        let result = verifier.verify(&token, past_grace + TimeDelta::seconds(offset)).await;
        assert!(matches!(result, Err(AuthError::KeyUnavailable)), "{result:?}");
    }

    fetcher.fail.store(false, Ordering::SeqCst);
    let recovered = past_grace + TimeDelta::seconds(120);
    assert!(verifier.verify(&token, recovered).await.is_ok());
    assert!(matches!(cache.status(recovered), CacheStatus::Fresh { age_secs: 0, .. }));
}

/// What the test JWKS endpoint does with one connection.
#[derive(Clone)]
enum Reply {
    /// 200 with a `content-length` body.
    Jwks,
    /// 200 with a chunked body and no `content-length`.
    ChunkedJwks,
    /// An error status with an empty body.
    Status(u16),
    /// Read the request and never answer.
    Stall,
}

/// Serve the fixture JWKS, answering the n-th connection with `script(n)`.
/// Returns the URL and a connection counter.
async fn serve_jwks<F>(script: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(usize) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let reply = script(counter.fetch_add(1, Ordering::SeqCst));
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                }
                let response = match reply {
                    Reply::Jwks => format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{JWKS}",
                        JWKS.len()
                    ),
                    Reply::ChunkedJwks => {
                        let mut out = String::from(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n",
                        );
                        for chunk in JWKS.as_bytes().chunks(64) {
                            out.push_str(&format!("{:x}\r\n{}\r\n", chunk.len(), String::from_utf8_lossy(chunk)));
                        }
                        out.push_str("0\r\n\r\n");
                        out
                    }
                    Reply::Status(code) => {
                        format!("HTTP/1.1 {code} Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    }
                    Reply::Stall => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{addr}/.well-known/jwks.json"), hits)
}

fn remote_config(url: &str) -> AuthConfig {
    let mut config = AuthConfig {
        mode: AuthMode::Remote,
        ..AuthConfig::default()
    };
    config.remote.jwks_url = url.to_string();
    config.remote.timeout = Duration::from_secs(2);
    config.remote.retries = 0;
    config
}

/// Keys published over HTTP verify tokens
#[tokio::test]
async fn test_remote_jwks_is_fetched_and_cached() {
    let (url, hits) = serve_jwks(|_| Reply::Jwks).await;
    let config = remote_config(&url);
    let cache = Arc::new(KeyCache::from_config(&config).unwrap());
    let verifier = TokenVerifier::new(Arc::clone(&cache), &config).unwrap();
    let now = Utc::now();

    let token = long_lived_token(now);
    assert!(verifier.verify(&token, now).await.is_ok());
    assert!(verifier.verify(&token, now + TimeDelta::seconds(60)).await.is_ok());

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let keys = cache.get(now).await.unwrap();
    assert_eq!(keys.origin(), KeyOrigin::Remote);
    assert_eq!(keys.kids().collect::<Vec<_>>(), vec![common::DEV_KID]);
}

/// A response over the size limit is rejected
#[tokio::test]
async fn test_oversized_jwks_is_rejected() {
    let (url, _) = serve_jwks(|_| Reply::Jwks).await;
    let mut config = remote_config(&url);
    config.remote.max_body_bytes = 64;
    let cache = KeyCache::from_config(&config).unwrap();

    assert!(matches!(cache.prime(Utc::now()).await, Err(KeyError::Unavailable)));
}

/// The size cap holds without a content-length header
#[tokio::test]
async fn test_oversized_chunked_jwks_is_rejected() {
    let (url, hits) = serve_jwks(|_| Reply::ChunkedJwks).await;
    let mut config = remote_config(&url);
    config.remote.max_body_bytes = 64;
    config.remote.retries = 2;
    let cache = KeyCache::from_config(&config).unwrap();
    assert!(matches!(cache.prime(Utc::now()).await, Err(KeyError::Unavailable)));
    assert_eq!(hits.load(Ordering::SeqCst), 1, "size errors are not retried");

    // Within the cap the same chunked body loads.
    let (url, _) = serve_jwks(|_| Reply::ChunkedJwks).await;
    let cache = KeyCache::from_config(&remote_config(&url)).unwrap();
    assert_eq!(cache.prime(Utc::now()).await.unwrap().len(), 1);
}

/// Transient failures are retried within the retry budget
#[tokio::test]
async fn test_transient_failures_are_retried() {
    // GIVEN: a provider that answers 503 twice, then serves keys
    let (url, hits) = serve_jwks(|n| if n < 2 { Reply::Status(503) } else { Reply::Jwks }).await;
    let mut config = remote_config(&url);
    config.remote.retries = 2;
    config.remote.initial_backoff = Duration::from_millis(10);
    let cache = KeyCache::from_config(&config).unwrap();

    // WHEN: the cache is primed
    let keys = cache.prime(Utc::now()).await;

    // THEN: retries + 1 attempts were made and the last one succeeded
    assert_eq!(keys.unwrap().len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(cache.refresh_attempts(), 1);
}

/// The retry budget is bounded
#[tokio::test]
async fn test_retry_budget_is_exhausted() {
    let (url, hits) = serve_jwks(|_| Reply::Status(503)).await;
    let mut config = remote_config(&url);
    config.remote.retries = 2;
    config.remote.initial_backoff = Duration::from_millis(10);
    let cache = KeyCache::from_config(&config).unwrap();

    assert!(matches!(cache.prime(Utc::now()).await, Err(KeyError::Unavailable)));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

/// A provider that stops answering times out and the stale keys are served
#[tokio::test]
async fn test_stalled_provider_serves_stale_keys() {
    // GIVEN: keys fetched at t0 from a provider that then hangs
    let (url, hits) = serve_jwks(|n| if n == 0 { Reply::Jwks } else { Reply::Stall }).await;
    let mut config = remote_config(&url);
    config.remote.timeout = Duration::from_millis(200);
    config.cache = timing();
    let cache = Arc::new(KeyCache::from_config(&config).unwrap());
    let verifier = TokenVerifier::new(Arc::clone(&cache), &config).unwrap();
    let t0 = Utc::now();
    let token = long_lived_token(t0);
    assert!(verifier.verify(&token, t0).await.is_ok());

    // WHEN: the set is 2 minutes past TTL and the refresh hangs
    let started = std::time::Instant::now();
    let result = verifier.verify(&token, t0 + TimeDelta::seconds(420)).await;

    // THEN: the fetch is cut off by the timeout and verification succeeds
    assert!(result.is_ok(), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

/// An unreachable provider at cold start leaves no keys
#[tokio::test]
async fn test_unreachable_provider_at_cold_start() {
    let config = remote_config("http://127.0.0.1:1/jwks.json");
    let cache = Arc::new(KeyCache::from_config(&config).unwrap());
    let verifier = TokenVerifier::new(Arc::clone(&cache), &config).unwrap();
    let now = Utc::now();

    let result = verifier.verify(&long_lived_token(now), now).await;

    assert!(matches!(result, Err(AuthError::KeyUnavailable)), "{result:?}");
    assert_eq!(cache.status(now), CacheStatus::Empty);
}

/// Malformed JWKS documents are reported, not served
#[test]
fn test_jwks_parse_errors() {
    assert!(matches!(parse_jwks(b"not json"), Err(KeyError::Parse(_))));
    assert!(matches!(parse_jwks(br#"{"keys": []}"#), Err(KeyError::Empty)));
    assert_eq!(parse_jwks(JWKS.as_bytes()).unwrap().len(), 1);
}
