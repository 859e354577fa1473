// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end flows through the cache handler with a mock origin.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_cache::policy::RuleMatcher;
use hoard_cache::storage::{Backend, BodyReader};
use hoard_cache::{
    admin, CacheHandler, ClientWriter, Config, Entry, HttpCache, RequestHead, Response, Upstream,
    UrlLock,
};
use hoard_error::{Error, ErrorType, Result};
use http::{header, HeaderName, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;

// ----- mock downstream client -----

#[derive(Default)]
struct ClientState {
    status: Option<StatusCode>,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Vec<u8>,
}

#[derive(Default)]
struct MockClient {
    state: Mutex<ClientState>,
}

impl MockClient {
    fn new() -> Arc<Self> {
        Arc::new(MockClient::default())
    }

    fn status(&self) -> Option<StatusCode> {
        self.state.lock().status
    }

    fn header(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .headers
            .iter()
            .find(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.to_str().unwrap_or("").to_string())
    }

    fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().body).into_owned()
    }
}

#[async_trait]
impl ClientWriter for MockClient {
    fn append_header(&self, name: HeaderName, value: HeaderValue) {
        self.state.lock().headers.push((name, value));
    }

    async fn write_header(&self, code: StatusCode) -> Result<()> {
        self.state.lock().status = Some(code);
        Ok(())
    }

    async fn write_body(&self, data: &[u8]) -> Result<usize> {
        self.state.lock().body.extend_from_slice(data);
        Ok(data.len())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ----- mock origin -----

type Responder =
    dyn Fn(&RequestHead) -> (StatusCode, Vec<(&'static str, String)>, Bytes) + Send + Sync;

struct Origin {
    hits: AtomicUsize,
    delay: Duration,
    responder: Mutex<Arc<Responder>>,
}

impl Origin {
    fn new(
        responder: impl Fn(&RequestHead) -> (StatusCode, Vec<(&'static str, String)>, Bytes)
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Origin {
            hits: AtomicUsize::new(0),
            delay: Duration::ZERO,
            responder: Mutex::new(Arc::new(responder)),
        })
    }

    fn with_delay(
        delay: Duration,
        responder: impl Fn(&RequestHead) -> (StatusCode, Vec<(&'static str, String)>, Bytes)
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Origin {
            hits: AtomicUsize::new(0),
            delay,
            responder: Mutex::new(Arc::new(responder)),
        })
    }

    fn set_responder(
        &self,
        responder: impl Fn(&RequestHead) -> (StatusCode, Vec<(&'static str, String)>, Bytes)
            + Send
            + Sync
            + 'static,
    ) {
        *self.responder.lock() = Arc::new(responder);
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for Origin {
    async fn serve(&self, head: RequestHead, _body: Bytes, response: Arc<Response>) -> Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let responder = self.responder.lock().clone();
        let (code, headers, body) = (*responder)(&head);
        for (name, value) in headers {
            response.insert_header(
                HeaderName::from_static(name),
                HeaderValue::from_str(&value).unwrap(),
            );
        }
        response.write_header(code);
        if !body.is_empty() {
            response.write(&body).await?;
        }
        Ok(())
    }
}

// A backend whose stored body can no longer be read back.
struct FailingBackend;

#[async_trait]
impl Backend for FailingBackend {
    async fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn clean(&self) -> Result<()> {
        Ok(())
    }

    async fn get_reader(&self) -> Result<BodyReader> {
        Error::e_explain(ErrorType::ReadError, "backend lost the body")
    }

    fn length(&self) -> usize {
        0
    }
}

// Plant a public entry whose reads fail into the handler's index.
async fn plant_unreadable_entry(
    handler: &CacheHandler,
    config: &Config,
    key: &str,
    head: RequestHead,
    cache_control: &str,
) {
    let mut headers = http::HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, cache_control.parse().unwrap());
    let response = Response::stub(StatusCode::OK, headers);
    response.set_body(Arc::new(FailingBackend));
    response.close().await.unwrap();

    let entry = Arc::new(Entry::new(key, head, response, config));
    assert!(entry.is_public());
    handler.cache().put(entry);
}

// ----- harness -----

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn file_config(tag: &str, default_max_age: u64) -> Config {
    Config {
        default_max_age,
        rule_matchers: vec![RuleMatcher::Path {
            path: "/".to_string(),
        }],
        path: std::env::temp_dir()
            .join(format!("hoard-flow-{tag}-{}", std::process::id()))
            .to_string_lossy()
            .into_owned(),
        ..Config::default()
    }
}

fn build_handler(config: Config) -> Arc<CacheHandler> {
    let config = Arc::new(config);
    let cache = HttpCache::new(&config, None);
    let locks = Arc::new(UrlLock::new(config.cache_buckets_num));
    Arc::new(CacheHandler::new(config, cache, locks, None))
}

fn request(method: Method, path: &str, headers: &[(&str, &str)]) -> RequestHead {
    let mut head = RequestHead::new(method, path.parse().unwrap());
    head.headers
        .insert(header::HOST, "localhost".parse().unwrap());
    for (name, value) in headers {
        head.headers.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
    }
    head
}

async fn run(handler: &CacheHandler, head: RequestHead, origin: &Arc<Origin>) -> Arc<MockClient> {
    let client = MockClient::new();
    handler
        .handle(head, Bytes::new(), client.clone(), origin.clone())
        .await
        .unwrap();
    client
}

// ----- scenarios -----

#[tokio::test]
async fn test_public_hit_via_file_backend() {
    init_log();
    let origin = Origin::new(|_| (StatusCode::OK, vec![], Bytes::from_static(b"hello")));
    let handler = build_handler(file_config("hit", 1));

    let client = run(&handler, request(Method::GET, "/x", &[]), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("miss"));
    assert_eq!(client.status(), Some(StatusCode::OK));
    assert_eq!(client.body_string(), "hello");

    let client = run(&handler, request(Method::GET, "/x", &[]), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("hit"));
    assert_eq!(client.body_string(), "hello");
    assert_eq!(origin.hits(), 1);

    // past default_max_age the entry is stale and the origin is asked again
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let client = run(&handler, request(Method::GET, "/x", &[]), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("miss"));
    assert_eq!(client.body_string(), "hello");
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn test_vary_produces_sibling_representations() {
    let origin = Origin::new(|head| {
        let encoding = head.header_str("accept-encoding").to_string();
        (
            StatusCode::OK,
            vec![
                ("vary", "Accept-Encoding".to_string()),
                ("cache-control", "max-age=60".to_string()),
            ],
            Bytes::from(format!("body-{encoding}")),
        )
    });
    let handler = build_handler(file_config("vary", 300));

    let gzip = request(Method::GET, "/v", &[("accept-encoding", "gzip")]);
    let brotli = request(Method::GET, "/v", &[("accept-encoding", "br")]);

    let client = run(&handler, gzip.clone(), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("miss"));
    assert_eq!(client.body_string(), "body-gzip");

    // different Vary dimension: own fetch, own representation
    let client = run(&handler, brotli.clone(), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("miss"));
    assert_eq!(client.body_string(), "body-br");

    let client = run(&handler, gzip, &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("hit"));
    assert_eq!(client.body_string(), "body-gzip");

    let client = run(&handler, brotli, &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("hit"));
    assert_eq!(client.body_string(), "body-br");

    // both entries coexist under the same fingerprint
    assert_eq!(handler.cache().keys().len(), 1);
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn test_concurrent_misses_coalesce() {
    init_log();
    let origin = Origin::with_delay(Duration::from_millis(50), |_| {
        (StatusCode::OK, vec![], Bytes::from_static(b"hello"))
    });
    let handler = build_handler(file_config("coalesce", 300));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let handler = handler.clone();
        let origin = origin.clone();
        tasks.push(tokio::spawn(async move {
            run(&handler, request(Method::GET, "/c", &[]), &origin).await
        }));
    }

    let mut misses = 0;
    for task in tasks {
        let client = task.await.unwrap();
        assert_eq!(client.body_string(), "hello");
        match client.header("x-cache-status").as_deref() {
            Some("miss") => misses += 1,
            Some("hit") => {}
            other => panic!("unexpected cache status {other:?}"),
        }
    }

    // the URL lock allows exactly one fetch
    assert_eq!(origin.hits(), 1);
    assert_eq!(misses, 1);
}

#[tokio::test]
async fn test_stale_served_on_upstream_error() {
    let origin = Origin::new(|_| {
        (
            StatusCode::OK,
            vec![("cache-control", "max-age=1".to_string())],
            Bytes::from_static(b"fresh value"),
        )
    });
    let handler = build_handler(file_config("stale", 300));

    let client = run(&handler, request(Method::GET, "/s", &[]), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("miss"));

    // entry expires but stays within the stale grace period
    tokio::time::sleep(Duration::from_millis(1200)).await;
    origin.set_responder(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            vec![],
            Bytes::from_static(b"boom"),
        )
    });

    let client = run(&handler, request(Method::GET, "/s", &[]), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("hit"));
    assert_eq!(client.status(), Some(StatusCode::OK));
    assert_eq!(client.body_string(), "fresh value");
}

#[tokio::test]
async fn test_unreadable_hit_answers_with_stored_status() {
    let origin = Origin::new(|_| (StatusCode::OK, vec![], Bytes::from_static(b"unexpected")));
    let config = file_config("unreadable-hit", 300);
    let handler = build_handler(config.clone());

    let head = request(Method::GET, "/u", &[]);
    plant_unreadable_entry(&handler, &config, "GET localhost/u?", head.clone(), "max-age=3600")
        .await;

    // the read error must not turn into a fresh upstream fetch
    let client = run(&handler, head, &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("hit"));
    assert_eq!(client.status(), Some(StatusCode::OK));
    assert_eq!(client.body_string(), "");
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn test_unreadable_stale_answers_with_stored_status() {
    let origin = Origin::new(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            vec![],
            Bytes::from_static(b"boom"),
        )
    });
    let config = file_config("unreadable-stale", 300);
    let handler = build_handler(config.clone());

    let head = request(Method::GET, "/us", &[]);
    plant_unreadable_entry(&handler, &config, "GET localhost/us?", head.clone(), "max-age=1")
        .await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // the stale body cannot be read back, its status still answers: the
    // client must never see the 5xx and the 5xx must not be stored
    let client = run(&handler, head, &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("hit"));
    assert_eq!(client.status(), Some(StatusCode::OK));
    assert_eq!(client.body_string(), "");
    assert_eq!(origin.hits(), 1);
    assert_eq!(handler.cache().keys(), vec!["GET localhost/us?".to_string()]);
}

#[tokio::test]
async fn test_private_response_skips_cache() {
    let origin = Origin::new(|_| {
        (
            StatusCode::OK,
            vec![("cache-control", "private".to_string())],
            Bytes::from_static(b"for your eyes only"),
        )
    });
    let handler = build_handler(file_config("private", 300));

    for _ in 0..2 {
        let client = run(&handler, request(Method::GET, "/p", &[]), &origin).await;
        assert_eq!(client.header("x-cache-status").as_deref(), Some("skip"));
        assert_eq!(client.body_string(), "for your eyes only");
    }
    // nothing was stored, both requests hit the origin
    assert_eq!(origin.hits(), 2);
    assert!(handler.cache().keys().is_empty());
}

#[tokio::test]
async fn test_unmatched_method_bypasses() {
    let origin = Origin::new(|_| (StatusCode::OK, vec![], Bytes::from_static(b"posted")));
    let handler = build_handler(file_config("bypass", 300));

    let client = MockClient::new();
    handler
        .handle(
            request(Method::POST, "/b", &[]),
            Bytes::from_static(b"payload"),
            client.clone(),
            origin.clone(),
        )
        .await
        .unwrap();
    assert_eq!(client.header("x-cache-status").as_deref(), Some("bypass"));
    assert_eq!(client.body_string(), "posted");
    assert!(handler.cache().keys().is_empty());
}

#[tokio::test]
async fn test_head_request_serves_status_only() {
    let origin = Origin::new(|_| (StatusCode::OK, vec![], Bytes::from_static(b"unused")));
    let handler = build_handler(file_config("head", 300));

    let client = run(&handler, request(Method::HEAD, "/h", &[]), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("miss"));
    assert_eq!(client.status(), Some(StatusCode::OK));
    assert_eq!(client.body_string(), "");
}

#[tokio::test]
async fn test_empty_body_upstream_completes() {
    // the worker finishes before a backend exists; readers must still end
    let origin = Origin::new(|_| (StatusCode::OK, vec![], Bytes::new()));
    let handler = build_handler(file_config("empty", 300));

    let client = run(&handler, request(Method::GET, "/e", &[]), &origin).await;
    assert_eq!(client.header("x-cache-status").as_deref(), Some("miss"));
    assert_eq!(client.status(), Some(StatusCode::OK));
    assert_eq!(client.body_string(), "");
}

#[tokio::test]
async fn test_admin_listing_and_purge() {
    // admin endpoints work against the provisioned process-wide cache
    let handler = hoard_cache::provision(file_config("admin", 300)).await.unwrap();
    let origin = Origin::new(|_| (StatusCode::OK, vec![], Bytes::from_static(b"hello")));

    let client = MockClient::new();
    handler
        .handle(
            request(Method::GET, "/hello", &[]),
            Bytes::new(),
            client.clone(),
            origin.clone(),
        )
        .await
        .unwrap();
    assert_eq!(client.header("x-cache-status").as_deref(), Some("miss"));

    let health = admin::handle(
        http::Request::builder()
            .method("GET")
            .uri("/health")
            .body(Bytes::new())
            .unwrap(),
    )
    .await;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(&health.body()[..], b"OK");

    let listing = admin::handle(
        http::Request::builder()
            .method("GET")
            .uri("/caches/")
            .body(Bytes::new())
            .unwrap(),
    )
    .await;
    let keys: Vec<String> = serde_json::from_slice(listing.body()).unwrap();
    assert!(keys.contains(&"GET localhost/hello?".to_string()));

    // wrong method and malformed body are rejected
    let resp = admin::handle(
        http::Request::builder()
            .method("GET")
            .uri("/caches/purge")
            .body(Bytes::new())
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let resp = admin::handle(
        http::Request::builder()
            .method("DELETE")
            .uri("/caches/purge")
            .body(Bytes::from_static(b"not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = admin::handle(
        http::Request::builder()
            .method("DELETE")
            .uri("/caches/purge")
            .body(Bytes::from_static(
                br#"{"host": "http://localhost", "uri": "hello"}"#,
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let listing = admin::handle(
        http::Request::builder()
            .method("GET")
            .uri("/caches/")
            .body(Bytes::new())
            .unwrap(),
    )
    .await;
    let keys: Vec<String> = serde_json::from_slice(listing.body()).unwrap();
    assert!(!keys.contains(&"GET localhost/hello?".to_string()));
}
