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

//! The HTTP surface peers use to fetch shared cache bytes.
//!
//! A deliberately small HTTP/1.1 server: peers only ever send
//! `GET /_groupcache/<group>/<key>` and only ever need the raw bytes back.
//! One request per connection, no keep-alive.

use std::net::SocketAddr;
use std::sync::Arc;

use hoard_error::{Error, ErrorType, OrErr, Result};
use log::{debug, error, warn};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::pool::{ClusterMemory, PEER_PATH_PREFIX};

const MAX_REQUEST_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;

/// Bind the peer surface on `addr` and serve it until the returned sender
/// fires. The caller keeps the sender for shutdown (send `true` to drain).
pub async fn spawn_peer_server(
    pool: Arc<ClusterMemory>,
    addr: SocketAddr,
) -> Result<(JoinHandle<()>, watch::Sender<bool>)> {
    let listener = TcpListener::bind(addr)
        .await
        .or_err_with(ErrorType::BindError, || format!("binding peer surface {addr}"))?;
    let (tx, mut rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        debug!("peer surface listening on {addr}");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let pool = pool.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(pool, stream).await {
                                    warn!("peer connection from {peer}: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("peer surface accept: {e}");
                        }
                    }
                }
                _ = rx.changed() => {
                    debug!("peer surface on {addr} shutting down");
                    break;
                }
            }
        }
    });

    Ok((handle, tx))
}

async fn handle_connection(pool: Arc<ClusterMemory>, mut stream: TcpStream) -> Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let (method, path) = loop {
        let mut chunk = [0u8; 1024];
        let n = stream
            .read(&mut chunk)
            .await
            .or_err(ErrorType::ReadError, "reading peer request")?;
        if n == 0 {
            return Error::e_explain(ErrorType::ReadError, "peer closed before request end");
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_SIZE {
            return Error::e_explain(ErrorType::ReadError, "peer request too large");
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let method = req.method.unwrap_or("").to_string();
                let path = req.path.unwrap_or("").to_string();
                break (method, path);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => {
                return Error::e_because(ErrorType::InvalidHTTPHeader, "parsing peer request", e)
            }
        }
    };

    if method != "GET" {
        return write_response(&mut stream, 405, "Method Not Allowed", b"").await;
    }

    match lookup_path(&pool, &path) {
        Some(bytes) => write_response(&mut stream, 200, "OK", &bytes).await,
        None => write_response(&mut stream, 404, "Not Found", b"").await,
    }
}

// Resolve `/_groupcache/<group>/<key>` against the local store.
fn lookup_path(pool: &ClusterMemory, path: &str) -> Option<bytes::Bytes> {
    let rest = path.strip_prefix(PEER_PATH_PREFIX)?;
    let (group, key) = rest.split_once('/')?;
    let group = percent_decode_str(group).decode_utf8().ok()?;
    if group != pool.group() {
        return None;
    }
    let key = percent_decode_str(key).decode_utf8().ok()?;
    pool.load_local(&key)
}

async fn write_response(
    stream: &mut TcpStream,
    code: u16,
    reason: &str,
    body: &[u8],
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .or_err(ErrorType::WriteError, "writing peer response head")?;
    stream
        .write_all(body)
        .await
        .or_err(ErrorType::WriteError, "writing peer response body")?;
    stream
        .shutdown()
        .await
        .or_err(ErrorType::WriteError, "closing peer connection")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pool_with(key: &str, value: &'static [u8]) -> Arc<ClusterMemory> {
        let pool = ClusterMemory::new("http_cache", "127.0.0.1:0".parse().unwrap(), 1 << 20);
        pool.store(key, Bytes::from_static(value));
        pool
    }

    #[test]
    fn test_lookup_path() {
        let pool = pool_with("GET example.com/x?", b"body");
        let hit = lookup_path(&pool, "/_groupcache/http_cache/GET%20example.com%2Fx%3F");
        assert_eq!(hit.unwrap(), Bytes::from_static(b"body"));

        assert!(lookup_path(&pool, "/_groupcache/http_cache/other").is_none());
        assert!(lookup_path(&pool, "/_groupcache/wrong_group/GET%20example.com%2Fx%3F").is_none());
        assert!(lookup_path(&pool, "/somewhere/else").is_none());
    }

    #[tokio::test]
    async fn test_serve_roundtrip() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = pool_with("k", b"cluster bytes");
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        // bind on an ephemeral port, then learn it from the listener
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        let serve_pool = pool.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_connection(serve_pool, stream).await.unwrap();
        });

        let mut stream = TcpStream::connect(bound).await.unwrap();
        stream
            .write_all(b"GET /_groupcache/http_cache/k HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        stream.read_to_end(&mut resp).await.unwrap();
        let resp = String::from_utf8_lossy(&resp);
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.ends_with("cluster bytes"));
    }
}
