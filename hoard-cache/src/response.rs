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

//! The in-flight response object.
//!
//! A [Response] is what the upstream worker writes into and what cache
//! readers read out of. Four single-shot events order its life:
//! `headers_ready` -> `body_set` -> `body_complete` -> `closed`.
//! Writing the header is latching; the header snapshot taken at that point
//! is what gets stored and replayed to every later reader.

use std::sync::Arc;

use hoard_error::{Error, ErrorType, OkOrErr, Result};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::storage::{Backend, BodyReader};

// A single-shot event: fires exactly once, any number of waiters.
pub(crate) struct Flag {
    tx: watch::Sender<bool>,
}

impl Flag {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Flag { tx }
    }

    /// Fire the event. Returns whether this call was the first.
    pub(crate) fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as self, wait_for cannot fail while we borrow it
        let _ = rx.wait_for(|set| *set).await;
    }
}

// The body backend slot. Closing and installing race when the upstream
// worker finishes before the handler picks a backend; the slot remembers a
// close that found it empty so a late install gets sealed right away.
enum BodySlot {
    Empty,
    Set(Arc<dyn Backend>),
    ClosedEmpty,
}

impl BodySlot {
    fn backend(&self) -> Option<Arc<dyn Backend>> {
        match self {
            BodySlot::Set(backend) => Some(backend.clone()),
            _ => None,
        }
    }
}

/// An in-flight HTTP response backed by a storage [Backend].
pub struct Response {
    code: Mutex<StatusCode>,
    headers: Mutex<HeaderMap>,
    snap: OnceCell<HeaderMap>,
    body: Mutex<BodySlot>,

    headers_ready: Flag,
    body_set: Flag,
    body_complete: Flag,
    closed: Flag,
}

impl Response {
    /// A new empty response, status 200 until the writer says otherwise.
    pub fn new() -> Arc<Self> {
        Arc::new(Response {
            code: Mutex::new(StatusCode::OK),
            headers: Mutex::new(HeaderMap::new()),
            snap: OnceCell::new(),
            body: Mutex::new(BodySlot::Empty),
            headers_ready: Flag::new(),
            body_set: Flag::new(),
            body_complete: Flag::new(),
            closed: Flag::new(),
        })
    }

    /// A response whose headers are already frozen. Used by tests and by
    /// code paths that synthesize a response instead of fetching one.
    pub fn stub(code: StatusCode, snap: HeaderMap) -> Arc<Self> {
        let resp = Response::new();
        *resp.headers.lock() = snap;
        resp.write_header(code);
        resp
    }

    /// A response that is already complete and readable from `backend`.
    ///
    /// The backend is installed without being closed: the bytes it serves
    /// were published earlier (possibly by another node).
    pub fn sealed(code: StatusCode, backend: Arc<dyn Backend>) -> Arc<Self> {
        let resp = Response::stub(code, HeaderMap::new());
        *resp.body.lock() = BodySlot::Set(backend);
        resp.body_set.fire();
        resp.body_complete.fire();
        resp.closed.fire();
        resp
    }

    /// The status code of the in-flight write.
    pub fn status(&self) -> StatusCode {
        *self.code.lock()
    }

    /// Access the mutable header map of the in-flight write.
    pub fn headers_mut(&self) -> parking_lot::MutexGuard<'_, HeaderMap> {
        self.headers.lock()
    }

    /// Shorthand for inserting one header into the in-flight header map.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.headers.lock().insert(name, value);
    }

    /// The frozen header snapshot, empty if the header was never written.
    pub fn snap_header(&self) -> HeaderMap {
        self.snap.get().cloned().unwrap_or_default()
    }

    /// Freeze the header and status code. Latching: only the first call is
    /// observable, later calls are no-ops.
    pub fn write_header(&self, code: StatusCode) {
        let mut snap = self.headers.lock().clone();
        // what we replay later must not carry the origin's identity or a
        // length we cannot guarantee
        snap.remove(header::SERVER);
        snap.remove(header::CONTENT_LENGTH);
        if self.snap.set(snap).is_ok() {
            *self.code.lock() = code;
            self.headers_ready.fire();
        }
    }

    /// Append body bytes.
    ///
    /// The first write promotes to `write_header(200)` when the writer
    /// never wrote one. Suspends until a backend is installed.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.headers_ready.is_set() {
            self.write_header(StatusCode::OK);
        }
        self.body_set.wait().await;
        let backend = { self.body.lock().backend() };
        let backend = backend.or_err(ErrorType::WriteError, "no storage provided")?;
        backend.write(data).await
    }

    /// Install the storage backend for the body and release pending writes.
    ///
    /// Installing after the response was closed seals the backend
    /// immediately: the writer is gone, readers must not wait for it.
    pub fn set_body(&self, backend: Arc<dyn Backend>) {
        let late = {
            let mut slot = self.body.lock();
            let late = matches!(*slot, BodySlot::ClosedEmpty);
            *slot = BodySlot::Set(backend.clone());
            late
        };
        if late {
            tokio::spawn(async move {
                let _ = backend.close().await;
            });
        }
        self.body_set.fire();
    }

    /// The backend of this response, if one was installed.
    pub fn body(&self) -> Option<Arc<dyn Backend>> {
        self.body.lock().backend()
    }

    /// Flush buffered body bytes.
    pub async fn flush(&self) -> Result<()> {
        if !self.headers_ready.is_set() {
            self.write_header(StatusCode::OK);
        }
        let backend = { self.body.lock().backend() };
        match backend {
            Some(backend) => backend.flush().await,
            None => Ok(()),
        }
    }

    /// Seal the body: no further writes. Readers waiting on completion
    /// proceed, as do handlers waiting on [Self::wait_close].
    pub async fn close(&self) -> Result<()> {
        let backend = {
            let mut slot = self.body.lock();
            let backend = slot.backend();
            if backend.is_none() {
                *slot = BodySlot::ClosedEmpty;
            }
            backend
        };
        let result = match backend {
            Some(backend) => backend.close().await,
            None => Ok(()),
        };
        self.body_complete.fire();
        self.closed.fire();
        result
    }

    /// Drop the stored body.
    pub async fn clean(&self) -> Result<()> {
        let backend = { self.body.lock().backend() };
        match backend {
            Some(backend) => backend.clean().await,
            None => Ok(()),
        }
    }

    /// Acquire an independent reader over the body.
    ///
    /// Streaming backends hand out readers as soon as the backend is
    /// installed; the others once the body is complete.
    pub async fn get_reader(&self) -> Result<BodyReader> {
        self.body_set.wait().await;
        let backend = { self.body.lock().backend() };
        let backend = backend
            .ok_or_else(|| Error::explain(ErrorType::ReadError, "body backend disappeared"))?;
        if !backend.supports_streaming_read() {
            self.body_complete.wait().await;
        }
        backend.get_reader().await
    }

    /// The number of body bytes stored so far.
    pub fn body_length(&self) -> usize {
        self.body.lock().backend().map(|b| b.length()).unwrap_or(0)
    }

    /// Suspend until the header is written.
    pub async fn wait_headers(&self) {
        self.headers_ready.wait().await;
    }

    /// Suspend until the response is closed.
    pub async fn wait_close(&self) {
        self.closed.wait().await;
    }

    /// Whether the header was written already.
    pub fn headers_written(&self) -> bool {
        self.headers_ready.is_set()
    }

    /// Whether the body is complete.
    pub fn body_completed(&self) -> bool {
        self.body_complete.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_header_snapshot_on_write_header() {
        let resp = Response::new();
        resp.insert_header(header::CONTENT_TYPE, "application/json".parse().unwrap());
        resp.insert_header(header::SERVER, "origin/1.0".parse().unwrap());
        resp.insert_header(header::CONTENT_LENGTH, "10".parse().unwrap());

        let waiter = {
            let resp = resp.clone();
            tokio::spawn(async move { resp.wait_headers().await })
        };
        resp.write_header(StatusCode::CREATED);
        waiter.await.unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        let snap = resp.snap_header();
        assert_eq!(snap.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert!(snap.get(header::SERVER).is_none());
        assert!(snap.get(header::CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn test_write_header_latches() {
        let resp = Response::new();
        resp.write_header(StatusCode::OK);
        resp.insert_header(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        resp.write_header(StatusCode::NOT_FOUND);

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.snap_header().get(header::CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn test_write_blocks_until_body_set() {
        let resp = Response::new();
        let writer = {
            let resp = resp.clone();
            tokio::spawn(async move { resp.write(b"hello").await })
        };
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        let backend = Arc::new(MemoryBackend::new());
        resp.set_body(backend.clone());
        assert_eq!(writer.await.unwrap().unwrap(), 5);
        assert_eq!(backend.length(), 5);
        // auto-promoted to 200
        assert!(resp.headers_written());
    }

    #[tokio::test]
    async fn test_reader_gated_on_close_for_buffered_backend() {
        let resp = Response::new();
        resp.set_body(Arc::new(MemoryBackend::new()));
        resp.write(b"body").await.unwrap();

        {
            let resp = resp.clone();
            let pending = async move { resp.get_reader().await }.boxed();
            // memory backends do not stream, the reader must still be gated
            assert!(pending.now_or_never().is_none());
        }

        resp.close().await.unwrap();
        let mut reader = resp.get_reader().await.unwrap();
        assert_eq!(
            reader.read_body().await.unwrap(),
            Some(bytes::Bytes::from_static(b"body"))
        );
    }

    #[tokio::test]
    async fn test_close_fires_events_in_order() {
        let resp = Response::new();
        resp.set_body(Arc::new(MemoryBackend::new()));
        let closed = {
            let resp = resp.clone();
            tokio::spawn(async move { resp.wait_close().await })
        };
        resp.close().await.unwrap();
        assert!(resp.body_completed());
        closed.await.unwrap();
    }

    #[tokio::test]
    async fn test_sealed_response_is_readable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write(b"published").await.unwrap();
        let resp = Response::sealed(StatusCode::OK, backend);
        let mut reader = resp.get_reader().await.unwrap();
        assert_eq!(
            reader.read_body().await.unwrap(),
            Some(bytes::Bytes::from_static(b"published"))
        );
    }
}
