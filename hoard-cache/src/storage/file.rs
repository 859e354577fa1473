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

//! The file storage backend.
//!
//! The body of an entry is appended to a temp file while any number of
//! readers stream it through their own file handles. A reader that catches
//! up with the writer parks on its [Subscription] channel and retries once
//! more bytes land (or the writer closes).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_error::{ErrorType, OrErr, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::subscription::Subscription;
use super::{Backend, BodyReader, ReadBody};

const READ_CHUNK_SIZE: usize = 8 * 1024;

// distinguishes temp files of this process from leftovers of a previous one
static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// File-backed body storage with streaming readers.
pub struct FileBackend {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    subscription: Arc<Subscription>,
    written: AtomicUsize,
}

impl FileBackend {
    /// Create a fresh temp file under `dir`, creating the directory first
    /// when missing.
    pub async fn new(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .or_err_with(ErrorType::FileCreateError, || {
                format!("creating cache dir {}", dir.display())
            })?;

        let name = format!(
            "hoard-cache-{}-{}",
            std::process::id(),
            NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed)
        );
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .or_err_with(ErrorType::FileCreateError, || {
                format!("creating cache file {}", path.display())
            })?;

        Ok(FileBackend {
            path,
            file: tokio::sync::Mutex::new(file),
            subscription: Arc::new(Subscription::new()),
            written: AtomicUsize::new(0),
        })
    }

    /// The temp file this backend writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn write(&self, data: &[u8]) -> Result<usize> {
        {
            let mut file = self.file.lock().await;
            file.write_all(data)
                .await
                .or_err(ErrorType::FileWriteError, "writing cache file")?;
            // make the bytes visible to reader handles before waking them
            file.flush()
                .await
                .or_err(ErrorType::FileWriteError, "flushing cache file")?;
        }
        self.written.fetch_add(data.len(), Ordering::Relaxed);
        self.subscription.notify(data.len());
        Ok(data.len())
    }

    async fn flush(&self) -> Result<()> {
        self.file
            .lock()
            .await
            .sync_data()
            .await
            .or_err(ErrorType::FileWriteError, "syncing cache file")?;
        self.subscription.notify(0);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .file
            .lock()
            .await
            .flush()
            .await
            .or_err(ErrorType::FileWriteError, "closing cache file");
        // only after the bytes are down: readers drain on channel close
        self.subscription.close();
        result
    }

    async fn clean(&self) -> Result<()> {
        // deleting under an active reader would truncate its body
        self.subscription.wait_idle().await;
        tokio::fs::remove_file(&self.path)
            .await
            .or_err_with(ErrorType::FileRemoveError, || {
                format!("removing cache file {}", self.path.display())
            })
    }

    async fn get_reader(&self) -> Result<BodyReader> {
        let file = File::open(&self.path)
            .await
            .or_err_with(ErrorType::FileOpenError, || {
                format!("opening cache file {}", self.path.display())
            })?;
        let (id, rx) = self.subscription.subscribe();
        Ok(Box::new(FileReader {
            file,
            notifications: rx,
            id,
            subscription: self.subscription.clone(),
            writer_done: false,
        }))
    }

    fn length(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    fn supports_streaming_read(&self) -> bool {
        true
    }
}

/// Reads a cache file while it may still be growing.
struct FileReader {
    file: File,
    notifications: mpsc::Receiver<usize>,
    id: u64,
    subscription: Arc<Subscription>,
    writer_done: bool,
}

#[async_trait]
impl ReadBody for FileReader {
    async fn read_body(&mut self) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = self
                .file
                .read(&mut buf)
                .await
                .or_err(ErrorType::FileReadError, "reading cache file")?;
            if n > 0 {
                return Ok(Some(Bytes::copy_from_slice(&buf[..n])));
            }
            if self.writer_done {
                return Ok(None);
            }
            // at end of file before the writer finished: park until more
            // bytes land or the writer closes
            match self.notifications.recv().await {
                Some(_) => {}
                None => self.writer_done = true,
            }
        }
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.subscription.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    fn test_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hoard-file-backend-{tag}-{}", std::process::id()))
    }

    async fn read_all(reader: &mut BodyReader) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.read_body().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let backend = FileBackend::new(&test_dir("rw")).await.unwrap();
        backend.write(b"hello ").await.unwrap();
        backend.write(b"world").await.unwrap();
        backend.close().await.unwrap();

        let mut reader = backend.get_reader().await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"hello world");
        assert_eq!(backend.length(), 11);

        drop(reader);
        backend.clean().await.unwrap();
        assert!(!backend.path().exists());
    }

    #[tokio::test]
    async fn test_reader_streams_while_writing() {
        let backend = Arc::new(FileBackend::new(&test_dir("stream")).await.unwrap());
        // reader acquired before the first write
        let mut reader = backend.get_reader().await.unwrap();

        // nothing to read yet, the reader parks
        assert!(reader.read_body().now_or_never().is_none());

        backend.write(b"chunk1").await.unwrap();
        let got = reader.read_body().await.unwrap().unwrap();
        assert_eq!(got, Bytes::from_static(b"chunk1"));

        backend.write(b"chunk2").await.unwrap();
        let got = reader.read_body().await.unwrap().unwrap();
        assert_eq!(got, Bytes::from_static(b"chunk2"));

        backend.close().await.unwrap();
        assert!(reader.read_body().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_late_reader_sees_full_body() {
        let backend = FileBackend::new(&test_dir("late")).await.unwrap();
        backend.write(b"all the bytes").await.unwrap();
        backend.close().await.unwrap();

        // acquired after close: drains immediately
        let mut reader = backend.get_reader().await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"all the bytes");
    }

    #[tokio::test]
    async fn test_clean_waits_for_readers() {
        let backend = Arc::new(FileBackend::new(&test_dir("clean")).await.unwrap());
        backend.write(b"data").await.unwrap();
        backend.close().await.unwrap();

        let reader = backend.get_reader().await.unwrap();
        let cleaner = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.clean().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cleaner.is_finished());
        assert!(backend.path().exists());

        drop(reader);
        cleaner.await.unwrap().unwrap();
        assert!(!backend.path().exists());
    }
}
