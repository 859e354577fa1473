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

//! The fan-out notification primitive behind streaming file reads.
//!
//! A single writer notifies any number of subscribed readers that more
//! bytes are available. Notifications are advisory and lossy: a subscriber
//! whose slot is full simply misses one, which is safe because readers
//! always attempt a read first and a later notification (or the writer
//! closing) will wake them again.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

struct SubState {
    closed: bool,
    next_id: u64,
    // `None` once the subscription is closed: dropping a sender is what
    // closes the subscriber's channel, but the entry must stay registered
    // so wait_idle keeps counting the reader until it unsubscribes.
    senders: HashMap<u64, Option<mpsc::Sender<usize>>>,
}

/// A lossy many-reader notification fan-out.
pub struct Subscription {
    state: Mutex<SubState>,
    count: watch::Sender<usize>,
}

impl Subscription {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Subscription {
            state: Mutex::new(SubState {
                closed: false,
                next_id: 0,
                senders: HashMap::new(),
            }),
            count,
        }
    }

    /// Register a subscriber. Returns its id and the notification channel.
    ///
    /// When the producer has already closed, the returned channel is closed
    /// and the subscriber is not counted: there is nothing left to wait for.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<usize>) {
        let (tx, rx) = mpsc::channel(1);
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if state.closed {
            drop(tx);
            return (id, rx);
        }
        state.senders.insert(id, Some(tx));
        self.count.send_replace(state.senders.len());
        (id, rx)
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock();
        if state.senders.remove(&id).is_some() {
            self.count.send_replace(state.senders.len());
        }
    }

    /// Wake every subscriber: `new_bytes` more bytes are readable
    /// (zero means "the writer flushed"). Never blocks; full slots drop
    /// the notification.
    pub fn notify(&self, new_bytes: usize) {
        let state = self.state.lock();
        for sender in state.senders.values().flatten() {
            let _ = sender.try_send(new_bytes);
        }
    }

    /// Signal producer end: every subscriber channel is closed. Subscribers
    /// stay registered until they unsubscribe themselves.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for sender in state.senders.values_mut() {
            *sender = None;
        }
    }

    /// Block until no subscribers remain. Returns immediately when there
    /// are none.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // the sender lives in self, wait_for can only fail if self is gone
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// The number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().senders.len()
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}
