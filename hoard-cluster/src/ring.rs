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

//! The consistent-hash ring over cache peers.
//!
//! Every peer contributes a fixed number of points on the ring so that
//! adding or removing a node only remaps a small share of the key space.
//! The ring is rebuilt wholesale whenever the directory reports a peer
//! change; lookups never lock.

use std::cmp::Ordering;
use std::net::SocketAddr;

use crc32fast::Hasher;

// Points placed on the ring per peer. All peers carry the same weight.
const POINTS_PER_PEER: u32 = 160;

// A point on the ring.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Point {
    // the index into the peer address table
    peer: u32,
    hash: u32,
}

// We only want to compare the hash when sorting, so we implement these traits by hand.
impl Ord for Point {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl PartialOrd for Point {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The consistent hashing ring.
///
/// A [Ring] maps cache keys onto the peer set reported by the directory.
pub struct Ring {
    ring: Box<[Point]>,
    addrs: Box<[SocketAddr]>,
}

impl Ring {
    /// Build a new [Ring] from the given peer addresses.
    pub fn new(peers: &[SocketAddr]) -> Self {
        if peers.is_empty() {
            return Ring {
                ring: Box::new([]),
                addrs: Box::new([]),
            };
        }

        let mut ring = Vec::with_capacity(peers.len() * POINTS_PER_PEER as usize);
        let mut addrs = Vec::with_capacity(peers.len());

        for peer in peers {
            let mut hasher = Hasher::new();
            hasher.update(peer.ip().to_string().as_bytes());
            hasher.update(b"\0");
            hasher.update(peer.port().to_string().as_bytes());

            addrs.push(*peer);
            let peer_idx = (addrs.len() - 1) as u32;

            // Chain each point's hash off the previous one so points spread
            // over the whole u32 space.
            let mut prev_hash: u32 = 0;
            for _ in 0..POINTS_PER_PEER {
                let mut hasher = hasher.clone();
                hasher.update(&prev_hash.to_le_bytes());
                let hash = hasher.finalize();
                ring.push(Point {
                    peer: peer_idx,
                    hash,
                });
                prev_hash = hash;
            }
        }

        ring.sort_unstable();
        ring.dedup_by(|a, b| a.hash == b.hash);

        Ring {
            ring: ring.into_boxed_slice(),
            addrs: addrs.into_boxed_slice(),
        }
    }

    /// Whether the ring has no peers at all.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// The number of peers on the ring.
    pub fn peer_count(&self) -> usize {
        self.addrs.len()
    }

    // Find the ring index for the given key.
    fn point_idx(&self, key: &[u8]) -> usize {
        let hash = crc32fast::hash(key);
        match self.ring.binary_search_by(|p| p.hash.cmp(&hash)) {
            Ok(i) => i,
            // wrap around to the front when the key hashes past the last point
            Err(i) => {
                if i == self.ring.len() {
                    0
                } else {
                    i
                }
            }
        }
    }

    /// Map the given key to the peer owning it. `None` when the ring is empty.
    pub fn owner(&self, key: &[u8]) -> Option<SocketAddr> {
        self.ring
            .get(self.point_idx(key))
            .map(|p| self.addrs[p.peer as usize])
    }
}
