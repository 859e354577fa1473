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

//! Two in-process cache nodes exchanging bytes over the peer surface.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hoard_cluster::{spawn_peer_server, ClusterMemory, Ring};

fn free_addr() -> SocketAddr {
    // grab an ephemeral port, then release it for the peer server
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

// A key the given peer owns on a two-node ring.
fn key_owned_by(peers: &[SocketAddr], owner: SocketAddr) -> String {
    let ring = Ring::new(peers);
    for i in 0..1000 {
        let key = format!("exchange-key-{i}");
        if ring.owner(key.as_bytes()) == Some(owner) {
            return key;
        }
    }
    panic!("no key hashed onto {owner} in 1000 tries");
}

#[tokio::test]
async fn test_fetch_from_owning_peer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let addr_a = free_addr();
    let addr_b = free_addr();
    let peers = vec![addr_a, addr_b];

    let node_a = ClusterMemory::new("http_cache", addr_a, 1 << 20);
    let node_b = ClusterMemory::new("http_cache", addr_b, 1 << 20);
    node_a.set_peers(peers.clone());
    node_b.set_peers(peers.clone());

    let (server_a, shutdown_a) = spawn_peer_server(node_a.clone(), addr_a).await.unwrap();

    // a publishes a key it owns; b must fetch it over HTTP
    let key = key_owned_by(&peers, addr_a);
    node_a.store(&key, Bytes::from_static(b"published on a"));

    let got = node_b.load(&key).await.unwrap();
    assert_eq!(got, Bytes::from_static(b"published on a"));

    // a key nobody published is a cluster-wide miss
    let missing = key_owned_by(&peers, addr_a) + "-missing";
    let err = node_b.load(&missing).await.unwrap_err();
    assert!(err.is_no_precollect());

    let _ = shutdown_a.send(true);
    let _ = server_a.await;
}

#[tokio::test]
async fn test_owner_gone_is_a_peer_error() {
    let addr_a = free_addr();
    let addr_b = free_addr();
    let peers = vec![addr_a, addr_b];

    let node_b = ClusterMemory::new("http_cache", addr_b, 1 << 20);
    node_b.set_peers(peers.clone());

    // no server is listening on a; fetching a key a owns must surface a
    // transport error, not a silent miss
    let key = key_owned_by(&peers, addr_a);
    let err = node_b.load(&key).await.unwrap_err();
    assert!(!err.is_no_precollect());
}
