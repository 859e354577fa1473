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

//! Cache fingerprints.
//!
//! A fingerprint is produced by expanding a template such as
//! `{method} {host}{path}?{query}` against request variables. The same
//! template, escaped, is what the purge endpoint turns into a regular
//! expression, so expansion must be deterministic and leave unknown
//! placeholders untouched.

use std::collections::HashMap;
use std::fmt::Write;

use bytes::Bytes;
use http::header;
use sha1::{Digest, Sha1};

use crate::RequestHead;

/// Expands `{variable}` placeholders against a set of known values.
///
/// Unknown placeholders are kept verbatim. `{header:<name>}` resolves
/// against the request headers when the replacer was built from a request.
pub struct Replacer<'a> {
    vars: HashMap<&'static str, String>,
    headers: Option<&'a http::HeaderMap>,
    body: Option<&'a Bytes>,
}

impl<'a> Replacer<'a> {
    /// An empty replacer; values are added with [Self::set].
    pub fn new() -> Replacer<'static> {
        Replacer {
            vars: HashMap::new(),
            headers: None,
            body: None,
        }
    }

    /// A replacer carrying every variable a request can provide.
    pub fn from_request(head: &'a RequestHead, body: &'a Bytes) -> Replacer<'a> {
        let mut vars = HashMap::new();
        vars.insert("method", head.method.to_string());
        vars.insert("host", head.host().to_string());
        vars.insert("path", head.uri.path().to_string());
        vars.insert("query", head.uri.query().unwrap_or("").to_string());
        let content_length = head
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .unwrap_or_else(|| body.len().to_string());
        vars.insert("contentlength", content_length);
        Replacer {
            vars,
            headers: Some(&head.headers),
            body: Some(body),
        }
    }

    /// Set (or override) a variable.
    pub fn set(&mut self, name: &'static str, value: String) {
        self.vars.insert(name, value);
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(v) = self.vars.get(name) {
            return Some(v.clone());
        }
        if name == "bodyhash" {
            // hashed on demand, most templates never ask for it
            return self.body.map(|b| body_hash(b));
        }
        if let Some(header_name) = name.strip_prefix("header:") {
            let headers = self.headers?;
            return Some(
                headers
                    .get(header_name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string(),
            );
        }
        None
    }

    /// Expand every known placeholder in `template`.
    pub fn replace(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[1..end];
                    match self.resolve(name) {
                        Some(value) => out.push_str(&value),
                        // unknown placeholders stay verbatim
                        None => out.push_str(&after[..=end]),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(after);
                    return out;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Compute the fingerprint of a request under the given template.
pub fn build_key(template: &str, head: &RequestHead, body: &Bytes) -> String {
    Replacer::from_request(head, body).replace(template)
}

/// The index shard / URL lock bucket a key belongs to.
pub fn bucket_index(key: &str, buckets_num: usize) -> usize {
    (crc32fast::hash(key.as_bytes()) as usize) % buckets_num
}

/// SHA-1 hex digest of a request body.
pub fn body_hash(body: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(body);
    let raw = hasher.finalize();
    let mut s = String::with_capacity(raw.len() * 2);
    for byte in raw {
        // safe, just dumping hex into a string
        write!(s, "{:02x}", byte).unwrap();
    }
    s
}
