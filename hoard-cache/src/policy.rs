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

//! The cacheability and expiry decision engine.
//!
//! [cache_status] is a pure function from a request/response pair to a
//! `(is_public, expiration)` verdict for a shared cache, following
//! RFC 7234 freshness rules. The decision never looks at the body.

use std::time::{Duration, SystemTime};

use http::header;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::cache_control::CacheControl;
use crate::config::Config;
use crate::RequestHead;

/// A reason a shared cache must not store a response.
// https://datatracker.ietf.org/doc/html/rfc7234#section-3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoStoreReason {
    /// The request method is not understood as cacheable.
    RequestMethod,
    /// The request said `no-store`.
    RequestNoStore,
    /// The response said `no-store`.
    ResponseNoStore,
    /// The response is `private` and this is a shared cache.
    ResponsePrivate,
    /// The response is already stale on arrival (`max-age=0`).
    ResponseZeroLifetime,
    /// The request carried `Authorization` and no response directive
    /// permits a shared cache to store it anyway.
    AuthorizationHeader,
    /// The status code is not cacheable by default and the response gives
    /// no explicit freshness lifetime.
    StatusNotCacheable,
}

// Status codes cacheable by default.
// https://datatracker.ietf.org/doc/html/rfc7231#section-6.1
fn status_cacheable_by_default(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        200 | 203 | 204 | 206 | 300 | 301 | 404 | 405 | 410 | 414 | 501
    )
}

/// Predicates that gate which responses are admitted to the cache.
///
/// Matchers are configured as tagged variants; all configured matchers must
/// accept a response for it to be stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleMatcher {
    /// Accepts requests whose URL path starts with the prefix.
    Path { path: String },
    /// Accepts responses carrying any of the listed values for the header.
    Header { header: String, value: Vec<String> },
}

impl RuleMatcher {
    /// Whether the request/response pair passes this matcher.
    pub fn matches(
        &self,
        head: &RequestHead,
        _status: StatusCode,
        resp_headers: &HeaderMap,
    ) -> bool {
        match self {
            RuleMatcher::Path { path } => head.uri.path().starts_with(path.as_str()),
            RuleMatcher::Header { header, value } => {
                let got = resp_headers
                    .get(header)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                value.iter().any(|v| v == got)
            }
        }
    }
}

// Everything judge() extracts from the headers before scoring. A parse
// failure anywhere here suppresses caching entirely.
struct Parsed {
    req_cc: Option<CacheControl>,
    resp_cc: Option<CacheControl>,
    expires: Option<SystemTime>,
    date: Option<SystemTime>,
}

fn parse_headers(head: &RequestHead, resp_headers: &HeaderMap) -> Result<Parsed, ()> {
    let req_cc = CacheControl::from_header_map(&head.headers);
    let resp_cc = CacheControl::from_header_map(resp_headers);

    // surface delta-seconds garbage now, callers treat it as unparseable
    for cc in [&req_cc, &resp_cc].into_iter().flatten() {
        cc.max_age().map_err(|_| ())?;
        cc.s_maxage().map_err(|_| ())?;
    }

    // servers return things like `Expires: 0` to mean "already expired",
    // unparseable values are treated as absent
    let expires = resp_headers
        .get(header::EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok());

    let date = match resp_headers.get(header::DATE) {
        Some(v) => {
            let v = v.to_str().map_err(|_| ())?;
            Some(httpdate::parse_http_date(v).map_err(|_| ())?)
        }
        None => None,
    };

    // parsed only for validation, a malformed value poisons the response
    if let Some(v) = resp_headers.get(header::LAST_MODIFIED) {
        let v = v.to_str().map_err(|_| ())?;
        httpdate::parse_http_date(v).map_err(|_| ())?;
    }

    Ok(Parsed {
        req_cc,
        resp_cc,
        expires,
        date,
    })
}

fn collect_reasons(
    head: &RequestHead,
    status: StatusCode,
    parsed: &Parsed,
) -> Vec<NoStoreReason> {
    let mut reasons = Vec::new();
    let resp_cc = parsed.resp_cc.as_ref();
    let explicit_freshness = resp_cc
        .map(|cc| cc.has_explicit_freshness())
        .unwrap_or(false)
        || parsed.expires.is_some();

    match head.method {
        http::Method::GET | http::Method::HEAD => {}
        http::Method::POST => {
            if !explicit_freshness {
                reasons.push(NoStoreReason::RequestMethod);
            }
        }
        _ => reasons.push(NoStoreReason::RequestMethod),
    }

    if let Some(cc) = parsed.req_cc.as_ref() {
        if cc.no_store() {
            reasons.push(NoStoreReason::RequestNoStore);
        }
    }

    if let Some(cc) = resp_cc {
        if cc.no_store() {
            reasons.push(NoStoreReason::ResponseNoStore);
        }
        if cc.private() {
            reasons.push(NoStoreReason::ResponsePrivate);
        }
        // already stale when it arrives, storing it buys nothing
        let zero_life = matches!(cc.s_maxage(), Ok(Some(0)))
            || (matches!(cc.max_age(), Ok(Some(0))) && !matches!(cc.s_maxage(), Ok(Some(_))));
        if zero_life {
            reasons.push(NoStoreReason::ResponseZeroLifetime);
        }
    }

    if head.headers.contains_key(header::AUTHORIZATION) {
        let allowed = resp_cc
            .map(|cc| cc.allow_caching_authorized_req())
            .unwrap_or(false);
        if !allowed {
            reasons.push(NoStoreReason::AuthorizationHeader);
        }
    }

    if !status_cacheable_by_default(status) && !explicit_freshness {
        reasons.push(NoStoreReason::StatusNotCacheable);
    }

    reasons
}

// Freshness lifetime for a shared cache, RFC 7234 section 4.2:
// s-maxage, else max-age, else Expires minus Date, else already expired.
fn expiration_time(parsed: &Parsed, now: SystemTime) -> SystemTime {
    let resp_cc = parsed.resp_cc.as_ref();
    if let Some(s) = resp_cc.and_then(|cc| cc.s_maxage().ok().flatten()) {
        return now + Duration::from_secs(s.into());
    }
    if let Some(m) = resp_cc.and_then(|cc| cc.max_age().ok().flatten()) {
        return now + Duration::from_secs(m.into());
    }
    if let Some(expires) = parsed.expires {
        // a Date header is commonly missing while the response is still
        // being produced, fall back to the local clock
        let server_date = parsed.date.unwrap_or(now);
        return match expires.duration_since(server_date) {
            Ok(ahead) => now + ahead,
            Err(behind) => now - behind.duration(),
        };
    }
    now
}

/// Decide whether the response may be stored by this shared cache and until
/// when it stays fresh.
///
/// The second value is the expiration instant: for non-public verdicts it
/// paces how long the key stays claimed (`lock_timeout`), zero
/// (`UNIX_EPOCH`) when the response headers could not be parsed at all.
pub fn cache_status(
    head: &RequestHead,
    status: StatusCode,
    resp_headers: &HeaderMap,
    config: &Config,
    now: SystemTime,
) -> (bool, SystemTime) {
    let lock_timeout = Duration::from_secs(config.lock_timeout);

    // partial responses would poison every later full-body hit
    if status == StatusCode::PARTIAL_CONTENT || resp_headers.contains_key(header::CONTENT_RANGE) {
        return (false, now + lock_timeout);
    }

    if status == StatusCode::NOT_MODIFIED {
        return (false, now);
    }

    let parsed = match parse_headers(head, resp_headers) {
        Ok(parsed) => parsed,
        Err(()) => return (false, SystemTime::UNIX_EPOCH),
    };

    if !collect_reasons(head, status, &parsed).is_empty() {
        return (false, now + lock_timeout);
    }

    let mut expiration = expiration_time(&parsed, now);

    let vary = resp_headers
        .get(header::VARY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if vary == "*" {
        return (false, now + lock_timeout);
    }

    for rule in &config.rule_matchers {
        if !rule.matches(head, status, resp_headers) {
            return (false, now);
        }
    }

    if now + Duration::from_secs(1) > expiration {
        expiration = now + Duration::from_secs(config.default_max_age);
    }

    (true, expiration)
}
