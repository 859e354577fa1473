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

//! The admin surface: health, key listing, key inspection and purge.
//!
//! Expressed as a plain `http::Request -> http::Response` function so the
//! outer server can mount it on whatever admin listener it runs. All of it
//! is a thin translation layer over the index's keys/get/del.

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use log::error;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Deserialize;

use crate::key::Replacer;
use crate::{current_config, shared_cache, RequestHead};

/// Purge request body.
///
/// ```json
/// { "method": "GET", "host": "example.com", "uri": "/static?ext=txt" }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct PurgePayload {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub uri: String,
}

impl PurgePayload {
    // Normalize the payload into the variables the key template consumes.
    fn transform(mut self) -> PurgeQuery {
        if self.method.is_empty() {
            self.method = "GET".to_string();
        }

        let (path, query) = match self.uri.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (self.uri.clone(), String::new()),
        };

        let mut host = match self.host.split_once("//") {
            // prune a scheme prefix like http:// or https://
            Some((_, rest)) => rest.to_string(),
            None => self.host.clone(),
        };
        if !host.ends_with('/') {
            host.push('/');
        }

        PurgeQuery {
            method: self.method,
            host,
            path,
            query,
        }
    }
}

#[derive(Debug)]
struct PurgeQuery {
    method: String,
    host: String,
    path: String,
    query: String,
}

impl PurgeQuery {
    // Turn the key template into the regular expression purged keys must
    // match: the literal `?` is escaped so it matches verbatim.
    fn pattern(&self, template: &str) -> String {
        let escaped = match template.find('?') {
            Some(i) => format!("{}\\{}", &template[..i], &template[i..]),
            None => template.to_string(),
        };
        let mut replacer = Replacer::new();
        replacer.set("method", self.method.clone());
        replacer.set("host", self.host.clone());
        replacer.set("path", self.path.clone());
        replacer.set("query", self.query.clone());
        replacer.replace(&escaped)
    }
}

/// Serve one admin request.
pub async fn handle(req: Request<Bytes>) -> Response<Bytes> {
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/health" => reply(StatusCode::OK, None, Bytes::from_static(b"OK")),
        "/caches/purge" => handle_purge(req).await,
        "/caches/" => handle_list_keys(req),
        _ if path.starts_with("/caches/") => handle_show(req, &path).await,
        _ => reply(StatusCode::NOT_FOUND, None, Bytes::new()),
    }
}

fn handle_list_keys(req: Request<Bytes>) -> Response<Bytes> {
    if req.method() != Method::GET {
        return reply(StatusCode::METHOD_NOT_ALLOWED, None, Bytes::new());
    }
    let Some(cache) = shared_cache() else {
        return reply(StatusCode::OK, Some("application/json"), Bytes::from_static(b"[]"));
    };
    let mut keys = cache.keys();
    keys.sort_unstable();
    match serde_json::to_vec(&keys) {
        Ok(body) => reply(StatusCode::OK, Some("application/json"), Bytes::from(body)),
        Err(e) => {
            error!("encoding cache keys: {e}");
            reply(StatusCode::BAD_REQUEST, None, Bytes::new())
        }
    }
}

async fn handle_show(req: Request<Bytes>, path: &str) -> Response<Bytes> {
    if req.method() != Method::GET {
        return reply(StatusCode::METHOD_NOT_ALLOWED, None, Bytes::new());
    }
    let Some(cache) = shared_cache() else {
        return reply(StatusCode::OK, None, Bytes::new());
    };

    let raw_key = path.trim_start_matches("/caches/");
    let key = match percent_decode_str(raw_key).decode_utf8() {
        Ok(key) => key.into_owned(),
        Err(_) => return reply(StatusCode::BAD_REQUEST, None, Bytes::new()),
    };

    let head = RequestHead {
        method: req.method().clone(),
        uri: req.uri().clone(),
        headers: req.headers().clone(),
    };
    let Some(entry) = cache.get(&key, &head, false) else {
        return reply(StatusCode::OK, None, Bytes::new());
    };

    // dump the stored body verbatim
    match entry.response().get_reader().await {
        Ok(mut reader) => {
            let mut body = Vec::new();
            loop {
                match reader.read_body().await {
                    Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                    Ok(None) => break,
                    Err(e) => {
                        error!("reading cached body of {key}: {e}");
                        return reply(StatusCode::INTERNAL_SERVER_ERROR, None, Bytes::new());
                    }
                }
            }
            reply(StatusCode::OK, None, Bytes::from(body))
        }
        Err(e) => {
            error!("opening cached body of {key}: {e}");
            reply(StatusCode::INTERNAL_SERVER_ERROR, None, Bytes::new())
        }
    }
}

async fn handle_purge(req: Request<Bytes>) -> Response<Bytes> {
    if req.method() != Method::DELETE {
        return reply(StatusCode::METHOD_NOT_ALLOWED, None, Bytes::new());
    }

    let payload: PurgePayload = match serde_json::from_slice(req.body()) {
        Ok(payload) => payload,
        Err(_) => return reply(StatusCode::BAD_REQUEST, None, Bytes::new()),
    };
    let query = payload.transform();
    let pattern = query.pattern(&current_config().cache_key_template);

    let regex = match Regex::new(&pattern) {
        Ok(regex) => regex,
        Err(e) => {
            error!("purge pattern {pattern:?}: {e}");
            return reply(StatusCode::BAD_REQUEST, None, Bytes::new());
        }
    };

    let Some(cache) = shared_cache() else {
        return reply(StatusCode::OK, None, Bytes::new());
    };

    // a handful of keys in practice, scanning beats bookkeeping
    for key in cache.keys() {
        if regex.is_match(&key) {
            if let Err(e) = cache.del(&key).await {
                error!("purging {key}: {e}");
                return reply(StatusCode::INTERNAL_SERVER_ERROR, None, Bytes::new());
            }
        }
    }
    reply(StatusCode::OK, None, Bytes::new())
}

fn reply(code: StatusCode, content_type: Option<&'static str>, body: Bytes) -> Response<Bytes> {
    let mut resp = Response::new(body);
    *resp.status_mut() = code;
    if let Some(content_type) = content_type {
        resp.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_defaults_and_uri_split() {
        let payload = PurgePayload {
            method: String::new(),
            host: "example.com".to_string(),
            uri: "/static?ext=txt".to_string(),
        };
        let query = payload.transform();
        assert_eq!(query.method, "GET");
        assert_eq!(query.host, "example.com/");
        assert_eq!(query.path, "/static");
        assert_eq!(query.query, "ext=txt");
    }

    #[test]
    fn test_host_scheme_pruned() {
        let payload = PurgePayload {
            method: String::new(),
            host: "http://localhost".to_string(),
            uri: "hello".to_string(),
        };
        let query = payload.transform();
        assert_eq!(query.host, "localhost/");
        assert_eq!(query.path, "hello");
        assert_eq!(query.query, "");
    }

    #[test]
    fn test_pattern_escapes_question_mark() {
        let payload = PurgePayload {
            method: String::new(),
            host: "http://localhost".to_string(),
            uri: "hello".to_string(),
        };
        let pattern = payload
            .transform()
            .pattern("{method} {host}{path}?{query}");
        assert_eq!(pattern, "GET localhost/hello\\?");

        let regex = Regex::new(&pattern).unwrap();
        assert!(regex.is_match("GET localhost/hello?"));
        assert!(!regex.is_match("GET localhost/other?"));
    }
}
