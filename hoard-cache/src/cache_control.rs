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

//! Functions and utilities to help parse Cache-Control headers

use hoard_error::{Error, ErrorType, Result};
use http::HeaderValue;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::num::IntErrorKind;
use std::str;

/// The max delta-second per [RFC 9111](https://datatracker.ietf.org/doc/html/rfc9111#section-1.2.2)
// "If a cache receives a delta-seconds
// value greater than the greatest integer it can represent, or if any
// of its subsequent calculations overflows, the cache MUST consider the
// value to be either 2147483648 (2^31) or the greatest positive integer
// it can conveniently represent."
pub const DELTA_SECONDS_OVERFLOW_VALUE: u32 = 2147483648;

/// Cache control directive key type
pub type DirectiveKey = String;

/// Cache control directive value type
#[derive(Debug)]
pub struct DirectiveValue(pub Vec<u8>);

impl AsRef<[u8]> for DirectiveValue {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl DirectiveValue {
    /// A [DirectiveValue] without quotes (`"`).
    pub fn parse_as_bytes(&self) -> &[u8] {
        self.0
            .strip_prefix(&[b'"'])
            .and_then(|bytes| bytes.strip_suffix(&[b'"']))
            .unwrap_or(&self.0[..])
    }

    /// A [DirectiveValue] without quotes (`"`) as `str`.
    pub fn parse_as_str(&self) -> Result<&str> {
        str::from_utf8(self.parse_as_bytes()).or_else(|e| {
            Error::e_because(
                ErrorType::InvalidCacheControl,
                "could not parse value as utf8",
                e,
            )
        })
    }

    /// Parse the [DirectiveValue] as delta seconds
    ///
    /// `"`s are ignored. The value is capped to [DELTA_SECONDS_OVERFLOW_VALUE].
    pub fn parse_as_delta_seconds(&self) -> Result<u32> {
        match self.parse_as_str()?.parse::<u32>() {
            Ok(value) => Ok(value),
            Err(e) => {
                // delta-seconds expect to handle positive overflow gracefully
                if e.kind() == &IntErrorKind::PosOverflow {
                    Ok(DELTA_SECONDS_OVERFLOW_VALUE)
                } else {
                    Error::e_because(
                        ErrorType::InvalidCacheControl,
                        "could not parse value as u32",
                        e,
                    )
                }
            }
        }
    }
}

/// An ordered map to store cache control key value pairs.
pub type DirectiveMap = IndexMap<DirectiveKey, Option<DirectiveValue>>;

/// Parsed Cache-Control directives
#[derive(Debug)]
pub struct CacheControl {
    /// The parsed directives
    pub directives: DirectiveMap,
}

// Cache-Control   = 1#cache-directive
// cache-directive = token [ "=" ( token / quoted-string ) ]
// token           = [^\x00-\x20\(\)<>@\,;\:\\"\/\[\]\?\=\{\}\x7F]+
// quoted-string   = "(?:[^"\\]|\\.)*"
//
// note the `token` implementation excludes disallowed ASCII ranges
// and disallowed delimiters: https://datatracker.ietf.org/doc/html/rfc9110#section-5.6.2
// though it does not forbid `obs-text`: %x80-FF
static RE_CACHE_DIRECTIVE: Lazy<Regex> =
    // to break our version down further:
    // `(?-u)`: unicode support disabled, which puts the regex into "ASCII compatible mode" for specifying literal bytes like \x7F
    // `(?:^|(?:\s*[,;]\s*)`: allow either , or ; as a delimiter
    // `([^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+)`: token (directive name capture group)
    // `(?:=((?:[^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+|(?:"(?:[^"\\]|\\.)*"))))`: token OR quoted-string (directive value capture-group)
    Lazy::new(|| {
        Regex::new(r#"(?-u)(?:^|(?:\s*[,;]\s*))([^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+)(?:=((?:[^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+|(?:"(?:[^"\\]|\\.)*"))))?"#).unwrap()
    });

impl CacheControl {
    // Our parsing strategy is more permissive than the RFC in a few ways:
    // - Allows semicolons as delimiters (in addition to commas). See the regex above.
    // - Allows octets outside of visible ASCII in `token`s.
    // - Doesn't require no-value for "boolean directives," such as must-revalidate
    // - Allows quoted-string format for numeric values.
    fn from_headers(headers: http::header::GetAll<HeaderValue>) -> Option<Self> {
        let mut directives = IndexMap::new();
        // should iterate in header line insertion order
        for line in headers {
            for captures in RE_CACHE_DIRECTIVE.captures_iter(line.as_bytes()) {
                // directive key
                // header values don't have to be utf-8, but we store keys as strings for case-insensitive hashing
                let key = captures.get(1).and_then(|cap| {
                    str::from_utf8(cap.as_bytes())
                        .ok()
                        .map(|token| token.to_lowercase())
                });
                if key.is_none() {
                    continue;
                }
                // directive value
                // match token or quoted-string
                let value = captures
                    .get(2)
                    .map(|cap| DirectiveValue(cap.as_bytes().to_vec()));
                directives.insert(key.unwrap(), value);
            }
        }
        Some(CacheControl { directives })
    }

    /// Parse the `Cache-Control` header lines of the given header map.
    ///
    /// `None` when the header is absent entirely.
    pub fn from_header_map(headers: &http::HeaderMap) -> Option<Self> {
        if !headers.contains_key(http::header::CACHE_CONTROL) {
            return None;
        }
        Self::from_headers(headers.get_all(http::header::CACHE_CONTROL))
    }

    /// Whether the given directive is in the cache control.
    pub fn has_key(&self, key: &str) -> bool {
        self.directives.contains_key(key)
    }

    /// Whether the `public` directive is in the cache control.
    pub fn public(&self) -> bool {
        self.has_key("public")
    }

    /// Whether the given directive exists, and it has no value.
    fn has_key_without_value(&self, key: &str) -> bool {
        matches!(self.directives.get(key), Some(None))
    }

    /// Whether the standalone `private` exists in the cache control
    // RFC 7234: using the #field-name versions of `private`
    // means a shared cache "MUST NOT store the specified field-name(s),
    // whereas it MAY store the remainder of the response."
    // It must be a boolean form (no value) to apply to the whole response.
    // https://datatracker.ietf.org/doc/html/rfc7234#section-5.2.2.6
    pub fn private(&self) -> bool {
        self.has_key_without_value("private")
    }

    /// Whether the standalone `no-cache` exists in the cache control
    pub fn no_cache(&self) -> bool {
        self.has_key_without_value("no-cache")
    }

    /// Whether `no-store` exists.
    pub fn no_store(&self) -> bool {
        self.has_key("no-store")
    }

    fn parse_delta_seconds(&self, key: &str) -> Result<Option<u32>> {
        if let Some(Some(dir_value)) = self.directives.get(key) {
            Ok(Some(dir_value.parse_as_delta_seconds()?))
        } else {
            Ok(None)
        }
    }

    /// Return the `max-age` seconds
    pub fn max_age(&self) -> Result<Option<u32>> {
        self.parse_delta_seconds("max-age")
    }

    /// Return the `s-maxage` seconds
    pub fn s_maxage(&self) -> Result<Option<u32>> {
        self.parse_delta_seconds("s-maxage")
    }

    /// Whether `must-revalidate` exists.
    pub fn must_revalidate(&self) -> bool {
        self.has_key("must-revalidate")
    }

    /// Whether `proxy-revalidate` exists.
    pub fn proxy_revalidate(&self) -> bool {
        self.has_key("proxy-revalidate")
    }

    /// Whether a directive provides this response an explicit freshness
    /// lifetime a shared cache may use.
    pub fn has_explicit_freshness(&self) -> bool {
        self.has_key("s-maxage") || self.has_key("max-age")
    }

    /// Whether this cache-control allows a shared cache to store the
    /// response to a request that carried `Authorization`.
    // RFC 7234 https://datatracker.ietf.org/doc/html/rfc7234#section-3.2
    pub fn allow_caching_authorized_req(&self) -> bool {
        self.must_revalidate() || self.public() || self.has_key("s-maxage")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CACHE_CONTROL;

    fn parse(value: &str) -> CacheControl {
        let mut headers = http::HeaderMap::new();
        headers.insert(CACHE_CONTROL, value.parse().unwrap());
        CacheControl::from_header_map(&headers).unwrap()
    }

    #[test]
    fn test_simple_directives() {
        let cc = parse("public, max-age=10");
        assert!(cc.public());
        assert!(!cc.private());
        assert_eq!(cc.max_age().unwrap(), Some(10));
        assert!(cc.s_maxage().unwrap().is_none());
    }

    #[test]
    fn test_absent_header() {
        let headers = http::HeaderMap::new();
        assert!(CacheControl::from_header_map(&headers).is_none());
    }

    #[test]
    fn test_quoted_value() {
        let cc = parse(r#"max-age="20""#);
        assert_eq!(cc.max_age().unwrap(), Some(20));
    }

    #[test]
    fn test_invalid_delta_seconds() {
        let cc = parse("max-age=song");
        assert!(cc.max_age().is_err());
    }

    #[test]
    fn test_delta_seconds_overflow() {
        let cc = parse("max-age=99999999999999999999");
        assert_eq!(cc.max_age().unwrap(), Some(DELTA_SECONDS_OVERFLOW_VALUE));
    }

    #[test]
    fn test_private_forms() {
        assert!(parse("private").private());
        // the field-name form only covers the listed headers, not the response
        assert!(!parse(r#"private="set-cookie""#).private());
    }

    #[test]
    fn test_multiple_header_lines() {
        let mut headers = http::HeaderMap::new();
        headers.append(CACHE_CONTROL, "public".parse().unwrap());
        headers.append(CACHE_CONTROL, "max-age=30".parse().unwrap());
        let cc = CacheControl::from_header_map(&headers).unwrap();
        assert!(cc.public());
        assert_eq!(cc.max_age().unwrap(), Some(30));
    }

    #[test]
    fn test_case_insensitive_keys() {
        let cc = parse("Max-Age=5, NO-STORE");
        assert_eq!(cc.max_age().unwrap(), Some(5));
        assert!(cc.no_store());
    }

    #[test]
    fn test_authorized_req_override() {
        assert!(parse("s-maxage=10").allow_caching_authorized_req());
        assert!(parse("public").allow_caching_authorized_req());
        assert!(parse("must-revalidate").allow_caching_authorized_req());
        assert!(!parse("max-age=10").allow_caching_authorized_req());
    }
}
