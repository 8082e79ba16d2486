//! Header collections at the engine boundary.
//!
//! HTTP/2 does not require header name uniqueness, so a [`HeaderBlock`] maps
//! each name to an ordered value sequence. Sensitivity (names that must not
//! be compressed or cached) is carried as metadata alongside the mapping and
//! translated to `http::HeaderValue::set_sensitive` at the engine boundary,
//! which the engine encodes as HPACK never-indexed.

use hashbrown::HashMap;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};

use crate::error::{self, Result};

pub const PSEUDO_METHOD: &str = ":method";
pub const PSEUDO_PATH: &str = ":path";
pub const PSEUDO_SCHEME: &str = ":scheme";
pub const PSEUDO_AUTHORITY: &str = ":authority";
pub const PSEUDO_STATUS: &str = ":status";

const REQUEST_PSEUDO: [&str; 4] = [PSEUDO_METHOD, PSEUDO_PATH, PSEUDO_SCHEME, PSEUDO_AUTHORITY];

/// Name → ordered value sequence, plus the sensitivity marker list.
///
/// Names are normalized to lowercase on insertion, matching what the engine
/// puts on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderBlock {
    fields: HashMap<String, Vec<String>>,
    sensitive: Vec<String>,
}

impl HeaderBlock {
    pub fn new() -> HeaderBlock {
        HeaderBlock::default()
    }

    /// Replaces the whole value sequence for `name`.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> &mut Self {
        self.fields
            .insert(name.as_ref().to_ascii_lowercase(), vec![value.into()]);
        self
    }

    /// Appends a value, keeping earlier values for the same name in order.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> &mut Self {
        self.fields
            .entry(name.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.fields
            .get(&name.as_ref().to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Full ordered value sequence for `name`.
    pub fn get_all(&self, name: impl AsRef<str>) -> Option<&[String]> {
        self.fields
            .get(&name.as_ref().to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.fields.contains_key(&name.as_ref().to_ascii_lowercase())
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Names currently marked as not-to-be-compressed/cached.
    pub fn sensitive_names(&self) -> &[String] {
        &self.sensitive
    }

    /// Marks every currently-present name as sensitive. The value mapping is
    /// left untouched.
    pub fn mark_sensitive(&mut self) -> &mut Self {
        self.sensitive = self.fields.keys().cloned().collect();
        self
    }

    pub fn is_sensitive(&self, name: impl AsRef<str>) -> bool {
        let name = name.as_ref().to_ascii_lowercase();
        self.sensitive.iter().any(|n| *n == name)
    }

    /// Merges two blocks. Right-hand value sequences override left-hand on
    /// name collision; sensitivity marker lists are concatenated without
    /// deduplication.
    pub fn union(left: &HeaderBlock, right: &HeaderBlock) -> HeaderBlock {
        let mut out = left.clone();
        for (name, values) in &right.fields {
            out.fields.insert(name.clone(), values.clone());
        }
        out.sensitive.extend(right.sensitive.iter().cloned());
        out
    }

    // Pseudo-header accessors.

    pub fn method(&self) -> Option<&str> {
        self.get(PSEUDO_METHOD)
    }

    pub fn path(&self) -> Option<&str> {
        self.get(PSEUDO_PATH)
    }

    pub fn scheme(&self) -> Option<&str> {
        self.get(PSEUDO_SCHEME)
    }

    pub fn authority(&self) -> Option<&str> {
        self.get(PSEUDO_AUTHORITY)
    }

    pub fn status(&self) -> Option<&str> {
        self.get(PSEUDO_STATUS)
    }

    /// Client-initiated exchanges must carry the four request pseudo-headers.
    pub(crate) fn validate_request(&self) -> Result<()> {
        let missing: Vec<&str> = REQUEST_PSEUDO
            .iter()
            .copied()
            .filter(|name| !self.contains(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(error::protocol_violation(format!(
                "missing required pseudo-headers: {}",
                missing.join(", ")
            )))
        }
    }

    /// Builds the request handed to the engine. Pseudo-headers become the
    /// method/URI; everything else lands in the header map with sensitivity
    /// applied.
    pub(crate) fn to_request(&self) -> Result<Request<()>> {
        self.validate_request()?;
        let method = Method::from_bytes(self.method().unwrap_or_default().as_bytes())
            .map_err(|e| error::protocol_violation(format!("invalid :method: {e}")))?;
        let uri = format!(
            "{}://{}{}",
            self.scheme().unwrap_or_default(),
            self.authority().unwrap_or_default(),
            self.path().unwrap_or_default()
        );
        let uri = uri
            .parse::<Uri>()
            .map_err(|e| error::protocol_violation(format!("invalid request target: {e}")))?;

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .map_err(|e| error::protocol_violation(format!("invalid request: {e}")))?;
        *request.headers_mut() = self.to_header_map(false)?;
        Ok(request)
    }

    /// Builds the response handed to the engine; requires `:status`.
    pub(crate) fn to_response(&self) -> Result<Response<()>> {
        let status = self
            .status()
            .ok_or_else(|| error::protocol_violation("missing :status pseudo-header"))?;
        let status = status
            .parse::<StatusCode>()
            .map_err(|e| error::protocol_violation(format!("invalid :status: {e}")))?;
        let mut response = Response::builder()
            .status(status)
            .body(())
            .map_err(|e| error::protocol_violation(format!("invalid response: {e}")))?;
        *response.headers_mut() = self.to_header_map(false)?;
        Ok(response)
    }

    /// Converts the non-pseudo fields to an `http::HeaderMap`. With
    /// `reject_pseudo` (trailers), any pseudo-header is a protocol violation.
    pub(crate) fn to_header_map(&self, reject_pseudo: bool) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, values) in &self.fields {
            if name.starts_with(':') {
                if reject_pseudo {
                    return Err(error::protocol_violation(format!(
                        "pseudo-header {name} not allowed in trailers"
                    )));
                }
                continue;
            }
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| error::protocol_violation(format!("invalid header name {name}: {e}")))?;
            let sensitive = self.is_sensitive(name);
            for value in values {
                let mut header_value = HeaderValue::from_str(value).map_err(|e| {
                    error::protocol_violation(format!("invalid value for {name}: {e}"))
                })?;
                header_value.set_sensitive(sensitive);
                map.append(header_name.clone(), header_value);
            }
        }
        Ok(map)
    }

    /// Rebuilds a block from inbound request parts, restoring the request
    /// pseudo-headers the engine folded into method/URI.
    pub(crate) fn from_request_parts(parts: &http::request::Parts) -> HeaderBlock {
        let mut block = HeaderBlock::new();
        block.insert(PSEUDO_METHOD, parts.method.as_str());
        if let Some(paq) = parts.uri.path_and_query() {
            block.insert(PSEUDO_PATH, paq.as_str());
        }
        if let Some(scheme) = parts.uri.scheme_str() {
            block.insert(PSEUDO_SCHEME, scheme);
        }
        if let Some(authority) = parts.uri.authority() {
            block.insert(PSEUDO_AUTHORITY, authority.as_str());
        }
        block.absorb_header_map(&parts.headers);
        block
    }

    pub(crate) fn from_response_parts(status: StatusCode, headers: &HeaderMap) -> HeaderBlock {
        let mut block = HeaderBlock::new();
        block.insert(PSEUDO_STATUS, status.as_str());
        block.absorb_header_map(headers);
        block
    }

    pub(crate) fn from_header_map(headers: &HeaderMap) -> HeaderBlock {
        let mut block = HeaderBlock::new();
        block.absorb_header_map(headers);
        block
    }

    fn absorb_header_map(&mut self, headers: &HeaderMap) {
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            self.append(name.as_str(), value);
        }
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for HeaderBlock {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> HeaderBlock {
        let mut block = HeaderBlock::new();
        for (name, value) in iter {
            block.append(name, value);
        }
        block
    }
}
