//! Replayable request capture
//!
//! A `reqwest::RequestBuilder` is consumed by `send()`, so a request that may
//! have to be re-issued after a refresh is kept as plain data instead. Bodies
//! are `Bytes`, which makes the clone for each send a refcount bump.

use bytes::Bytes;
use common::Secret;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Method, URL, headers and body of an outbound call.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl AuthRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Add or replace a header.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("invalid value for header {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set `content-type`.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::InvalidRequest(format!("serializing JSON body: {e}")))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(body));
        Ok(self)
    }
}

/// An `AuthRequest` on its way through the pipeline.
///
/// The original request is never mutated. `retried` flips once, the first
/// time the request is handed to the refresh coordinator, and a request that
/// is already retried is never handed over again.
#[derive(Debug)]
pub struct TrackedRequest {
    id: Uuid,
    request: AuthRequest,
    retried: bool,
    sent_with: Option<Secret<String>>,
}

impl TrackedRequest {
    pub fn new(request: AuthRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            retried: false,
            sent_with: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &AuthRequest {
        &self.request
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// Access credential the first send carried.
    pub fn sent_with(&self) -> Option<&Secret<String>> {
        self.sent_with.as_ref()
    }

    pub(crate) fn record_access(&mut self, access: Option<Secret<String>>) {
        self.sent_with = access;
    }
}
