pub mod client;

pub use client::HttpClient;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Method;
use url::Url;

use crate::error::TransportError;

/// Represents the type of body content in an HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyType {
    Json,
    FormUrlEncoded,
    Xml,
    Multipart,
    Raw,
    None,
}

impl BodyType {
    /// Detects the body type from the Content-Type header.
    pub fn detect_body_type(headers: &HeaderMap) -> BodyType {
        if let Some(content_type) = headers.get(CONTENT_TYPE) {
            if let Ok(value) = content_type.to_str() {
                let value_lower = value.to_lowercase();
                if value_lower.contains("json") {
                    return BodyType::Json;
                } else if value_lower.contains("application/x-www-form-urlencoded") {
                    return BodyType::FormUrlEncoded;
                } else if value_lower.contains("xml") {
                    return BodyType::Xml;
                } else if value_lower.contains("multipart/form-data") {
                    return BodyType::Multipart;
                } else {
                    return BodyType::Raw;
                }
            }
        }
        BodyType::None
    }
}

/// Represents an HTTP request with all its components.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: String,
    pub body_type: BodyType,
}

impl HttpRequest {
    /// Creates a new `HttpRequest`, auto-detecting the body type from headers.
    pub fn new(method: Method, url: Url, headers: HeaderMap, body: String) -> Self {
        let body_type = BodyType::detect_body_type(&headers);
        Self {
            method,
            url,
            headers,
            body,
            body_type,
        }
    }

    /// Convenience constructor for a bodiless GET.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url, HeaderMap::new(), String::new())
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Approximate size of the request on the wire: request line, headers and body.
    pub fn byte_size(&self) -> usize {
        let line = self.method.as_str().len() + self.url.as_str().len() + 12;
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.as_str().len() + v.len() + 4)
            .sum();
        line + headers + self.body.len()
    }
}

/// A response as returned by the host transport.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status,
            body: body.into(),
            elapsed,
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// One captured request/response pair.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
}

impl Exchange {
    pub fn new(request: HttpRequest, response: Option<HttpResponse>) -> Self {
        Self { request, response }
    }
}

/// Replays requests on behalf of the engine. Implemented by the host
/// interception tool; [`HttpClient`] is the bundled reqwest implementation.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}
