use async_trait::async_trait;
use rand::prelude::IndexedRandom;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder, Proxy};
use std::time::{Duration, Instant};

use super::{BodyType, HttpRequest, HttpResponse, HttpTransport};
use crate::error::TransportError;

/// Bundled reqwest transport, used when no interception host supplies one.
pub struct HttpClient {
    inner: Client,
    user_agents: Vec<&'static str>,
    default_timeout: Duration,
    default_headers: HeaderMap,
}

impl HttpClient {
    pub fn new(
        timeout_seconds: u64,
        proxy_url: Option<&str>,
        custom_headers: &[(String, String)],
    ) -> Result<Self, TransportError> {
        let timeout = Duration::from_secs(timeout_seconds.max(1));

        let mut builder = ClientBuilder::new()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true);

        if let Some(proxy) = proxy_url {
            let p = Proxy::all(proxy).map_err(|e| TransportError::Setup(e.to_string()))?;
            builder = builder.proxy(p);
        }

        let inner = builder
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        let mut default_headers = HeaderMap::new();
        for (key, val) in custom_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(val),
            ) {
                default_headers.insert(name, value);
            }
        }

        let user_agents = vec![
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) \
             Gecko/20100101 Firefox/120.0",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_0) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
        ];

        Ok(Self {
            inner,
            user_agents,
            default_timeout: timeout,
            default_headers,
        })
    }

    fn get_random_user_agent(&self) -> &'static str {
        let mut rng = rand::rng();
        *self.user_agents.choose(&mut rng).unwrap_or(&"Mozilla/5.0")
    }
}

#[async_trait]
impl HttpTransport for HttpClient {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.inner.request(req.method.clone(), req.url.as_str());

        for (name, value) in self.default_headers.iter() {
            builder = builder.header(name, value);
        }

        for (name, value) in req.headers.iter() {
            builder = builder.header(name, value);
        }

        if !req.headers.contains_key(reqwest::header::USER_AGENT) {
            builder = builder.header(reqwest::header::USER_AGENT, self.get_random_user_agent());
        }

        if !req.body.is_empty() {
            if !req.headers.contains_key(reqwest::header::CONTENT_TYPE) {
                let content_type = match req.body_type {
                    BodyType::Json => "application/json",
                    BodyType::FormUrlEncoded => "application/x-www-form-urlencoded",
                    BodyType::Xml => "application/xml",
                    BodyType::Multipart => "multipart/form-data",
                    BodyType::Raw | BodyType::None => "text/plain",
                };
                builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
            }
            builder = builder.body(req.body.clone());
        }

        let start = Instant::now();
        let response = builder
            .timeout(self.default_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.default_timeout)
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(HttpResponse::new(status, body, start.elapsed()))
    }
}
