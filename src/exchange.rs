//! One HTTP request/response cycle per call.
//!
//! Success and error answers are treated alike: the status code and the body
//! always come back, so a server-provided error payload is never lost. Only a
//! request that produced no status at all (refused connection, TLS failure,
//! timeout) is an [`ExchangeError`].

use std::fmt;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, warn};

const APPLICATION_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// A fully described request. Headers keep their insertion order.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ExchangeRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// A POST carrying a JSON body.
    pub fn post_json(url: impl Into<String>, body: String) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![(CONTENT_TYPE.as_str().to_string(), APPLICATION_JSON.to_string())],
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn accept_json(self) -> Self {
        self.header(ACCEPT.as_str(), APPLICATION_JSON)
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header(AUTHORIZATION.as_str(), format!("Bearer {token}"))
    }

    /// Case-insensitive header lookup, first match.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResponse {
    pub status: u16,
    pub body: String,
}

impl ExchangeResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request URL could not be assembled, so nothing was sent.
    #[error("invalid request url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No status was received.
    #[error("{method} {url} failed: {source}")]
    Request {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// The seam between the workflow and the network.
pub trait HttpExchange {
    fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangeResponse, ExchangeError>;
}

impl<T: HttpExchange + ?Sized> HttpExchange for &T {
    fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangeResponse, ExchangeError> {
        (**self).exchange(request)
    }
}

/// [`HttpExchange`] over a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestExchange {
    client: Client,
}

impl ReqwestExchange {
    /// `timeout` bounds each whole request. `None` disables the limit, so a
    /// stalled server blocks the call indefinitely.
    pub fn new(timeout: Option<Duration>) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ExchangeError::Client)?;
        Ok(Self { client })
    }
}

impl HttpExchange for ReqwestExchange {
    fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangeResponse, ExchangeError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        debug!(method = %request.method, url = %request.url, "sending request");
        let resp = builder.send().map_err(|source| ExchangeError::Request {
            method: request.method,
            url: request.url.clone(),
            source,
        })?;

        let status = resp.status().as_u16();
        let body = match resp.text() {
            Ok(text) => text,
            Err(e) => {
                warn!(status, "response body unreadable, treating as empty: {}", e);
                String::new()
            }
        };
        debug!(status, bytes = body.len(), "response received");
        Ok(ExchangeResponse { status, body })
    }
}
