//! CouchDB peer access over HTTP.
//!
//! [`HttpStore`] is the production [`Store`]: JSON request/response
//! plumbing on reqwest with rustls, per-request basic auth, and a single
//! transparent retry when the peer closed an idle connection (CouchDB
//! drops idle keep-alive connections aggressively). One client per peer
//! is shared by every database handle cloned from it, so connection
//! pooling happens per peer rather than per database.

use async_trait::async_trait;
use reqwest::{Client, Method, Url, header};
use serde_json::Value;
use tracing::debug;

use super::{Query, Result, Store, StoreError};
use crate::config::{ConfigError, PeerConfig};

pub struct HttpStore {
    client: Client,
    base: Url,
    basic: Option<(String, String)>,
}

impl HttpStore {
    /// Build a client for the peer described by `config`.
    ///
    /// The request timeout applies to every call, including long-poll
    /// `_changes` requests; see [`PeerConfig::request_timeout`] for the
    /// relationship with the server-side long-poll timeout.
    pub fn connect(config: &PeerConfig) -> std::result::Result<Self, ConfigError> {
        let base = Url::parse(&config.url).map_err(|e| ConfigError::InvalidUrl {
            url: config.url.clone(),
            message: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(ConfigError::InvalidUrl {
                url: config.url.clone(),
                message: "URL cannot carry path segments".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base,
            basic: config.basic.clone(),
        })
    }

    fn build_url(&self, parts: &[&str], query: &Query) -> Result<(Url, String)> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| StoreError::Transport {
                path: self.base.to_string(),
                message: "base URL cannot carry path segments".to_string(),
            })?;
            segments.pop_if_empty();
            segments.extend(parts);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.pairs());
        }
        let path = format!("/{}", parts.join("/"));
        Ok((url, path))
    }

    async fn request(
        &self,
        method: Method,
        parts: &[&str],
        query: &Query,
        body: Option<&Value>,
    ) -> Result<Value> {
        let (url, path) = self.build_url(parts, query)?;
        // One automatic retry in case the peer closed an idle connection.
        let mut retried = false;
        loop {
            let mut req = self
                .client
                .request(method.clone(), url.clone())
                .header(header::ACCEPT, "application/json");
            if let Some((username, password)) = &self.basic {
                req = req.basic_auth(username, Some(password));
            }
            if method == Method::POST || method == Method::PUT {
                req = req.header(header::CONTENT_TYPE, "application/json");
            }
            if let Some(body) = body {
                req = req.json(body);
            }
            match req.send().await {
                Ok(response) => return decode(response, &path).await,
                Err(e) if !retried && retriable(&e) => {
                    debug!(%path, error = %e, "connection closed by peer, retrying once");
                    retried = true;
                }
                Err(e) => return Err(map_transport(e, &path)),
            }
        }
    }
}

fn retriable(e: &reqwest::Error) -> bool {
    !e.is_timeout() && (e.is_connect() || e.is_request())
}

fn map_transport(e: reqwest::Error, path: &str) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout {
            path: path.to_string(),
        }
    } else {
        StoreError::Transport {
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}

async fn decode(response: reqwest::Response, path: &str) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(|e| StoreError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        });
    }
    // CouchDB error bodies are {"error": ..., "reason": ...}; fall back
    // to the HTTP reason phrase when the body is not JSON.
    let reason = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|v| v["reason"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown")
                .to_string()
        });
    Err(StoreError::from_status(status.as_u16(), path, &reason))
}

#[async_trait]
impl Store for HttpStore {
    async fn get(&self, parts: &[&str], query: &Query) -> Result<Value> {
        self.request(Method::GET, parts, query, None).await
    }

    async fn post(&self, body: Option<&Value>, parts: &[&str], query: &Query) -> Result<Value> {
        self.request(Method::POST, parts, query, body).await
    }

    async fn put(&self, body: Option<&Value>, parts: &[&str], query: &Query) -> Result<Value> {
        self.request(Method::PUT, parts, query, body).await
    }

    async fn delete(&self, parts: &[&str], query: &Query) -> Result<Value> {
        self.request(Method::DELETE, parts, query, None).await
    }
}
