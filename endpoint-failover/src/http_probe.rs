//! A [`Probe`] speaking JSON-RPC over HTTP.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, Proxy, StatusCode};
use serde_json::json;
use tracing::{error, trace};
use url::Url;

use crate::{
    probe::{Probe, ProbeError},
    Endpoint, FailoverError,
};

/// Default path of the JSON-RPC handler.
pub const DEFAULT_PATH: &str = "/json_rpc";
/// Default method called by the probe. It must be side-effect free.
pub const DEFAULT_METHOD: &str = "get_version";

const HTTP_PROBE: &str = "HttpProbe";

/// Probes endpoints by calling a cheap JSON-RPC method.
///
/// A `401` response means the endpoint is up but rejected the credentials, a `404` means it is
/// up but doesn't serve the method. Any other failure, including a JSON-RPC error object, counts
/// as no response.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    path: String,
    method: String,
    // One client per proxy address, built on first use.
    proxied: Arc<Mutex<HashMap<String, Client>>>,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbe {
    /// Creates a probe calling [`DEFAULT_METHOD`] at [`DEFAULT_PATH`].
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Same as [`new`](Self::new), with a preconfigured client for endpoints without a proxy.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            path: DEFAULT_PATH.to_string(),
            method: DEFAULT_METHOD.to_string(),
            proxied: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the path of the JSON-RPC handler.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the JSON-RPC method to call.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Checks that the endpoint can be probed: its address is a valid URL and its proxy, if
    /// any, uses a supported scheme.
    pub fn validate_endpoint(endpoint: &Endpoint) -> Result<(), FailoverError> {
        endpoint.url()?;
        if let Some(proxy) = endpoint.proxy() {
            proxy_client(&proxy)?;
        }
        Ok(())
    }

    fn client_for(&self, endpoint: &Endpoint) -> Result<Client, FailoverError> {
        let Some(proxy) = endpoint.proxy() else {
            return Ok(self.client.clone());
        };
        let mut proxied = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = proxied.get(&proxy) {
            return Ok(client.clone());
        }
        let client = proxy_client(&proxy)?;
        proxied.insert(proxy, client.clone());
        Ok(client)
    }

    fn request_url(&self, endpoint: &Endpoint) -> Result<Url, FailoverError> {
        endpoint.url()?.join(&self.path).map_err(|err| {
            FailoverError::InvalidConfiguration(format!(
                "Invalid path {} for {}: {err}",
                self.path,
                endpoint.address()
            ))
        })
    }
}

fn proxy_client(proxy: &str) -> Result<Client, FailoverError> {
    let url = Url::parse(proxy).map_err(|err| {
        FailoverError::InvalidConfiguration(format!("Invalid proxy address {proxy}: {err}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FailoverError::NotSupported(format!(
            "proxy scheme {} is not supported",
            url.scheme()
        )));
    }
    let proxy = Proxy::all(url)
        .map_err(|err| FailoverError::InvalidConfiguration(format!("Invalid proxy: {err}")))?;
    Client::builder()
        .proxy(proxy)
        .build()
        .map_err(|err| FailoverError::InvalidConfiguration(format!("Cannot build client: {err}")))
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<(), ProbeError> {
        let url = self
            .request_url(endpoint)
            .map_err(|err| ProbeError::other(err.to_string()))?;
        let client = self
            .client_for(endpoint)
            .map_err(|err| ProbeError::other(err.to_string()))?;

        let body = json!({ "jsonrpc": "2.0", "id": "0", "method": self.method });
        let mut request = client.post(url.clone()).json(&body).timeout(timeout);
        if let Some(credentials) = endpoint.credentials() {
            request = request.basic_auth(credentials.username(), Some(credentials.password()));
        }

        let response = request.send().await.map_err(|err| {
            ProbeError::other(format!("Failed to execute POST request to {url}: {err}"))
        })?;
        match response.status() {
            StatusCode::UNAUTHORIZED => {
                return Err(ProbeError::unauthorized(format!("{url} rejected the credentials")))
            }
            StatusCode::NOT_FOUND => {
                return Err(ProbeError::not_found(format!("{url} doesn't serve {}", self.method)))
            }
            status if !status.is_success() => {
                let err_msg = format!(
                    "{HTTP_PROBE}: Unexpected http status code {status} for url={url} received"
                );
                error!(err_msg);
                return Err(ProbeError::other(err_msg));
            }
            _ => {}
        }

        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ProbeError::other(format!("Invalid JSON-RPC reply from {url}: {err}")))?;
        if let Some(err) = reply.get("error") {
            return Err(ProbeError::other(format!("{url} returned an error: {err}")));
        }
        trace!("{HTTP_PROBE}: {url} answered {}", self.method);
        Ok(())
    }
}
