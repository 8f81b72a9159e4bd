//! Resilient network client
//!
//! One HTTP client shared by the chain adapters and the fee estimator.
//! Endpoints are walked strictly in order: the first endpoint whose response
//! parses wins, and results from different endpoints are never blended. No
//! parallel racing either, so indexer load stays predictable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{EndpointFailure, Error, Result};

/// A named endpoint in an ordered fallback list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
}

impl Endpoint {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
        }
    }
}

/// Operation class, which selects the per-call timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Balance, UTXO, nonce, and fee lookups.
    Read,
    /// Transaction submission.
    Broadcast,
}

/// JSON-RPC request ID counter
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// JSON-RPC 2.0 request
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    method: String,
    params: Value,
    id: u64,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Blocking-per-call HTTP/RPC client with ordered endpoint fallback.
pub struct NetworkClient {
    client: Client,
    read_timeout: Duration,
    broadcast_timeout: Duration,
}

impl NetworkClient {
    pub fn new(read_timeout: Duration, broadcast_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("tywallet-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            read_timeout,
            broadcast_timeout,
        })
    }

    fn timeout_for(&self, op: OpClass) -> Duration {
        match op {
            OpClass::Read => self.read_timeout,
            OpClass::Broadcast => self.broadcast_timeout,
        }
    }

    /// GET a single URL and return the response body.
    pub async fn get_text(&self, url: &str, op: OpClass) -> Result<String> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout_for(op))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("HTTP {}", status)));
        }

        response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }

    /// GET each endpoint in order; return the first response `parse` accepts.
    ///
    /// A response that fails to parse counts as an endpoint failure and the
    /// walk advances, exactly like a transport error.
    pub async fn get_with<T, F>(&self, endpoints: &[Endpoint], op: OpClass, parse: F) -> Result<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let mut failures = Vec::new();

        for endpoint in endpoints {
            debug!(endpoint = %endpoint.name, "requesting");
            match self.get_text(&endpoint.url, op).await {
                Ok(body) => match parse(&body) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        warn!(endpoint = %endpoint.name, error = %e, "malformed response");
                        failures.push(EndpointFailure {
                            endpoint: endpoint.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "request failed");
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(Error::AllEndpointsFailed { failures })
    }

    /// POST the same body to each endpoint in order until one accepts.
    ///
    /// `parse` must validate the returned transaction identifier. Re-sending
    /// identical signed bytes to further endpoints is safe as long as none
    /// has accepted; a timeout after the body was handed to the transport is
    /// the one case that cannot be called a clean failure, so the walk stops
    /// with [`Error::BroadcastAmbiguous`].
    pub async fn broadcast_with<T, F>(
        &self,
        endpoints: &[Endpoint],
        content_type: &str,
        body: &str,
        parse: F,
    ) -> Result<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let mut failures = Vec::new();

        for endpoint in endpoints {
            debug!(endpoint = %endpoint.name, "broadcasting");
            let sent = self
                .client
                .post(&endpoint.url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body.to_string())
                .timeout(self.broadcast_timeout)
                .send()
                .await;

            let response = match sent {
                Err(e) if e.is_timeout() => {
                    warn!(endpoint = %endpoint.name, "broadcast timed out; outcome unknown");
                    return Err(Error::BroadcastAmbiguous(format!(
                        "{} did not answer before the deadline",
                        endpoint.name
                    )));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "broadcast failed");
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
                Ok(response) => response,
            };

            let status = response.status();
            let text = match response.text().await {
                Err(e) if e.is_timeout() => {
                    warn!(endpoint = %endpoint.name, "broadcast response timed out; outcome unknown");
                    return Err(Error::BroadcastAmbiguous(format!(
                        "{} accepted the request but the response timed out",
                        endpoint.name
                    )));
                }
                Err(e) => {
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
                Ok(text) => text,
            };

            if !status.is_success() {
                // Definitive rejection; safe to try the next endpoint.
                warn!(endpoint = %endpoint.name, status = %status, "broadcast rejected");
                failures.push(EndpointFailure {
                    endpoint: endpoint.name.clone(),
                    reason: format!("HTTP {}: {}", status, text.trim()),
                });
                continue;
            }

            match parse(&text) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(Error::AllEndpointsFailed { failures })
    }

    /// One JSON-RPC 2.0 call against a single endpoint.
    pub async fn rpc_single(
        &self,
        endpoint: &Endpoint,
        method: &str,
        params: Value,
        op: OpClass,
    ) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
        };

        let sent = self
            .client
            .post(&endpoint.url)
            .json(&request)
            .timeout(self.timeout_for(op))
            .send()
            .await;

        let response = match sent {
            Err(e) if e.is_timeout() && op == OpClass::Broadcast => {
                return Err(Error::BroadcastAmbiguous(format!(
                    "{} did not answer before the deadline",
                    endpoint.name
                )));
            }
            Err(e) => return Err(Error::Network(e.to_string())),
            Ok(response) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("HTTP {}", status)));
        }

        let parsed: JsonRpcResponse = match response.json().await {
            Err(e) if e.is_timeout() && op == OpClass::Broadcast => {
                return Err(Error::BroadcastAmbiguous(format!(
                    "{} accepted the request but the response timed out",
                    endpoint.name
                )));
            }
            Err(e) => return Err(Error::Network(e.to_string())),
            Ok(parsed) => parsed,
        };

        if let Some(error) = parsed.error {
            return Err(Error::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        parsed
            .result
            .ok_or_else(|| Error::Network("missing result in RPC response".to_string()))
    }

    /// JSON-RPC 2.0 call with ordered endpoint fallback.
    pub async fn rpc(
        &self,
        endpoints: &[Endpoint],
        method: &str,
        params: Value,
        op: OpClass,
    ) -> Result<Value> {
        let mut failures = Vec::new();

        for endpoint in endpoints {
            debug!(endpoint = %endpoint.name, method, "rpc call");
            match self.rpc_single(endpoint, method, params.clone(), op).await {
                Ok(value) => return Ok(value),
                Err(e @ Error::BroadcastAmbiguous(_)) => return Err(e),
                Err(e) => {
                    warn!(endpoint = %endpoint.name, method, error = %e, "rpc failed");
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(Error::AllEndpointsFailed { failures })
    }
}
