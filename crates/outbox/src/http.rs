//! `Transport` over HTTP with JSON command bodies.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde_json::Value;

use crate::error::RequestError;
use crate::types::{Method, Request, Response, Transport};

const HTTP_CONNECT_TIMEOUT_MS: u64 = 5_000;
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;

const JSON_CODE_BAD_REQUEST: u32 = 400;
const JSON_CODE_SOCKET_INTERRUPTED: u32 = 359;
const UNIQUE_CONSTRAINT_MESSAGE: &str = "Unique Constraints Violation";
const SOCKET_TITLE: &str = "Socket";

/// Commands whose responses are used to measure the server clock offset.
const TIME_SKEW_COMMANDS: [&str; 3] = ["OpenReport", "ReconnectApp", "OpenApp"];

#[derive(Clone, Debug)]
pub struct HttpTransport {
    base_url: String,
    secure_base_url: String,
    client: Client,
    time_skew_ms: Arc<AtomicI64>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, secure_base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(HTTP_CONNECT_TIMEOUT_MS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .tcp_nodelay(true)
            .build()
            .context("build http client")?;
        Ok(Self::with_client(base_url, secure_base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, secure_base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into(),
            secure_base_url: secure_base_url.into(),
            client,
            time_skew_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Server clock minus local clock, in milliseconds, as last measured
    /// from the `Date` header of a skew-measuring command.
    pub fn time_skew_ms(&self) -> i64 {
        self.time_skew_ms.load(Ordering::Acquire)
    }

    pub fn endpoint(&self, request: &Request) -> String {
        let base = if request.secure {
            &self.secure_base_url
        } else {
            &self.base_url
        };
        format!("{}/api/{}", base.trim_end_matches('/'), request.command)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dispatch(&self, request: &Request) -> Result<Response, RequestError> {
        let url = self.endpoint(request);
        let builder = match request.method {
            Method::Post => self.client.post(&url).json(&request.payload),
            Method::Get => self.client.get(&url).query(&query_pairs(request)),
        };
        let started = Utc::now().timestamp_millis();
        let response = builder.send().await.map_err(|err| {
            if err.is_builder() {
                RequestError::Rejected {
                    status: 0,
                    message: err.to_string(),
                }
            } else {
                tracing::debug!(error = ?err, command = %request.command, "request failed to fetch");
                RequestError::Offline
            }
        })?;

        if TIME_SKEW_COMMANDS.contains(&request.command.as_str()) {
            let date = response
                .headers()
                .get(header::DATE)
                .and_then(|value| value.to_str().ok());
            let skew = time_skew_ms(date, started, Utc::now().timestamp_millis());
            self.time_skew_ms.store(skew, Ordering::Release);
            tracing::debug!(command = %request.command, skew_ms = skew, "measured server time skew");
        }

        let status = response.status();
        if let Some(err) = classify_status(status.as_u16()) {
            return Err(err);
        }
        let body = response.bytes().await.map_err(|err| {
            tracing::debug!(error = ?err, command = %request.command, "response body interrupted");
            RequestError::Offline
        })?;
        let parsed: Response = serde_json::from_slice(&body).map_err(|err| RequestError::Rejected {
            status: status.as_u16(),
            message: format!("decode response: {err}"),
        })?;
        classify_response(parsed)
    }
}

/// Map a non-success HTTP status to a request error.
pub fn classify_status(status: u16) -> Option<RequestError> {
    if StatusCode::from_u16(status).is_ok_and(|s| s.is_success()) {
        return None;
    }
    Some(match status {
        429 => RequestError::Throttled,
        500 | 502 | 504 | 520 => RequestError::ServiceInterrupted { status },
        _ => RequestError::Rejected {
            status,
            message: StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("unknown status")
                .to_string(),
        },
    })
}

/// Inspect the command-level result of a parsed response.
pub fn classify_response(response: Response) -> Result<Response, RequestError> {
    if response.json_code == JSON_CODE_BAD_REQUEST
        && response.message.as_deref() == Some(UNIQUE_CONSTRAINT_MESSAGE)
    {
        return Err(RequestError::DuplicateRecord);
    }
    if response.json_code == JSON_CODE_SOCKET_INTERRUPTED && response.title.as_deref() == Some(SOCKET_TITLE) {
        return Err(RequestError::ServiceInterrupted {
            status: JSON_CODE_SOCKET_INTERRUPTED as u16,
        });
    }
    Ok(response)
}

/// Offset of the server clock given its `Date` header and the local send
/// and receive times. Half the round trip is credited to the response leg.
/// A missing or unparseable header yields zero.
pub fn time_skew_ms(date_header: Option<&str>, started_ms: i64, finished_ms: i64) -> i64 {
    let Some(server) = date_header.and_then(|raw| DateTime::parse_from_rfc2822(raw).ok()) else {
        return 0;
    };
    let latency = (finished_ms - started_ms) / 2;
    server.timestamp_millis() - started_ms + latency
}

fn query_pairs(request: &Request) -> Vec<(String, String)> {
    request
        .payload
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}
