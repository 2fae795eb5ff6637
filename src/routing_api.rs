// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # Routing API Client
//!
//! Access to the authoritative TCP route catalog.
//!
//! The catalog is consumed two ways:
//!
//! - a full listing of every TCP route mapping, used for periodic bulk syncs
//! - a server-sent event stream of `Upsert` / `Delete` events
//!
//! Both sit behind the [`RouteSource`] and [`EventSource`] traits so the
//! updater and watcher can be driven by fakes in tests. [`RoutingApiClient`]
//! is the HTTP implementation.

use async_trait::async_trait;
use log::warn;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::models::{Action, TcpEvent, TcpRouteMapping};

pub const TCP_ROUTES_PATH: &str = "/routing/v1/tcp_routes";
pub const TCP_ROUTE_EVENTS_PATH: &str = "/routing/v1/tcp_routes/events";

/// Timeout for plain request/response calls. The event stream has none.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest event stream line accepted before the subscription is dropped.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum RouteSourceError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("routing API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("routing API request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid routing API payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("event stream line longer than {0} bytes")]
    LineTooLong(usize),
    #[error("event stream ended")]
    StreamEnded,
    #[error("event source closed")]
    Closed,
}

impl RouteSourceError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RouteSourceError::Unauthorized(_))
    }
}

/// A subscription to the TCP route event stream.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the next event. Any error ends the subscription.
    async fn next(&self) -> Result<TcpEvent, RouteSourceError>;

    /// Close the subscription, waking up a pending [`EventSource::next`].
    async fn close(&self) -> Result<(), RouteSourceError>;
}

/// The authoritative TCP route catalog.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn tcp_route_mappings(&self) -> Result<Vec<TcpRouteMapping>, RouteSourceError>;

    async fn subscribe_to_tcp_events(&self) -> Result<Box<dyn EventSource>, RouteSourceError>;

    /// Use `access_token` for every following request.
    fn set_token(&self, access_token: &str);
}

/// One dispatched server-sent event before interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; only complete
/// lines are interpreted. Lines are capped at [`MAX_LINE_LENGTH`].
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body, returning every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RawEvent>, RouteSourceError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            if newline > MAX_LINE_LENGTH {
                return Err(RouteSourceError::LineTooLong(MAX_LINE_LENGTH));
            }
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        if self.buffer.len() > MAX_LINE_LENGTH {
            return Err(RouteSourceError::LineTooLong(MAX_LINE_LENGTH));
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Option<RawEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id and retry carry nothing the router needs
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawEvent> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(RawEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Interpret a raw event. Event types other than `Upsert` and `Delete` are
/// skipped.
pub fn decode_event(raw: &RawEvent) -> Result<Option<TcpEvent>, RouteSourceError> {
    let Ok(action) = Action::from_str(&raw.event) else {
        warn!("Skipping routing API event of unknown type {:?}.", raw.event);
        return Ok(None);
    };
    let mapping: TcpRouteMapping = serde_json::from_str(&raw.data)?;
    Ok(Some(TcpEvent { action, mapping }))
}

struct StreamState {
    response: Option<reqwest::Response>,
    decoder: EventStreamDecoder,
    pending: VecDeque<RawEvent>,
}

/// Event source reading a server-sent event response body.
pub struct HttpEventSource {
    stream: Mutex<StreamState>,
    closed: watch::Sender<bool>,
}

impl HttpEventSource {
    pub fn new(response: reqwest::Response) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            stream: Mutex::new(StreamState {
                response: Some(response),
                decoder: EventStreamDecoder::new(),
                pending: VecDeque::new(),
            }),
            closed,
        }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn next(&self) -> Result<TcpEvent, RouteSourceError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(RouteSourceError::Closed);
        }

        let mut guard = tokio::select! {
            guard = self.stream.lock() => guard,
            _ = closed.changed() => return Err(RouteSourceError::Closed),
        };
        let state = &mut *guard;

        loop {
            while let Some(raw) = state.pending.pop_front() {
                if let Some(event) = decode_event(&raw)? {
                    return Ok(event);
                }
            }

            let Some(response) = state.response.as_mut() else {
                return Err(RouteSourceError::Closed);
            };
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk?,
                _ = closed.changed() => return Err(RouteSourceError::Closed),
            };

            match chunk {
                Some(bytes) => {
                    let events = state.decoder.push(&bytes)?;
                    state.pending.extend(events);
                }
                None => {
                    state.response = None;
                    return Err(RouteSourceError::StreamEnded);
                }
            }
        }
    }

    async fn close(&self) -> Result<(), RouteSourceError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// HTTP client for the routing API.
pub struct RoutingApiClient {
    base_url: String,
    http: reqwest::Client,
    token: RwLock<String>,
}

impl RoutingApiClient {
    pub fn new(base_url: &str, skip_tls_verification: bool) -> Result<Self, RouteSourceError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tcp-router/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(skip_tls_verification)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            token: RwLock::new(String::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorization(&self) -> Option<String> {
        let token = self.token.read().unwrap_or_else(|e| e.into_inner());
        if token.is_empty() {
            None
        } else {
            Some(format!("bearer {}", token))
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RouteSourceError> {
        let request = match self.authorization() {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RouteSourceError::Unauthorized(body));
        }
        Err(RouteSourceError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RouteSource for RoutingApiClient {
    async fn tcp_route_mappings(&self) -> Result<Vec<TcpRouteMapping>, RouteSourceError> {
        let request = self
            .http
            .get(self.url(TCP_ROUTES_PATH))
            .timeout(REQUEST_TIMEOUT);
        let body = self.send(request).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn subscribe_to_tcp_events(&self) -> Result<Box<dyn EventSource>, RouteSourceError> {
        let request = self
            .http
            .get(self.url(TCP_ROUTE_EVENTS_PATH))
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = self.send(request).await?;
        Ok(Box::new(HttpEventSource::new(response)))
    }

    fn set_token(&self, access_token: &str) {
        let mut token = self.token.write().unwrap_or_else(|e| e.into_inner());
        *token = access_token.to_string();
    }
}
