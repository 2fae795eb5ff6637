// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! In-memory stand-ins for the route source, token source and configurer.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};

use crate::configurer::Configurer;
use crate::models::{ModificationTag, TcpEvent, TcpRouteMapping};
use crate::routing_api::{EventSource, RouteSource, RouteSourceError};
use crate::routing_table::Snapshot;
use crate::token::{Token, TokenSource};

pub fn mapping(port: u32, ip: &str, backend_port: u32, index: u32) -> TcpRouteMapping {
    TcpRouteMapping {
        router_group_guid: "router-group".to_string(),
        external_port: port,
        host_ip: ip.to_string(),
        host_port: backend_port,
        modification_tag: ModificationTag::new("guid", index),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeConfigurer {
    pub snapshots: Mutex<Vec<Snapshot>>,
    pub drains: AtomicUsize,
    pub fail: AtomicBool,
    /// Time every `configure` call takes, like a slow reload.
    pub delay_ms: AtomicU64,
}

impl FakeConfigurer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Snapshot> {
        self.snapshots.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Configurer for FakeConfigurer {
    async fn configure(&self, snapshot: &Snapshot) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.snapshots.lock().unwrap().push(snapshot.clone());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("configurer failure");
        }
        Ok(())
    }

    async fn stop_and_drain(&self) -> Result<()> {
        self.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTokenSource {
    /// `force_refresh` argument of every call.
    pub requests: Mutex<Vec<bool>>,
    pub fail: AtomicBool,
}

impl FakeTokenSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<bool> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenSource for FakeTokenSource {
    async fn fetch_token(&self, force_refresh: bool) -> Result<Token> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(force_refresh);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("token endpoint unavailable");
        }
        Ok(Token {
            access_token: format!("token-{}", requests.len()),
            expires_in: 3600,
        })
    }
}

pub struct FakeEventSource {
    tx: mpsc::UnboundedSender<Result<TcpEvent, RouteSourceError>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<TcpEvent, RouteSourceError>>>,
    closed: watch::Sender<bool>,
    pub close_calls: AtomicUsize,
}

impl FakeEventSource {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed,
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn send(&self, event: TcpEvent) {
        let _ = self.tx.send(Ok(event));
    }

    pub fn fail(&self, error: RouteSourceError) {
        let _ = self.tx.send(Err(error));
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl EventSource for Arc<FakeEventSource> {
    async fn next(&self) -> Result<TcpEvent, RouteSourceError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(RouteSourceError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            event = rx.recv() => event.unwrap_or(Err(RouteSourceError::StreamEnded)),
            _ = closed.changed() => Err(RouteSourceError::Closed),
        }
    }

    async fn close(&self) -> Result<(), RouteSourceError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRouteSource {
    listings: Mutex<VecDeque<Result<Vec<TcpRouteMapping>, RouteSourceError>>>,
    subscriptions: Mutex<VecDeque<Arc<FakeEventSource>>>,
    pub list_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub tokens: Mutex<Vec<String>>,
    stalled: AtomicBool,
    release: Notify,
}

impl FakeRouteSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the result of the next `tcp_route_mappings` call. With nothing
    /// queued the listing is empty.
    pub fn push_listing(&self, listing: Result<Vec<TcpRouteMapping>, RouteSourceError>) {
        self.listings.lock().unwrap().push_back(listing);
    }

    /// Queue an event source for the next subscription. With nothing queued
    /// subscribing fails.
    pub fn push_subscription(&self, source: Arc<FakeEventSource>) {
        self.subscriptions.lock().unwrap().push_back(source);
    }

    /// Make listings block until [`FakeRouteSource::release`] is called.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.stalled.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteSource for FakeRouteSource {
    async fn tcp_route_mappings(&self) -> Result<Vec<TcpRouteMapping>, RouteSourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.listings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn subscribe_to_tcp_events(&self) -> Result<Box<dyn EventSource>, RouteSourceError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        match self.subscriptions.lock().unwrap().pop_front() {
            Some(source) => Ok(Box::new(source)),
            None => Err(RouteSourceError::Status {
                status: 503,
                body: "unavailable".to_string(),
            }),
        }
    }

    fn set_token(&self, access_token: &str) {
        self.tokens.lock().unwrap().push(access_token.to_string());
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
