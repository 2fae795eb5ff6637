// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # Watcher
//!
//! Keeps a subscription to the routing API event stream alive and feeds the
//! [`Updater`].
//!
//! A subscription worker owns the event source and cycles through three
//! states:
//!
//! 1. FetchingToken: force-refresh the OAuth token
//! 2. Subscribing: open the event stream
//! 3. Streaming: forward events until the stream fails, then close it and go
//!    back to fetching a token
//!
//! Failures in the first two states are retried after the subscription retry
//! interval. The main loop applies forwarded events in arrival order and
//! starts a bulk sync for every request from the [`crate::syncer::Syncer`].
//! Syncs still running at shutdown are aborted, so nothing reconfigures
//! HAProxy once [`Watcher::run`] has returned.

use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::models::TcpEvent;
use crate::routing_api::{EventSource, RouteSource};
use crate::token::TokenSource;
use crate::updater::Updater;

const EVENT_BUFFER: usize = 1024;

pub struct Watcher {
    route_source: Arc<dyn RouteSource>,
    token_source: Arc<dyn TokenSource>,
    updater: Arc<Updater>,
    sync_requests: mpsc::Receiver<()>,
    retry_interval: Duration,
}

impl Watcher {
    pub fn new(
        route_source: Arc<dyn RouteSource>,
        token_source: Arc<dyn TokenSource>,
        updater: Arc<Updater>,
        sync_requests: mpsc::Receiver<()>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            route_source,
            token_source,
            updater,
            sync_requests,
            retry_interval,
        }
    }

    /// Run until `shutdown` flips to true. The open event stream is closed
    /// before this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Watcher started.");

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let worker = tokio::spawn(subscription_worker(
            self.route_source.clone(),
            self.token_source.clone(),
            event_tx,
            self.retry_interval,
            shutdown.clone(),
        ));

        let mut syncs = JoinSet::new();
        while !*shutdown.borrow() {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
                Some(event) = event_rx.recv() => {
                    self.updater.handle_event(event).await;
                }
                Some(()) = self.sync_requests.recv() => {
                    let updater = self.updater.clone();
                    syncs.spawn(async move { updater.sync().await });
                }
                Some(result) = syncs.join_next() => {
                    if let Err(e) = result {
                        error!("Bulk sync failed: {}", e);
                    }
                }
            }
        }

        if !syncs.is_empty() {
            debug!("Aborting {} in-flight bulk syncs.", syncs.len());
        }
        syncs.shutdown().await;

        // Unblocks a worker waiting for room in the channel
        drop(event_rx);
        if let Err(e) = worker.await {
            error!("Subscription worker failed: {}", e);
        }
        info!("Watcher stopped.");
    }
}

async fn subscription_worker(
    route_source: Arc<dyn RouteSource>,
    token_source: Arc<dyn TokenSource>,
    events: mpsc::Sender<TcpEvent>,
    retry_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        match token_source.fetch_token(true).await {
            Ok(token) => route_source.set_token(&token.access_token),
            Err(e) => {
                error!("error-fetching-token: {:#}", e);
                if !wait_for_retry(retry_interval, &mut shutdown).await {
                    break;
                }
                continue;
            }
        }

        let source = match route_source.subscribe_to_tcp_events().await {
            Ok(source) => {
                info!("subscribed-to-tcp-routing-events");
                source
            }
            Err(e) => {
                error!("failed-subscribing-to-tcp-routing-events: {}", e);
                if !wait_for_retry(retry_interval, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        let stopping = stream_events(source.as_ref(), &events, &mut shutdown).await;
        if let Err(e) = source.close().await {
            debug!("Failed to close TCP event stream: {}", e);
        }
        if stopping {
            break;
        }
    }
    debug!("Subscription worker stopped.");
}

/// Forward events until the stream fails or shutdown is requested. Returns
/// true when the worker should stop.
async fn stream_events(
    source: &dyn EventSource,
    events: &mpsc::Sender<TcpEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
            next = source.next() => match next {
                Ok(event) => tokio::select! {
                    result = events.send(event) => {
                        if result.is_err() {
                            return true;
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            return true;
                        }
                    }
                },
                Err(e) => {
                    error!("failed-getting-next-tcp-routing-event: {}", e);
                    return false;
                }
            },
        }
    }
}

/// Sleep for `interval` unless shutdown comes first. Returns false on
/// shutdown.
async fn wait_for_retry(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        result = shutdown.changed() => result.is_ok() && !*shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{
        eventually, mapping, FakeConfigurer, FakeEventSource, FakeRouteSource, FakeTokenSource,
    };
    use crate::routing_api::RouteSourceError;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use tokio::task::JoinHandle;

    struct Harness {
        updater: Arc<Updater>,
        routes: Arc<FakeRouteSource>,
        tokens: Arc<FakeTokenSource>,
        configurer: Arc<FakeConfigurer>,
        sync_tx: mpsc::Sender<()>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<()>,
    }

    fn start(
        routes: Arc<FakeRouteSource>,
        tokens: Arc<FakeTokenSource>,
        retry: Duration,
    ) -> Harness {
        let configurer = FakeConfigurer::new();
        let updater = Arc::new(Updater::new(
            routes.clone(),
            tokens.clone(),
            configurer.clone(),
        ));
        let (sync_tx, sync_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let watcher = Watcher::new(
            routes.clone(),
            tokens.clone(),
            updater.clone(),
            sync_rx,
            retry,
        );
        let handle = tokio::spawn(watcher.run(shutdown_rx));
        Harness {
            updater,
            routes,
            tokens,
            configurer,
            sync_tx,
            shutdown,
            handle,
        }
    }

    async fn stop(h: Harness) {
        h.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), h.handle)
            .await
            .expect("Watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_events_reach_the_updater() {
        let routes = FakeRouteSource::new();
        let source = FakeEventSource::new();
        routes.push_subscription(source.clone());
        let h = start(routes, FakeTokenSource::new(), Duration::from_millis(10));

        source.send(TcpEvent::upsert(mapping(80, "1.1.1.1", 8080, 1)));
        source.send(TcpEvent::upsert(mapping(80, "2.2.2.2", 8080, 1)));
        eventually(|| h.configurer.calls() == 2).await;

        let snapshot = h.configurer.last().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(h.tokens.requests(), vec![true]);
        assert_eq!(h.routes.tokens(), vec!["token-1"]);

        stop_and_check_closed(h, &source).await;
    }

    async fn stop_and_check_closed(h: Harness, source: &FakeEventSource) {
        stop(h).await;
        assert!(source.is_closed());
        assert_eq!(source.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_error_resubscribes() {
        let routes = FakeRouteSource::new();
        let first = FakeEventSource::new();
        let second = FakeEventSource::new();
        routes.push_subscription(first.clone());
        routes.push_subscription(second.clone());
        let h = start(routes, FakeTokenSource::new(), Duration::from_millis(10));

        eventually(|| h.routes.subscribe_calls.load(Ordering::SeqCst) == 1).await;
        first.fail(RouteSourceError::StreamEnded);
        eventually(|| h.routes.subscribe_calls.load(Ordering::SeqCst) == 2).await;
        assert_eq!(first.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.tokens.requests(), vec![true, true]);

        second.send(TcpEvent::upsert(mapping(90, "3.3.3.3", 9090, 1)));
        eventually(|| h.configurer.calls() == 1).await;

        stop_and_check_closed(h, &second).await;
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_retried() {
        let routes = FakeRouteSource::new();
        let h = start(routes, FakeTokenSource::new(), Duration::from_millis(10));

        eventually(|| h.routes.subscribe_calls.load(Ordering::SeqCst) >= 3).await;
        // Every attempt starts from a fresh token
        assert!(h.tokens.requests().len() >= 3);

        stop(h).await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_retry_wait() {
        let tokens = FakeTokenSource::new();
        tokens.fail.store(true, Ordering::SeqCst);
        let h = start(FakeRouteSource::new(), tokens, Duration::from_secs(3600));

        eventually(|| h.tokens.requests().len() == 1).await;
        assert_eq!(h.routes.subscribe_calls.load(Ordering::SeqCst), 0);

        stop(h).await;
    }

    #[tokio::test]
    async fn test_sync_request_starts_bulk_sync() {
        let routes = FakeRouteSource::new();
        routes.push_subscription(FakeEventSource::new());
        routes.push_listing(Ok(vec![mapping(80, "1.1.1.1", 8080, 1)]));
        let h = start(routes, FakeTokenSource::new(), Duration::from_millis(10));

        h.sync_tx.send(()).await.unwrap();
        eventually(|| h.configurer.calls() == 1).await;
        assert_eq!(h.routes.list_calls.load(Ordering::SeqCst), 1);

        stop(h).await;
    }

    #[tokio::test]
    async fn test_shutdown_with_full_event_buffer() {
        let routes = FakeRouteSource::new();
        let source = FakeEventSource::new();
        routes.push_subscription(source.clone());
        let h = start(routes, FakeTokenSource::new(), Duration::from_millis(10));
        h.configurer.delay_ms.store(20, Ordering::SeqCst);

        let events = EVENT_BUFFER as u32 + 100;
        for port in 1..=events {
            source.send(TcpEvent::upsert(mapping(port, "1.1.1.1", 8080, 1)));
        }
        // The worker fills the buffer while the main loop sits in a reload
        eventually(|| h.configurer.calls() >= 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        stop_and_check_closed(h, &source).await;
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stalled_sync() {
        let routes = FakeRouteSource::new();
        routes.push_subscription(FakeEventSource::new());
        routes.stall();
        routes.push_listing(Ok(vec![mapping(80, "1.1.1.1", 8080, 1)]));
        let h = start(routes, FakeTokenSource::new(), Duration::from_millis(10));

        h.sync_tx.send(()).await.unwrap();
        eventually(|| h.routes.list_calls.load(Ordering::SeqCst) == 1).await;

        let routes = h.routes.clone();
        let configurer = h.configurer.clone();
        let updater = h.updater.clone();
        stop(h).await;

        // The listing resolving after shutdown must not reach HAProxy
        routes.release();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(configurer.calls(), 0);
        assert!(updater.snapshot().await.is_empty());
    }
}
