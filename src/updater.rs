// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # Updater
//!
//! Owns the routing table and reconciles it from two inputs:
//!
//! - push events from the routing API subscription
//! - periodic bulk syncs of the full route listing
//!
//! While a bulk sync is in flight incoming events are cached and replayed, in
//! arrival order, once the listing has been merged. Every change to the table
//! is followed by a call to the [`Configurer`] while the table lock is still
//! held, so snapshots reach HAProxy in the order the table changed.

use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::configurer::Configurer;
use crate::models::{Action, BackendServer, RoutingKey, TcpEvent, TcpRouteMapping};
use crate::routing_api::RouteSource;
use crate::routing_table::{RoutingTable, RoutingTableEntry, Snapshot, TableError};
use crate::token::TokenSource;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid route: {0}")]
    Validation(#[from] TableError),
    #[error("failed to configure HAProxy: {0:#}")]
    Configure(anyhow::Error),
}

#[derive(Default)]
struct UpdaterState {
    table: RoutingTable,
    syncing: bool,
    cached_events: Vec<TcpEvent>,
}

pub struct Updater {
    state: Mutex<UpdaterState>,
    route_source: Arc<dyn RouteSource>,
    token_source: Arc<dyn TokenSource>,
    configurer: Arc<dyn Configurer>,
}

impl Updater {
    pub fn new(
        route_source: Arc<dyn RouteSource>,
        token_source: Arc<dyn TokenSource>,
        configurer: Arc<dyn Configurer>,
    ) -> Self {
        Self {
            state: Mutex::new(UpdaterState::default()),
            route_source,
            token_source,
            configurer,
        }
    }

    /// Apply one push event, or cache it while a bulk sync is running.
    pub async fn handle_event(&self, event: TcpEvent) {
        let mut state = self.state.lock().await;

        if state.syncing {
            debug!(
                "caching-event: {} {}:{} on port {}",
                event.action,
                event.mapping.host_ip,
                event.mapping.host_port,
                event.mapping.external_port
            );
            state.cached_events.push(event);
            return;
        }

        if apply_event(&mut state.table, &event, Instant::now()) {
            self.configure(&state.table).await;
        }
    }

    /// Merge the full route listing into the table.
    ///
    /// Only keys present in the listing are replaced; keys the listing does
    /// not mention are left to their TTLs and to delete events. A sync
    /// requested while another one is running returns immediately.
    pub async fn sync(&self) {
        match self.token_source.fetch_token(false).await {
            Ok(token) => self.route_source.set_token(&token.access_token),
            Err(e) => {
                error!("error-fetching-token: {:#}", e);
                return;
            }
        }

        {
            let mut state = self.state.lock().await;
            if state.syncing {
                debug!("Bulk sync already in progress, skipping.");
                return;
            }
            state.syncing = true;
        }

        debug!("Starting bulk sync of TCP routes.");
        let listing = self.fetch_mappings().await;

        let mut state = self.state.lock().await;
        let mut changed = match listing {
            Ok(mappings) => {
                let count = mappings.len();
                let changed = merge_mappings(&mut state.table, mappings, Instant::now());
                info!(
                    "Bulk sync fetched {} TCP route mappings (changed={}).",
                    count, changed
                );
                changed
            }
            Err(e) => {
                error!("Failed to fetch TCP route mappings: {:#}", e);
                false
            }
        };

        state.syncing = false;
        let cached = std::mem::take(&mut state.cached_events);
        if !cached.is_empty() {
            debug!("Applying {} events cached during sync.", cached.len());
        }
        for event in &cached {
            changed |= apply_event(&mut state.table, event, Instant::now());
        }

        if changed {
            self.configure(&state.table).await;
        }
    }

    /// Drop backends whose TTL expired and reconfigure if any were removed.
    pub async fn prune_stale(&self) {
        let mut state = self.state.lock().await;
        if state.table.prune_stale(Instant::now()) {
            self.configure(&state.table).await;
        }
    }

    /// Replace the backends of each given key, as the legacy admin endpoint
    /// does. Returns whether the table changed.
    pub async fn update(
        &self,
        routes: Vec<(RoutingKey, Vec<BackendServer>)>,
    ) -> Result<bool, UpdateError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let mut changed = false;
        for (key, servers) in routes {
            changed |= state.table.set(key, RoutingTableEntry::new(servers, now))?;
        }

        if changed {
            self.configurer
                .configure(&state.table.snapshot())
                .await
                .map_err(UpdateError::Configure)?;
        }
        Ok(changed)
    }

    pub async fn syncing(&self) -> bool {
        self.state.lock().await.syncing
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.state.lock().await.table.snapshot()
    }

    /// List mappings, refreshing the token and retrying once when the routing
    /// API rejects it.
    async fn fetch_mappings(&self) -> Result<Vec<TcpRouteMapping>> {
        match self.route_source.tcp_route_mappings().await {
            Err(e) if e.is_unauthorized() => {
                warn!("Routing API rejected the token, refreshing it: {}", e);
                let token = self.token_source.fetch_token(true).await?;
                self.route_source.set_token(&token.access_token);
                Ok(self.route_source.tcp_route_mappings().await?)
            }
            result => Ok(result?),
        }
    }

    async fn configure(&self, table: &RoutingTable) {
        if let Err(e) = self.configurer.configure(&table.snapshot()).await {
            error!("Failed to configure HAProxy: {:#}", e);
        }
    }
}

fn apply_event(table: &mut RoutingTable, event: &TcpEvent, now: Instant) -> bool {
    let (key, server) = match event.mapping.to_route() {
        Ok(route) => route,
        Err(e) => {
            warn!(
                "Dropping {} event for port {}: {}",
                event.action, event.mapping.external_port, e
            );
            return false;
        }
    };

    let result = match event.action {
        Action::Upsert => table.upsert_backend(key, server, now),
        Action::Delete => table.delete_backend(&key, &server),
    };
    result.unwrap_or_else(|e| {
        warn!("Dropping {} event: {}", event.action, e);
        false
    })
}

/// Group `mappings` by routing key and replace each of those keys.
fn merge_mappings(table: &mut RoutingTable, mappings: Vec<TcpRouteMapping>, now: Instant) -> bool {
    let mut routes: BTreeMap<RoutingKey, Vec<BackendServer>> = BTreeMap::new();
    for mapping in mappings {
        match mapping.to_route() {
            Ok((key, server)) => routes.entry(key).or_default().push(server),
            Err(e) => warn!(
                "Skipping TCP route mapping {}:{} on port {}: {}",
                mapping.host_ip, mapping.host_port, mapping.external_port, e
            ),
        }
    }

    let mut changed = false;
    for (key, servers) in routes {
        match table.set(key, RoutingTableEntry::new(servers, now)) {
            Ok(set_changed) => changed |= set_changed,
            Err(e) => warn!("Skipping synced route: {}", e),
        }
    }
    changed
}
