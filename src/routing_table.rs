// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # Routing Table
//!
//! The authoritative in-memory routing state: a map from [`RoutingKey`] to the
//! set of backends serving it.
//!
//! Every mutation reports whether the table actually changed. That flag is
//! what decides if HAProxy gets reconfigured, so applying the same input twice
//! never causes a second reload.
//!
//! Backends are deduplicated by `(address, port)` and kept in insertion order.
//! Each backend remembers when it was last confirmed by the routing API so it
//! can expire once its TTL runs out.
//!
//! The table itself is not synchronised; the updater owns it behind a lock.

use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::models::{BackendServer, RoutingKey};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("invalid routing key {0}: port must be between 1 and 65535")]
    InvalidKey(RoutingKey),
}

/// A backend together with the last time the routing API confirmed it.
#[derive(Debug, Clone)]
pub struct TrackedBackend {
    pub server: BackendServer,
    pub updated_at: Instant,
}

impl TrackedBackend {
    pub fn new(server: BackendServer, updated_at: Instant) -> Self {
        Self { server, updated_at }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.server.ttl_seconds != 0
            && now.saturating_duration_since(self.updated_at)
                > Duration::from_secs(self.server.ttl_seconds)
    }
}

/// The ordered backends bound to one routing key.
///
/// Equality ignores `updated_at`: two entries are equal when they list the
/// same servers in the same order.
#[derive(Debug, Clone, Default)]
pub struct RoutingTableEntry {
    backends: Vec<TrackedBackend>,
}

impl RoutingTableEntry {
    /// Build an entry from servers observed at `now`.
    ///
    /// When two servers share `(address, port)` the later one replaces the
    /// earlier one only if its modification tag supersedes it.
    pub fn new(servers: impl IntoIterator<Item = BackendServer>, now: Instant) -> Self {
        let mut entry = Self::default();
        for server in servers {
            match entry.position(&server) {
                Some(pos) => {
                    let existing = &mut entry.backends[pos].server;
                    if server.modification_tag.succeeds(&existing.modification_tag) {
                        *existing = server;
                    }
                }
                None => entry.backends.push(TrackedBackend::new(server, now)),
            }
        }
        entry
    }

    pub fn backends(&self) -> &[TrackedBackend] {
        &self.backends
    }

    pub fn servers(&self) -> impl Iterator<Item = &BackendServer> {
        self.backends.iter().map(|backend| &backend.server)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn position(&self, server: &BackendServer) -> Option<usize> {
        self.backends
            .iter()
            .position(|backend| backend.server.same_server(server))
    }

    /// Reorder so backends already present in `existing` keep their relative
    /// order and come first; new ones follow in their given order.
    fn ordered_like(mut self, existing: &RoutingTableEntry) -> Self {
        let mut ordered = Vec::with_capacity(self.backends.len());
        for old in &existing.backends {
            if let Some(pos) = self.position(&old.server) {
                ordered.push(self.backends.remove(pos));
            }
        }
        ordered.append(&mut self.backends);
        Self { backends: ordered }
    }
}

impl PartialEq for RoutingTableEntry {
    fn eq(&self, other: &Self) -> bool {
        self.servers().eq(other.servers())
    }
}

impl Eq for RoutingTableEntry {}

/// Immutable deep copy of the routing table, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    routes: BTreeMap<RoutingKey, Vec<BackendServer>>,
}

impl Snapshot {
    pub fn routes(&self) -> &BTreeMap<RoutingKey, Vec<BackendServer>> {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromIterator<(RoutingKey, Vec<BackendServer>)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (RoutingKey, Vec<BackendServer>)>>(iter: T) -> Self {
        Self {
            routes: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: HashMap<RoutingKey, RoutingTableEntry>,
}

fn check_key(key: &RoutingKey) -> Result<(), TableError> {
    if key.is_valid() {
        Ok(())
    } else {
        Err(TableError::InvalidKey(key.clone()))
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry at `key`.
    ///
    /// Backends that were already bound to `key` keep their position, so a
    /// replacement listing the same servers in another order is not a change.
    /// An empty entry removes the key.
    pub fn set(&mut self, key: RoutingKey, entry: RoutingTableEntry) -> Result<bool, TableError> {
        check_key(&key)?;

        let entry = match self.entries.get(&key) {
            Some(existing) => entry.ordered_like(existing),
            None => entry,
        };

        if entry.is_empty() {
            return Ok(self.entries.remove(&key).is_some());
        }

        let changed = self.entries.get(&key) != Some(&entry);
        self.entries.insert(key, entry);
        Ok(changed)
    }

    /// Add `server` to `key`, or replace the backend with the same
    /// `(address, port)` when the incoming modification tag supersedes it.
    ///
    /// An upsert repeating the stored tag and fields only refreshes the
    /// backend's TTL clock.
    pub fn upsert_backend(
        &mut self,
        key: RoutingKey,
        server: BackendServer,
        now: Instant,
    ) -> Result<bool, TableError> {
        check_key(&key)?;

        let entry = self.entries.entry(key).or_default();
        let Some(pos) = entry.position(&server) else {
            entry.backends.push(TrackedBackend::new(server, now));
            return Ok(true);
        };

        let existing = &mut entry.backends[pos];
        if server
            .modification_tag
            .succeeds(&existing.server.modification_tag)
        {
            let changed = existing.server != server;
            existing.server = server;
            existing.updated_at = now;
            return Ok(changed);
        }

        if existing.server == server {
            existing.updated_at = now;
        } else {
            debug!(
                "Ignoring upsert of {}:{} with outdated modification tag {:?} (stored {:?}).",
                server.address,
                server.port,
                server.modification_tag,
                existing.server.modification_tag
            );
        }
        Ok(false)
    }

    /// Remove the backend sharing `(address, port)` with `server`.
    ///
    /// Deleting an unknown backend is a no-op. The delete is honored only when
    /// its modification tag is at least as new as the stored one.
    pub fn delete_backend(
        &mut self,
        key: &RoutingKey,
        server: &BackendServer,
    ) -> Result<bool, TableError> {
        check_key(key)?;

        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        let Some(pos) = entry.position(server) else {
            return Ok(false);
        };

        let stored = &entry.backends[pos].server.modification_tag;
        if !server.modification_tag.succeeds_or_equals(stored) {
            debug!(
                "Ignoring delete of {}:{} with outdated modification tag {:?} (stored {:?}).",
                server.address, server.port, server.modification_tag, stored
            );
            return Ok(false);
        }

        entry.backends.remove(pos);
        if entry.is_empty() {
            self.entries.remove(key);
        }
        Ok(true)
    }

    /// Drop every backend whose TTL expired before `now`, then every entry
    /// left without backends.
    pub fn prune_stale(&mut self, now: Instant) -> bool {
        let mut changed = false;
        self.entries.retain(|key, entry| {
            entry.backends.retain(|backend| {
                if backend.is_stale(now) {
                    info!(
                        "Pruning stale backend {}:{} from {} (ttl {}s).",
                        backend.server.address,
                        backend.server.port,
                        key,
                        backend.server.ttl_seconds
                    );
                    changed = true;
                    return false;
                }
                true
            });
            !entry.is_empty()
        });
        changed
    }

    pub fn snapshot(&self) -> Snapshot {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.servers().cloned().collect()))
            .collect()
    }

    pub fn get(&self, key: &RoutingKey) -> Option<&RoutingTableEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
