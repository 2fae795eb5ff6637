// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # TCP Router
//!
//! Control plane for an HAProxy based TCP router. It mirrors TCP route
//! mappings published by a routing API into the HAProxy configuration and
//! reloads HAProxy whenever the effective set of routes changes.
//!
//! Data flows in one direction:
//!
//! ```text
//! routing API ──events──▶ Watcher ──▶ Updater ──▶ RoutingTable
//!              ◀─listing── Syncer ──┘      │
//!                                          ▼
//!                       Configurer ─▶ ConfigRenderer + Reloader ─▶ HAProxy
//! ```

pub mod admin;
pub mod config;
pub mod configurer;
pub mod haproxy;
pub mod models;
pub mod reloader;
pub mod routing_api;
pub mod routing_table;
pub mod syncer;
pub mod token;
pub mod updater;
pub mod watcher;

#[cfg(test)]
mod fakes;

// Port limits
pub const MIN_PORT: u16 = 1;
pub const MAX_PORT: u16 = 65535;

pub use configurer::{Configurer, HaproxyConfigurer};
pub use haproxy::{BackendTlsConfig, ConfigRenderer};
pub use models::{BackendServer, ModificationTag, RoutingKey, TcpEvent, TcpRouteMapping};
pub use reloader::Reloader;
pub use routing_api::{EventSource, RouteSource, RouteSourceError, RoutingApiClient};
pub use routing_table::{RoutingTable, RoutingTableEntry, Snapshot};
pub use syncer::{Pruner, Syncer};
pub use token::{NoopTokenSource, TokenSource, UaaTokenFetcher};
pub use updater::Updater;
pub use watcher::Watcher;
