// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # HAProxy Config Renderer
//!
//! Turns a routing table [`Snapshot`] into the TCP frontend/backend section of
//! the HAProxy configuration.
//!
//! ## Layout
//!
//! For every inbound port, in ascending order, the output holds one
//! `frontend` stanza followed by one `backend` stanza per SNI hostname bound
//! to the port. The empty hostname is the port's `default_backend`; any other
//! hostname is selected with `use_backend ... if { req.ssl_sni <host> }` and
//! turns on TLS ClientHello inspection for the frontend.
//!
//! Servers keep the order in which they were added to the routing table, so a
//! reload does not reshuffle server names.
//!
//! ## Determinism
//!
//! The same snapshot always renders to the same bytes. The configurer relies
//! on this to skip reloads when nothing changed.
//!
//! Routes that cannot be expressed safely (port 0, a malformed SNI hostname,
//! a TLS backend without an instance id, ...) are dropped with an error log
//! instead of failing the whole render.

use anyhow::{Context, Result};
use askama::Template;
use log::error;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::models::{
    is_valid_address, is_valid_hostname, is_valid_instance_id, BackendServer, RoutingKey,
    TLS_PORT_UNSET,
};
use crate::routing_table::Snapshot;

/// Global settings for TLS from HAProxy to the backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendTlsConfig {
    pub enabled: bool,
    pub ca_cert_path: String,
    pub client_cert_and_key_path: Option<String>,
}

/// Port → SNI hostname → servers, with invalid routes already removed.
pub type HaproxyConfig = BTreeMap<u16, BTreeMap<String, Vec<BackendServer>>>;

/// Group a snapshot by port and hostname, dropping keys that cannot be
/// rendered and entries without backends.
pub fn haproxy_config(snapshot: &Snapshot) -> HaproxyConfig {
    let mut config = HaproxyConfig::new();

    for (key, servers) in snapshot.routes() {
        if !key.is_valid() {
            error!("Dropping route {}: invalid inbound port.", key);
            continue;
        }
        if !key.sni_hostname.is_empty() && !is_valid_hostname(&key.sni_hostname) {
            error!(
                "Dropping route {}: invalid SNI hostname {:?}.",
                key, key.sni_hostname
            );
            continue;
        }
        if servers.is_empty() {
            continue;
        }

        config
            .entry(key.port)
            .or_default()
            .insert(key.sni_hostname.clone(), servers.clone());
    }

    config
}

pub struct FrontendView {
    pub port: u16,
    pub inspect_sni: bool,
    pub backends: Vec<BackendView>,
}

pub struct BackendView {
    pub name: String,
    pub sni_hostname: String,
    pub servers: Vec<String>,
}

#[derive(Template)]
#[template(path = "tcp-routes.cfg.askama", escape = "none")]
pub struct TcpRoutes {
    pub frontends: Vec<FrontendView>,
}

fn backend_name(port: u16, sni_hostname: &str) -> String {
    if sni_hostname.is_empty() {
        format!("backend_{}", port)
    } else {
        format!("backend_{}_{}", port, sni_hostname)
    }
}

/// Renders snapshots with a fixed backend TLS policy.
#[derive(Debug, Clone, Default)]
pub struct ConfigRenderer {
    backend_tls: BackendTlsConfig,
}

impl ConfigRenderer {
    pub fn new(backend_tls: BackendTlsConfig) -> Self {
        Self { backend_tls }
    }

    pub fn render(&self, snapshot: &Snapshot) -> Result<String> {
        let frontends = haproxy_config(snapshot)
            .into_iter()
            .map(|(port, hosts)| {
                let inspect_sni = hosts.keys().any(|host| !host.is_empty());
                let backends = hosts
                    .into_iter()
                    .map(|(sni_hostname, servers)| {
                        let key = RoutingKey::new(port, sni_hostname);
                        BackendView {
                            name: backend_name(port, &key.sni_hostname),
                            servers: servers
                                .iter()
                                .filter_map(|server| self.server_line(&key, server))
                                .collect(),
                            sni_hostname: key.sni_hostname,
                        }
                    })
                    .collect();
                FrontendView {
                    port,
                    inspect_sni,
                    backends,
                }
            })
            .collect();

        TcpRoutes { frontends }
            .render()
            .context("Failed to render HAProxy configuration template")
    }

    /// The `server` line for one backend, or `None` when it must be skipped.
    fn server_line(&self, key: &RoutingKey, server: &BackendServer) -> Option<String> {
        if server.address.is_empty() || server.port == 0 {
            error!(
                "Dropping backend {:?}:{} of {}: address and port are required.",
                server.address, server.port, key
            );
            return None;
        }
        if !is_valid_address(&server.address) {
            error!(
                "Dropping backend of {}: invalid address {:?}.",
                key, server.address
            );
            return None;
        }

        if server.tls_port > 0 {
            if !self.backend_tls.enabled {
                error!(
                    "backend-tls-not-enabled: skipping backend {}:{} of {} with TLS port {}.",
                    server.address, server.port, key, server.tls_port
                );
                return None;
            }
            if server.instance_id.is_empty() {
                error!(
                    "Dropping backend {}:{} of {}: backend_configuration.instance_id = unset",
                    server.address, server.tls_port, key
                );
                return None;
            }
            if !is_valid_instance_id(&server.instance_id) {
                error!(
                    "Dropping backend {}:{} of {}: invalid instance id {:?}.",
                    server.address, server.tls_port, key, server.instance_id
                );
                return None;
            }

            let mut line = format!(
                "server server_{addr}_{port} {addr}:{port} ssl verify required verifyhost {host} ca-file {ca}",
                addr = server.address,
                port = server.tls_port,
                host = server.instance_id,
                ca = self.backend_tls.ca_cert_path,
            );
            if let Some(cert) = &self.backend_tls.client_cert_and_key_path {
                line.push_str(" crt ");
                line.push_str(cert);
            }
            return Some(line);
        }

        if server.tls_port == TLS_PORT_UNSET && self.backend_tls.enabled {
            error!(
                "route-missing-tls-information: backend {}:{} of {} is served without TLS.",
                server.address, server.port, key
            );
        }

        Some(format!(
            "server server_{addr}_{port} {addr}:{port}",
            addr = server.address,
            port = server.port
        ))
    }
}
