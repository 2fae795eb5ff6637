// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # Admin endpoint
//!
//! The legacy `POST /v0/external_ports` endpoint. It takes a list of external
//! ports, each with the full set of cleartext backends it should forward to,
//! and replaces those ports in the routing table. Route events from the
//! routing API remain the authoritative source; this only exists for older
//! tooling.
//!
//! ```json
//! [{"external_port": 1024, "backends": [{"backend_ip": "10.0.0.1", "backend_port": 8080}]}]
//! ```

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::models::{is_valid_address, BackendServer, RoutingKey};
use crate::updater::{UpdateError, Updater};
use crate::{MAX_PORT, MIN_PORT};

pub const EXTERNAL_PORTS_PATH: &str = "/v0/external_ports";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendHostInfo {
    pub backend_ip: String,
    pub backend_port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExternalPortMapping {
    pub external_port: u32,
    #[serde(default)]
    pub backends: Vec<BackendHostInfo>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("invalid port range '{0}'")]
    InvalidRange(String),
}

/// Ports the admin endpoint may assign, written as `"1024-1033,2000"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservablePorts {
    ranges: Vec<RangeInclusive<u16>>,
}

impl ReservablePorts {
    /// With no ranges configured every valid port is reservable.
    pub fn contains(&self, port: u16) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(&port))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_port(port: &str) -> Result<u16, PortRangeError> {
    port.trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port >= MIN_PORT)
        .ok_or_else(|| PortRangeError::InvalidPort(port.trim().to_string()))
}

impl FromStr for ReservablePorts {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let range = match part.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse_port(start)?, parse_port(end)?);
                    if start > end {
                        return Err(PortRangeError::InvalidRange(part.to_string()));
                    }
                    start..=end
                }
                None => {
                    let port = parse_port(part)?;
                    port..=port
                }
            };
            ranges.push(range);
        }
        Ok(Self { ranges })
    }
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Update(#[from] UpdateError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::InvalidRequest(_) | AdminError::Update(UpdateError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            AdminError::Update(UpdateError::Configure(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub updater: Arc<Updater>,
    pub reservable_ports: Arc<ReservablePorts>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route(EXTERNAL_PORTS_PATH, post(update_external_ports))
        .with_state(state)
}

/// Serve the admin router on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Admin endpoint listening on {}.", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

fn validate_port(value: u32, what: &str) -> Result<u16, AdminError> {
    u16::try_from(value)
        .ok()
        .filter(|port| (MIN_PORT..=MAX_PORT).contains(port))
        .ok_or_else(|| {
            AdminError::InvalidRequest(format!("{} {} is out of range (1-65535)", what, value))
        })
}

fn to_routes(
    mappings: Vec<ExternalPortMapping>,
    reservable_ports: &ReservablePorts,
) -> Result<Vec<(RoutingKey, Vec<BackendServer>)>, AdminError> {
    mappings
        .into_iter()
        .map(|mapping| {
            let port = validate_port(mapping.external_port, "external_port")?;
            if !reservable_ports.contains(port) {
                return Err(AdminError::InvalidRequest(format!(
                    "external_port {} is not in a reservable port range",
                    port
                )));
            }

            let backends = mapping
                .backends
                .into_iter()
                .map(|backend| {
                    if backend.backend_ip.trim().is_empty() {
                        return Err(AdminError::InvalidRequest(format!(
                            "backend_ip is empty for external_port {}",
                            port
                        )));
                    }
                    if !is_valid_address(&backend.backend_ip) {
                        return Err(AdminError::InvalidRequest(format!(
                            "backend_ip {:?} is not an IP address or hostname",
                            backend.backend_ip
                        )));
                    }
                    let backend_port = validate_port(backend.backend_port, "backend_port")?;
                    Ok(BackendServer::new(backend.backend_ip, backend_port))
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok((RoutingKey::new(port, ""), backends))
        })
        .collect()
}

async fn update_external_ports(
    State(state): State<AdminState>,
    payload: Result<Json<Vec<ExternalPortMapping>>, JsonRejection>,
) -> Result<StatusCode, AdminError> {
    let Json(mappings) = payload.map_err(|rejection| {
        warn!("Rejected external ports request: {}", rejection.body_text());
        AdminError::InvalidRequest(rejection.body_text())
    })?;

    let routes = to_routes(mappings, &state.reservable_ports).inspect_err(|e| {
        warn!("Rejected external ports request: {}", e);
    })?;

    let count = routes.len();
    match state.updater.update(routes).await {
        Ok(changed) => {
            info!(
                "Applied {} external port mappings (changed={}).",
                count, changed
            );
            Ok(StatusCode::OK)
        }
        Err(e) => {
            error!("Failed to apply external port mappings: {}", e);
            Err(e.into())
        }
    }
}
