// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! Routing data model shared by the table, the renderer and the route source.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

use crate::{MAX_PORT, MIN_PORT};

/// Longest hostname accepted as a backend address or SNI match.
pub const MAX_HOSTNAME_LENGTH: usize = 253;
/// Longest single DNS label.
pub const MAX_LABEL_LENGTH: usize = 63;

/// `tls_port` value meaning "no TLS information was supplied".
pub const TLS_PORT_UNSET: i32 = 0;
/// `tls_port` value meaning "this backend is cleartext on purpose".
pub const TLS_PORT_CLEARTEXT: i32 = -1;

/// Identity of one HAProxy frontend route: an inbound port plus an optional
/// SNI hostname. An empty hostname is the default backend of the port.
///
/// Ordering is by port first, then hostname, which is the order the renderer
/// emits stanzas in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey {
    pub port: u16,
    pub sni_hostname: String,
}

impl RoutingKey {
    pub fn new(port: u16, sni_hostname: impl Into<String>) -> Self {
        Self {
            port,
            sni_hostname: sni_hostname.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.port >= MIN_PORT
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sni_hostname.is_empty() {
            write!(f, "{}", self.port)
        } else {
            write!(f, "{}/{}", self.port, self.sni_hostname)
        }
    }
}

/// Version token of a route record in the routing API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModificationTag {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub index: u32,
}

impl ModificationTag {
    pub fn new(guid: impl Into<String>, index: u32) -> Self {
        Self {
            guid: guid.into(),
            index,
        }
    }

    /// Whether `self` supersedes `stored`.
    ///
    /// Within one guid the strictly larger index wins. Tags from different
    /// guids cannot be ordered, so the incoming tag wins.
    pub fn succeeds(&self, stored: &ModificationTag) -> bool {
        if self.guid != stored.guid {
            return true;
        }
        self.index > stored.index
    }

    /// Like [`ModificationTag::succeeds`] but ties are accepted.
    pub fn succeeds_or_equals(&self, stored: &ModificationTag) -> bool {
        self == stored || self.succeeds(stored)
    }
}

impl PartialOrd for ModificationTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.guid != other.guid {
            return None;
        }
        Some(self.index.cmp(&other.index))
    }
}

/// One upstream server behind a routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BackendServer {
    pub address: String,
    pub port: u16,
    /// `> 0` enables TLS to the backend, [`TLS_PORT_UNSET`] means no TLS
    /// information, [`TLS_PORT_CLEARTEXT`] means cleartext on purpose.
    pub tls_port: i32,
    pub instance_id: String,
    pub modification_tag: ModificationTag,
    /// Zero never expires.
    pub ttl_seconds: u64,
}

impl BackendServer {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, tls_port: i32, instance_id: impl Into<String>) -> Self {
        self.tls_port = tls_port;
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_tag(mut self, modification_tag: ModificationTag) -> Self {
        self.modification_tag = modification_tag;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Backends sharing this key are the same server for dedup purposes.
    pub fn dedup_key(&self) -> (&str, u16) {
        (&self.address, self.port)
    }

    pub fn same_server(&self, other: &BackendServer) -> bool {
        self.dedup_key() == other.dedup_key()
    }
}

/// Push event action from the routing API event stream.
#[derive(
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
pub enum Action {
    Upsert,
    Delete,
}

/// A TCP route mapping as served by the routing API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRouteMapping {
    #[serde(default)]
    pub router_group_guid: String,
    #[serde(rename = "port")]
    pub external_port: u32,
    #[serde(rename = "backend_ip")]
    pub host_ip: String,
    #[serde(rename = "backend_port")]
    pub host_port: u32,
    #[serde(
        rename = "host_tls_port",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tls_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni_hostname: Option<String>,
    #[serde(default)]
    pub modification_tag: ModificationTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Reasons a route mapping is refused before it reaches the routing table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("external port out of valid range (1-65535): {0}")]
    InvalidExternalPort(u32),
    #[error("backend port out of valid range (1-65535): {0}")]
    InvalidBackendPort(u32),
    #[error("backend TLS port out of valid range: {0}")]
    InvalidTlsPort(i32),
    #[error("backend address is empty")]
    EmptyAddress,
    #[error("backend address is not an IP address or hostname: {0:?}")]
    InvalidAddress(String),
    #[error("instance id contains unsupported characters: {0:?}")]
    InvalidInstanceId(String),
}

/// Check a hostname against the DNS grammar: dot separated labels of ASCII
/// letters, digits and `-`, where no label is empty, longer than
/// [`MAX_LABEL_LENGTH`] or starts or ends with `-`.
pub fn is_valid_hostname(hostname: &str) -> bool {
    hostname.len() <= MAX_HOSTNAME_LENGTH
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= MAX_LABEL_LENGTH
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// A backend address must be an IP address or a hostname.
pub fn is_valid_address(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok() || is_valid_hostname(address)
}

/// Instance ids end up as the `verifyhost` argument, so only plain token
/// characters are allowed. Empty means unset.
pub fn is_valid_instance_id(instance_id: &str) -> bool {
    instance_id.len() <= MAX_HOSTNAME_LENGTH
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn validate_port(port: u32) -> Option<u16> {
    u16::try_from(port)
        .ok()
        .filter(|port| (MIN_PORT..=MAX_PORT).contains(port))
}

impl TcpRouteMapping {
    pub fn routing_key(&self) -> Result<RoutingKey, MappingError> {
        let port = validate_port(self.external_port)
            .ok_or(MappingError::InvalidExternalPort(self.external_port))?;
        Ok(RoutingKey::new(
            port,
            self.sni_hostname.clone().unwrap_or_default(),
        ))
    }

    /// Builds the backend for this mapping.
    ///
    /// A missing `instance_id` on a TLS backend is not rejected here; the
    /// renderer drops and reports those.
    pub fn backend_server(&self) -> Result<BackendServer, MappingError> {
        if self.host_ip.trim().is_empty() {
            return Err(MappingError::EmptyAddress);
        }
        if !is_valid_address(&self.host_ip) {
            return Err(MappingError::InvalidAddress(self.host_ip.clone()));
        }
        let port = validate_port(self.host_port)
            .ok_or(MappingError::InvalidBackendPort(self.host_port))?;
        let tls_port = self.tls_port.unwrap_or(TLS_PORT_UNSET);
        if tls_port < TLS_PORT_CLEARTEXT || tls_port > i32::from(MAX_PORT) {
            return Err(MappingError::InvalidTlsPort(tls_port));
        }
        let instance_id = self.instance_id.clone().unwrap_or_default();
        if !is_valid_instance_id(&instance_id) {
            return Err(MappingError::InvalidInstanceId(instance_id));
        }

        Ok(BackendServer {
            address: self.host_ip.clone(),
            port,
            tls_port,
            instance_id,
            modification_tag: self.modification_tag.clone(),
            ttl_seconds: self.ttl.unwrap_or(0),
        })
    }

    pub fn to_route(&self) -> Result<(RoutingKey, BackendServer), MappingError> {
        Ok((self.routing_key()?, self.backend_server()?))
    }
}

/// One push event from the routing API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEvent {
    pub action: Action,
    pub mapping: TcpRouteMapping,
}

impl TcpEvent {
    pub fn upsert(mapping: TcpRouteMapping) -> Self {
        Self {
            action: Action::Upsert,
            mapping,
        }
    }

    pub fn delete(mapping: TcpRouteMapping) -> Self {
        Self {
            action: Action::Delete,
            mapping,
        }
    }
}
