// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # Configuration
//!
//! The daemon reads a single TOML file at startup:
//!
//! ```toml
//! [routing_api]
//! url = "https://api.example.com"
//! auth_enabled = true
//!
//! [oauth]
//! token_endpoint = "https://uaa.example.com"
//! client_id = "tcp_router"
//! client_secret = "secret"
//!
//! [haproxy]
//! base_config_path = "/etc/haproxy/haproxy.cfg.template"
//! config_path = "/etc/haproxy/haproxy.cfg"
//! reload_script_path = "/usr/local/bin/haproxy_reloader"
//! drain_wait_secs = 20
//!
//! [backend_tls]
//! enabled = true
//! ca_cert_path = "/etc/haproxy/backend-ca.pem"
//!
//! [intervals]
//! sync_secs = 60
//! prune_secs = 30
//! subscription_retry_secs = 5
//!
//! [admin]
//! listen_addr = "127.0.0.1:9999"
//! reservable_ports = "1024-1033,2000"
//! ```
//!
//! Every validation problem is reported at once, not just the first.

use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::admin::ReservablePorts;
use crate::haproxy::BackendTlsConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {}", .0.join(", "))]
    Validation(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub routing_api: RoutingApiConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    pub haproxy: HaproxyConfig,
    #[serde(default)]
    pub backend_tls: BackendTlsConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingApiConfig {
    pub url: String,
    #[serde(default = "default_true")]
    pub auth_enabled: bool,
    #[serde(default)]
    pub skip_tls_verification: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub skip_tls_verification: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaproxyConfig {
    /// Static HAProxy configuration the routes are appended to.
    pub base_config_path: PathBuf,
    /// Live configuration file HAProxy loads.
    pub config_path: PathBuf,
    pub reload_script_path: PathBuf,
    #[serde(default)]
    pub drain_wait_secs: u64,
}

impl HaproxyConfig {
    pub fn drain_wait(&self) -> Duration {
        Duration::from_secs(self.drain_wait_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    pub sync_secs: u64,
    pub prune_secs: u64,
    pub subscription_retry_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            sync_secs: 60,
            prune_secs: 30,
            subscription_retry_secs: 5,
        }
    }
}

impl IntervalsConfig {
    pub fn sync(&self) -> Duration {
        Duration::from_secs(self.sync_secs)
    }

    pub fn prune(&self) -> Duration {
        Duration::from_secs(self.prune_secs)
    }

    pub fn subscription_retry(&self) -> Duration {
        Duration::from_secs(self.subscription_retry_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// The admin endpoint is disabled when unset.
    pub listen_addr: Option<SocketAddr>,
    pub reservable_ports: String,
}

impl AdminConfig {
    pub fn reservable_ports(&self) -> Result<ReservablePorts, ConfigError> {
        self.reservable_ports
            .parse()
            .map_err(|e| ConfigError::Validation(vec![format!("admin.reservable_ports: {}", e)]))
    }
}

fn default_true() -> bool {
    true
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

pub fn validate_config(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    let url = config.routing_api.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        errors.push(format!(
            "routing_api.url must be an http(s) URL, got '{}'",
            url
        ));
    }

    if config.routing_api.auth_enabled {
        if config.oauth.token_endpoint.trim().is_empty() {
            errors.push("oauth.token_endpoint is required when auth is enabled".to_string());
        }
        if config.oauth.client_id.trim().is_empty() {
            errors.push("oauth.client_id is required when auth is enabled".to_string());
        }
    }

    if !config.haproxy.base_config_path.is_file() {
        errors.push(format!(
            "haproxy.base_config_path {} does not exist",
            config.haproxy.base_config_path.display()
        ));
    }
    if config.haproxy.config_path.as_os_str().is_empty() {
        errors.push("haproxy.config_path is required".to_string());
    }
    if config.haproxy.reload_script_path.as_os_str().is_empty() {
        errors.push("haproxy.reload_script_path is required".to_string());
    }

    if config.backend_tls.enabled && config.backend_tls.ca_cert_path.trim().is_empty() {
        errors.push("backend_tls.ca_cert_path is required when backend TLS is enabled".to_string());
    }

    for (name, secs) in [
        ("intervals.sync_secs", config.intervals.sync_secs),
        ("intervals.prune_secs", config.intervals.prune_secs),
        (
            "intervals.subscription_retry_secs",
            config.intervals.subscription_retry_secs,
        ),
    ] {
        if secs == 0 {
            errors.push(format!("{} must be greater than 0", name));
        }
    }

    if let Err(e) = config.admin.reservable_ports.parse::<ReservablePorts>() {
        errors.push(format!("admin.reservable_ports: {}", e));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
