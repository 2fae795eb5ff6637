// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

use async_trait::async_trait;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tcp_router::{EventSource, RouteSource, RouteSourceError, TcpRouteMapping};

pub const BASE_CONFIG: &str = "global\n  maxconn 64000\n\ndefaults\n  mode tcp\n";

/// Route source serving a fixed listing and refusing subscriptions.
#[derive(Default)]
pub struct ListingSource {
    listing: Mutex<Vec<TcpRouteMapping>>,
}

impl ListingSource {
    pub fn set_listing(&self, listing: Vec<TcpRouteMapping>) {
        *self.listing.lock().unwrap() = listing;
    }
}

#[async_trait]
impl RouteSource for ListingSource {
    async fn tcp_route_mappings(&self) -> Result<Vec<TcpRouteMapping>, RouteSourceError> {
        Ok(self.listing.lock().unwrap().clone())
    }

    async fn subscribe_to_tcp_events(&self) -> Result<Box<dyn EventSource>, RouteSourceError> {
        Err(RouteSourceError::Status {
            status: 503,
            body: "no event stream".to_string(),
        })
    }

    fn set_token(&self, _access_token: &str) {}
}

/// Parse a mapping the way the routing API serves it.
pub fn mapping(json: &str) -> TcpRouteMapping {
    serde_json::from_str(json).expect("Invalid mapping JSON")
}

/// Base config plus a reload script recording `IS_DRAINING` for every call.
pub struct HaproxyDir {
    pub dir: tempfile::TempDir,
}

impl HaproxyDir {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        fs::write(dir.path().join("haproxy.cfg.template"), BASE_CONFIG)
            .expect("Failed to write base config");

        let script = dir.path().join("reload.sh");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"${{IS_DRAINING:-false}}\" >> {}\n",
                dir.path().join("reloads").display()
            ),
        )
        .expect("Failed to write reload script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
            .expect("Failed to make reload script executable");

        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn base_config(&self) -> PathBuf {
        self.path().join("haproxy.cfg.template")
    }

    pub fn config(&self) -> PathBuf {
        self.path().join("haproxy.cfg")
    }

    pub fn script(&self) -> PathBuf {
        self.path().join("reload.sh")
    }

    pub fn written(&self) -> String {
        fs::read_to_string(self.config()).unwrap_or_default()
    }

    pub fn reloads(&self) -> Vec<String> {
        fs::read_to_string(self.path().join("reloads"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
