// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! # Configurer
//!
//! Applies a routing table snapshot to HAProxy:
//!
//! 1. Renders the snapshot into the dynamic TCP section
//! 2. Prepends the verbatim contents of the base config file
//! 3. Writes the result to a temporary sibling of the live config and renames
//!    it into place, so HAProxy never reads a half written file
//! 4. Runs the reload script
//!
//! Calls are serialised: two snapshots arriving at once produce two complete
//! write-and-reload cycles, one after the other.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::haproxy::ConfigRenderer;
use crate::reloader::Reloader;
use crate::routing_table::Snapshot;

/// Something that can turn routing table snapshots into live load balancer
/// configuration.
#[async_trait]
pub trait Configurer: Send + Sync {
    /// Make the load balancer serve exactly the routes in `snapshot`.
    async fn configure(&self, snapshot: &Snapshot) -> Result<()>;

    /// Put the load balancer in drain mode and give it time to drain.
    async fn stop_and_drain(&self) -> Result<()>;
}

/// Replace `path` with `content` through a temporary file in the same
/// directory and a rename.
pub fn write_atomically(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut candidate = NamedTempFile::new_in(dir).with_context(|| {
        format!(
            "Failed to create temporary config file in {}",
            dir.display()
        )
    })?;
    candidate
        .write_all(content.as_bytes())
        .context("Failed to write temporary config file")?;
    candidate
        .as_file()
        .sync_all()
        .context("Failed to flush temporary config file")?;
    // HAProxy may run as another user; temp files start out owner-only
    fs::set_permissions(candidate.path(), fs::Permissions::from_mode(0o644))
        .context("Failed to set config file permissions")?;

    candidate
        .persist(path)
        .with_context(|| format!("Failed to move config file into place: {}", path.display()))?;
    Ok(())
}

pub struct HaproxyConfigurer {
    renderer: ConfigRenderer,
    reloader: Reloader,
    base_config_path: PathBuf,
    config_path: PathBuf,
    drain_wait: Duration,
    /// Last configuration that was written and reloaded successfully.
    applied: Mutex<Option<String>>,
}

impl HaproxyConfigurer {
    pub fn new(
        renderer: ConfigRenderer,
        reloader: Reloader,
        base_config_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        drain_wait: Duration,
    ) -> Self {
        Self {
            renderer,
            reloader,
            base_config_path: base_config_path.into(),
            config_path: config_path.into(),
            drain_wait,
            applied: Mutex::new(None),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[async_trait]
impl Configurer for HaproxyConfigurer {
    async fn configure(&self, snapshot: &Snapshot) -> Result<()> {
        let mut applied = self.applied.lock().await;

        let rendered = self.renderer.render(snapshot)?;
        let base = tokio::fs::read_to_string(&self.base_config_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to read base HAProxy config {}",
                    self.base_config_path.display()
                )
            })?;
        let content = format!("{}{}", base, rendered);

        if applied.as_deref() == Some(content.as_str()) {
            debug!("HAProxy configuration is unchanged.");
            return Ok(());
        }

        let config_path = self.config_path.clone();
        let candidate = content.clone();
        tokio::task::spawn_blocking(move || write_atomically(&config_path, &candidate))
            .await
            .context("HAProxy config writer task failed")??;

        self.reloader.run(false).await?;
        *applied = Some(content);

        info!(
            "HAProxy configuration was updated: {} routes written to {}.",
            snapshot.len(),
            self.config_path.display()
        );
        Ok(())
    }

    async fn stop_and_drain(&self) -> Result<()> {
        let _applied = self.applied.lock().await;

        info!("Draining HAProxy for {:?}...", self.drain_wait);
        self.reloader.run(true).await?;
        tokio::time::sleep(self.drain_wait).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackendServer, RoutingKey};
    use crate::reloader::tests::write_script;
    use pretty_assertions::assert_eq;

    const BASE_CONFIG: &str = "global\n  maxconn 64000\n\ndefaults\n  timeout connect 5s\n";

    struct Fixture {
        dir: tempfile::TempDir,
        calls: PathBuf,
        configurer: HaproxyConfigurer,
    }

    fn fixture(script_body: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let base = dir.path().join("haproxy.cfg.template");
        fs::write(&base, BASE_CONFIG).expect("Failed to write base config");
        let calls = dir.path().join("calls");
        let script = write_script(
            dir.path(),
            "reload.sh",
            &format!(
                "echo \"${{IS_DRAINING:-false}}\" >> {}\n{}",
                calls.display(),
                script_body
            ),
        );

        let configurer = HaproxyConfigurer::new(
            ConfigRenderer::default(),
            Reloader::new(script),
            base,
            dir.path().join("haproxy.cfg"),
            Duration::ZERO,
        );
        Fixture {
            dir,
            calls,
            configurer,
        }
    }

    fn reload_calls(fixture: &Fixture) -> Vec<String> {
        fs::read_to_string(&fixture.calls)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn snapshot(port: u16) -> Snapshot {
        vec![(
            RoutingKey::new(port, ""),
            vec![BackendServer::new("1.2.3.4", 8080)],
        )]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_configure_writes_base_and_routes() {
        let fixture = fixture("exit 0");

        fixture
            .configurer
            .configure(&snapshot(80))
            .await
            .expect("Configure failed");

        let written = fs::read_to_string(fixture.configurer.config_path()).unwrap();
        let expected = format!(
            "{}{}",
            BASE_CONFIG,
            r#"
frontend frontend_80
  mode tcp
  bind :80
  default_backend backend_80

backend backend_80
  mode tcp
  server server_1.2.3.4_8080 1.2.3.4:8080
"#
        );
        assert_eq!(written, expected);
        assert_eq!(reload_calls(&fixture), vec!["false"]);

        let mode = fs::metadata(fixture.configurer.config_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);

        // No temp files left behind
        let leftovers = fs::read_dir(fixture.dir.path())
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_configure_skips_identical_config() {
        let fixture = fixture("exit 0");

        fixture.configurer.configure(&snapshot(80)).await.unwrap();
        fixture.configurer.configure(&snapshot(80)).await.unwrap();
        assert_eq!(reload_calls(&fixture).len(), 1);

        fixture.configurer.configure(&snapshot(90)).await.unwrap();
        assert_eq!(reload_calls(&fixture).len(), 2);
    }

    #[tokio::test]
    async fn test_configure_retries_after_failed_reload() {
        let fixture = fixture("exit 1");

        assert!(fixture.configurer.configure(&snapshot(80)).await.is_err());
        // The file was still replaced
        assert!(fs::read_to_string(fixture.configurer.config_path())
            .unwrap()
            .contains("frontend frontend_80"));

        // The same snapshot is applied again since it never reloaded
        assert!(fixture.configurer.configure(&snapshot(80)).await.is_err());
        assert_eq!(reload_calls(&fixture).len(), 2);
    }

    #[tokio::test]
    async fn test_configure_missing_base_config() {
        let fixture = fixture("exit 0");
        fs::remove_file(fixture.dir.path().join("haproxy.cfg.template")).unwrap();

        let err = fixture
            .configurer
            .configure(&snapshot(80))
            .await
            .expect_err("Missing base config should fail");
        assert!(err.to_string().contains("Failed to read base HAProxy config"));
        assert!(reload_calls(&fixture).is_empty());
        assert!(!fixture.configurer.config_path().exists());
    }

    #[tokio::test]
    async fn test_stop_and_drain() {
        let fixture = fixture("exit 0");

        fixture
            .configurer
            .stop_and_drain()
            .await
            .expect("Drain failed");
        assert_eq!(reload_calls(&fixture), vec!["true"]);
    }

    #[test]
    fn test_write_atomically_replaces_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let path = dir.path().join("haproxy.cfg");
        fs::write(&path, "old").unwrap();

        write_atomically(&path, "new").expect("Write failed");
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }
}
