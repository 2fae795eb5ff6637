// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! Runs the external HAProxy reload script.

use anyhow::{Context, Result};
use log::{error, info};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Environment variable telling the reload script to put HAProxy in drain mode.
pub const IS_DRAINING_ENV: &str = "IS_DRAINING";

#[derive(Debug, Clone)]
pub struct Reloader {
    script_path: PathBuf,
}

impl Reloader {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
        }
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Run the reload script and wait for it to exit.
    ///
    /// With `drain` set the child sees `IS_DRAINING=true`; otherwise the
    /// variable is removed from its environment. Stdout and stderr are logged
    /// together with the command. A nonzero exit status is an error.
    pub async fn run(&self, drain: bool) -> Result<()> {
        let mut command = Command::new(&self.script_path);
        if drain {
            command.env(IS_DRAINING_ENV, "true");
        } else {
            command.env_remove(IS_DRAINING_ENV);
        }

        let output = command.output().await.with_context(|| {
            format!(
                "Failed to execute reload script {}",
                self.script_path.display()
            )
        })?;

        let combined_output = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if output.status.success() {
            info!(
                "Reload script finished: command={} drain={} output={:?}",
                self.script_path.display(),
                drain,
                combined_output.trim_end()
            );
            return Ok(());
        }

        error!(
            "Reload script failed: command={} drain={} output={:?} error={}",
            self.script_path.display(),
            drain,
            combined_output.trim_end(),
            output.status
        );
        Err(anyhow::anyhow!(
            "Reload script {} exited with {}",
            self.script_path.display(),
            output.status
        ))
    }
}
