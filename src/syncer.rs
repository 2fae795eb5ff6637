// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! Periodic tickers: bulk sync requests and stale backend pruning.

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::updater::Updater;

/// Requests a bulk sync every `interval`, starting immediately.
///
/// Requests go into a channel of capacity one; a full channel means a sync
/// is already pending and the tick is dropped.
pub struct Syncer {
    interval: Duration,
    requests: mpsc::Sender<()>,
}

impl Syncer {
    pub fn new(interval: Duration, requests: mpsc::Sender<()>) -> Self {
        Self { interval, requests }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Syncer started (interval {:?}).", self.interval);
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.requests.try_send(()) {
                    Ok(()) => debug!("Requested bulk sync."),
                    Err(TrySendError::Full(())) => debug!("Bulk sync already pending."),
                    Err(TrySendError::Closed(())) => break,
                },
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Syncer stopped.");
    }
}

/// Calls [`Updater::prune_stale`] every `interval`.
pub struct Pruner {
    interval: Duration,
    updater: Arc<Updater>,
}

impl Pruner {
    pub fn new(interval: Duration, updater: Arc<Updater>) -> Self {
        Self { interval, updater }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.updater.prune_stale().await,
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Pruner stopped.");
    }
}
