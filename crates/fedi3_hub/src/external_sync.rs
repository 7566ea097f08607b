/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, warn};

use crate::directory::Directory;

/// Writes tend to come in bursts; one reconcile covers them all.
const RECONCILE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Keeps the set of loaded external databases equal to what local users
/// follow. Runs at most once per interval, on request or on the timer.
pub fn start_reconcile_worker(dir: Arc<Directory>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(dir.config().reconcile_interval_secs.unwrap_or(30).max(1));
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_run: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
                _ = dir.reconcile_requested() => {
                    let mut at = Instant::now() + RECONCILE_DEBOUNCE;
                    if let Some(prev) = last_run {
                        at = at.max(prev + interval);
                    }
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            last_run = Some(Instant::now());
            tick.reset();
            if let Err(e) = dir.load_or_unload_external_databases().await {
                warn!("external reconcile error: {e:#}");
            }
        }
        debug!("reconcile worker stopped");
    });
}

/// Pulls new entries for one external database per tick, round robin.
pub fn start_sync_worker(dir: Arc<Directory>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = dir.config().external_sync_interval_secs.unwrap_or(5).max(1);
        let mut tick = tokio::time::interval(Duration::from_secs(interval));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }

            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = dir.sync_next_external().await {
                warn!("external sync error: {e:#}");
            }
        }
        debug!("sync worker stopped");
    });
}
