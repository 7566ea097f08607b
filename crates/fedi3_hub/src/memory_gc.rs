/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::info;

use crate::directory::Directory;

/// Periodically drops idle databases from memory. Their logs stay on disk.
pub fn start_memory_gc_worker(dir: Arc<Directory>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = dir.config().memory_gc_interval_secs.unwrap_or(10).max(1);
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

            let unloaded = dir.sweep_inactive(now_ms());
            if !unloaded.is_empty() {
                info!(unloaded = unloaded.len(), "memory gc unloaded databases");
            }
        }
    });
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
