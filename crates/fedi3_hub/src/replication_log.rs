/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tokio::sync::broadcast;

use crate::store::{SortedLogStore, StoreEvent};

pub const DEFAULT_CAPACITY: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationEventKind {
    Append,
    PeerOpen,
    PeerRemove,
    Load,
    Unload,
    Sync,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplicationEvent {
    pub ts_ms: i64,
    pub discovery_key: String,
    pub kind: ReplicationEventKind,
    pub detail: String,
}

/// Bounded in-memory trail of what happened to each database.
pub struct ReplicationLog {
    capacity: usize,
    events: Mutex<VecDeque<ReplicationEvent>>,
}

impl ReplicationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, discovery_key: &str, kind: ReplicationEventKind, detail: impl Into<String>) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(ReplicationEvent {
            ts_ms: now_ms(),
            discovery_key: discovery_key.to_string(),
            kind,
            detail: detail.into(),
        });
    }

    /// Oldest first.
    pub fn query(&self, pred: impl Fn(&ReplicationEvent) -> bool) -> Vec<ReplicationEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }

    /// Forwards store events until the store is dropped.
    pub fn watch(self: &Arc<Self>, store: &dyn SortedLogStore) {
        let mut rx = store.subscribe();
        let dkey = store.discovery_key().to_string();
        let log = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        let (kind, detail) = match ev {
                            StoreEvent::Append { seq } => (ReplicationEventKind::Append, format!("seq={seq}")),
                            StoreEvent::PeerOpen { peer } => (ReplicationEventKind::PeerOpen, peer),
                            StoreEvent::PeerRemove { peer } => (ReplicationEventKind::PeerRemove, peer),
                        };
                        log.record(&dkey, kind, detail);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        });
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
