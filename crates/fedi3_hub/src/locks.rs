/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

/// Named async mutexes. Unrelated names never contend; entries are dropped
/// once nobody holds or waits on them.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

pub struct LockGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    manager: Arc<LockManager>,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn lock(self: &Arc<Self>, name: impl Into<String>) -> LockGuard {
        let name = name.into();
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(name.clone())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        LockGuard {
            name,
            guard: Some(guard),
            manager: self.clone(),
        }
    }

    pub fn held_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .manager
            .locks
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(m) = locks.get(&self.name) {
            // Only the map still references it: no holder, no waiter.
            if Arc::strong_count(m) == 1 {
                locks.remove(&self.name);
            }
        }
    }
}
