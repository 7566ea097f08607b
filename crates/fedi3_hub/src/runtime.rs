/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::directory::Directory;
use crate::keys::default_data_dir;
use crate::store::SqliteStoreProvider;
use anyhow::{Context, Result};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
};
use tokio::sync::watch;
use tracing::{error, info};

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);

struct RunningHub {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

static REGISTRY: Mutex<Vec<(u64, RunningHub)>> = Mutex::new(Vec::new());

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Suffix of every local identity (`user@domain`).
    pub domain: String,
    pub data_dir: Option<String>,
    /// Store directories of peers to pull external logs from.
    pub peer_dirs: Option<Vec<String>>,

    pub reconcile_interval_secs: Option<u64>,
    pub external_sync_interval_secs: Option<u64>,
    pub memory_gc_interval_secs: Option<u64>,
    pub sync_timeout_secs: Option<u64>,

    /// Idle time before an external database leaves memory.
    pub external_idle_secs: Option<u64>,
    /// Same for local databases. Unset: local databases stay loaded.
    pub local_idle_secs: Option<u64>,

    pub feed_cache_ttl_secs: Option<u64>,
    pub feed_page_size: Option<usize>,
    pub replication_log_capacity: Option<usize>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            data_dir: None,
            peer_dirs: None,
            reconcile_interval_secs: Some(30),
            external_sync_interval_secs: Some(5),
            memory_gc_interval_secs: Some(10),
            sync_timeout_secs: Some(10),
            external_idle_secs: Some(300),
            local_idle_secs: None,
            feed_cache_ttl_secs: Some(30),
            feed_page_size: Some(crate::feed::DEFAULT_PAGE_SIZE),
            replication_log_capacity: Some(crate::replication_log::DEFAULT_CAPACITY),
        }
    }
}

impl HubConfig {
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
            _ => default_data_dir(),
        }
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .try_init()
        .ok();
}

/// Opens the directory and spawns its workers on a dedicated runtime
/// thread. Returns a handle for [`stop`].
pub fn start(cfg: HubConfig) -> Result<u64> {
    init_tracing();
    if cfg.domain.trim().is_empty() {
        return Err(crate::error::ApiError::Configuration("domain is empty".to_string()).into());
    }

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = thread::spawn(move || {
        if let Err(e) = run_hub(cfg, shutdown_rx) {
            error!("hub runtime failed: {e:#}");
        }
    });

    let mut reg = REGISTRY.lock().unwrap_or_else(|p| p.into_inner());
    reg.push((
        handle,
        RunningHub {
            shutdown_tx,
            join: Some(join),
        },
    ));

    Ok(handle)
}

pub fn stop(handle: u64) -> Result<()> {
    let running = {
        let mut reg = REGISTRY.lock().unwrap_or_else(|p| p.into_inner());
        let idx = reg
            .iter()
            .position(|(h, _)| *h == handle)
            .context("invalid handle")?;
        let (_, mut running) = reg.swap_remove(idx);
        let _ = running.shutdown_tx.send(true);
        running.join.take()
    };

    if let Some(j) = running {
        thread::spawn(move || {
            let _ = j.join();
        });
    }
    Ok(())
}

fn run_hub(cfg: HubConfig, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let data_dir = cfg.resolve_data_dir()?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        info!("data dir: {}", data_dir.display());

        let peers = cfg
            .peer_dirs
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let provider = SqliteStoreProvider::new(data_dir.join("stores"), peers)?;
        let dir = Directory::open(cfg, &data_dir, Arc::new(provider)).await?;

        crate::external_sync::start_reconcile_worker(dir.clone(), shutdown_rx.clone());
        crate::external_sync::start_sync_worker(dir.clone(), shutdown_rx.clone());
        crate::memory_gc::start_memory_gc_worker(dir.clone(), shutdown_rx.clone());
        info!(
            domain = %dir.config().domain,
            server = %dir.server_public().public_key(),
            "hub started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        info!("hub stopped");
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn config_fills_missing_knobs() {
        let cfg: HubConfig = serde_json::from_str(r#"{"domain": "hub.example", "local_idle_secs": 60}"#).unwrap();
        assert_eq!(cfg.domain, "hub.example");
        assert_eq!(cfg.local_idle_secs, Some(60));
        assert_eq!(cfg.external_idle_secs, Some(300));
        assert_eq!(cfg.feed_page_size, Some(10));
        assert!(cfg.peer_dirs.is_none());
    }

    #[test]
    fn start_bootstraps_then_stops() {
        let tmp = TempDir::new().unwrap();
        let cfg = HubConfig {
            domain: "hub.test".to_string(),
            data_dir: Some(tmp.path().display().to_string()),
            ..HubConfig::default()
        };
        let handle = start(cfg).unwrap();
        let keys = tmp.path().join("server_keys.json");
        for _ in 0..100 {
            if keys.exists() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(keys.exists());
        stop(handle).unwrap();
        assert!(stop(handle).is_err());
    }

    #[test]
    fn empty_domain_is_rejected() {
        let cfg = HubConfig {
            domain: " ".to_string(),
            ..HubConfig::default()
        };
        assert!(start(cfg).is_err());
    }
}
