/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Sorted log store: an append-only log with a sorted key/value view on top.
//!
//! The engine only talks to the [`SortedLogStore`] / [`StoreProvider`] traits.
//! The SQLite implementation keeps one file per log under `<dir>/<dkey>.db`
//! and "replicates" by pulling log entries from the same file in peer
//! directories, which is enough for a LAN deployment and for tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ApiError;
use crate::keys::{discovery_key, generate_keypair, is_valid_key};

#[derive(Debug, Clone, Default)]
pub struct RangeOpts {
    pub gt: Option<String>,
    pub gte: Option<String>,
    pub lt: Option<String>,
    pub lte: Option<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub seq: u64,
    pub value: Vec<u8>,
}

/// One position of the log. `value == None` is a deletion.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub seq: u64,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub ts_ms: i64,
}

#[derive(Debug, Clone)]
pub struct RawDiff {
    pub key: String,
    /// Last log position that touched `key` inside the window.
    pub seq: u64,
    pub left: Option<Vec<u8>>,
    pub right: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Append { seq: u64 },
    PeerOpen { peer: String },
    PeerRemove { peer: String },
}

#[async_trait]
pub trait SortedLogStore: Send + Sync {
    fn public_key(&self) -> &str;
    fn discovery_key(&self) -> &str;
    fn writable(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    /// Returns false when the key did not exist (nothing appended).
    async fn del(&self, key: &str) -> Result<bool>;
    /// Applies all ops in one transaction.
    async fn apply(&self, ops: Vec<WriteOp>) -> Result<u64>;
    async fn range(&self, opts: RangeOpts) -> Result<Vec<KvEntry>>;
    /// Current log length (highest seq, 0 when empty).
    async fn len(&self) -> Result<u64>;
    /// Keys under `prefix` touched in `(since, until]`, with their value as of
    /// `since` (left) and as of `until` (right), in the order of their last
    /// write. Unchanged keys are omitted.
    async fn diff(&self, prefix: &str, since: u64, until: u64) -> Result<Vec<RawDiff>>;
    async fn log_entries(&self, after: u64, limit: usize) -> Result<Vec<LogEntry>>;
    /// Replication hook: appends entries written elsewhere by the owner.
    async fn ingest(&self, entries: Vec<LogEntry>) -> Result<u64>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
    fn notify(&self, event: StoreEvent);
}

#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Creates a brand new writable log.
    async fn create(&self) -> Result<Arc<dyn SortedLogStore>>;
    /// Opens a log by public key. Writable only if we hold its secret.
    async fn open(&self, public_key: &str) -> Result<Arc<dyn SortedLogStore>>;
    /// Pulls missing entries from peers. Returns how many were appended.
    async fn sync(&self, store: &dyn SortedLogStore) -> Result<u64>;
    async fn destroy(&self, discovery_key: &str) -> Result<()>;
}

pub struct SqliteLogStore {
    path: PathBuf,
    public_key: String,
    discovery_key: String,
    writable: bool,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteLogStore {
    pub fn open(path: impl AsRef<Path>, public_key: &str, secret_key: Option<&str>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let dkey = discovery_key(public_key)?;
        let conn = open_conn(&path)?;
        init_db(&conn)?;
        let stored_pk: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'public_key'", [], |r| r.get(0))
            .optional()?;
        match stored_pk {
            Some(pk) if !pk.eq_ignore_ascii_case(public_key) => {
                anyhow::bail!("store {} belongs to {pk}, not {public_key}", path.display());
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('public_key', ?1)",
                    params![public_key.to_ascii_lowercase()],
                )?;
            }
        }
        if let Some(sk) = secret_key {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('secret_key', ?1)",
                params![sk],
            )?;
        }
        let writable: bool = conn
            .query_row("SELECT 1 FROM meta WHERE key = 'secret_key'", [], |_| Ok(()))
            .optional()?
            .is_some();
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            path,
            public_key: public_key.to_ascii_lowercase(),
            discovery_key: dkey,
            writable,
            events,
        })
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(ApiError::Permissions(format!(
                "database {} is read-only on this server",
                self.public_key
            ))
            .into());
        }
        Ok(())
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<u64> {
        self.ensure_writable()?;
        let path = self.path.clone();
        let appended = tokio::task::spawn_blocking(move || -> Result<Vec<u64>> {
            let mut conn = open_conn(&path)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let now = now_ms();
            let mut seqs = Vec::new();
            for op in ops {
                match op {
                    WriteOp::Put { key, value } => {
                        tx.execute(
                            "INSERT INTO log (key, value, ts_ms) VALUES (?1, ?2, ?3)",
                            params![key, value, now],
                        )?;
                        let seq = tx.last_insert_rowid();
                        tx.execute(
                            "INSERT OR REPLACE INTO kv (key, value, seq) VALUES (?1, ?2, ?3)",
                            params![key, value, seq],
                        )?;
                        seqs.push(seq as u64);
                    }
                    WriteOp::Del { key } => {
                        let exists = tx
                            .query_row("SELECT 1 FROM kv WHERE key = ?1", params![key], |_| Ok(()))
                            .optional()?
                            .is_some();
                        if !exists {
                            continue;
                        }
                        tx.execute(
                            "INSERT INTO log (key, value, ts_ms) VALUES (?1, NULL, ?2)",
                            params![key, now],
                        )?;
                        seqs.push(tx.last_insert_rowid() as u64);
                        tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                    }
                }
            }
            tx.commit()?;
            Ok(seqs)
        })
        .await??;
        for seq in &appended {
            self.notify(StoreEvent::Append { seq: *seq });
        }
        Ok(appended.last().copied().unwrap_or(0))
    }
}

#[async_trait]
impl SortedLogStore for SqliteLogStore {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    fn discovery_key(&self) -> &str {
        &self.discovery_key
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<KvEntry>> {
            let conn = open_conn(&path)?;
            let row = conn
                .query_row(
                    "SELECT seq, value FROM kv WHERE key = ?1",
                    params![key],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?)),
                )
                .optional()?;
            Ok(row.map(|(seq, value)| KvEntry {
                key,
                seq: seq as u64,
                value,
            }))
        })
        .await?
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        self.write(vec![WriteOp::Put {
            key: key.to_string(),
            value,
        }])
        .await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let seq = self
            .write(vec![WriteOp::Del {
                key: key.to_string(),
            }])
            .await?;
        Ok(seq > 0)
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(0);
        }
        self.write(ops).await
    }

    async fn range(&self, opts: RangeOpts) -> Result<Vec<KvEntry>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<KvEntry>> {
            let conn = open_conn(&path)?;
            let mut clauses = Vec::new();
            let mut args: Vec<String> = Vec::new();
            for (op, v) in [
                (">", &opts.gt),
                (">=", &opts.gte),
                ("<", &opts.lt),
                ("<=", &opts.lte),
            ] {
                if let Some(v) = v {
                    args.push(v.clone());
                    clauses.push(format!("key {op} ?{}", args.len()));
                }
            }
            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let order = if opts.reverse { "DESC" } else { "ASC" };
            let limit = opts.limit.map(|l| l as i64).unwrap_or(-1);
            let sql = format!(
                "SELECT key, seq, value FROM kv {where_sql} ORDER BY key {order} LIMIT {limit}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), |r| {
                    Ok(KvEntry {
                        key: r.get(0)?,
                        seq: r.get::<_, i64>(1)? as u64,
                        value: r.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    async fn len(&self) -> Result<u64> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = open_conn(&path)?;
            let n: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM log", [], |r| r.get(0))?;
            Ok(n as u64)
        })
        .await?
    }

    async fn diff(&self, prefix: &str, since: u64, until: u64) -> Result<Vec<RawDiff>> {
        if until <= since {
            return Ok(Vec::new());
        }
        let path = self.path.clone();
        let lo = prefix.to_string();
        let hi = prefix_end(prefix);
        tokio::task::spawn_blocking(move || -> Result<Vec<RawDiff>> {
            let conn = open_conn(&path)?;
            let mut stmt = conn.prepare(
                r#"
                SELECT key, MAX(seq) AS last FROM log
                WHERE seq > ?1 AND seq <= ?2 AND key >= ?3 AND key < ?4
                GROUP BY key
                ORDER BY last ASC
                "#,
            )?;
            let keys = stmt
                .query_map(params![since as i64, until as i64, lo, hi], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut at = conn.prepare(
                "SELECT value FROM log WHERE key = ?1 AND seq <= ?2 ORDER BY seq DESC LIMIT 1",
            )?;
            let mut out = Vec::with_capacity(keys.len());
            for (key, seq) in keys {
                let left: Option<Vec<u8>> = at
                    .query_row(params![key, since as i64], |r| r.get::<_, Option<Vec<u8>>>(0))
                    .optional()?
                    .flatten();
                let right: Option<Vec<u8>> = at
                    .query_row(params![key, until as i64], |r| r.get::<_, Option<Vec<u8>>>(0))
                    .optional()?
                    .flatten();
                if left == right {
                    continue;
                }
                out.push(RawDiff { key, seq, left, right });
            }
            Ok(out)
        })
        .await?
    }

    async fn log_entries(&self, after: u64, limit: usize) -> Result<Vec<LogEntry>> {
        read_log_entries(self.path.clone(), after, limit, false).await
    }

    async fn ingest(&self, entries: Vec<LogEntry>) -> Result<u64> {
        if self.writable {
            anyhow::bail!("refusing to ingest foreign entries into a writable log");
        }
        if entries.is_empty() {
            return Ok(0);
        }
        let path = self.path.clone();
        let (ingested, last) = tokio::task::spawn_blocking(move || -> Result<(u64, u64)> {
            let mut conn = open_conn(&path)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let mut n = 0u64;
            let mut last = 0u64;
            for e in entries {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO log (seq, key, value, ts_ms) VALUES (?1, ?2, ?3, ?4)",
                    params![e.seq as i64, e.key, e.value, e.ts_ms],
                )?;
                if inserted == 0 {
                    continue;
                }
                n += 1;
                last = last.max(e.seq);
                let current: Option<i64> = tx
                    .query_row("SELECT seq FROM kv WHERE key = ?1", params![e.key], |r| r.get(0))
                    .optional()?;
                if current.map(|s| s as u64 > e.seq).unwrap_or(false) {
                    continue;
                }
                match e.value {
                    Some(v) => {
                        tx.execute(
                            "INSERT OR REPLACE INTO kv (key, value, seq) VALUES (?1, ?2, ?3)",
                            params![e.key, v, e.seq as i64],
                        )?;
                    }
                    None => {
                        tx.execute("DELETE FROM kv WHERE key = ?1", params![e.key])?;
                    }
                }
            }
            tx.commit()?;
            Ok((n, last))
        })
        .await??;
        if ingested > 0 {
            self.notify(StoreEvent::Append { seq: last });
        }
        Ok(ingested)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
pub struct SqliteStoreProvider {
    dir: PathBuf,
    peer_dirs: Vec<PathBuf>,
}

impl SqliteStoreProvider {
    pub fn new(dir: impl AsRef<Path>, peer_dirs: Vec<PathBuf>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("create store dir: {}", dir.display()))?;
        Ok(Self { dir, peer_dirs })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, dkey: &str) -> PathBuf {
        self.dir.join(format!("{dkey}.db"))
    }
}

#[async_trait]
impl StoreProvider for SqliteStoreProvider {
    async fn create(&self) -> Result<Arc<dyn SortedLogStore>> {
        let kp = generate_keypair();
        let path = self.path_for(&discovery_key(&kp.public_key)?);
        let store = tokio::task::spawn_blocking(move || {
            SqliteLogStore::open(path, &kp.public_key, Some(&kp.secret_key))
        })
        .await??;
        Ok(Arc::new(store))
    }

    async fn open(&self, public_key: &str) -> Result<Arc<dyn SortedLogStore>> {
        if !is_valid_key(public_key) {
            return Err(ApiError::Validation(format!("invalid database key: {public_key}")).into());
        }
        let path = self.path_for(&discovery_key(public_key)?);
        let pk = public_key.to_string();
        let store = tokio::task::spawn_blocking(move || SqliteLogStore::open(path, &pk, None)).await??;
        Ok(Arc::new(store))
    }

    async fn sync(&self, store: &dyn SortedLogStore) -> Result<u64> {
        if store.writable() {
            return Ok(0);
        }
        let mut total = 0u64;
        for peer in &self.peer_dirs {
            let peer_path = peer.join(format!("{}.db", store.discovery_key()));
            if !peer_path.exists() {
                continue;
            }
            let peer_name = peer.display().to_string();
            store.notify(StoreEvent::PeerOpen {
                peer: peer_name.clone(),
            });
            loop {
                let local_len = store.len().await?;
                let batch = read_log_entries(peer_path.clone(), local_len, 500, true).await?;
                if batch.is_empty() {
                    break;
                }
                let n = store.ingest(batch).await?;
                total += n;
                if n == 0 {
                    break;
                }
            }
            store.notify(StoreEvent::PeerRemove { peer: peer_name });
        }
        if total > 0 {
            debug!(db=%store.discovery_key(), pulled = total, "store sync");
        }
        Ok(total)
    }

    async fn destroy(&self, discovery_key: &str) -> Result<()> {
        let path = self.path_for(discovery_key);
        tokio::task::spawn_blocking(move || -> Result<()> {
            for suffix in ["", "-wal", "-shm"] {
                let p = PathBuf::from(format!("{}{suffix}", path.display()));
                if p.exists() {
                    std::fs::remove_file(&p).with_context(|| format!("remove {}", p.display()))?;
                }
            }
            Ok(())
        })
        .await??;
        Ok(())
    }
}

async fn read_log_entries(path: PathBuf, after: u64, limit: usize, read_only: bool) -> Result<Vec<LogEntry>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>> {
        let conn = if read_only {
            let c = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("open peer log: {}", path.display()))?;
            c.busy_timeout(Duration::from_secs(5))?;
            c
        } else {
            open_conn(&path)?
        };
        let mut stmt = conn.prepare(
            "SELECT seq, key, value, ts_ms FROM log WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after as i64, limit as i64], |r| {
                Ok(LogEntry {
                    seq: r.get::<_, i64>(0)? as u64,
                    key: r.get(1)?,
                    value: r.get(2)?,
                    ts_ms: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
    .await?
}

/// Smallest string greater than every string starting with `prefix`.
pub fn prefix_end(prefix: &str) -> String {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return chars.into_iter().collect();
        }
    }
    "\u{10ffff}".to_string()
}

fn open_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(10))?;
    Ok(conn)
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS log (
          seq INTEGER PRIMARY KEY,
          key TEXT NOT NULL,
          value BLOB NULL,
          ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_log_key_seq ON log(key, seq);
        CREATE TABLE IF NOT EXISTS kv (
          key TEXT PRIMARY KEY,
          value BLOB NOT NULL,
          seq INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
