/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::error::ApiError;
use crate::keys::mlts;
use crate::locks::{LockGuard, LockManager};
use crate::schemas::{field_str, KeyGen, Record, SchemaId};
use crate::store::{prefix_end, RangeOpts, SortedLogStore, WriteOp};

pub const URL_SCHEME: &str = "hub://";

#[derive(Clone)]
pub struct Table {
    schema: SchemaId,
    store: Arc<dyn SortedLogStore>,
    locks: Arc<LockManager>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TableEntry {
    pub key: String,
    pub seq: u64,
    pub url: String,
    pub value: Value,
}

impl TableEntry {
    pub fn record<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone())
            .with_context(|| format!("decode {}", self.url))
    }
}

impl Table {
    pub fn new(schema: SchemaId, store: Arc<dyn SortedLogStore>, locks: Arc<LockManager>) -> Self {
        Self {
            schema,
            store,
            locks,
        }
    }

    pub fn schema(&self) -> SchemaId {
        self.schema
    }

    pub fn url(&self, key: &str) -> String {
        entry_url(self.store.public_key(), self.schema, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<TableEntry>> {
        let Some(e) = self.store.get(&storage_key(self.schema, key)).await? else {
            return Ok(None);
        };
        let value: Value = serde_json::from_slice(&e.value)
            .with_context(|| format!("corrupt row {}", self.url(key)))?;
        Ok(Some(TableEntry {
            key: key.to_string(),
            seq: e.seq,
            url: self.url(key),
            value,
        }))
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(e) => Ok(Some(e.record()?)),
            None => Ok(None),
        }
    }

    /// Bounds are table keys; with none given this is a full forward scan.
    pub async fn list(&self, opts: RangeOpts) -> Result<Vec<TableEntry>> {
        let prefix = table_prefix(self.schema);
        let rows = self.store.range(absolute_range(self.schema, opts)).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let key = r.key[prefix.len()..].to_string();
            let value: Value = serde_json::from_slice(&r.value)
                .with_context(|| format!("corrupt row {}", self.url(&key)))?;
            out.push(TableEntry {
                url: self.url(&key),
                key,
                seq: r.seq,
                value,
            });
        }
        Ok(out)
    }

    pub async fn put(&self, key: &str, value: &Value) -> Result<TableEntry> {
        if key.is_empty() {
            return Err(ApiError::Validation(format!("{}: empty key", self.schema)).into());
        }
        Record::parse(self.schema, value)?;
        let bytes = serde_json::to_vec(value)?;
        let seq = self.store.put(&storage_key(self.schema, key), bytes).await?;
        Ok(TableEntry {
            key: key.to_string(),
            seq,
            url: self.url(key),
            value: value.clone(),
        })
    }

    pub async fn put_as<T: Serialize>(&self, key: &str, record: &T) -> Result<TableEntry> {
        self.put(key, &serde_json::to_value(record)?).await
    }

    pub async fn create(&self, value: &Value) -> Result<TableEntry> {
        let key = self.generate_key(value)?;
        self.put(&key, value).await
    }

    pub fn generate_key(&self, value: &Value) -> Result<String> {
        match self.schema.key_gen() {
            KeyGen::Auto => Ok(mlts()),
            KeyGen::Fixed(k) => Ok(k.to_string()),
            KeyGen::Fields(paths) => {
                let mut parts = Vec::with_capacity(paths.len());
                for p in paths {
                    let v = field_str(value, p).ok_or_else(|| {
                        ApiError::Validation(format!("{}: missing field {p}", self.schema))
                    })?;
                    parts.push(v);
                }
                Ok(parts.join(":"))
            }
            KeyGen::Explicit => Err(ApiError::Permissions(format!(
                "{} keys are assigned by the indexer",
                self.schema
            ))
            .into()),
        }
    }

    pub async fn del(&self, key: &str) -> Result<bool> {
        self.store.del(&storage_key(self.schema, key)).await
    }

    /// Serializes writers of one logical key of this table.
    pub async fn lock(&self, key: &str) -> LockGuard {
        self.locks
            .lock(lock_name(self.store.discovery_key(), self.schema, key))
            .await
    }
}

/// Atomic write set against one database. Pending writes are visible to
/// reads through the batch, and lock guards taken through it are held until
/// the batch is committed or dropped.
pub struct Batch {
    store: Arc<dyn SortedLogStore>,
    locks: Arc<LockManager>,
    ops: Vec<WriteOp>,
    pending: HashMap<String, Option<Vec<u8>>>,
    guards: Vec<LockGuard>,
}

impl Batch {
    pub fn new(store: Arc<dyn SortedLogStore>, locks: Arc<LockManager>) -> Self {
        Self {
            store,
            locks,
            ops: Vec::new(),
            pending: HashMap::new(),
            guards: Vec::new(),
        }
    }

    pub async fn lock(&mut self, schema: SchemaId, key: &str) {
        let name = lock_name(self.store.discovery_key(), schema, key);
        if self.guards.iter().any(|g| g.name() == name) {
            return;
        }
        let guard = self.locks.lock(name).await;
        self.guards.push(guard);
    }

    pub async fn get(&self, schema: SchemaId, key: &str) -> Result<Option<Value>> {
        let sk = storage_key(schema, key);
        let bytes = match self.pending.get(&sk) {
            Some(p) => p.clone(),
            None => self.store.get(&sk).await?.map(|e| e.value),
        };
        match bytes {
            Some(b) => Ok(Some(serde_json::from_slice(&b)?)),
            None => Ok(None),
        }
    }

    pub async fn get_as<T: DeserializeOwned>(&self, schema: SchemaId, key: &str) -> Result<Option<T>> {
        match self.get(schema, key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Range read overlaying pending writes. Returns `(table key, value)`.
    pub async fn list(&self, schema: SchemaId, opts: RangeOpts) -> Result<Vec<(String, Value)>> {
        let reverse = opts.reverse;
        let limit = opts.limit;
        let mut range = absolute_range(schema, opts);
        range.limit = None;
        range.reverse = false;
        let in_range = |k: &str| {
            range.gt.as_deref().map_or(true, |b| k > b)
                && range.gte.as_deref().map_or(true, |b| k >= b)
                && range.lt.as_deref().map_or(true, |b| k < b)
                && range.lte.as_deref().map_or(true, |b| k <= b)
        };
        let mut merged: BTreeMap<String, Vec<u8>> = self
            .store
            .range(range.clone())
            .await?
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect();
        for (k, v) in &self.pending {
            if !in_range(k) {
                continue;
            }
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        let prefix_len = table_prefix(schema).len();
        let mut out = Vec::new();
        let iter: Box<dyn Iterator<Item = (&String, &Vec<u8>)>> = if reverse {
            Box::new(merged.iter().rev())
        } else {
            Box::new(merged.iter())
        };
        for (k, v) in iter {
            if limit.map_or(false, |l| out.len() >= l) {
                break;
            }
            out.push((k[prefix_len..].to_string(), serde_json::from_slice(v)?));
        }
        Ok(out)
    }

    pub fn put(&mut self, schema: SchemaId, key: &str, value: &Value) -> Result<()> {
        Record::parse(schema, value)?;
        let sk = storage_key(schema, key);
        let bytes = serde_json::to_vec(value)?;
        self.pending.insert(sk.clone(), Some(bytes.clone()));
        self.ops.push(WriteOp::Put { key: sk, value: bytes });
        Ok(())
    }

    pub fn put_as<T: Serialize>(&mut self, schema: SchemaId, key: &str, record: &T) -> Result<()> {
        self.put(schema, key, &serde_json::to_value(record)?)
    }

    pub fn del(&mut self, schema: SchemaId, key: &str) {
        let sk = storage_key(schema, key);
        self.pending.insert(sk.clone(), None);
        self.ops.push(WriteOp::Del { key: sk });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub async fn commit(self) -> Result<u64> {
        let Batch {
            store, ops, guards, ..
        } = self;
        let seq = store.apply(ops).await;
        drop(guards);
        seq
    }
}

pub fn table_prefix(schema: SchemaId) -> String {
    format!("{}|", schema.id())
}

pub fn storage_key(schema: SchemaId, key: &str) -> String {
    format!("{}|{}", schema.id(), key)
}

pub fn lock_name(discovery_key: &str, schema: SchemaId, key: &str) -> String {
    format!("{discovery_key}:{}:{key}", schema.id())
}

pub fn entry_url(public_key: &str, schema: SchemaId, key: &str) -> String {
    format!("{URL_SCHEME}{public_key}/{}/{key}", schema.id())
}

/// Splits `hub://<public key>/<schema id>/<key>`. The key part may be empty
/// for database urls.
pub fn parse_entry_url(url: &str) -> Result<(String, Option<(SchemaId, String)>)> {
    let rest = url
        .trim()
        .strip_prefix(URL_SCHEME)
        .ok_or_else(|| ApiError::Validation(format!("not a hub url: {url}")))?;
    let (pk, path) = match rest.split_once('/') {
        Some((pk, path)) => (pk, path),
        None => (rest, ""),
    };
    if !crate::keys::is_valid_key(pk) {
        return Err(ApiError::Validation(format!("bad database key in url: {url}")).into());
    }
    let pk = pk.to_ascii_lowercase();
    if path.is_empty() {
        return Ok((pk, None));
    }
    for schema in SchemaId::ALL {
        if let Some(key) = path.strip_prefix(&format!("{}/", schema.id())) {
            return Ok((pk, Some((schema, key.to_string()))));
        }
    }
    Err(ApiError::NotFound(format!("unknown table in url: {url}")).into())
}

fn absolute_range(schema: SchemaId, opts: RangeOpts) -> RangeOpts {
    let prefix = table_prefix(schema);
    let sk = |k: String| format!("{prefix}{k}");
    let mut out = RangeOpts {
        gt: opts.gt.map(sk),
        gte: opts.gte.map(sk),
        lt: opts.lt.map(sk),
        lte: opts.lte.map(sk),
        limit: opts.limit,
        reverse: opts.reverse,
    };
    if out.gt.is_none() && out.gte.is_none() {
        out.gte = Some(prefix.clone());
    }
    if out.lt.is_none() && out.lte.is_none() {
        out.lt = Some(prefix_end(&prefix));
    }
    out
}
