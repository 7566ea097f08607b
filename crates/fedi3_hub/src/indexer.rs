/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Incremental secondary indexes.
//!
//! Every indexer keeps, per source database, the last log position it has
//! folded in (an `IndexState` row in the indexing database). A pass diffs the
//! source tables over `(last_processed_seq, len]`, hands each diff to the
//! maintainer in log order inside its own batch and only then advances the
//! cursor. A
//! crash between the two replays the diffs, so maintainers are written to be
//! idempotent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fedi3_protocol::IndexStateRecord;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::ApiError;
use crate::schemas::{Record, SchemaId};
use crate::store::{RangeOpts, RawDiff, WriteOp};
use crate::table::{storage_key, table_prefix, Batch};

#[derive(Debug, Clone)]
pub struct Diff {
    pub schema: SchemaId,
    pub key: String,
    /// Log position of the write that produced `right`.
    pub seq: u64,
    /// Entry url inside the source database.
    pub url: String,
    pub left: Option<Record>,
    pub right: Option<Record>,
}

impl Diff {
    pub fn is_edit(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.right.is_none()
    }

    /// The side that carries the record: right for creates/edits, left for deletes.
    pub fn record(&self) -> Option<&Record> {
        self.right.as_ref().or(self.left.as_ref())
    }
}

#[async_trait]
pub trait Maintainer: Send + Sync {
    /// Folds one diff into the index. Writes go to `batch` only; an error
    /// discards the batch.
    async fn apply(&self, batch: &mut Batch, source: &Database, diff: &Diff) -> Result<()>;
}

pub struct Indexer {
    pub index_schema: SchemaId,
    pub source_schemas: Vec<SchemaId>,
    maintainer: Arc<dyn Maintainer>,
}

impl Indexer {
    pub fn id(&self) -> &'static str {
        self.index_schema.id()
    }

    fn state_key(&self, source: &Database) -> String {
        format!("{}:{}", self.id(), source.discovery_key())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub diffs: u64,
    pub failed: u64,
}

pub struct IndexerEngine {
    db: Arc<Database>,
    indexers: RwLock<Vec<Arc<Indexer>>>,
}

impl IndexerEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            indexers: RwLock::new(Vec::new()),
        }
    }

    pub fn indexing_db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn create_indexer(
        &self,
        index_schema: SchemaId,
        source_schemas: Vec<SchemaId>,
        maintainer: Arc<dyn Maintainer>,
    ) -> Result<()> {
        if !index_schema.is_index() || !self.db.has_table(index_schema) {
            return Err(ApiError::Configuration(format!(
                "{index_schema} is not an index table of {}",
                self.db.identity()
            ))
            .into());
        }
        let mut indexers = self.indexers.write().unwrap_or_else(|p| p.into_inner());
        if indexers.iter().any(|i| i.index_schema == index_schema) {
            return Err(ApiError::Configuration(format!("indexer {index_schema} already registered")).into());
        }
        indexers.push(Arc::new(Indexer {
            index_schema,
            source_schemas,
            maintainer,
        }));
        Ok(())
    }

    pub fn indexer_ids(&self) -> Vec<&'static str> {
        self.snapshot().iter().map(|i| i.id()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<Indexer>> {
        self.indexers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub async fn get_index_state(&self, index_id: &str, source: &Database) -> Result<Option<IndexStateRecord>> {
        let key = format!("{index_id}:{}", source.discovery_key());
        self.db.table(SchemaId::IndexState)?.get_as(&key).await
    }

    pub async fn set_index_state(&self, indexer: &Indexer, source: &Database, seq: u64) -> Result<()> {
        let rec = IndexStateRecord {
            index_id: indexer.id().to_string(),
            indexing_db: self.db.discovery_key().to_string(),
            source_db: source.discovery_key().to_string(),
            source_schemas: indexer
                .source_schemas
                .iter()
                .map(|s| s.id().to_string())
                .collect(),
            last_processed_seq: seq,
            updated_at_ms: now_ms(),
        };
        self.db
            .table(SchemaId::IndexState)?
            .put_as(&indexer.state_key(source), &rec)
            .await?;
        Ok(())
    }

    /// Incremental path after a write to `source`.
    pub async fn update_indexes(&self, source: &Database) -> Result<PassStats> {
        if !self.db.should_index(source) {
            return Ok(PassStats::default());
        }
        let mut total = PassStats::default();
        for indexer in self.snapshot() {
            match self.run_pass(&indexer, source).await {
                Ok(s) => {
                    total.diffs += s.diffs;
                    total.failed += s.failed;
                }
                Err(e) => warn!(index = indexer.id(), db = %source.discovery_key(), "index pass failed: {e:#}"),
            }
        }
        Ok(total)
    }

    /// Full reconciliation over `sources`. One failing source never stops
    /// the others.
    pub async fn catchup(&self, sources: &[Arc<Database>]) -> PassStats {
        let mut total = PassStats::default();
        for source in sources {
            match self.update_indexes(source).await {
                Ok(s) => {
                    total.diffs += s.diffs;
                    total.failed += s.failed;
                }
                Err(e) => warn!(db = %source.discovery_key(), "catch-up failed: {e:#}"),
            }
        }
        if total.diffs > 0 || total.failed > 0 {
            debug!(diffs = total.diffs, failed = total.failed, "index catch-up");
        }
        total
    }

    /// Clears the index tables and cursors of `index_ids` so the next
    /// catch-up re-derives them from the start of every source log.
    pub async fn reset(&self, index_ids: &[String]) -> Result<Vec<&'static str>> {
        let all = self.snapshot();
        let mut targets = Vec::new();
        for id in index_ids {
            let indexer = all
                .iter()
                .find(|i| i.id() == id.trim())
                .ok_or_else(|| ApiError::NotFound(format!("unknown index: {id}")))?;
            if !targets.iter().any(|t: &Arc<Indexer>| t.index_schema == indexer.index_schema) {
                targets.push(indexer.clone());
            }
        }

        let states = self.db.table(SchemaId::IndexState)?;
        for indexer in &targets {
            let cursor_rows = states
                .list(RangeOpts {
                    gt: Some(format!("{}:", indexer.id())),
                    lt: Some(format!("{};", indexer.id())),
                    ..Default::default()
                })
                .await?;
            // Rows come back sorted, so concurrent resets lock in the same order.
            let mut guards = Vec::with_capacity(cursor_rows.len());
            for row in &cursor_rows {
                guards.push(states.lock(&row.key).await);
            }
            let mut ops = Vec::new();
            for row in self
                .db
                .store()
                .range(RangeOpts {
                    gte: Some(table_prefix(indexer.index_schema)),
                    lt: Some(crate::store::prefix_end(&table_prefix(indexer.index_schema))),
                    ..Default::default()
                })
                .await?
            {
                ops.push(WriteOp::Del { key: row.key });
            }
            for row in &cursor_rows {
                ops.push(WriteOp::Del {
                    key: storage_key(SchemaId::IndexState, &row.key),
                });
            }
            let cleared = ops.len();
            self.db
                .store()
                .apply(ops)
                .await
                .with_context(|| format!("reset {}", indexer.id()))?;
            drop(guards);
            info!(index = indexer.id(), cleared, "index reset");
        }
        Ok(targets.iter().map(|i| i.id()).collect())
    }

    async fn run_pass(&self, indexer: &Indexer, source: &Database) -> Result<PassStats> {
        let state_key = indexer.state_key(source);
        let _cursor = self.db.table(SchemaId::IndexState)?.lock(&state_key).await;

        let state = self.get_index_state(indexer.id(), source).await?;
        let since = state.as_ref().map(|s| s.last_processed_seq).unwrap_or(0);
        let until = source.store().len().await?;
        let mut stats = PassStats::default();
        if until <= since {
            if state.is_none() {
                self.set_index_state(indexer, source, until).await?;
            }
            return Ok(stats);
        }

        let mut diffs = Vec::new();
        for schema in &indexer.source_schemas {
            let prefix = table_prefix(*schema);
            let raw = source
                .store()
                .diff(&prefix, since, until)
                .await
                .with_context(|| format!("diff {schema} of {}", source.discovery_key()))?;
            for r in raw {
                match decode_diff(*schema, &prefix, source, r) {
                    Ok(d) => diffs.push(d),
                    Err(e) => {
                        stats.failed += 1;
                        warn!(index = indexer.id(), db = %source.discovery_key(), "skipping undecodable entry: {e:#}");
                    }
                }
            }
        }
        // One ordering across tables: the log's.
        diffs.sort_by_key(|d| d.seq);

        for diff in diffs {
            let mut batch = self.db.batch();
            let applied = match indexer.maintainer.apply(&mut batch, source, &diff).await {
                Ok(()) => batch.commit().await.map(|_| ()),
                Err(e) => Err(e),
            };
            match applied {
                Ok(()) => stats.diffs += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(index = indexer.id(), url = %diff.url, "maintainer failed: {e:#}");
                }
            }
        }

        self.set_index_state(indexer, source, until).await?;
        Ok(stats)
    }
}

fn decode_diff(schema: SchemaId, prefix: &str, source: &Database, raw: RawDiff) -> Result<Diff> {
    let key = raw.key[prefix.len()..].to_string();
    let left = raw
        .left
        .as_deref()
        .map(|b| Record::parse_bytes(schema, b))
        .transpose()?;
    let right = raw
        .right
        .as_deref()
        .map(|b| Record::parse_bytes(schema, b))
        .transpose()?;
    Ok(Diff {
        schema,
        seq: raw.seq,
        url: crate::table::entry_url(source.public_key(), schema, &key),
        key,
        left,
        right,
    })
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
