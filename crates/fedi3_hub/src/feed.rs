/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{unfold, Stream};
use serde_json::Value;
use std::{collections::VecDeque, sync::Arc};
use tracing::warn;

use crate::database::Database;
use crate::schemas::SchemaId;
use crate::store::RangeOpts;

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FeedItem {
    pub key: String,
    pub url: String,
    pub author: String,
    /// Discovery key of the source database, used to break key ties.
    pub source: String,
    pub value: Value,
}

/// A descending page source.
#[async_trait]
pub trait FeedCursor: Send {
    fn source(&self) -> &str;
    /// Next `n` items strictly older than the previous page. Empty means done.
    async fn next_page(&mut self, n: usize) -> Result<Vec<FeedItem>>;
}

/// Walks one table of one database newest first.
pub struct TableCursor {
    db: Arc<Database>,
    schema: SchemaId,
    lt: Option<String>,
}

impl TableCursor {
    pub fn new(db: Arc<Database>, schema: SchemaId, lt: Option<String>) -> Self {
        Self { db, schema, lt }
    }
}

#[async_trait]
impl FeedCursor for TableCursor {
    fn source(&self) -> &str {
        self.db.discovery_key()
    }

    async fn next_page(&mut self, n: usize) -> Result<Vec<FeedItem>> {
        let rows = self
            .db
            .table(self.schema)?
            .list(RangeOpts {
                lt: self.lt.clone(),
                limit: Some(n),
                reverse: true,
                ..Default::default()
            })
            .await?;
        if let Some(last) = rows.last() {
            self.lt = Some(last.key.clone());
        }
        Ok(rows
            .into_iter()
            .map(|e| FeedItem {
                key: e.key,
                url: e.url,
                author: self.db.identity().to_string(),
                source: self.db.discovery_key().to_string(),
                value: e.value,
            })
            .collect())
    }
}

struct MergeSource {
    cursor: Box<dyn FeedCursor>,
    buf: VecDeque<FeedItem>,
    exhausted: bool,
}

/// Merges N descending cursors into one descending sequence capped at
/// `limit`, holding at most one page per source.
pub struct FeedMerge {
    sources: Vec<MergeSource>,
    page_size: usize,
    remaining: usize,
}

impl FeedMerge {
    pub fn new(cursors: Vec<Box<dyn FeedCursor>>, page_size: usize, limit: usize) -> Self {
        Self {
            sources: cursors
                .into_iter()
                .map(|cursor| MergeSource {
                    cursor,
                    buf: VecDeque::new(),
                    exhausted: false,
                })
                .collect(),
            page_size: page_size.max(1),
            remaining: limit,
        }
    }

    pub async fn next(&mut self) -> Option<FeedItem> {
        if self.remaining == 0 {
            return None;
        }
        for s in self.sources.iter_mut() {
            if !s.buf.is_empty() || s.exhausted {
                continue;
            }
            match s.cursor.next_page(self.page_size).await {
                Ok(page) if page.is_empty() => s.exhausted = true,
                Ok(page) => s.buf.extend(page),
                Err(e) => {
                    // A broken source must not hide the others.
                    warn!(source = %s.cursor.source(), "feed source failed: {e:#}");
                    s.exhausted = true;
                }
            }
        }
        let best = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.buf.front().map(|h| (i, h)))
            .max_by(|(_, a), (_, b)| (&a.key, &a.source).cmp(&(&b.key, &b.source)))
            .map(|(i, _)| i)?;
        self.remaining -= 1;
        self.sources[best].buf.pop_front()
    }

    pub async fn collect(mut self) -> Vec<FeedItem> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item);
        }
        out
    }

    pub fn into_stream(self) -> impl Stream<Item = FeedItem> + Send {
        unfold(self, |mut merge| async move {
            let item = merge.next().await?;
            Some((item, merge))
        })
    }
}
