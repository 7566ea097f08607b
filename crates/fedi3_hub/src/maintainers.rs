/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use fedi3_protocol::{
    FeedIdxRecord, FollowIdxRecord, NotificationIdxRecord, ReactionIdxRecord, SubjectRef,
    ThreadIdxRecord, ThreadItem,
};
use std::sync::Arc;

use crate::database::Database;
use crate::indexer::{Diff, IndexerEngine, Maintainer};
use crate::keys::discovery_key;
use crate::schemas::{Record, SchemaId};
use crate::store::RangeOpts;
use crate::table::{parse_entry_url, Batch};

pub fn register_default_indexers(engine: &IndexerEngine) -> Result<()> {
    engine.create_indexer(
        SchemaId::NotificationIdx,
        vec![SchemaId::Follow, SchemaId::Comment, SchemaId::Reaction],
        Arc::new(NotificationsMaintainer),
    )?;
    engine.create_indexer(SchemaId::ThreadIdx, vec![SchemaId::Comment], Arc::new(ThreadMaintainer))?;
    engine.create_indexer(SchemaId::FollowIdx, vec![SchemaId::Follow], Arc::new(FollowIdxMaintainer))?;
    engine.create_indexer(
        SchemaId::ReactionIdx,
        vec![SchemaId::Reaction],
        Arc::new(ReactionIdxMaintainer),
    )?;
    engine.create_indexer(SchemaId::FeedIdx, vec![SchemaId::Post], Arc::new(CommunityFeedMaintainer))?;
    Ok(())
}

/// Row-key range holding every row filed under one subject (a notification
/// recipient, a community).
pub fn subject_range(subject_dkey: &str) -> RangeOpts {
    RangeOpts {
        gt: Some(format!("{subject_dkey}:")),
        lt: Some(format!("{subject_dkey};")),
        ..Default::default()
    }
}

/// Sort token of a per-subject row: the event's own time first, then its
/// log position and source database for events sharing a millisecond.
/// Replays and rebuilds mint the same token again.
pub fn event_token(created_at_ms: i64, seq: u64, source_dkey: &str) -> String {
    format!("{:012x}{:012x}{source_dkey}", created_at_ms.max(0) as u64, seq)
}

/// Key of the row under `subject_dkey` whose `item_url` is `url`.
async fn find_row_by_item(batch: &Batch, schema: SchemaId, subject_dkey: &str, url: &str) -> Result<Option<String>> {
    Ok(batch
        .list(schema, subject_range(subject_dkey))
        .await?
        .into_iter()
        .find(|(_, v)| v.get("item_url").and_then(|u| u.as_str()) == Some(url))
        .map(|(k, _)| k))
}

fn db_key_of_url(url: &str) -> Result<String> {
    Ok(parse_entry_url(url)?.0)
}

/// follow, comment and reaction rows land in the notification feed of the
/// database they point at.
pub struct NotificationsMaintainer;

impl NotificationsMaintainer {
    fn recipient(record: &Record) -> Result<Option<(String, i64)>> {
        Ok(match record {
            Record::Follow(f) => Some((f.subject.db_key.to_ascii_lowercase(), f.created_at_ms)),
            Record::Comment(c) => {
                let target = c.reply.parent.as_ref().unwrap_or(&c.reply.root);
                Some((db_key_of_url(&target.db_url)?, c.created_at_ms))
            }
            Record::Reaction(r) => Some((db_key_of_url(&r.subject.db_url)?, r.created_at_ms)),
            _ => None,
        })
    }
}

#[async_trait]
impl Maintainer for NotificationsMaintainer {
    async fn apply(&self, batch: &mut Batch, source: &Database, diff: &Diff) -> Result<()> {
        if diff.is_edit() {
            return Ok(());
        }
        let Some(record) = diff.record() else {
            return Ok(());
        };
        let Some((recipient, created_at_ms)) = Self::recipient(record)? else {
            return Ok(());
        };
        if recipient.eq_ignore_ascii_case(source.public_key()) {
            return Ok(());
        }
        let rdkey = discovery_key(&recipient)?;
        batch.lock(SchemaId::NotificationIdx, &rdkey).await;

        let existing = find_row_by_item(batch, SchemaId::NotificationIdx, &rdkey, &diff.url).await?;
        match (&diff.right, existing) {
            (Some(_), None) => {
                let row = NotificationIdxRecord {
                    item_url: diff.url.clone(),
                    author_db_key: source.public_key().to_string(),
                    created_at_ms,
                };
                let token = event_token(created_at_ms, diff.seq, source.discovery_key());
                batch.put_as(SchemaId::NotificationIdx, &format!("{rdkey}:{token}"), &row)?;
            }
            (None, Some(key)) => batch.del(SchemaId::NotificationIdx, &key),
            _ => {}
        }
        Ok(())
    }
}

/// Comment → reply list of its root and of its direct parent.
pub struct ThreadMaintainer;

#[async_trait]
impl Maintainer for ThreadMaintainer {
    async fn apply(&self, batch: &mut Batch, source: &Database, diff: &Diff) -> Result<()> {
        if diff.is_edit() {
            return Ok(());
        }
        let Some(Record::Comment(comment)) = diff.record() else {
            return Ok(());
        };
        let mut targets = vec![comment.reply.root.db_url.clone()];
        if let Some(parent) = &comment.reply.parent {
            if parent.db_url != comment.reply.root.db_url {
                targets.push(parent.db_url.clone());
            }
        }
        targets.sort();
        for t in &targets {
            batch.lock(SchemaId::ThreadIdx, t).await;
        }

        for subject_url in targets {
            let mut row = batch
                .get_as::<ThreadIdxRecord>(SchemaId::ThreadIdx, &subject_url)
                .await?
                .unwrap_or_else(|| ThreadIdxRecord {
                    subject_url: subject_url.clone(),
                    items: Vec::new(),
                });
            let before = row.items.len();
            if diff.is_delete() {
                row.items.retain(|i| i.url != diff.url);
            } else if !row.items.iter().any(|i| i.url == diff.url) {
                row.items.push(ThreadItem {
                    url: diff.url.clone(),
                    author_db_key: source.public_key().to_string(),
                    created_at_ms: comment.created_at_ms,
                });
                row.items
                    .sort_by(|a, b| (a.created_at_ms, &a.url).cmp(&(b.created_at_ms, &b.url)));
            }
            if row.items.len() == before {
                continue;
            }
            if row.items.is_empty() {
                batch.del(SchemaId::ThreadIdx, &subject_url);
            } else {
                batch.put_as(SchemaId::ThreadIdx, &subject_url, &row)?;
            }
        }
        Ok(())
    }
}

/// Follow → follower set of the followed database, keyed by its discovery key.
pub struct FollowIdxMaintainer;

#[async_trait]
impl Maintainer for FollowIdxMaintainer {
    async fn apply(&self, batch: &mut Batch, source: &Database, diff: &Diff) -> Result<()> {
        if diff.is_edit() {
            return Ok(());
        }
        let Some(Record::Follow(follow)) = diff.record() else {
            return Ok(());
        };
        let subject = follow.subject.db_key.to_ascii_lowercase();
        let key = discovery_key(&subject)?;
        batch.lock(SchemaId::FollowIdx, &key).await;

        let mut row = batch
            .get_as::<FollowIdxRecord>(SchemaId::FollowIdx, &key)
            .await?
            .unwrap_or_else(|| FollowIdxRecord {
                subject_db_key: subject,
                followers: Vec::new(),
            });
        let follower = SubjectRef {
            user_id: source.identity().to_string(),
            db_key: source.public_key().to_string(),
        };
        let before = row.followers.len();
        if diff.is_delete() {
            row.followers.retain(|f| !f.db_key.eq_ignore_ascii_case(&follower.db_key));
        } else if !row.followers.iter().any(|f| f.db_key.eq_ignore_ascii_case(&follower.db_key)) {
            row.followers.push(follower);
        }
        if row.followers.len() == before {
            return Ok(());
        }
        if row.followers.is_empty() {
            batch.del(SchemaId::FollowIdx, &key);
        } else {
            batch.put_as(SchemaId::FollowIdx, &key, &row)?;
        }
        Ok(())
    }
}

/// Reaction → per-subject tally: reaction string → reaction entry urls.
pub struct ReactionIdxMaintainer;

#[async_trait]
impl Maintainer for ReactionIdxMaintainer {
    async fn apply(&self, batch: &mut Batch, _source: &Database, diff: &Diff) -> Result<()> {
        if diff.is_edit() {
            return Ok(());
        }
        let Some(Record::Reaction(reaction)) = diff.record() else {
            return Ok(());
        };
        let subject_url = reaction.subject.db_url.clone();
        batch.lock(SchemaId::ReactionIdx, &subject_url).await;

        let mut row = batch
            .get_as::<ReactionIdxRecord>(SchemaId::ReactionIdx, &subject_url)
            .await?
            .unwrap_or_else(|| ReactionIdxRecord {
                subject_url: subject_url.clone(),
                reactions: Default::default(),
            });
        let urls = row.reactions.entry(reaction.reaction.clone()).or_default();
        let before = urls.len();
        if diff.is_delete() {
            urls.retain(|u| u != &diff.url);
        } else if !urls.contains(&diff.url) {
            urls.push(diff.url.clone());
        }
        if urls.len() == before {
            return Ok(());
        }
        row.reactions.retain(|_, v| !v.is_empty());
        if row.reactions.is_empty() {
            batch.del(SchemaId::ReactionIdx, &subject_url);
        } else {
            batch.put_as(SchemaId::ReactionIdx, &subject_url, &row)?;
        }
        Ok(())
    }
}

/// Post naming a community → that community's feed. Moving a post to
/// another community moves its row.
pub struct CommunityFeedMaintainer;

impl CommunityFeedMaintainer {
    fn community_of(record: Option<&Record>) -> Option<(String, i64)> {
        match record {
            Some(Record::Post(p)) => p
                .community
                .as_ref()
                .map(|c| (c.db_key.to_ascii_lowercase(), p.created_at_ms)),
            _ => None,
        }
    }
}

#[async_trait]
impl Maintainer for CommunityFeedMaintainer {
    async fn apply(&self, batch: &mut Batch, source: &Database, diff: &Diff) -> Result<()> {
        let before = Self::community_of(diff.left.as_ref());
        let after = Self::community_of(diff.right.as_ref());
        if before.as_ref().map(|b| &b.0) == after.as_ref().map(|a| &a.0) && diff.is_edit() {
            return Ok(());
        }
        let before = before.map(|(k, _)| discovery_key(&k)).transpose()?;
        let after = after
            .map(|(k, t)| discovery_key(&k).map(|d| (d, t)))
            .transpose()?;

        let mut targets = before.iter().chain(after.iter().map(|(d, _)| d)).cloned().collect::<Vec<_>>();
        targets.sort();
        for t in &targets {
            batch.lock(SchemaId::FeedIdx, t).await;
        }

        if let Some(cdkey) = &before {
            if let Some(key) = find_row_by_item(batch, SchemaId::FeedIdx, cdkey, &diff.url).await? {
                batch.del(SchemaId::FeedIdx, &key);
            }
        }
        if let Some((cdkey, created_at_ms)) = after {
            if find_row_by_item(batch, SchemaId::FeedIdx, &cdkey, &diff.url).await?.is_none() {
                let token = event_token(created_at_ms, diff.seq, source.discovery_key());
                batch.put_as(
                    SchemaId::FeedIdx,
                    &format!("{cdkey}:{token}"),
                    &FeedIdxRecord {
                        item_url: diff.url.clone(),
                        author_db_key: source.public_key().to_string(),
                        created_at_ms,
                    },
                )?;
            }
        }
        Ok(())
    }
}
