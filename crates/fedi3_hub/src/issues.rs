/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use fedi3_protocol::SubjectRef;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IssueKind {
    /// A followed database could not be loaded.
    ExternalLoad { subject: SubjectRef, discovery_key: String },
}

/// A background failure surfaced to operators instead of being propagated.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Issue {
    pub id: u64,
    pub kind: IssueKind,
    pub description: String,
    pub cause: String,
    pub error: String,
    pub can_recover: bool,
    pub created_at_ms: i64,
}

#[derive(Default)]
pub struct IssueTracker {
    seq: AtomicU64,
    issues: Mutex<Vec<Issue>>,
}

impl IssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an issue. An open issue of the same kind is replaced so a
    /// database failing on every pass shows up once.
    pub fn add(&self, kind: IssueKind, description: String, cause: String, error: String, can_recover: bool) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut issues = self.issues.lock().unwrap_or_else(|p| p.into_inner());
        issues.retain(|i| i.kind != kind);
        issues.push(Issue {
            id,
            kind,
            description,
            cause,
            error,
            can_recover,
            created_at_ms: now_ms(),
        });
        id
    }

    pub fn list(&self) -> Vec<Issue> {
        self.issues.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn dismiss(&self, id: u64) -> bool {
        self.take(id).is_some()
    }

    pub fn take(&self, id: u64) -> Option<Issue> {
        let mut issues = self.issues.lock().unwrap_or_else(|p| p.into_inner());
        let idx = issues.iter().position(|i| i.id == id)?;
        Some(issues.remove(idx))
    }

    /// Clears issues about a database that has since loaded fine.
    pub fn resolve_database(&self, discovery_key: &str) {
        self.issues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|i| match &i.kind {
                IssueKind::ExternalLoad { discovery_key: d, .. } => d != discovery_key,
            });
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
