/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use fedi3_protocol::UserKind;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use crate::error::ApiError;
use crate::locks::LockManager;
use crate::schemas::SchemaId;
use crate::store::SortedLogStore;
use crate::table::{Batch, Table, URL_SCHEME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DbKind {
    PublicServer,
    PrivateServer,
    PublicUser,
    PrivateUser,
}

impl DbKind {
    pub fn is_private(&self) -> bool {
        matches!(self, Self::PrivateServer | Self::PrivateUser)
    }

    pub fn schemas(&self) -> &'static [SchemaId] {
        match self {
            Self::PublicServer => &[
                SchemaId::User,
                SchemaId::NotificationIdx,
                SchemaId::ThreadIdx,
                SchemaId::FollowIdx,
                SchemaId::ReactionIdx,
                SchemaId::FeedIdx,
                SchemaId::IndexState,
            ],
            Self::PrivateServer => &[SchemaId::Account],
            Self::PublicUser => &[
                SchemaId::Profile,
                SchemaId::Post,
                SchemaId::Comment,
                SchemaId::Follow,
                SchemaId::Reaction,
                SchemaId::CommunityMembership,
                SchemaId::CommunityMember,
                SchemaId::ItemClass,
                SchemaId::Item,
            ],
            Self::PrivateUser => &[SchemaId::Mute],
        }
    }
}

/// One sorted log plus the typed tables living in it.
pub struct Database {
    kind: DbKind,
    user_kind: Option<UserKind>,
    identity: String,
    store: Arc<dyn SortedLogStore>,
    locks: Arc<LockManager>,
    tables: HashMap<SchemaId, Table>,
    loaded_at_ms: i64,
    last_activity_ms: AtomicI64,
    /// None: never ejected for inactivity.
    idle_ttl_ms: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseInfo {
    pub kind: DbKind,
    pub user_kind: Option<UserKind>,
    pub identity: String,
    pub public_key: String,
    pub discovery_key: String,
    pub writable: bool,
    pub is_private: bool,
    pub loaded_at_ms: i64,
    pub last_activity_ms: i64,
}

impl Database {
    pub fn new(
        kind: DbKind,
        user_kind: Option<UserKind>,
        identity: impl Into<String>,
        store: Arc<dyn SortedLogStore>,
        locks: Arc<LockManager>,
        idle_ttl_ms: Option<i64>,
    ) -> Self {
        let tables = kind
            .schemas()
            .iter()
            .map(|s| (*s, Table::new(*s, store.clone(), locks.clone())))
            .collect();
        let now = now_ms();
        Self {
            kind,
            user_kind,
            identity: identity.into(),
            store,
            locks,
            tables,
            loaded_at_ms: now,
            last_activity_ms: AtomicI64::new(now),
            idle_ttl_ms,
        }
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    pub fn user_kind(&self) -> Option<UserKind> {
        self.user_kind
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn public_key(&self) -> &str {
        self.store.public_key()
    }

    pub fn discovery_key(&self) -> &str {
        self.store.discovery_key()
    }

    pub fn writable(&self) -> bool {
        self.store.writable()
    }

    pub fn is_private(&self) -> bool {
        self.kind.is_private()
    }

    pub fn url(&self) -> String {
        format!("{URL_SCHEME}{}", self.public_key())
    }

    pub fn store(&self) -> &Arc<dyn SortedLogStore> {
        &self.store
    }

    pub fn table(&self, schema: SchemaId) -> Result<&Table> {
        self.tables.get(&schema).ok_or_else(|| {
            ApiError::NotFound(format!("table {schema} not found in {}", self.identity)).into()
        })
    }

    pub fn has_table(&self, schema: SchemaId) -> bool {
        self.tables.contains_key(&schema)
    }

    pub fn batch(&self) -> Batch {
        Batch::new(self.store.clone(), self.locks.clone())
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn is_ejectable_from_memory(&self, now_ms: i64) -> bool {
        match self.idle_ttl_ms {
            Some(ttl) => now_ms - self.last_activity_ms() >= ttl,
            None => false,
        }
    }

    /// The public server database indexes every public user database.
    pub fn should_index(&self, other: &Database) -> bool {
        self.kind == DbKind::PublicServer && other.kind == DbKind::PublicUser
    }

    pub fn info(&self) -> DatabaseInfo {
        DatabaseInfo {
            kind: self.kind,
            user_kind: self.user_kind,
            identity: self.identity.clone(),
            public_key: self.public_key().to_string(),
            discovery_key: self.discovery_key().to_string(),
            writable: self.writable(),
            is_private: self.is_private(),
            loaded_at_ms: self.loaded_at_ms,
            last_activity_ms: self.last_activity_ms(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .field("discovery_key", &self.discovery_key())
            .field("writable", &self.writable())
            .finish()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
