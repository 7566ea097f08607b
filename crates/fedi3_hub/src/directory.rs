/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The database directory: which logs are in memory, who owns them, and the
//! glue between writes, indexes and the read side.

use anyhow::{Context, Result};
use fedi3_protocol::{
    AccountRecord, CommunityMemberRecord, FollowRecord, MuteRecord, ProfileRecord, SubjectRef,
    ThreadIdxRecord, ThreadItem, UserKind, UserRecord,
};
use futures_util::future::join_all;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

use crate::database::{Database, DatabaseInfo, DbKind};
use crate::error::ApiError;
use crate::feed::{FeedCursor, FeedItem, FeedMerge, TableCursor, DEFAULT_PAGE_SIZE};
use crate::feed_cache::FeedCache;
use crate::indexer::{IndexerEngine, PassStats};
use crate::issues::{Issue, IssueKind, IssueTracker};
use crate::keys::{discovery_key, is_valid_key, load_server_keys, save_server_keys, ServerKeys};
use crate::locks::LockManager;
use crate::maintainers::{register_default_indexers, subject_range};
use crate::replication_log::{ReplicationEvent, ReplicationEventKind, ReplicationLog, DEFAULT_CAPACITY};
use crate::runtime::HubConfig;
use crate::schemas::SchemaId;
use crate::store::{RangeOpts, StoreProvider};
use crate::table::{parse_entry_url, TableEntry};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewUser {
    pub username: String,
    pub kind: UserKind,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

pub struct CreatedUser {
    pub identity: String,
    pub database: Arc<Database>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReconcileStats {
    pub wanted: usize,
    pub loaded: usize,
    pub unloaded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Registry {
    by_identity: HashMap<String, Arc<Database>>,
    by_dkey: HashMap<String, Arc<Database>>,
}

impl Registry {
    fn insert(&mut self, db: Arc<Database>) {
        let id = db.identity().to_ascii_lowercase();
        // A remote log claiming a local identity never shadows the local one.
        let shadowed = self
            .by_identity
            .get(&id)
            .map(|cur| cur.writable() && !db.writable())
            .unwrap_or(false);
        if !shadowed {
            self.by_identity.insert(id, db.clone());
        }
        self.by_dkey.insert(db.discovery_key().to_string(), db);
    }

    fn remove(&mut self, dkey: &str) -> Option<Arc<Database>> {
        let db = self.by_dkey.remove(dkey)?;
        let id = db.identity().to_ascii_lowercase();
        if self
            .by_identity
            .get(&id)
            .map(|cur| cur.discovery_key() == dkey)
            .unwrap_or(false)
        {
            self.by_identity.remove(&id);
        }
        Some(db)
    }
}

pub struct Directory {
    cfg: HubConfig,
    data_dir: PathBuf,
    provider: Arc<dyn StoreProvider>,
    locks: Arc<LockManager>,
    server_public: Arc<Database>,
    server_private: Arc<Database>,
    indexer: IndexerEngine,
    public: RwLock<Registry>,
    private: RwLock<Registry>,
    loading: Mutex<HashMap<String, Arc<OnceCell<Arc<Database>>>>>,
    followed: RwLock<HashSet<String>>,
    feed_cache: FeedCache<Vec<FeedItem>>,
    issues: IssueTracker,
    replication_log: Arc<ReplicationLog>,
    reconcile: Notify,
    sync_cursor: AtomicUsize,
}

impl Directory {
    /// Opens (or bootstraps) the server databases under `data_dir`, loads
    /// local users and brings every index up to date.
    pub async fn open(cfg: HubConfig, data_dir: impl AsRef<Path>, provider: Arc<dyn StoreProvider>) -> Result<Arc<Self>> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let locks = LockManager::new();

        let (public_store, private_store) = match load_server_keys(&data_dir)? {
            Some(keys) => {
                let public = provider.open(&keys.public_server_db).await?;
                let private = provider.open(&keys.private_server_db).await?;
                for s in [&public, &private] {
                    if !s.writable() {
                        return Err(ApiError::Configuration(format!(
                            "server database {} is not writable in {}",
                            s.public_key(),
                            data_dir.display()
                        ))
                        .into());
                    }
                }
                (public, private)
            }
            None => {
                let public = provider.create().await?;
                let private = provider.create().await?;
                save_server_keys(
                    &data_dir,
                    &ServerKeys {
                        public_server_db: public.public_key().to_string(),
                        private_server_db: private.public_key().to_string(),
                    },
                )?;
                info!(public = %public.public_key(), "bootstrapped server databases");
                (public, private)
            }
        };

        let server_public = Arc::new(Database::new(
            DbKind::PublicServer,
            None,
            format!("server@{}", cfg.domain),
            public_store,
            locks.clone(),
            None,
        ));
        let server_private = Arc::new(Database::new(
            DbKind::PrivateServer,
            None,
            format!("server@{}", cfg.domain),
            private_store,
            locks.clone(),
            None,
        ));
        let indexer = IndexerEngine::new(server_public.clone());
        register_default_indexers(&indexer)?;

        let replication_log = Arc::new(ReplicationLog::new(
            cfg.replication_log_capacity.unwrap_or(DEFAULT_CAPACITY),
        ));
        replication_log.watch(server_public.store().as_ref());
        replication_log.watch(server_private.store().as_ref());

        let dir = Arc::new(Self {
            cfg,
            data_dir,
            provider,
            locks,
            server_public,
            server_private,
            indexer,
            public: RwLock::new(Registry::default()),
            private: RwLock::new(Registry::default()),
            loading: Mutex::new(HashMap::new()),
            followed: RwLock::new(HashSet::new()),
            feed_cache: FeedCache::new(),
            issues: IssueTracker::new(),
            replication_log,
            reconcile: Notify::new(),
            sync_cursor: AtomicUsize::new(0),
        });

        let users = dir.local_users().await?;
        for rec in &users {
            if let Err(e) = dir.load_local_user(rec).await {
                warn!(user = %rec.username, "failed to load local user: {e:#}");
            }
        }
        let stats = dir.catchup_all_indexes().await;
        info!(users = users.len(), diffs = stats.diffs, "directory ready");
        Ok(dir)
    }

    pub fn config(&self) -> &HubConfig {
        &self.cfg
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn server_public(&self) -> &Arc<Database> {
        &self.server_public
    }

    pub fn server_private(&self) -> &Arc<Database> {
        &self.server_private
    }

    pub fn indexer(&self) -> &IndexerEngine {
        &self.indexer
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn identity_of(&self, username: &str) -> String {
        format!("{}@{}", username.trim().to_ascii_lowercase(), self.cfg.domain)
    }

    fn local_idle_ms(&self) -> Option<i64> {
        self.cfg.local_idle_secs.map(|s| s as i64 * 1000)
    }

    fn external_idle_ms(&self) -> Option<i64> {
        Some(self.cfg.external_idle_secs.unwrap_or(300) as i64 * 1000)
    }

    fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.sync_timeout_secs.unwrap_or(10).max(1))
    }

    fn feed_ttl(&self) -> Duration {
        Duration::from_secs(self.cfg.feed_cache_ttl_secs.unwrap_or(30))
    }

    // ---- registries ----

    fn register(&self, db: Arc<Database>) {
        let reg = if db.is_private() { &self.private } else { &self.public };
        reg.write().unwrap_or_else(|p| p.into_inner()).insert(db.clone());
        self.replication_log.watch(db.store().as_ref());
        self.replication_log
            .record(db.discovery_key(), ReplicationEventKind::Load, db.identity());
    }

    fn is_server_db(&self, dkey: &str) -> bool {
        dkey == self.server_public.discovery_key() || dkey == self.server_private.discovery_key()
    }

    fn loaded(&self, private: bool) -> Vec<Arc<Database>> {
        let reg = if private { &self.private } else { &self.public };
        let mut out = reg
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .by_dkey
            .values()
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.discovery_key().cmp(b.discovery_key()));
        out
    }

    pub fn get_database_by_discovery_key(&self, dkey: &str) -> Option<Arc<Database>> {
        let dkey = dkey.trim().to_ascii_lowercase();
        if dkey == self.server_public.discovery_key() {
            return Some(self.server_public.clone());
        }
        if dkey == self.server_private.discovery_key() {
            return Some(self.server_private.clone());
        }
        for reg in [&self.public, &self.private] {
            if let Some(db) = reg.read().unwrap_or_else(|p| p.into_inner()).by_dkey.get(&dkey) {
                return Some(db.clone());
            }
        }
        None
    }

    /// Resolves an identity (`user` or `user@domain`), a discovery key or a
    /// public key to a loaded public database. Evicted local users are
    /// reloaded on demand.
    pub async fn get_database(&self, id: &str) -> Result<Arc<Database>> {
        let id = id.trim();
        if is_valid_key(id) {
            if let Some(db) = self.get_database_by_discovery_key(id) {
                return Ok(db);
            }
            if let Some(db) = self.get_database_by_discovery_key(&discovery_key(id)?) {
                return Ok(db);
            }
            return Err(ApiError::NotFound(format!("database {id} is not loaded")).into());
        }
        let identity = self.normalize_identity(id);
        let found = self
            .public
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .by_identity
            .get(&identity)
            .cloned();
        if let Some(db) = found {
            return Ok(db);
        }
        if let Some(username) = self.local_username(&identity) {
            if let Some(rec) = self.server_public.table(SchemaId::User)?.get_as::<UserRecord>(&username).await? {
                return self.load_local_user(&rec).await;
            }
        }
        Err(ApiError::NotFound(format!("no database for {id}")).into())
    }

    pub async fn get_private_database(&self, identity: &str) -> Result<Arc<Database>> {
        let public = self.get_database(identity).await?;
        let identity = public.identity().to_ascii_lowercase();
        self.private
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .by_identity
            .get(&identity)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("no private database for {identity}")).into())
    }

    pub async fn get_database_by_url(&self, url: &str) -> Result<Arc<Database>> {
        let (pk, _) = parse_entry_url(url)?;
        self.get_database_by_discovery_key(&discovery_key(&pk)?)
            .ok_or_else(|| ApiError::NotFound(format!("database of {url} is not loaded")).into())
    }

    fn normalize_identity(&self, id: &str) -> String {
        let id = id.trim().to_ascii_lowercase();
        if id.contains('@') {
            id
        } else {
            format!("{id}@{}", self.cfg.domain.to_ascii_lowercase())
        }
    }

    fn local_username(&self, identity: &str) -> Option<String> {
        let (user, domain) = identity.split_once('@')?;
        domain
            .eq_ignore_ascii_case(&self.cfg.domain)
            .then(|| user.to_string())
    }

    /// Runs `init` at most once per discovery key at a time; concurrent
    /// callers share its result.
    async fn load_once<F, Fut>(&self, dkey: &str, init: F) -> Result<Arc<Database>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Database>>>,
    {
        if let Some(db) = self.get_database_by_discovery_key(dkey) {
            return Ok(db);
        }
        let cell = {
            let mut loading = self.loading.lock().unwrap_or_else(|p| p.into_inner());
            loading
                .entry(dkey.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let res = cell
            .get_or_try_init(|| async move {
                if let Some(db) = self.get_database_by_discovery_key(dkey) {
                    return Ok(db);
                }
                init().await
            })
            .await
            .cloned();
        {
            let mut loading = self.loading.lock().unwrap_or_else(|p| p.into_inner());
            if loading.get(dkey).map(|c| Arc::ptr_eq(c, &cell)).unwrap_or(false) {
                loading.remove(dkey);
            }
        }
        res
    }

    async fn local_users(&self) -> Result<Vec<UserRecord>> {
        self.server_public
            .table(SchemaId::User)?
            .list(RangeOpts::default())
            .await?
            .iter()
            .map(|e| e.record())
            .collect()
    }

    async fn load_local_user(&self, rec: &UserRecord) -> Result<Arc<Database>> {
        let dkey = discovery_key(&rec.db_key)?;
        self.load_once(&dkey, || async {
            let store = self.provider.open(&rec.db_key).await?;
            if !store.writable() {
                return Err(ApiError::Configuration(format!(
                    "database of local user {} is not writable here",
                    rec.username
                ))
                .into());
            }
            let identity = self.identity_of(&rec.username);
            let account: Option<AccountRecord> = self
                .server_private
                .table(SchemaId::Account)?
                .get_as(&rec.username)
                .await?;
            if let Some(acct) = account {
                let pstore = self.provider.open(&acct.private_db_key).await?;
                self.register(Arc::new(Database::new(
                    DbKind::PrivateUser,
                    Some(rec.kind),
                    identity.clone(),
                    pstore,
                    self.locks.clone(),
                    self.local_idle_ms(),
                )));
            }
            let db = Arc::new(Database::new(
                DbKind::PublicUser,
                Some(rec.kind),
                identity,
                store,
                self.locks.clone(),
                self.local_idle_ms(),
            ));
            self.register(db.clone());
            // Whatever was written while it was out of memory.
            if let Err(e) = self.indexer.update_indexes(&db).await {
                warn!(user = %rec.username, "index catch-up after load failed: {e:#}");
            }
            Ok::<_, anyhow::Error>(db)
        })
        .await
    }

    // ---- users ----

    pub async fn create_user(&self, new_user: NewUser) -> Result<CreatedUser> {
        let username = new_user.username.trim().to_ascii_lowercase();
        validate_username(&username)?;
        let users = self.server_public.table(SchemaId::User)?;
        let _guard = users.lock(&username).await;
        if users.get(&username).await?.is_some() {
            return Err(ApiError::Validation(format!("username {username} is taken")).into());
        }

        let identity = self.identity_of(&username);
        let now = now_ms();
        let public_store = self.provider.create().await?;
        let private_store = self.provider.create().await?;
        let db = Arc::new(Database::new(
            DbKind::PublicUser,
            Some(new_user.kind),
            identity.clone(),
            public_store,
            self.locks.clone(),
            self.local_idle_ms(),
        ));
        let private = Arc::new(Database::new(
            DbKind::PrivateUser,
            Some(new_user.kind),
            identity.clone(),
            private_store,
            self.locks.clone(),
            self.local_idle_ms(),
        ));

        db.table(SchemaId::Profile)?
            .put_as(
                "self",
                &ProfileRecord {
                    display_name: new_user
                        .display_name
                        .filter(|s| !s.trim().is_empty())
                        .unwrap_or_else(|| username.clone()),
                    description: new_user.description,
                },
            )
            .await?;
        users
            .put_as(
                &username,
                &UserRecord {
                    username: username.clone(),
                    kind: new_user.kind,
                    db_key: db.public_key().to_string(),
                    db_url: db.url(),
                    created_at_ms: now,
                },
            )
            .await?;
        self.server_private
            .table(SchemaId::Account)?
            .put_as(
                &username,
                &AccountRecord {
                    username: username.clone(),
                    email: new_user.email,
                    private_db_key: private.public_key().to_string(),
                    created_at_ms: now,
                },
            )
            .await?;

        self.register(private);
        self.register(db.clone());
        self.on_database_change(&db).await?;
        info!(%identity, db = %db.discovery_key(), "user created");
        Ok(CreatedUser {
            identity,
            database: db,
        })
    }

    /// Removes the account and destroys both of the user's logs. Index rows
    /// derived from them are left as they are.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        let username = username.trim().to_ascii_lowercase();
        let users = self.server_public.table(SchemaId::User)?;
        let _guard = users.lock(&username).await;
        let rec: UserRecord = users
            .get_as(&username)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("user {username}")))?;
        let accounts = self.server_private.table(SchemaId::Account)?;
        let account: Option<AccountRecord> = accounts.get_as(&username).await?;

        let public_dkey = discovery_key(&rec.db_key)?;
        self.unload(&public_dkey);
        self.provider.destroy(&public_dkey).await?;
        if let Some(acct) = &account {
            let private_dkey = discovery_key(&acct.private_db_key)?;
            self.unload(&private_dkey);
            self.provider.destroy(&private_dkey).await?;
        }
        users.del(&username).await?;
        accounts.del(&username).await?;
        self.invalidate_feed(&self.identity_of(&username)).await;
        self.schedule_reconcile();
        info!(user = %username, "user deleted");
        Ok(())
    }

    // ---- external lifecycle ----

    /// Loads a remote database, pulling what peers have before returning.
    pub async fn load_external(&self, subject: &SubjectRef) -> Result<Arc<Database>> {
        if !is_valid_key(&subject.db_key) {
            return Err(ApiError::Validation(format!("invalid database key: {}", subject.db_key)).into());
        }
        let pk = subject.db_key.to_ascii_lowercase();
        let dkey = discovery_key(&pk)?;
        let db = self
            .load_once(&dkey, || async {
                let store = self.provider.open(&pk).await?;
                let pulled = tokio::time::timeout(self.sync_timeout(), self.provider.sync(store.as_ref()))
                    .await
                    .map_err(|_| anyhow::anyhow!("sync of {dkey} timed out"))??;
                let db = Arc::new(Database::new(
                    DbKind::PublicUser,
                    None,
                    subject.user_id.clone(),
                    store,
                    self.locks.clone(),
                    self.external_idle_ms(),
                ));
                self.register(db.clone());
                debug!(db = %dkey, pulled, "external database loaded");
                Ok::<_, anyhow::Error>(db)
            })
            .await?;
        self.issues.resolve_database(&dkey);
        self.indexer.update_indexes(&db).await?;
        Ok(db)
    }

    /// Drops a database from memory. Server databases stay.
    pub fn unload(&self, dkey: &str) -> bool {
        if self.is_server_db(dkey) {
            return false;
        }
        let mut removed = false;
        for reg in [&self.public, &self.private] {
            if let Some(db) = reg.write().unwrap_or_else(|p| p.into_inner()).remove(dkey) {
                self.replication_log
                    .record(dkey, ReplicationEventKind::Unload, db.identity());
                removed = true;
            }
        }
        removed
    }

    /// Follow subjects and community memberships of every local user, keyed
    /// by discovery key. Local databases are left out.
    pub async fn compute_followed_discovery_keys(&self) -> Result<HashMap<String, SubjectRef>> {
        let users = self.local_users().await?;
        let mut local = HashSet::new();
        for rec in &users {
            local.insert(discovery_key(&rec.db_key)?);
        }
        let mut out = HashMap::new();
        for rec in &users {
            let dkey = discovery_key(&rec.db_key)?;
            let db = match self.get_database_by_discovery_key(&dkey) {
                Some(db) => db,
                // Not in memory: read it without registering.
                None => Arc::new(Database::new(
                    DbKind::PublicUser,
                    Some(rec.kind),
                    self.identity_of(&rec.username),
                    self.provider.open(&rec.db_key).await?,
                    self.locks.clone(),
                    None,
                )),
            };
            for e in db.table(SchemaId::Follow)?.list(RangeOpts::default()).await? {
                let f: FollowRecord = e.record()?;
                push_subject(&mut out, &local, f.subject);
            }
            for e in db
                .table(SchemaId::CommunityMembership)?
                .list(RangeOpts::default())
                .await?
            {
                let m: fedi3_protocol::CommunityMembershipRecord = e.record()?;
                push_subject(&mut out, &local, m.community);
            }
        }
        Ok(out)
    }

    pub async fn load_or_unload_external_databases(&self) -> Result<ReconcileStats> {
        let wanted = self.compute_followed_discovery_keys().await?;
        *self.followed.write().unwrap_or_else(|p| p.into_inner()) = wanted.keys().cloned().collect();

        let missing = wanted
            .iter()
            .filter(|(dkey, _)| self.get_database_by_discovery_key(dkey).is_none())
            .map(|(dkey, subject)| (dkey.clone(), subject.clone()))
            .collect::<Vec<_>>();
        let results = join_all(missing.iter().map(|(_, subject)| self.load_external(subject))).await;

        let mut stats = ReconcileStats {
            wanted: wanted.len(),
            ..Default::default()
        };
        for ((dkey, subject), res) in missing.into_iter().zip(results) {
            match res {
                Ok(_) => stats.loaded += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(db = %dkey, user = %subject.user_id, "external load failed: {e:#}");
                    self.issues.add(
                        IssueKind::ExternalLoad {
                            subject: subject.clone(),
                            discovery_key: dkey,
                        },
                        format!("Could not load the database of {}", subject.user_id),
                        "load_or_unload_external_databases".to_string(),
                        format!("{e:#}"),
                        true,
                    );
                }
            }
        }

        for db in self.loaded(false) {
            if db.writable() || db.kind() != DbKind::PublicUser {
                continue;
            }
            if !wanted.contains_key(db.discovery_key()) && self.unload(db.discovery_key()) {
                stats.unloaded += 1;
            }
        }
        if stats.loaded > 0 || stats.unloaded > 0 || stats.failed > 0 {
            info!(
                wanted = stats.wanted,
                loaded = stats.loaded,
                unloaded = stats.unloaded,
                failed = stats.failed,
                "external databases reconciled"
            );
        }
        Ok(stats)
    }

    pub fn schedule_reconcile(&self) {
        self.reconcile.notify_one();
    }

    pub async fn reconcile_requested(&self) {
        self.reconcile.notified().await;
    }

    /// Syncs the next loaded external database (round robin) and folds what
    /// arrived into the indexes. Returns its discovery key.
    pub async fn sync_next_external(&self) -> Result<Option<String>> {
        let externals = self
            .loaded(false)
            .into_iter()
            .filter(|db| !db.writable() && db.kind() == DbKind::PublicUser)
            .collect::<Vec<_>>();
        if externals.is_empty() {
            return Ok(None);
        }
        let idx = self.sync_cursor.fetch_add(1, Ordering::Relaxed) % externals.len();
        let db = &externals[idx];
        let pulled = tokio::time::timeout(self.sync_timeout(), self.provider.sync(db.store().as_ref()))
            .await
            .map_err(|_| anyhow::anyhow!("sync of {} timed out", db.discovery_key()))?
            .with_context(|| format!("sync {}", db.discovery_key()))?;
        if pulled > 0 {
            self.replication_log.record(
                db.discovery_key(),
                ReplicationEventKind::Sync,
                format!("pulled={pulled}"),
            );
            self.indexer.update_indexes(db).await?;
            self.invalidate_feeds_of(db).await;
        }
        Ok(Some(db.discovery_key().to_string()))
    }

    /// Unloads databases the ejection policy deems idle. Server databases
    /// and followed externals stay.
    pub fn sweep_inactive(&self, now_ms: i64) -> Vec<String> {
        let followed = self.followed.read().unwrap_or_else(|p| p.into_inner()).clone();
        let mut out = Vec::new();
        for db in self.loaded(false).into_iter().chain(self.loaded(true)) {
            let dkey = db.discovery_key();
            if self.is_server_db(dkey) || !db.is_ejectable_from_memory(now_ms) {
                continue;
            }
            if !db.writable() && followed.contains(dkey) {
                continue;
            }
            if self.unload(dkey) {
                out.push(dkey.to_string());
            }
        }
        if !out.is_empty() {
            debug!(unloaded = out.len(), "inactive databases swept");
        }
        out
    }

    // ---- writes, indexes ----

    /// Call after every local write to `db`.
    pub async fn on_database_change(&self, db: &Database) -> Result<()> {
        db.touch();
        self.indexer.update_indexes(db).await?;
        if db.writable() && db.kind() == DbKind::PublicUser {
            self.schedule_reconcile();
        }
        Ok(())
    }

    /// Catch-up over `sources`, or over every loaded public database.
    pub async fn catchup_indexes(&self, sources: Option<&[Arc<Database>]>) -> PassStats {
        match sources {
            Some(sources) => self.indexer.catchup(sources).await,
            None => self.indexer.catchup(&self.loaded(false)).await,
        }
    }

    pub async fn catchup_all_indexes(&self) -> PassStats {
        self.catchup_indexes(None).await
    }

    /// Resets the given indexes of the indexing database named by
    /// `identity` and re-derives them from every local user plus the loaded
    /// externals. Evicted local users are loaded back for the replay.
    pub async fn rebuild_indexes(&self, identity: &str, index_ids: &[String]) -> Result<Vec<&'static str>> {
        let target = self.get_database(identity).await.or_else(|e| {
            let id = identity.trim().to_ascii_lowercase();
            if id == "server" || id == self.server_public.identity().to_ascii_lowercase() {
                Ok(self.server_public.clone())
            } else {
                Err(e)
            }
        })?;
        if target.discovery_key() != self.server_public.discovery_key() {
            return Err(ApiError::Validation(format!("{} does not maintain indexes", target.identity())).into());
        }
        let ids = if index_ids.is_empty() {
            self.indexer.indexer_ids().iter().map(|s| s.to_string()).collect()
        } else {
            index_ids.to_vec()
        };
        let reset = self.indexer.reset(&ids).await?;
        for rec in self.local_users().await? {
            if let Err(e) = self.load_local_user(&rec).await {
                warn!(user = %rec.username, "cannot replay local user: {e:#}");
            }
        }
        let stats = self.catchup_all_indexes().await;
        info!(indexes = reset.len(), diffs = stats.diffs, "indexes rebuilt");
        Ok(reset)
    }

    fn resolve_writable_table(schema: SchemaId) -> Result<()> {
        if schema.is_index() || matches!(schema, SchemaId::User | SchemaId::Account) {
            return Err(ApiError::Permissions(format!("{schema} is maintained by the server")).into());
        }
        Ok(())
    }

    async fn resolve_table_db(&self, db_id: &str, schema: SchemaId) -> Result<Arc<Database>> {
        match schema {
            SchemaId::Account => Ok(self.server_private.clone()),
            s if s.is_index() || s == SchemaId::User => Ok(self.server_public.clone()),
            s if s.is_private() => self.get_private_database(db_id).await,
            _ => self.get_database(db_id).await,
        }
    }

    pub async fn table_list(&self, db_id: &str, schema_id: &str, opts: RangeOpts) -> Result<Vec<TableEntry>> {
        let schema = SchemaId::from_id(schema_id)?;
        let db = self.resolve_table_db(db_id, schema).await?;
        db.touch();
        db.table(schema)?.list(opts).await
    }

    pub async fn table_get(&self, db_id: &str, schema_id: &str, key: &str) -> Result<Option<TableEntry>> {
        let schema = SchemaId::from_id(schema_id)?;
        let db = self.resolve_table_db(db_id, schema).await?;
        db.touch();
        db.table(schema)?.get(key).await
    }

    pub async fn table_create(&self, db_id: &str, schema_id: &str, value: Value) -> Result<TableEntry> {
        let schema = SchemaId::from_id(schema_id)?;
        Self::resolve_writable_table(schema)?;
        let db = self.resolve_table_db(db_id, schema).await?;
        let table = db.table(schema)?;
        let key = table.generate_key(&value)?;
        let entry = {
            let _guard = table.lock(&key).await;
            table.put(&key, &value).await?
        };
        self.after_write(&db, schema).await?;
        Ok(entry)
    }

    pub async fn table_update(&self, db_id: &str, schema_id: &str, key: &str, value: Value) -> Result<TableEntry> {
        let schema = SchemaId::from_id(schema_id)?;
        Self::resolve_writable_table(schema)?;
        let db = self.resolve_table_db(db_id, schema).await?;
        let table = db.table(schema)?;
        let entry = {
            let _guard = table.lock(key).await;
            if table.get(key).await?.is_none() {
                return Err(ApiError::NotFound(table.url(key)).into());
            }
            table.put(key, &value).await?
        };
        self.after_write(&db, schema).await?;
        Ok(entry)
    }

    pub async fn table_delete(&self, db_id: &str, schema_id: &str, key: &str) -> Result<bool> {
        let schema = SchemaId::from_id(schema_id)?;
        Self::resolve_writable_table(schema)?;
        let db = self.resolve_table_db(db_id, schema).await?;
        let table = db.table(schema)?;
        let deleted = {
            let _guard = table.lock(key).await;
            table.del(key).await?
        };
        if deleted {
            self.after_write(&db, schema).await?;
        }
        Ok(deleted)
    }

    pub(crate) async fn after_write(&self, db: &Database, schema: SchemaId) -> Result<()> {
        self.on_database_change(db).await?;
        if schema.affects_feed() {
            self.invalidate_feeds_of(db).await;
        }
        Ok(())
    }

    fn feed_lock_name(owner: &str) -> String {
        format!("feed:{}", owner.to_ascii_lowercase())
    }

    /// Waits for an in-flight computation of the owner's feed, so a result
    /// read before the write never lands in the cache after it.
    async fn invalidate_feed(&self, owner: &str) {
        let _guard = self.locks.lock(Self::feed_lock_name(owner)).await;
        self.feed_cache.invalidate(owner);
    }

    /// Drops cached feeds of the owner, of everyone following `db` and, for
    /// a community, of its members.
    async fn invalidate_feeds_of(&self, db: &Database) {
        let mut owners = vec![db.identity().to_string()];
        match self.list_followers(db.public_key()).await {
            Ok(followers) => owners.extend(followers.into_iter().map(|f| f.user_id)),
            Err(e) => debug!(db = %db.discovery_key(), "follower lookup failed: {e:#}"),
        }
        if let Ok(members) = db.table(SchemaId::CommunityMember) {
            match members.list(RangeOpts::default()).await {
                Ok(rows) => owners.extend(
                    rows.iter()
                        .filter_map(|r| r.record::<CommunityMemberRecord>().ok())
                        .map(|m| m.user.user_id),
                ),
                Err(e) => debug!(db = %db.discovery_key(), "member lookup failed: {e:#}"),
            }
        }
        owners.sort_by_key(|o| o.to_ascii_lowercase());
        owners.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        for owner in owners {
            self.invalidate_feed(&owner).await;
        }
    }

    // ---- reads ----

    pub fn list_databases(&self) -> Vec<DatabaseInfo> {
        let mut out = vec![self.server_public.info(), self.server_private.info()];
        out.extend(self.loaded(false).iter().map(|db| db.info()));
        out.extend(self.loaded(true).iter().map(|db| db.info()));
        out
    }

    pub fn query_replication_log(&self, pred: impl Fn(&ReplicationEvent) -> bool) -> Vec<ReplicationEvent> {
        self.replication_log.query(pred)
    }

    /// Newest posts of the user and everyone they follow, mutes excluded.
    pub async fn home_feed(&self, identity: &str, limit: usize, lt: Option<String>) -> Result<Vec<FeedItem>> {
        let db = self.get_database(identity).await?;
        if !db.writable() {
            return Err(ApiError::Permissions(format!("{} is not hosted here", db.identity())).into());
        }
        let owner = db.identity().to_string();
        // Held until the result is cached; invalidation waits on it.
        let _feed_guard = self.locks.lock(Self::feed_lock_name(&owner)).await;
        if lt.is_none() {
            if let Some(hit) = self.feed_cache.get(&owner, limit) {
                return Ok(hit.into_iter().take(limit).collect());
            }
        }

        let muted: HashSet<String> = match self.get_private_database(&owner).await {
            Ok(private) => {
                let mut set = HashSet::new();
                for e in private.table(SchemaId::Mute)?.list(RangeOpts::default()).await? {
                    let m: MuteRecord = e.record()?;
                    set.insert(m.subject.db_key.to_ascii_lowercase());
                }
                set
            }
            Err(_) => HashSet::new(),
        };

        let mut sources: Vec<Arc<Database>> = vec![db.clone()];
        let mut subjects = Vec::new();
        for e in db.table(SchemaId::Follow)?.list(RangeOpts::default()).await? {
            subjects.push(e.record::<FollowRecord>()?.subject);
        }
        for e in db
            .table(SchemaId::CommunityMembership)?
            .list(RangeOpts::default())
            .await?
        {
            subjects.push(e.record::<fedi3_protocol::CommunityMembershipRecord>()?.community);
        }
        for s in subjects {
            let pk = s.db_key.to_ascii_lowercase();
            if muted.contains(&pk) || !is_valid_key(&pk) {
                continue;
            }
            if let Some(other) = self.get_database_by_discovery_key(&discovery_key(&pk)?) {
                if !sources.iter().any(|d| d.discovery_key() == other.discovery_key()) {
                    other.touch();
                    sources.push(other);
                }
            }
        }

        let cursors = sources
            .into_iter()
            .map(|d| Box::new(TableCursor::new(d, SchemaId::Post, lt.clone())) as Box<dyn FeedCursor>)
            .collect();
        let page = self.cfg.feed_page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let items = FeedMerge::new(cursors, page, limit).collect().await;
        if lt.is_none() {
            self.feed_cache.set(&owner, items.clone(), limit, self.feed_ttl());
        }
        Ok(items)
    }

    /// Newest first. `lt` is a row key returned by a previous page.
    pub async fn list_notifications(&self, identity: &str, limit: usize, lt: Option<String>) -> Result<Vec<TableEntry>> {
        let db = self.get_database(identity).await?;
        let mut range = subject_range(db.discovery_key());
        if let Some(lt) = lt.filter(|k| k.starts_with(&format!("{}:", db.discovery_key()))) {
            range.lt = Some(lt);
        }
        range.limit = Some(limit);
        range.reverse = true;
        self.server_public.table(SchemaId::NotificationIdx)?.list(range).await
    }

    pub async fn count_notifications(&self, identity: &str, after: Option<String>) -> Result<usize> {
        let db = self.get_database(identity).await?;
        let mut range = subject_range(db.discovery_key());
        if let Some(after) = after.filter(|k| k.starts_with(&format!("{}:", db.discovery_key()))) {
            range.gt = Some(after);
        }
        Ok(self
            .server_public
            .table(SchemaId::NotificationIdx)?
            .list(range)
            .await?
            .len())
    }

    pub async fn list_replies(&self, subject_url: &str) -> Result<Vec<ThreadItem>> {
        let row: Option<ThreadIdxRecord> = self
            .server_public
            .table(SchemaId::ThreadIdx)?
            .get_as(subject_url.trim())
            .await?;
        Ok(row.map(|r| r.items).unwrap_or_default())
    }

    /// `db` is an identity or a public key; the database need not be loaded
    /// when a key is given.
    pub async fn list_followers(&self, db: &str) -> Result<Vec<SubjectRef>> {
        let dkey = if is_valid_key(db.trim()) {
            discovery_key(db.trim())?
        } else {
            self.get_database(db).await?.discovery_key().to_string()
        };
        let row: Option<fedi3_protocol::FollowIdxRecord> =
            self.server_public.table(SchemaId::FollowIdx)?.get_as(&dkey).await?;
        Ok(row.map(|r| r.followers).unwrap_or_default())
    }

    pub async fn get_reactions(&self, subject_url: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let row: Option<fedi3_protocol::ReactionIdxRecord> = self
            .server_public
            .table(SchemaId::ReactionIdx)?
            .get_as(subject_url.trim())
            .await?;
        Ok(row.map(|r| r.reactions).unwrap_or_default())
    }

    /// Posts filed under a community, newest first. `community` is an
    /// identity or a public key; the community need not be loaded when a key
    /// is given. `lt` is a row key from a previous page.
    pub async fn list_community_feed(&self, community: &str, limit: usize, lt: Option<String>) -> Result<Vec<TableEntry>> {
        let dkey = if is_valid_key(community.trim()) {
            discovery_key(community.trim())?
        } else {
            let db = self.get_database(community).await?;
            if db.user_kind() != Some(UserKind::Community) {
                return Err(ApiError::Validation(format!("{} is not a community", db.identity())).into());
            }
            db.discovery_key().to_string()
        };
        let mut range = subject_range(&dkey);
        if let Some(lt) = lt.filter(|k| k.starts_with(&format!("{dkey}:"))) {
            range.lt = Some(lt);
        }
        range.limit = Some(limit);
        range.reverse = true;
        self.server_public.table(SchemaId::FeedIdx)?.list(range).await
    }

    // ---- issues ----

    pub fn list_issues(&self) -> Vec<Issue> {
        self.issues.list()
    }

    pub fn dismiss_issue(&self, id: u64) -> bool {
        self.issues.dismiss(id)
    }

    /// Retries whatever failed. On another failure the issue is filed again.
    pub async fn recover_issue(&self, id: u64) -> Result<()> {
        let issue = self
            .issues
            .take(id)
            .ok_or_else(|| ApiError::NotFound(format!("issue {id}")))?;
        if !issue.can_recover {
            return Err(ApiError::Validation(format!("issue {id} cannot be recovered")).into());
        }
        match &issue.kind {
            IssueKind::ExternalLoad { subject, .. } => {
                if let Err(e) = self.load_external(subject).await {
                    self.issues.add(
                        issue.kind.clone(),
                        issue.description.clone(),
                        "recover".to_string(),
                        format!("{e:#}"),
                        true,
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

fn push_subject(out: &mut HashMap<String, SubjectRef>, local: &HashSet<String>, subject: SubjectRef) {
    if !is_valid_key(&subject.db_key) {
        return;
    }
    let Ok(dkey) = discovery_key(&subject.db_key) else {
        return;
    };
    if local.contains(&dkey) {
        return;
    }
    out.entry(dkey).or_insert(SubjectRef {
        user_id: subject.user_id,
        db_key: subject.db_key.to_ascii_lowercase(),
    });
}

fn validate_username(username: &str) -> Result<()> {
    let ok = !username.is_empty()
        && username.len() <= 64
        && username
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-' || b == b'.')
        && username != "server";
    if !ok {
        return Err(ApiError::Validation(format!("invalid username: {username:?}")).into());
    }
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::error_code_of;
    use crate::store::SqliteStoreProvider;
    use fedi3_protocol::ErrorCode;
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) fn test_config() -> HubConfig {
        HubConfig {
            domain: "hub.test".to_string(),
            ..HubConfig::default()
        }
    }

    pub(crate) async fn open_dir(data: &Path, peers: Vec<PathBuf>) -> Arc<Directory> {
        let provider = SqliteStoreProvider::new(data.join("stores"), peers).unwrap();
        Directory::open(test_config(), data, Arc::new(provider)).await.unwrap()
    }

    pub(crate) async fn user(dir: &Directory, name: &str, kind: UserKind) -> Arc<Database> {
        dir.create_user(NewUser {
            username: name.to_string(),
            kind,
            display_name: None,
            description: None,
            email: None,
        })
        .await
        .unwrap()
        .database
    }

    fn subject(db: &Database) -> Value {
        json!({"user_id": db.identity(), "db_key": db.public_key()})
    }

    #[tokio::test]
    async fn bootstrap_persists_server_keys_and_reloads_users() {
        let tmp = TempDir::new().unwrap();
        let (server_pk, alice_pk) = {
            let dir = open_dir(tmp.path(), vec![]).await;
            let alice = user(&dir, "alice", UserKind::Citizen).await;
            (dir.server_public().public_key().to_string(), alice.public_key().to_string())
        };
        let keys = load_server_keys(tmp.path()).unwrap().unwrap();
        assert_eq!(keys.public_server_db, server_pk);

        let dir = open_dir(tmp.path(), vec![]).await;
        assert_eq!(dir.server_public().public_key(), server_pk);
        let alice = dir.get_database("ALICE@hub.test").await.unwrap();
        assert_eq!(alice.public_key(), alice_pk);
        assert!(alice.writable());
        let profile = dir
            .table_get("alice", SchemaId::Profile.id(), "self")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.value["display_name"], "alice");
    }

    #[tokio::test]
    async fn server_keys_for_foreign_databases_are_rejected() {
        let tmp = TempDir::new().unwrap();
        save_server_keys(
            tmp.path(),
            &ServerKeys {
                public_server_db: crate::keys::generate_keypair().public_key,
                private_server_db: crate::keys::generate_keypair().public_key,
            },
        )
        .unwrap();
        let provider = SqliteStoreProvider::new(tmp.path().join("stores"), vec![]).unwrap();
        let err = Directory::open(test_config(), tmp.path(), Arc::new(provider))
            .await
            .err()
            .unwrap();
        assert_eq!(error_code_of(&err), Some(ErrorCode::ConfigurationError));
    }

    #[tokio::test]
    async fn usernames_are_validated_and_unique() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        user(&dir, "alice", UserKind::Citizen).await;
        for bad in ["alice", "Bad Name", "", "server"] {
            let err = dir
                .create_user(NewUser {
                    username: bad.to_string(),
                    kind: UserKind::Citizen,
                    display_name: None,
                    description: None,
                    email: None,
                })
                .await
                .err()
                .unwrap();
            assert_eq!(error_code_of(&err), Some(ErrorCode::ValidationError), "{bad}");
        }
    }

    #[tokio::test]
    async fn table_api_guards_index_tables_and_missing_rows() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        user(&dir, "alice", UserKind::Citizen).await;

        let err = dir
            .table_create("alice", SchemaId::FollowIdx.id(), json!({}))
            .await
            .unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::PermissionsError));

        let err = dir
            .table_update("alice", SchemaId::Post.id(), "nope", json!({"text": "x", "created_at_ms": 1}))
            .await
            .unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::NotFoundError));

        let err = dir
            .table_get("alice", "fedi3.hub/unknown", "x")
            .await
            .unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::NotFoundError));

        let err = dir
            .table_list("nobody", SchemaId::Post.id(), RangeOpts::default())
            .await
            .unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::NotFoundError));

        let post = dir
            .table_create("alice", SchemaId::Post.id(), json!({"text": "x", "created_at_ms": 1}))
            .await
            .unwrap();
        let updated = dir
            .table_update("alice", SchemaId::Post.id(), &post.key, json!({"text": "y", "created_at_ms": 1}))
            .await
            .unwrap();
        assert_eq!(updated.value["text"], "y");
        assert!(dir.table_delete("alice", SchemaId::Post.id(), &post.key).await.unwrap());
        assert!(!dir.table_delete("alice", SchemaId::Post.id(), &post.key).await.unwrap());
    }

    #[tokio::test]
    async fn follow_then_post_reaches_home_feed() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let bob = user(&dir, "bob", UserKind::Citizen).await;

        dir.table_create(
            "alice",
            SchemaId::Follow.id(),
            json!({"subject": subject(&bob), "created_at_ms": 1}),
        )
        .await
        .unwrap();
        let post = dir
            .table_create("bob", SchemaId::Post.id(), json!({"text": "hello", "created_at_ms": 2}))
            .await
            .unwrap();
        dir.catchup_all_indexes().await;

        let feed = dir.home_feed("alice", 10, None).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].url, post.url);
        assert_eq!(feed[0].author, bob.identity());

        // Nobody reacted or replied yet.
        assert!(dir.get_reactions(&post.url).await.unwrap().is_empty());
        assert!(dir.list_replies(&post.url).await.unwrap().is_empty());

        // Bob got a follow notification, Alice is a follower.
        assert_eq!(dir.count_notifications("bob", None).await.unwrap(), 1);
        let followers = dir.list_followers("bob").await.unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].db_key, alice.public_key());
    }

    #[tokio::test]
    async fn cached_feed_is_invalidated_by_new_posts_and_mutes_apply() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        user(&dir, "alice", UserKind::Citizen).await;
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        dir.table_create("alice", SchemaId::Follow.id(), json!({"subject": subject(&bob), "created_at_ms": 1}))
            .await
            .unwrap();
        dir.table_create("bob", SchemaId::Post.id(), json!({"text": "one", "created_at_ms": 2}))
            .await
            .unwrap();
        assert_eq!(dir.home_feed("alice", 10, None).await.unwrap().len(), 1);

        dir.table_create("bob", SchemaId::Post.id(), json!({"text": "two", "created_at_ms": 3}))
            .await
            .unwrap();
        let feed = dir.home_feed("alice", 10, None).await.unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].value["text"], "two");

        // Paging past the newest item.
        let older = dir
            .home_feed("alice", 10, Some(feed[0].key.clone()))
            .await
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].value["text"], "one");

        dir.table_create("alice", SchemaId::Mute.id(), json!({"subject": subject(&bob), "created_at_ms": 4}))
            .await
            .unwrap();
        assert!(dir.home_feed("alice", 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn notifications_page_newest_first() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        user(&dir, "alice", UserKind::Citizen).await;
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        let post = dir
            .table_create("bob", SchemaId::Post.id(), json!({"text": "p", "created_at_ms": 1}))
            .await
            .unwrap();
        for r in ["a", "b", "c"] {
            dir.table_create(
                "alice",
                SchemaId::Reaction.id(),
                json!({"subject": {"db_url": post.url}, "reaction": r, "created_at_ms": 2}),
            )
            .await
            .unwrap();
        }
        let first = dir.list_notifications(bob.identity(), 2, None).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = dir
            .list_notifications(bob.identity(), 2, Some(first[1].key.clone()))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].key < first[1].key);
        assert_eq!(dir.count_notifications("bob", Some(first[1].key.clone())).await.unwrap(), 1);
        assert_eq!(dir.get_reactions(&post.url).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn externals_follow_the_followed_set() {
        let remote_tmp = TempDir::new().unwrap();
        let local_tmp = TempDir::new().unwrap();
        let remote = open_dir(remote_tmp.path(), vec![]).await;
        let carol = user(&remote, "carol", UserKind::Citizen).await;
        let post = remote
            .table_create("carol", SchemaId::Post.id(), json!({"text": "from afar", "created_at_ms": 1}))
            .await
            .unwrap();

        let local = open_dir(local_tmp.path(), vec![remote_tmp.path().join("stores")]).await;
        user(&local, "alice", UserKind::Citizen).await;
        let follow = local
            .table_create("alice", SchemaId::Follow.id(), json!({"subject": subject(&carol), "created_at_ms": 2}))
            .await
            .unwrap();

        let stats = local.load_or_unload_external_databases().await.unwrap();
        assert_eq!(stats, ReconcileStats { wanted: 1, loaded: 1, unloaded: 0, failed: 0 });
        let ext = local.get_database_by_discovery_key(carol.discovery_key()).unwrap();
        assert!(!ext.writable());
        let feed = local.home_feed("alice", 10, None).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].url, post.url);
        assert!(!local
            .query_replication_log(|e| e.kind == ReplicationEventKind::Load && e.discovery_key == carol.discovery_key())
            .is_empty());

        // Unfollow: the external leaves memory on the next pass.
        local
            .table_delete("alice", SchemaId::Follow.id(), &follow.key)
            .await
            .unwrap();
        let stats = local.load_or_unload_external_databases().await.unwrap();
        assert_eq!(stats.unloaded, 1);
        assert!(local.get_database_by_discovery_key(carol.discovery_key()).is_none());
        // Every loaded non-writable database is in the followed set (empty).
        assert!(local
            .list_databases()
            .iter()
            .all(|d| d.writable));
    }

    #[tokio::test]
    async fn round_robin_sync_pulls_new_entries() {
        let remote_tmp = TempDir::new().unwrap();
        let local_tmp = TempDir::new().unwrap();
        let remote = open_dir(remote_tmp.path(), vec![]).await;
        let carol = user(&remote, "carol", UserKind::Citizen).await;
        let local = open_dir(local_tmp.path(), vec![remote_tmp.path().join("stores")]).await;
        user(&local, "alice", UserKind::Citizen).await;
        local
            .table_create("alice", SchemaId::Follow.id(), json!({"subject": subject(&carol), "created_at_ms": 1}))
            .await
            .unwrap();
        local.load_or_unload_external_databases().await.unwrap();
        assert!(local.home_feed("alice", 10, None).await.unwrap().is_empty());

        remote
            .table_create("carol", SchemaId::Post.id(), json!({"text": "later", "created_at_ms": 2}))
            .await
            .unwrap();
        let synced = local.sync_next_external().await.unwrap();
        assert_eq!(synced.as_deref(), Some(carol.discovery_key()));
        assert_eq!(local.home_feed("alice", 10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_loads_become_recoverable_issues() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let ghost = SubjectRef {
            user_id: "ghost@nowhere".into(),
            db_key: "zz".into(),
        };
        dir.issues.add(
            IssueKind::ExternalLoad {
                subject: ghost,
                discovery_key: "x".into(),
            },
            "load".into(),
            "test".into(),
            "boom".into(),
            true,
        );
        let issue = dir.list_issues().pop().unwrap();
        // Still broken: recovering files it again.
        assert!(dir.recover_issue(issue.id).await.is_err());
        let again = dir.list_issues();
        assert_eq!(again.len(), 1);
        assert!(dir.dismiss_issue(again[0].id));
        assert!(dir.list_issues().is_empty());
        assert!(dir.recover_issue(12345).await.is_err());
    }

    #[tokio::test]
    async fn sweep_keeps_server_databases_and_reloads_local_users_on_demand() {
        let tmp = TempDir::new().unwrap();
        let provider = SqliteStoreProvider::new(tmp.path().join("stores"), vec![]).unwrap();
        let cfg = HubConfig {
            local_idle_secs: Some(0),
            ..test_config()
        };
        let dir = Directory::open(cfg, tmp.path(), Arc::new(provider)).await.unwrap();
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let swept = dir.sweep_inactive(now_ms() + 1);
        assert!(swept.contains(&alice.discovery_key().to_string()));
        assert!(dir.get_database_by_discovery_key(dir.server_public().discovery_key()).is_some());
        assert!(dir.get_database_by_discovery_key(alice.discovery_key()).is_none());
        let again = dir.get_database("alice").await.unwrap();
        assert_eq!(again.public_key(), alice.public_key());
    }

    #[tokio::test]
    async fn delete_user_destroys_databases() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        dir.delete_user("alice").await.unwrap();
        assert!(dir.get_database("alice").await.is_err());
        assert!(!tmp
            .path()
            .join("stores")
            .join(format!("{}.db", alice.discovery_key()))
            .exists());
        let err = dir.delete_user("alice").await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::NotFoundError));
        // The name is free again.
        user(&dir, "alice", UserKind::Citizen).await;
    }

    #[tokio::test]
    async fn rebuild_restores_indexes() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        user(&dir, "alice", UserKind::Citizen).await;
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        dir.table_create("alice", SchemaId::Follow.id(), json!({"subject": subject(&bob), "created_at_ms": 1}))
            .await
            .unwrap();
        let rebuilt = dir.rebuild_indexes("server", &[]).await.unwrap();
        assert_eq!(rebuilt.len(), 5);
        assert_eq!(dir.list_followers("bob").await.unwrap().len(), 1);
        assert_eq!(dir.count_notifications("bob", None).await.unwrap(), 1);

        let err = dir.rebuild_indexes("alice", &[]).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::ValidationError));
    }

    fn idle_config() -> HubConfig {
        HubConfig {
            local_idle_secs: Some(0),
            ..test_config()
        }
    }

    #[tokio::test]
    async fn rebuild_replays_evicted_local_users() {
        let tmp = TempDir::new().unwrap();
        let provider = SqliteStoreProvider::new(tmp.path().join("stores"), vec![]).unwrap();
        let dir = Directory::open(idle_config(), tmp.path(), Arc::new(provider)).await.unwrap();
        user(&dir, "alice", UserKind::Citizen).await;
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        dir.table_create("alice", SchemaId::Follow.id(), json!({"subject": subject(&bob), "created_at_ms": 1}))
            .await
            .unwrap();
        let swept = dir.sweep_inactive(now_ms() + 1);
        assert!(swept.contains(&bob.discovery_key().to_string()));

        dir.rebuild_indexes("server", &[]).await.unwrap();
        assert_eq!(dir.list_followers(bob.public_key()).await.unwrap().len(), 1);
        assert_eq!(dir.count_notifications("bob", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reloading_a_local_user_catches_up_its_indexes() {
        let tmp = TempDir::new().unwrap();
        let provider = SqliteStoreProvider::new(tmp.path().join("stores"), vec![]).unwrap();
        let dir = Directory::open(idle_config(), tmp.path(), Arc::new(provider)).await.unwrap();
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        dir.sweep_inactive(now_ms() + 1);

        // Written while alice was out of memory.
        let side = SqliteStoreProvider::new(tmp.path().join("stores"), vec![]).unwrap();
        let offline = Database::new(
            DbKind::PublicUser,
            Some(UserKind::Citizen),
            alice.identity(),
            side.open(alice.public_key()).await.unwrap(),
            LockManager::new(),
            None,
        );
        offline
            .table(SchemaId::Follow)
            .unwrap()
            .create(&json!({"subject": subject(&bob), "created_at_ms": 2}))
            .await
            .unwrap();
        assert!(dir.list_followers(bob.public_key()).await.unwrap().is_empty());

        dir.get_database("alice").await.unwrap();
        assert_eq!(dir.list_followers(bob.public_key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalidation_waits_for_an_inflight_feed() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        dir.table_create("alice", SchemaId::Follow.id(), json!({"subject": subject(&bob), "created_at_ms": 1}))
            .await
            .unwrap();
        dir.table_create("bob", SchemaId::Post.id(), json!({"text": "one", "created_at_ms": 2}))
            .await
            .unwrap();
        let stale = dir.home_feed("alice", 10, None).await.unwrap();
        assert_eq!(stale.len(), 1);

        // Stand in for a feed computation that read bob's log before his
        // next post and has not cached its result yet.
        let inflight = dir.locks().lock(Directory::feed_lock_name(alice.identity())).await;
        let writer = {
            let dir = dir.clone();
            tokio::spawn(async move {
                dir.table_create("bob", SchemaId::Post.id(), json!({"text": "two", "created_at_ms": 3}))
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        dir.feed_cache.set(alice.identity(), stale, 10, Duration::from_secs(60));
        drop(inflight);
        writer.await.unwrap();

        let feed = dir.home_feed("alice", 10, None).await.unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].value["text"], "two");
    }

    #[tokio::test]
    async fn community_posts_refresh_member_feeds() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let guild = user(&dir, "guild", UserKind::Community).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        dir.table_create(
            "alice",
            SchemaId::CommunityMembership.id(),
            json!({"community": subject(&guild), "joined_at_ms": 1}),
        )
        .await
        .unwrap();
        dir.add_member(
            "guild",
            &SubjectRef {
                user_id: alice.identity().to_string(),
                db_key: alice.public_key().to_string(),
            },
            vec![],
        )
        .await
        .unwrap();
        assert!(dir.home_feed("alice", 10, None).await.unwrap().is_empty());

        dir.table_create("guild", SchemaId::Post.id(), json!({"text": "meeting at noon", "created_at_ms": 2}))
            .await
            .unwrap();
        let feed = dir.home_feed("alice", 10, None).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].author, guild.identity());
    }

    #[tokio::test]
    async fn community_feed_pages_newest_first() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let guild = user(&dir, "guild", UserKind::Community).await;
        user(&dir, "alice", UserKind::Citizen).await;
        user(&dir, "bob", UserKind::Citizen).await;
        for (author, text, t) in [("alice", "a1", 1), ("bob", "b1", 2), ("alice", "a2", 3)] {
            dir.table_create(
                author,
                SchemaId::Post.id(),
                json!({"text": text, "community": subject(&guild), "created_at_ms": t}),
            )
            .await
            .unwrap();
        }
        dir.table_create("alice", SchemaId::Post.id(), json!({"text": "elsewhere", "created_at_ms": 4}))
            .await
            .unwrap();

        let first = dir.list_community_feed("guild", 2, None).await.unwrap();
        let times = first
            .iter()
            .map(|e| e.value["created_at_ms"].as_i64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(times, vec![3, 2]);
        let rest = dir
            .list_community_feed(guild.public_key(), 2, Some(first[1].key.clone()))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].value["created_at_ms"], 1);

        let err = dir.list_community_feed("alice", 10, None).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::ValidationError));
    }
}
