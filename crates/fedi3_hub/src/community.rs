/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Community-owned items and member rosters. Every mutation is a
//! read-check-write under the row's table lock.

use anyhow::Result;
use fedi3_protocol::{CommunityMemberRecord, ItemClassRecord, ItemRecord, SubjectRef, UserKind};
use std::sync::Arc;
use tracing::{debug, info};

use crate::database::Database;
use crate::directory::Directory;
use crate::error::ApiError;
use crate::keys::{is_valid_key, mlts};
use crate::schemas::SchemaId;
use crate::store::RangeOpts;
use crate::table::{Batch, TableEntry};

/// Owner changes seen between peek and lock before a transfer gives up.
const TRANSFER_ATTEMPTS: usize = 8;

/// Lock key for the (owner, class) pair that fungible items accumulate on.
fn holding_key(owner: &SubjectRef, class_id: &str) -> String {
    format!("{}:{class_id}", owner.db_key.to_ascii_lowercase())
}

fn check_subject(s: &SubjectRef) -> Result<()> {
    if !is_valid_key(&s.db_key) {
        return Err(ApiError::Validation(format!("invalid database key: {}", s.db_key)).into());
    }
    Ok(())
}

/// Finds the row holding `class_id` for `owner` inside a batch.
async fn find_holding(batch: &Batch, owner: &SubjectRef, class_id: &str) -> Result<Option<(String, ItemRecord)>> {
    for (key, value) in batch.list(SchemaId::Item, RangeOpts::default()).await? {
        let item: ItemRecord = serde_json::from_value(value)?;
        if item.class_id == class_id && item.owner.db_key.eq_ignore_ascii_case(&owner.db_key) {
            return Ok(Some((key, item)));
        }
    }
    Ok(None)
}

impl Directory {
    async fn community_db(&self, community: &str) -> Result<Arc<Database>> {
        let db = self.get_database(community).await?;
        if db.user_kind() != Some(UserKind::Community) {
            return Err(ApiError::Validation(format!("{} is not a community", db.identity())).into());
        }
        if !db.writable() {
            return Err(ApiError::Permissions(format!("{} is not hosted here", db.identity())).into());
        }
        Ok(db)
    }

    async fn item_class(&self, db: &Database, class_id: &str) -> Result<ItemClassRecord> {
        db.table(SchemaId::ItemClass)?
            .get_as(class_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("item class {class_id}")).into())
    }

    /// Locks the holdings of the item's current owner and of `to`, then
    /// re-reads the item. The owner is only known after reading, so a
    /// transfer that landed in between means locking again.
    async fn lock_item_holdings(
        &self,
        db: &Database,
        item_key: &str,
        to: &SubjectRef,
    ) -> Result<(Batch, ItemRecord, ItemClassRecord)> {
        for _ in 0..TRANSFER_ATTEMPTS {
            let peek: ItemRecord = db
                .table(SchemaId::Item)?
                .get_as(item_key)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("item {item_key}")))?;
            let class = self.item_class(db, &peek.class_id).await?;

            let mut batch = db.batch();
            let mut names = vec![holding_key(&peek.owner, &peek.class_id), holding_key(to, &peek.class_id)];
            names.sort();
            names.dedup();
            for n in &names {
                batch.lock(SchemaId::Item, n).await;
            }

            let item: ItemRecord = batch
                .get_as(SchemaId::Item, item_key)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("item {item_key}")))?;
            if item.owner.db_key.eq_ignore_ascii_case(&peek.owner.db_key) {
                return Ok((batch, item, class));
            }
            debug!(item = item_key, "owner changed before lock, retrying");
        }
        Err(ApiError::Validation(format!("item {item_key} keeps changing hands")).into())
    }

    pub async fn create_item_class(
        &self,
        community: &str,
        id: &str,
        display_name: &str,
        fungible: bool,
    ) -> Result<TableEntry> {
        let db = self.community_db(community).await?;
        let id = id.trim();
        if id.is_empty() {
            return Err(ApiError::Validation("item class id is empty".to_string()).into());
        }
        let classes = db.table(SchemaId::ItemClass)?;
        let entry = {
            let _guard = classes.lock(id).await;
            if classes.get(id).await?.is_some() {
                return Err(ApiError::Validation(format!("item class {id} already exists")).into());
            }
            classes
                .put_as(
                    id,
                    &ItemClassRecord {
                        id: id.to_string(),
                        display_name: display_name.to_string(),
                        fungible,
                        created_at_ms: now_ms(),
                    },
                )
                .await?
        };
        self.after_write(&db, SchemaId::ItemClass).await?;
        Ok(entry)
    }

    /// Mints `qty` of a class for `owner`. Fungible classes add to the row
    /// the owner already holds; others always get a fresh row.
    pub async fn create_item(&self, community: &str, class_id: &str, owner: &SubjectRef, qty: u64) -> Result<String> {
        check_subject(owner)?;
        if qty == 0 {
            return Err(ApiError::Validation("qty must be positive".to_string()).into());
        }
        let db = self.community_db(community).await?;
        let class = self.item_class(&db, class_id).await?;

        let mut batch = db.batch();
        batch.lock(SchemaId::Item, &holding_key(owner, class_id)).await;
        let existing = if class.fungible {
            find_holding(&batch, owner, class_id).await?
        } else {
            None
        };
        let key = match existing {
            Some((key, mut item)) => {
                item.qty = item
                    .qty
                    .checked_add(qty)
                    .ok_or_else(|| ApiError::Validation("qty overflow".to_string()))?;
                batch.put_as(SchemaId::Item, &key, &item)?;
                key
            }
            None => {
                let key = mlts();
                batch.put_as(
                    SchemaId::Item,
                    &key,
                    &ItemRecord {
                        class_id: class_id.to_string(),
                        owner: owner.clone(),
                        qty,
                        created_at_ms: now_ms(),
                    },
                )?;
                key
            }
        };
        batch.commit().await?;
        self.after_write(&db, SchemaId::Item).await?;
        Ok(key)
    }

    /// Moves `qty` from the item row `item_key` to `to`. Returns the key of
    /// the receiving row.
    pub async fn transfer_item(&self, community: &str, item_key: &str, to: &SubjectRef, qty: u64) -> Result<String> {
        check_subject(to)?;
        if qty == 0 {
            return Err(ApiError::Validation("qty must be positive".to_string()).into());
        }
        let db = self.community_db(community).await?;
        let (mut batch, mut from, class) = self.lock_item_holdings(&db, item_key, to).await?;
        if from.qty < qty {
            return Err(ApiError::Validation(format!(
                "item {item_key} holds {} and cannot give {qty}",
                from.qty
            ))
            .into());
        }
        if from.owner.db_key.eq_ignore_ascii_case(&to.db_key) {
            return Ok(item_key.to_string());
        }

        let dest_key = if !class.fungible {
            if qty != from.qty {
                return Err(ApiError::Validation(format!("item {item_key} is not divisible")).into());
            }
            from.owner = to.clone();
            batch.put_as(SchemaId::Item, item_key, &from)?;
            item_key.to_string()
        } else {
            from.qty -= qty;
            if from.qty == 0 {
                batch.del(SchemaId::Item, item_key);
            } else {
                batch.put_as(SchemaId::Item, item_key, &from)?;
            }
            match find_holding(&batch, to, &from.class_id).await? {
                Some((key, mut held)) => {
                    held.qty = held
                        .qty
                        .checked_add(qty)
                        .ok_or_else(|| ApiError::Validation("qty overflow".to_string()))?;
                    batch.put_as(SchemaId::Item, &key, &held)?;
                    key
                }
                None => {
                    let key = mlts();
                    batch.put_as(
                        SchemaId::Item,
                        &key,
                        &ItemRecord {
                            class_id: from.class_id.clone(),
                            owner: to.clone(),
                            qty,
                            created_at_ms: now_ms(),
                        },
                    )?;
                    key
                }
            }
        };
        batch.commit().await?;
        self.after_write(&db, SchemaId::Item).await?;
        info!(community = %db.identity(), item = item_key, to = %to.user_id, qty, "item transferred");
        Ok(dest_key)
    }

    pub async fn add_member(&self, community: &str, user: &SubjectRef, roles: Vec<String>) -> Result<TableEntry> {
        check_subject(user)?;
        let db = self.community_db(community).await?;
        let members = db.table(SchemaId::CommunityMember)?;
        let key = user.db_key.to_ascii_lowercase();
        let entry = {
            let _guard = members.lock(&key).await;
            let current: Option<CommunityMemberRecord> = members.get_as(&key).await?;
            let record = match current {
                Some(m) if m.banned => {
                    return Err(ApiError::Permissions(format!("{} is banned", user.user_id)).into());
                }
                Some(m) => CommunityMemberRecord { roles, ..m },
                None => CommunityMemberRecord {
                    user: SubjectRef {
                        user_id: user.user_id.clone(),
                        db_key: key.clone(),
                    },
                    joined_at_ms: now_ms(),
                    roles,
                    banned: false,
                },
            };
            members.put_as(&key, &record).await?
        };
        self.after_write(&db, SchemaId::CommunityMember).await?;
        Ok(entry)
    }

    pub async fn remove_member(&self, community: &str, user_db_key: &str) -> Result<bool> {
        let db = self.community_db(community).await?;
        let members = db.table(SchemaId::CommunityMember)?;
        let key = user_db_key.trim().to_ascii_lowercase();
        let removed = {
            let _guard = members.lock(&key).await;
            members.del(&key).await?
        };
        if removed {
            self.after_write(&db, SchemaId::CommunityMember).await?;
        }
        Ok(removed)
    }

    pub async fn set_member_ban(&self, community: &str, user_db_key: &str, banned: bool) -> Result<TableEntry> {
        let db = self.community_db(community).await?;
        let members = db.table(SchemaId::CommunityMember)?;
        let key = user_db_key.trim().to_ascii_lowercase();
        let entry = {
            let _guard = members.lock(&key).await;
            let mut m: CommunityMemberRecord = members
                .get_as(&key)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("member {key}")))?;
            m.banned = banned;
            members.put_as(&key, &m).await?
        };
        self.after_write(&db, SchemaId::CommunityMember).await?;
        Ok(entry)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::{open_dir, user};
    use crate::error::error_code_of;
    use fedi3_protocol::ErrorCode;
    use futures_util::future::join_all;
    use tempfile::TempDir;

    fn subject(db: &Database) -> SubjectRef {
        SubjectRef {
            user_id: db.identity().to_string(),
            db_key: db.public_key().to_string(),
        }
    }

    async fn holdings(db: &Database) -> Vec<ItemRecord> {
        db.table(SchemaId::Item)
            .unwrap()
            .list(RangeOpts::default())
            .await
            .unwrap()
            .iter()
            .map(|e| e.record().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn concurrent_mints_accumulate() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let guild = user(&dir, "guild", UserKind::Community).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let alice = subject(&alice);
        dir.create_item_class("guild", "gold", "Gold", true).await.unwrap();

        let results = join_all((0..8).map(|_| dir.create_item("guild", "gold", &alice, 3))).await;
        let keys = results.into_iter().collect::<Result<Vec<_>>>().unwrap();
        assert!(keys.iter().all(|k| k == &keys[0]));

        let items = holdings(&guild).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].qty, 24);
    }

    #[tokio::test]
    async fn non_fungible_items_get_their_own_rows() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let guild = user(&dir, "guild", UserKind::Community).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let alice = subject(&alice);
        dir.create_item_class("guild", "sword", "Sword", false).await.unwrap();
        dir.create_item("guild", "sword", &alice, 1).await.unwrap();
        dir.create_item("guild", "sword", &alice, 1).await.unwrap();
        assert_eq!(holdings(&guild).await.len(), 2);

        let err = dir.create_item("guild", "shield", &alice, 1).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::NotFoundError));
        let err = dir.create_item_class("guild", "sword", "Again", false).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::ValidationError));
        let err = dir.create_item_class("alice", "x", "X", true).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::ValidationError));
    }

    #[tokio::test]
    async fn transfers_move_quantity_and_check_balance() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let guild = user(&dir, "guild", UserKind::Community).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let alice = subject(&alice);
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        let bob = subject(&bob);
        dir.create_item_class("guild", "gold", "Gold", true).await.unwrap();
        let from = dir.create_item("guild", "gold", &alice, 10).await.unwrap();

        let err = dir.transfer_item("guild", &from, &bob, 11).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::ValidationError));

        let to = dir.transfer_item("guild", &from, &bob, 4).await.unwrap();
        let again = dir.transfer_item("guild", &from, &bob, 6).await.unwrap();
        assert_eq!(to, again);

        let items = holdings(&guild).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].owner.db_key, bob.db_key);
        assert_eq!(items[0].qty, 10);

        let err = dir.transfer_item("guild", &from, &alice, 1).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::NotFoundError));
    }

    #[tokio::test]
    async fn member_roster_and_bans() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let guild = user(&dir, "guild", UserKind::Community).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let alice = subject(&alice);

        let err = dir.set_member_ban("guild", &alice.db_key, true).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::NotFoundError));

        dir.add_member("guild", &alice, vec!["member".into()]).await.unwrap();
        let updated = dir
            .add_member("guild", &alice, vec!["member".into(), "mod".into()])
            .await
            .unwrap();
        let rec: CommunityMemberRecord = updated.record().unwrap();
        assert_eq!(rec.roles, vec!["member", "mod"]);

        dir.set_member_ban("guild", &alice.db_key, true).await.unwrap();
        let err = dir.add_member("guild", &alice, vec![]).await.unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::PermissionsError));

        assert!(dir.remove_member("guild", &alice.db_key).await.unwrap());
        assert!(!dir.remove_member("guild", &alice.db_key).await.unwrap());
        assert!(guild
            .table(SchemaId::CommunityMember)
            .unwrap()
            .list(RangeOpts::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn racing_transfers_of_one_sword_leave_a_single_owner() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let guild = user(&dir, "guild", UserKind::Community).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let alice = subject(&alice);
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        let bob = subject(&bob);
        let carol = user(&dir, "carol", UserKind::Citizen).await;
        let carol = subject(&carol);
        dir.create_item_class("guild", "sword", "Sword", false).await.unwrap();
        let sword = dir.create_item("guild", "sword", &alice, 1).await.unwrap();

        for _ in 0..5 {
            let (a, b) = tokio::join!(
                dir.transfer_item("guild", &sword, &bob, 1),
                dir.transfer_item("guild", &sword, &carol, 1),
            );
            assert_eq!(a.unwrap(), sword);
            assert_eq!(b.unwrap(), sword);
        }

        let items = holdings(&guild).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].qty, 1);
        assert!(items[0].owner.db_key == bob.db_key || items[0].owner.db_key == carol.db_key);
    }

    #[tokio::test]
    async fn racing_fungible_transfers_never_overdraw() {
        let tmp = TempDir::new().unwrap();
        let dir = open_dir(tmp.path(), vec![]).await;
        let guild = user(&dir, "guild", UserKind::Community).await;
        let alice = user(&dir, "alice", UserKind::Citizen).await;
        let alice = subject(&alice);
        let bob = user(&dir, "bob", UserKind::Citizen).await;
        let bob = subject(&bob);
        let carol = user(&dir, "carol", UserKind::Citizen).await;
        let carol = subject(&carol);
        dir.create_item_class("guild", "gold", "Gold", true).await.unwrap();
        let purse = dir.create_item("guild", "gold", &alice, 10).await.unwrap();

        let (a, b) = tokio::join!(
            dir.transfer_item("guild", &purse, &bob, 6),
            dir.transfer_item("guild", &purse, &carol, 6),
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

        let items = holdings(&guild).await;
        assert_eq!(items.iter().map(|i| i.qty).sum::<u64>(), 10);
        let left = items.iter().find(|i| i.owner.db_key == alice.db_key).unwrap();
        assert_eq!(left.qty, 4);
    }
}
