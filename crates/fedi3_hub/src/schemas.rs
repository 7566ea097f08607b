/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use fedi3_protocol::{
    AccountRecord, CommentRecord, CommunityMemberRecord, CommunityMembershipRecord,
    FeedIdxRecord, FollowIdxRecord, FollowRecord, IndexStateRecord, ItemClassRecord, ItemRecord,
    MuteRecord, NotificationIdxRecord, PostRecord, ProfileRecord, ReactionIdxRecord,
    ReactionRecord, ThreadIdxRecord, UserRecord,
};
use serde_json::Value;

use crate::error::ApiError;

/// Every table the hub knows about. Unknown schema strings never get past
/// [`SchemaId::from_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchemaId {
    Profile,
    Post,
    Comment,
    Follow,
    Reaction,
    CommunityMembership,
    CommunityMember,
    ItemClass,
    Item,
    User,
    Account,
    Mute,
    NotificationIdx,
    ThreadIdx,
    FollowIdx,
    ReactionIdx,
    FeedIdx,
    IndexState,
}

#[derive(Debug, Clone, Copy)]
pub enum KeyGen {
    /// Monotonic lexicographic timestamp.
    Auto,
    Fixed(&'static str),
    /// Dotted paths into the record, joined with ':'.
    Fields(&'static [&'static str]),
    /// Supplied by the engine (index rows).
    Explicit,
}

impl SchemaId {
    pub const ALL: [SchemaId; 18] = [
        SchemaId::Profile,
        SchemaId::Post,
        SchemaId::Comment,
        SchemaId::Follow,
        SchemaId::Reaction,
        SchemaId::CommunityMembership,
        SchemaId::CommunityMember,
        SchemaId::ItemClass,
        SchemaId::Item,
        SchemaId::User,
        SchemaId::Account,
        SchemaId::Mute,
        SchemaId::NotificationIdx,
        SchemaId::ThreadIdx,
        SchemaId::FollowIdx,
        SchemaId::ReactionIdx,
        SchemaId::FeedIdx,
        SchemaId::IndexState,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Profile => "fedi3.hub/profile",
            Self::Post => "fedi3.hub/post",
            Self::Comment => "fedi3.hub/comment",
            Self::Follow => "fedi3.hub/follow",
            Self::Reaction => "fedi3.hub/reaction",
            Self::CommunityMembership => "fedi3.hub/community-membership",
            Self::CommunityMember => "fedi3.hub/community-member",
            Self::ItemClass => "fedi3.hub/item-class",
            Self::Item => "fedi3.hub/item",
            Self::User => "fedi3.hub/user",
            Self::Account => "fedi3.hub/account",
            Self::Mute => "fedi3.hub/mute",
            Self::NotificationIdx => "fedi3.hub/notification-idx",
            Self::ThreadIdx => "fedi3.hub/thread-idx",
            Self::FollowIdx => "fedi3.hub/follow-idx",
            Self::ReactionIdx => "fedi3.hub/reaction-idx",
            Self::FeedIdx => "fedi3.hub/feed-idx",
            Self::IndexState => "fedi3.hub/index-state",
        }
    }

    pub fn from_id(id: &str) -> Result<Self> {
        let id = id.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.id() == id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown table: {id}")).into())
    }

    pub fn key_gen(&self) -> KeyGen {
        match self {
            Self::Profile => KeyGen::Fixed("self"),
            Self::Post | Self::Comment | Self::Item => KeyGen::Auto,
            Self::Follow | Self::Mute => KeyGen::Fields(&["subject.db_key"]),
            Self::Reaction => KeyGen::Fields(&["reaction", "subject.db_url"]),
            Self::CommunityMembership => KeyGen::Fields(&["community.db_key"]),
            Self::CommunityMember => KeyGen::Fields(&["user.db_key"]),
            Self::ItemClass => KeyGen::Fields(&["id"]),
            Self::User | Self::Account => KeyGen::Fields(&["username"]),
            Self::NotificationIdx
            | Self::ThreadIdx
            | Self::FollowIdx
            | Self::ReactionIdx
            | Self::FeedIdx
            | Self::IndexState => KeyGen::Explicit,
        }
    }

    /// Derived tables: written only by indexers.
    pub fn is_index(&self) -> bool {
        matches!(
            self,
            Self::NotificationIdx
                | Self::ThreadIdx
                | Self::FollowIdx
                | Self::ReactionIdx
                | Self::FeedIdx
                | Self::IndexState
        )
    }

    /// Tables that live in a private database.
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Account | Self::Mute)
    }

    /// Writes to these tables change what someone's home feed looks like.
    pub fn affects_feed(&self) -> bool {
        matches!(
            self,
            Self::Post | Self::Follow | Self::Profile | Self::CommunityMembership | Self::Mute
        )
    }
}

impl std::fmt::Display for SchemaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Typed view of a table row.
#[derive(Debug, Clone)]
pub enum Record {
    Profile(ProfileRecord),
    Post(PostRecord),
    Comment(CommentRecord),
    Follow(FollowRecord),
    Reaction(ReactionRecord),
    CommunityMembership(CommunityMembershipRecord),
    CommunityMember(CommunityMemberRecord),
    ItemClass(ItemClassRecord),
    Item(ItemRecord),
    User(UserRecord),
    Account(AccountRecord),
    Mute(MuteRecord),
    NotificationIdx(NotificationIdxRecord),
    ThreadIdx(ThreadIdxRecord),
    FollowIdx(FollowIdxRecord),
    ReactionIdx(ReactionIdxRecord),
    FeedIdx(FeedIdxRecord),
    IndexState(IndexStateRecord),
}

impl Record {
    pub fn parse(schema: SchemaId, value: &Value) -> Result<Self> {
        let v = value.clone();
        let parsed = match schema {
            SchemaId::Profile => serde_json::from_value(v).map(Self::Profile),
            SchemaId::Post => serde_json::from_value(v).map(Self::Post),
            SchemaId::Comment => serde_json::from_value(v).map(Self::Comment),
            SchemaId::Follow => serde_json::from_value(v).map(Self::Follow),
            SchemaId::Reaction => serde_json::from_value(v).map(Self::Reaction),
            SchemaId::CommunityMembership => {
                serde_json::from_value(v).map(Self::CommunityMembership)
            }
            SchemaId::CommunityMember => serde_json::from_value(v).map(Self::CommunityMember),
            SchemaId::ItemClass => serde_json::from_value(v).map(Self::ItemClass),
            SchemaId::Item => serde_json::from_value(v).map(Self::Item),
            SchemaId::User => serde_json::from_value(v).map(Self::User),
            SchemaId::Account => serde_json::from_value(v).map(Self::Account),
            SchemaId::Mute => serde_json::from_value(v).map(Self::Mute),
            SchemaId::NotificationIdx => serde_json::from_value(v).map(Self::NotificationIdx),
            SchemaId::ThreadIdx => serde_json::from_value(v).map(Self::ThreadIdx),
            SchemaId::FollowIdx => serde_json::from_value(v).map(Self::FollowIdx),
            SchemaId::ReactionIdx => serde_json::from_value(v).map(Self::ReactionIdx),
            SchemaId::FeedIdx => serde_json::from_value(v).map(Self::FeedIdx),
            SchemaId::IndexState => serde_json::from_value(v).map(Self::IndexState),
        };
        parsed.map_err(|e| ApiError::Validation(format!("{schema}: {e}")).into())
    }

    pub fn parse_bytes(schema: SchemaId, bytes: &[u8]) -> Result<Self> {
        let v: Value = serde_json::from_slice(bytes)
            .map_err(|e| ApiError::Validation(format!("{schema}: {e}")))?;
        Self::parse(schema, &v)
    }

    pub fn schema(&self) -> SchemaId {
        match self {
            Self::Profile(_) => SchemaId::Profile,
            Self::Post(_) => SchemaId::Post,
            Self::Comment(_) => SchemaId::Comment,
            Self::Follow(_) => SchemaId::Follow,
            Self::Reaction(_) => SchemaId::Reaction,
            Self::CommunityMembership(_) => SchemaId::CommunityMembership,
            Self::CommunityMember(_) => SchemaId::CommunityMember,
            Self::ItemClass(_) => SchemaId::ItemClass,
            Self::Item(_) => SchemaId::Item,
            Self::User(_) => SchemaId::User,
            Self::Account(_) => SchemaId::Account,
            Self::Mute(_) => SchemaId::Mute,
            Self::NotificationIdx(_) => SchemaId::NotificationIdx,
            Self::ThreadIdx(_) => SchemaId::ThreadIdx,
            Self::FollowIdx(_) => SchemaId::FollowIdx,
            Self::ReactionIdx(_) => SchemaId::ReactionIdx,
            Self::FeedIdx(_) => SchemaId::FeedIdx,
            Self::IndexState(_) => SchemaId::IndexState,
        }
    }
}

/// Resolves a dotted path like `subject.db_key` to a non-empty string.
pub fn field_str(value: &Value, path: &str) -> Option<String> {
    let mut cur = value;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    match cur {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_roundtrip() {
        for s in SchemaId::ALL {
            assert_eq!(SchemaId::from_id(s.id()).unwrap(), s);
        }
        assert!(SchemaId::from_id("fedi3.hub/nope").is_err());
    }

    #[test]
    fn parse_rejects_wrong_shape() {
        let err = Record::parse(SchemaId::Follow, &json!({"subject": "bob"})).unwrap_err();
        assert_eq!(
            crate::error::error_code_of(&err),
            Some(fedi3_protocol::ErrorCode::ValidationError)
        );
    }

    #[test]
    fn parse_follow() {
        let rec = Record::parse(
            SchemaId::Follow,
            &json!({"subject": {"user_id": "bob@x", "db_key": "ab"}, "created_at_ms": 1}),
        )
        .unwrap();
        assert_eq!(rec.schema(), SchemaId::Follow);
    }

    #[test]
    fn field_paths() {
        let v = json!({"reaction": "like", "subject": {"db_url": "hub://k/p/1"}, "n": 3});
        assert_eq!(field_str(&v, "reaction").as_deref(), Some("like"));
        assert_eq!(field_str(&v, "subject.db_url").as_deref(), Some("hub://k/p/1"));
        assert_eq!(field_str(&v, "n").as_deref(), Some("3"));
        assert!(field_str(&v, "subject.missing").is_none());
    }
}
