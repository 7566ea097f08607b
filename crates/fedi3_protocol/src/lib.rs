/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to another participant's database.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubjectRef {
    pub user_id: String,
    /// Public key of the participant's public database (64 hex chars).
    pub db_key: String,
}

/// Reference to one entry in someone else's database.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EntryRef {
    pub db_url: String,
    #[serde(default)]
    pub author_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    Citizen,
    Community,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProfileRecord {
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PostRecord {
    pub text: String,
    #[serde(default)]
    pub community: Option<SubjectRef>,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplyRef {
    pub root: EntryRef,
    #[serde(default)]
    pub parent: Option<EntryRef>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommentRecord {
    pub text: String,
    pub reply: ReplyRef,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FollowRecord {
    pub subject: SubjectRef,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReactionRecord {
    pub subject: EntryRef,
    pub reaction: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommunityMembershipRecord {
    pub community: SubjectRef,
    pub joined_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommunityMemberRecord {
    pub user: SubjectRef,
    pub joined_at_ms: i64,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub banned: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ItemClassRecord {
    pub id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub fungible: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ItemRecord {
    pub class_id: String,
    pub owner: SubjectRef,
    pub qty: u64,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserRecord {
    pub username: String,
    pub kind: UserKind,
    pub db_key: String,
    pub db_url: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccountRecord {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub private_db_key: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MuteRecord {
    pub subject: SubjectRef,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NotificationIdxRecord {
    pub item_url: String,
    pub author_db_key: String,
    pub created_at_ms: i64,
}

/// One post filed under a community it names.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FeedIdxRecord {
    pub item_url: String,
    pub author_db_key: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ThreadItem {
    pub url: String,
    pub author_db_key: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ThreadIdxRecord {
    pub subject_url: String,
    pub items: Vec<ThreadItem>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FollowIdxRecord {
    pub subject_db_key: String,
    pub followers: Vec<SubjectRef>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReactionIdxRecord {
    pub subject_url: String,
    /// reaction string -> urls of the reaction entries
    pub reactions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IndexStateRecord {
    pub index_id: String,
    pub indexing_db: String,
    pub source_db: String,
    pub source_schemas: Vec<String>,
    pub last_processed_seq: u64,
    pub updated_at_ms: i64,
}

/// Stable error codes shared with the RPC layer.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    SessionError,
    ValidationError,
    NotFoundError,
    PermissionsError,
    ConfigurationError,
    RateLimitError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionError => "session-error",
            Self::ValidationError => "validation-error",
            Self::NotFoundError => "not-found",
            Self::PermissionsError => "permissions-error",
            Self::ConfigurationError => "configuration-error",
            Self::RateLimitError => "rate-limit-exceeded",
        }
    }

    /// Numeric code used by the JSON-RPC mapping.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::SessionError => -32001,
            Self::ValidationError => -32002,
            Self::NotFoundError => -32003,
            Self::PermissionsError => -32004,
            Self::ConfigurationError => -32005,
            Self::RateLimitError => -32006,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcErrorBody {
    pub code: i32,
    pub error: String,
    pub message: String,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct() {
        let all = [
            ErrorCode::SessionError,
            ErrorCode::ValidationError,
            ErrorCode::NotFoundError,
            ErrorCode::PermissionsError,
            ErrorCode::ConfigurationError,
            ErrorCode::RateLimitError,
        ];
        let mut names = all.iter().map(|c| c.as_str()).collect::<Vec<_>>();
        let mut codes = all.iter().map(|c| c.rpc_code()).collect::<Vec<_>>();
        names.sort();
        names.dedup();
        codes.sort();
        codes.dedup();
        assert_eq!(names.len(), all.len());
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn item_class_defaults_to_fungible() {
        let v: ItemClassRecord = serde_json::from_str(
            r#"{"id":"gold","display_name":"Gold","created_at_ms":1}"#,
        )
        .unwrap();
        assert!(v.fungible);
    }
}
