/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod community;
pub mod database;
pub mod directory;
pub mod error;
pub mod external_sync;
pub mod feed;
pub mod feed_cache;
pub mod indexer;
pub mod issues;
pub mod keys;
pub mod locks;
pub mod maintainers;
pub mod memory_gc;
pub mod replication_log;
pub mod runtime;
pub mod schemas;
pub mod store;
pub mod table;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
