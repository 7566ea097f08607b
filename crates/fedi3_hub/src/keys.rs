/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::Digest as _;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::error::ApiError;

const SERVER_KEYS_FILE: &str = "server_keys.json";

#[derive(Clone)]
pub struct DbKeyPair {
    pub public_key: String,
    pub secret_key: String,
}

/// Public keys of the server's own databases, persisted next to the stores.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerKeys {
    pub public_server_db: String,
    pub private_server_db: String,
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("FEDI3_HUB_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "fedi3", "Fedi3Hub")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn generate_keypair() -> DbKeyPair {
    let signing = SigningKey::generate(&mut OsRng);
    DbKeyPair {
        public_key: hex::encode(signing.verifying_key().to_bytes()),
        secret_key: hex::encode(signing.to_bytes()),
    }
}

pub fn is_valid_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Discovery keys let peers find a log without learning its public key.
pub fn discovery_key(public_key: &str) -> Result<String> {
    if !is_valid_key(public_key) {
        return Err(ApiError::Validation(format!("invalid database key: {public_key}")).into());
    }
    let bytes = hex::decode(public_key.to_ascii_lowercase()).context("decode public key")?;
    let mut h = sha2::Sha256::new();
    h.update(b"fedi3-hub-discovery");
    h.update(&bytes);
    Ok(hex::encode(h.finalize()))
}

/// Reads `server_keys.json`. A missing file is not an error: the caller
/// bootstraps fresh databases and persists their keys.
pub fn load_server_keys(dir: impl AsRef<Path>) -> Result<Option<ServerKeys>> {
    let path = dir.as_ref().join(SERVER_KEYS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let keys: ServerKeys = serde_json::from_str(&raw)
        .map_err(|e| ApiError::Configuration(format!("{}: {e}", path.display())))?;
    for k in [&keys.public_server_db, &keys.private_server_db] {
        if !is_valid_key(k) {
            return Err(ApiError::Configuration(format!(
                "{}: expected 64 hex chars, got {k:?}",
                path.display()
            ))
            .into());
        }
    }
    Ok(Some(keys))
}

pub fn save_server_keys(dir: impl AsRef<Path>, keys: &ServerKeys) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create data dir: {}", dir.display()))?;
    let path = dir.join(SERVER_KEYS_FILE);
    let json = serde_json::to_vec_pretty(keys)?;
    fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Monotonic lexicographic timestamps: 12 hex digits of milliseconds plus a
/// 4 hex digit counter for entries minted within the same millisecond.
pub struct Mlts {
    state: Mutex<(u64, u32)>,
}

impl Mlts {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next(&self) -> String {
        self.next_at(now_ms_u64())
    }

    pub fn next_at(&self, ms: u64) -> String {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if ms > st.0 {
            *st = (ms, 0);
        } else if st.1 >= 0xffff {
            // Counter exhausted: borrow the next millisecond.
            *st = (st.0 + 1, 0);
        } else {
            st.1 += 1;
        }
        format!("{:012x}{:04x}", st.0, st.1)
    }
}

impl Default for Mlts {
    fn default() -> Self {
        Self::new()
    }
}

static MLTS: Mlts = Mlts::new();

pub fn mlts() -> String {
    MLTS.next()
}

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generated_keys_are_valid_and_distinct() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert!(is_valid_key(&a.public_key));
        assert!(is_valid_key(&a.secret_key));
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn discovery_key_is_stable_and_hides_public_key() {
        let kp = generate_keypair();
        let d1 = discovery_key(&kp.public_key).unwrap();
        let d2 = discovery_key(&kp.public_key.to_uppercase()).unwrap();
        assert_eq!(d1, d2);
        assert_ne!(d1, kp.public_key);
        assert!(is_valid_key(&d1));
        assert!(discovery_key("nothex").is_err());
    }

    #[test]
    fn mlts_is_strictly_increasing_within_one_millisecond() {
        let gen = Mlts::new();
        let mut prev = gen.next_at(1_700_000_000_000);
        for _ in 0..1000 {
            let next = gen.next_at(1_700_000_000_000);
            assert!(next > prev, "{next} <= {prev}");
            prev = next;
        }
        // Clock going backwards must not break ordering.
        let back = gen.next_at(1_600_000_000_000);
        assert!(back > prev);
        let later = gen.next_at(1_800_000_000_000);
        assert!(later > back);
    }

    #[test]
    fn mlts_counter_overflow_rolls_into_next_ms() {
        let gen = Mlts::new();
        let mut prev = gen.next_at(5);
        for _ in 0..0x1_0005 {
            let next = gen.next_at(5);
            assert!(next > prev);
            prev = next;
        }
        assert!(prev.starts_with("000000000006"));
    }

    #[test]
    fn server_keys_absent_then_roundtrip() {
        let dir = TempDir::new().unwrap();
        assert!(load_server_keys(dir.path()).unwrap().is_none());
        let keys = ServerKeys {
            public_server_db: generate_keypair().public_key,
            private_server_db: generate_keypair().public_key,
        };
        save_server_keys(dir.path(), &keys).unwrap();
        assert_eq!(load_server_keys(dir.path()).unwrap(), Some(keys));
    }

    #[test]
    fn server_keys_reject_malformed_key() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(SERVER_KEYS_FILE),
            r#"{"public_server_db":"abc","private_server_db":"def"}"#,
        )
        .unwrap();
        let err = load_server_keys(dir.path()).unwrap_err();
        assert_eq!(
            crate::error::error_code_of(&err),
            Some(fedi3_protocol::ErrorCode::ConfigurationError)
        );
    }
}
