//! Per-key permission profiles (C3): two sets plus numeric caps, not a tiered
//! enum. Presets (Free/Pro/Enterprise) only seed the initial row; the
//! runtime check always reads the key's own allow/block sets.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use gw_types::FilesystemAccess;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Free,
    Pro,
    Enterprise,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionProfile {
    pub allowed_tools: HashSet<String>,
    pub blocked_tools: HashSet<String>,
    pub allowed_agents: HashSet<String>,
    pub allowed_skills: HashSet<String>,
    pub max_concurrent_tasks: u32,
    pub max_execution_seconds: u64,
    pub max_cost_per_task: f64,
    pub max_memory_mb: u32,
    pub filesystem_access: FilesystemAccess,
    pub network_access: bool,
}

impl PermissionProfile {
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Free => PermissionProfile {
                allowed_tools: ["Read"].into_iter().map(String::from).collect(),
                blocked_tools: ["Bash"].into_iter().map(String::from).collect(),
                allowed_agents: HashSet::new(),
                allowed_skills: HashSet::new(),
                max_concurrent_tasks: 1,
                max_execution_seconds: 60,
                max_cost_per_task: 0.05,
                max_memory_mb: 256,
                filesystem_access: FilesystemAccess::Readonly,
                network_access: false,
            },
            Preset::Pro => PermissionProfile {
                allowed_tools: ["Read", "Write", "Bash", "Grep", "Glob"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                blocked_tools: HashSet::new(),
                allowed_agents: ["general-purpose"].into_iter().map(String::from).collect(),
                allowed_skills: HashSet::new(),
                max_concurrent_tasks: 4,
                max_execution_seconds: 300,
                max_cost_per_task: 1.0,
                max_memory_mb: 1024,
                filesystem_access: FilesystemAccess::Readwrite,
                network_access: true,
            },
            Preset::Enterprise => PermissionProfile {
                allowed_tools: HashSet::new(), // empty allow-set + empty block-set == allow-all
                blocked_tools: HashSet::new(),
                allowed_agents: HashSet::new(),
                allowed_skills: HashSet::new(),
                max_concurrent_tasks: 16,
                max_execution_seconds: 1800,
                max_cost_per_task: 25.0,
                max_memory_mb: 8192,
                filesystem_access: FilesystemAccess::Readwrite,
                network_access: true,
            },
        }
    }

    /// `allowed ∧ ¬blocked`. An empty `allowed_tools` set means "no
    /// allowlist restriction" (Enterprise default); `blocked_tools` always wins.
    pub fn permits_tool(&self, tool: &str) -> bool {
        if self.blocked_tools.contains(tool) {
            return false;
        }
        self.allowed_tools.is_empty() || self.allowed_tools.contains(tool)
    }

    pub fn permits_agent(&self, agent: &str) -> bool {
        self.allowed_agents.is_empty() || self.allowed_agents.contains(agent)
    }

    pub fn permits_skill(&self, skill: &str) -> bool {
        self.allowed_skills.is_empty() || self.allowed_skills.contains(skill)
    }
}

#[derive(Debug, Error)]
pub enum PermissionStoreError {
    #[error("allowed_tools and blocked_tools overlap on: {0}")]
    OverlappingSets(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("background task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct PermissionStore {
    conn: Arc<Mutex<Connection>>,
}

impl PermissionStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, PermissionStoreError> {
        let path = db_path.as_ref().to_path_buf();
        let conn =
            tokio::task::spawn_blocking(move || -> Result<Connection, PermissionStoreError> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                let conn = Connection::open(path)?;
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS api_key_permissions (
                        key TEXT PRIMARY KEY,
                        profile_json TEXT NOT NULL
                    );",
                )?;
                Ok(conn)
            })
            .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Writes a profile for a key, enforcing the write-time invariant that
    /// `allowed_tools` and `blocked_tools` never overlap.
    pub async fn put(
        &self,
        key: &str,
        profile: PermissionProfile,
    ) -> Result<(), PermissionStoreError> {
        if let Some(overlap) = profile
            .allowed_tools
            .intersection(&profile.blocked_tools)
            .next()
        {
            return Err(PermissionStoreError::OverlappingSets(overlap.clone()));
        }
        let conn = self.conn.clone();
        let key = key.to_string();
        let json = serde_json::to_string(&profile)?;
        tokio::task::spawn_blocking(move || -> Result<(), PermissionStoreError> {
            let conn = conn.lock().expect("permission db mutex poisoned");
            conn.execute(
                "INSERT INTO api_key_permissions (key, profile_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET profile_json = excluded.profile_json",
                params![key, json],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<PermissionProfile>, PermissionStoreError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let raw = tokio::task::spawn_blocking(move || -> Result<Option<String>, PermissionStoreError> {
            let conn = conn.lock().expect("permission db mutex poisoned");
            let raw = conn
                .query_row(
                    "SELECT profile_json FROM api_key_permissions WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw)
        })
        .await??;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    pub async fn get_or_preset(
        &self,
        key: &str,
        default_preset: Preset,
    ) -> Result<PermissionProfile, PermissionStoreError> {
        match self.get(key).await? {
            Some(profile) => Ok(profile),
            None => {
                let profile = PermissionProfile::preset(default_preset);
                self.put(key, profile.clone()).await?;
                Ok(profile)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_never_overlap_allow_and_block() {
        for preset in [Preset::Free, Preset::Pro, Preset::Enterprise] {
            let profile = PermissionProfile::preset(preset);
            assert!(profile
                .allowed_tools
                .intersection(&profile.blocked_tools)
                .next()
                .is_none());
        }
    }

    #[test]
    fn free_preset_blocks_bash_but_allows_read() {
        let profile = PermissionProfile::preset(Preset::Free);
        assert!(profile.permits_tool("Read"));
        assert!(!profile.permits_tool("Bash"));
    }

    #[test]
    fn enterprise_preset_allows_everything_not_blocked() {
        let profile = PermissionProfile::preset(Preset::Enterprise);
        assert!(profile.permits_tool("AnyToolAtAll"));
    }

    #[tokio::test]
    async fn put_rejects_overlapping_sets() {
        let store = PermissionStore::open(":memory:").await.unwrap();
        let mut profile = PermissionProfile::preset(Preset::Pro);
        profile.allowed_tools.insert("Bash".to_string());
        profile.blocked_tools.insert("Bash".to_string());
        assert!(store.put("cc_test", profile).await.is_err());
    }

    #[tokio::test]
    async fn get_or_preset_seeds_and_persists() {
        let store = PermissionStore::open(":memory:").await.unwrap();
        let first = store.get_or_preset("cc_a", Preset::Free).await.unwrap();
        let second = store.get_or_preset("cc_a", Preset::Enterprise).await.unwrap();
        assert_eq!(first, second, "second call must read the persisted row, not reseed");
    }
}
