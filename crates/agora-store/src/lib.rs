//! Artifact store
//!
//! Artifacts are the only persistent objects in the world: documents,
//! executable services, contracts, and principal profiles all live
//! here. Deletion is soft so history and audit references stay
//! resolvable; deleted artifacts refuse writes and edits.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use agora_types::{ErrorCode, Scrip};

/// Contract applied when a write names none.
pub const DEFAULT_CONTRACT: &str = "kernel_contract_freeware";

fn utc_now() -> String {
    Utc::now().to_rfc3339()
}

/// One stored artifact. `auth_state` is contract-owned mutable state;
/// the store only seeds `writer` and `principal` at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub content: String,
    pub created_by: String,
    pub owner: String,
    pub created_at: String,
    pub updated_at: String,

    pub executable: bool,
    pub code: String,
    pub read_price: Scrip,
    pub invoke_price: Scrip,

    pub access_contract_id: String,
    pub metadata: Map<String, Value>,
    pub interface: Option<Map<String, Value>>,
    pub auth_state: Map<String, Value>,

    pub has_standing: bool,
    pub has_loop: bool,
    pub capabilities: Vec<String>,
    pub depends_on: Vec<String>,

    pub deleted: bool,
    pub deleted_at: Option<String>,
    pub deleted_by: Option<String>,

    pub kernel_protected: bool,
}

impl Artifact {
    /// JSON view. Code is withheld unless asked for, so listings stay
    /// cheap and reads only pay for what they requested.
    pub fn to_json(&self, include_code: bool) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            if !include_code {
                map.remove("code");
            }
        }
        value
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Principal recorded in auth_state, falling back to the owner.
    pub fn auth_principal(&self) -> &str {
        self.auth_state
            .get("principal")
            .and_then(Value::as_str)
            .unwrap_or(&self.owner)
    }

    pub fn auth_writer(&self) -> &str {
        self.auth_state
            .get("writer")
            .and_then(Value::as_str)
            .unwrap_or(&self.owner)
    }
}

/// Everything a `write` may set. Callers fill what they have;
/// `Default` covers the rest.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub artifact_type: String,
    pub content: String,
    pub executable: bool,
    pub code: String,
    pub read_price: Scrip,
    pub invoke_price: Scrip,
    pub access_contract_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    pub interface: Option<Map<String, Value>>,
    pub has_standing: bool,
    pub has_loop: bool,
    pub capabilities: Option<Vec<String>>,
    pub depends_on: Option<Vec<String>>,
    pub owner: Option<String>,
    pub kernel_protected: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("artifact '{0}' not found")]
    NotFound(String),
    #[error("artifact '{0}' is deleted")]
    Deleted(String),
    #[error("old_string not found in artifact content")]
    NotFoundInContent,
    #[error("old_string is not unique in artifact content")]
    NotUnique,
    #[error("edit produced no change")]
    NoChange,
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound(_) => ErrorCode::NotFound,
            StoreError::Deleted(_) => ErrorCode::Deleted,
            StoreError::NotFoundInContent => ErrorCode::NotFoundInContent,
            StoreError::NotUnique => ErrorCode::NotUnique,
            StoreError::NoChange => ErrorCode::NoChange,
        }
    }
}

/// In-memory artifact table, keyed by id.
#[derive(Default)]
pub struct ArtifactStore {
    artifacts: BTreeMap<String, Artifact>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, artifact_id: &str) -> Option<&Artifact> {
        self.artifacts.get(artifact_id)
    }

    pub fn get_mut(&mut self, artifact_id: &str) -> Option<&mut Artifact> {
        self.artifacts.get_mut(artifact_id)
    }

    pub fn count(&self) -> usize {
        self.artifacts.len()
    }

    pub fn list_all(&self, include_deleted: bool) -> Vec<Value> {
        self.artifacts
            .values()
            .filter(|a| include_deleted || !a.deleted)
            .map(|a| a.to_json(false))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    /// Create or update. Updates keep `has_standing`/`has_loop` sticky
    /// (a principal cannot be demoted by a later write), keep existing
    /// metadata when none is given, and rewrite `writer` when the
    /// owner changes. Writes to deleted artifacts are refused.
    pub fn write(
        &mut self,
        artifact_id: &str,
        created_by: &str,
        req: WriteRequest,
    ) -> Result<&Artifact, StoreError> {
        let now = utc_now();
        if self.artifacts.contains_key(artifact_id) {
            let existing = self
                .artifacts
                .get_mut(artifact_id)
                .ok_or_else(|| StoreError::NotFound(artifact_id.to_string()))?;
            if existing.deleted {
                return Err(StoreError::Deleted(artifact_id.to_string()));
            }
            existing.artifact_type = req.artifact_type;
            existing.content = req.content;
            existing.updated_at = now;
            existing.executable = req.executable;
            existing.code = req.code;
            existing.read_price = req.read_price;
            existing.invoke_price = req.invoke_price;
            if let Some(metadata) = req.metadata {
                existing.metadata = metadata;
            }
            if let Some(interface) = req.interface {
                existing.interface = Some(interface);
            }
            existing.has_standing = req.has_standing || existing.has_standing;
            existing.has_loop = req.has_loop || existing.has_loop;
            if let Some(capabilities) = req.capabilities {
                existing.capabilities = capabilities;
            }
            if let Some(depends_on) = req.depends_on {
                existing.depends_on = depends_on;
            }
            if let Some(contract) = req.access_contract_id {
                if !contract.is_empty() {
                    existing.access_contract_id = contract;
                }
            }
            if let Some(owner) = req.owner {
                existing.owner = owner.clone();
                existing
                    .auth_state
                    .insert("writer".to_string(), Value::from(owner.clone()));
                existing
                    .auth_state
                    .entry("principal".to_string())
                    .or_insert_with(|| Value::from(owner));
            }
            return Ok(existing);
        }

        let owner = req.owner.unwrap_or_else(|| created_by.to_string());
        let mut auth_state = Map::new();
        auth_state.insert("writer".to_string(), Value::from(owner.clone()));
        auth_state.insert("principal".to_string(), Value::from(owner.clone()));
        let artifact = Artifact {
            id: artifact_id.to_string(),
            artifact_type: req.artifact_type,
            content: req.content,
            created_by: created_by.to_string(),
            owner,
            created_at: now.clone(),
            updated_at: now,
            executable: req.executable,
            code: req.code,
            read_price: req.read_price,
            invoke_price: req.invoke_price,
            access_contract_id: req
                .access_contract_id
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTRACT.to_string()),
            metadata: req.metadata.unwrap_or_default(),
            interface: req.interface,
            auth_state,
            has_standing: req.has_standing || req.has_loop,
            has_loop: req.has_loop,
            capabilities: req.capabilities.unwrap_or_default(),
            depends_on: req.depends_on.unwrap_or_default(),
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            kernel_protected: req.kernel_protected,
        };
        self.artifacts.insert(artifact_id.to_string(), artifact);
        Ok(&self.artifacts[artifact_id])
    }

    /// Replace a single occurrence of `old_string` in the content.
    /// Zero hits, multiple hits, and no-op replacements each fail with
    /// their own error so agents can correct course.
    pub fn edit(
        &mut self,
        artifact_id: &str,
        old_string: &str,
        new_string: &str,
    ) -> Result<(), StoreError> {
        let artifact = self
            .artifacts
            .get_mut(artifact_id)
            .ok_or_else(|| StoreError::NotFound(artifact_id.to_string()))?;
        if artifact.deleted {
            return Err(StoreError::Deleted(artifact_id.to_string()));
        }
        let hits = artifact.content.matches(old_string).count();
        if hits == 0 {
            return Err(StoreError::NotFoundInContent);
        }
        if hits > 1 {
            return Err(StoreError::NotUnique);
        }
        let updated = artifact.content.replacen(old_string, new_string, 1);
        if updated == artifact.content {
            return Err(StoreError::NoChange);
        }
        artifact.content = updated;
        artifact.updated_at = utc_now();
        Ok(())
    }

    /// Idempotent; false when missing or already deleted.
    pub fn soft_delete(&mut self, artifact_id: &str, deleted_by: &str) -> bool {
        let Some(artifact) = self.artifacts.get_mut(artifact_id) else {
            return false;
        };
        if artifact.deleted {
            return false;
        }
        let now = utc_now();
        artifact.deleted = true;
        artifact.deleted_at = Some(now.clone());
        artifact.deleted_by = Some(deleted_by.to_string());
        artifact.updated_at = now;
        true
    }

    pub fn by_owner(&self, owner: &str) -> Vec<String> {
        self.artifacts
            .values()
            .filter(|a| !a.deleted && a.owner == owner)
            .map(|a| a.id.clone())
            .collect()
    }

    /// UTF-8 bytes of content plus code over an owner's live
    /// artifacts; the number disk quotas are checked against.
    pub fn owner_usage(&self, owner: &str) -> usize {
        self.artifacts
            .values()
            .filter(|a| !a.deleted && a.owner == owner)
            .map(|a| a.content.len() + a.code.len())
            .sum()
    }

    /// Ids of live executable artifacts flagged as agent loops.
    pub fn discover_loops(&self) -> Vec<String> {
        self.artifacts
            .values()
            .filter(|a| a.has_loop && a.executable && !a.deleted)
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn transfer_ownership(&mut self, artifact_id: &str, new_owner: &str) -> bool {
        let Some(artifact) = self.artifacts.get_mut(artifact_id) else {
            return false;
        };
        if artifact.deleted {
            return false;
        }
        artifact.owner = new_owner.to_string();
        artifact
            .auth_state
            .insert("writer".to_string(), Value::from(new_owner));
        artifact
            .auth_state
            .insert("principal".to_string(), Value::from(new_owner));
        artifact.updated_at = utc_now();
        true
    }

    /// Kernel-internal content update that skips the contract path.
    /// Used for kernel-maintained artifacts like principal profiles.
    pub fn modify_protected_content(&mut self, artifact_id: &str, content: &str) -> bool {
        let Some(artifact) = self.artifacts.get_mut(artifact_id) else {
            return false;
        };
        artifact.content = content.to_string();
        artifact.updated_at = utc_now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_simple(store: &mut ArtifactStore, id: &str, by: &str, content: &str) {
        store
            .write(
                id,
                by,
                WriteRequest {
                    artifact_type: "generic".to_string(),
                    content: content.to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn create_seeds_auth_state_and_default_contract() {
        let mut store = ArtifactStore::new();
        write_simple(&mut store, "doc_1", "alpha_1", "hello");
        let artifact = store.get("doc_1").unwrap();
        assert_eq!(artifact.owner, "alpha_1");
        assert_eq!(artifact.auth_writer(), "alpha_1");
        assert_eq!(artifact.auth_principal(), "alpha_1");
        assert_eq!(artifact.access_contract_id, DEFAULT_CONTRACT);
    }

    #[test]
    fn update_keeps_standing_and_rejects_deleted() {
        let mut store = ArtifactStore::new();
        store
            .write(
                "svc_1",
                "alpha_1",
                WriteRequest {
                    artifact_type: "service".to_string(),
                    content: "v1".to_string(),
                    has_standing: true,
                    ..Default::default()
                },
            )
            .unwrap();
        write_simple(&mut store, "svc_1", "alpha_1", "v2");
        assert!(store.get("svc_1").unwrap().has_standing);

        assert!(store.soft_delete("svc_1", "alpha_1"));
        let err = store
            .write("svc_1", "alpha_1", WriteRequest::default())
            .unwrap_err();
        assert_eq!(err, StoreError::Deleted("svc_1".to_string()));
    }

    #[test]
    fn owner_change_rewrites_writer_but_keeps_principal() {
        let mut store = ArtifactStore::new();
        write_simple(&mut store, "doc_1", "alpha_1", "x");
        store
            .write(
                "doc_1",
                "alpha_1",
                WriteRequest {
                    content: "x2".to_string(),
                    owner: Some("alpha_2".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let artifact = store.get("doc_1").unwrap();
        assert_eq!(artifact.owner, "alpha_2");
        assert_eq!(artifact.auth_writer(), "alpha_2");
        assert_eq!(artifact.auth_principal(), "alpha_1");
    }

    #[test]
    fn edit_errors_are_distinct() {
        let mut store = ArtifactStore::new();
        write_simple(&mut store, "doc_1", "alpha_1", "aa b aa");

        assert_eq!(
            store.edit("missing", "a", "b").unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            store.edit("doc_1", "zzz", "b").unwrap_err().code(),
            ErrorCode::NotFoundInContent
        );
        assert_eq!(
            store.edit("doc_1", "aa", "cc").unwrap_err().code(),
            ErrorCode::NotUnique
        );
        assert!(store.edit("doc_1", "b", "B").is_ok());
        assert_eq!(store.get("doc_1").unwrap().content, "aa B aa");
    }

    #[test]
    fn soft_delete_is_idempotent() {
        let mut store = ArtifactStore::new();
        write_simple(&mut store, "doc_1", "alpha_1", "x");
        assert!(store.soft_delete("doc_1", "alpha_2"));
        assert!(!store.soft_delete("doc_1", "alpha_2"));
        let artifact = store.get("doc_1").unwrap();
        assert!(artifact.deleted);
        assert_eq!(artifact.deleted_by.as_deref(), Some("alpha_2"));
    }

    #[test]
    fn owner_usage_counts_live_bytes_only() {
        let mut store = ArtifactStore::new();
        write_simple(&mut store, "doc_1", "alpha_1", "abcd");
        store
            .write(
                "svc_1",
                "alpha_1",
                WriteRequest {
                    content: "ab".to_string(),
                    executable: true,
                    code: "fn run() { 1 }".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        write_simple(&mut store, "doc_2", "alpha_1", "gone");
        store.soft_delete("doc_2", "alpha_1");

        assert_eq!(store.owner_usage("alpha_1"), 4 + 2 + 14);
        assert_eq!(store.owner_usage("alpha_2"), 0);
    }

    #[test]
    fn listings_hide_code_and_deleted() {
        let mut store = ArtifactStore::new();
        store
            .write(
                "svc_1",
                "alpha_1",
                WriteRequest {
                    executable: true,
                    code: "fn run() { 1 }".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        write_simple(&mut store, "doc_1", "alpha_1", "x");
        store.soft_delete("doc_1", "alpha_1");

        let listed = store.list_all(false);
        assert_eq!(listed.len(), 1);
        assert!(listed[0].get("code").is_none());
        assert_eq!(store.list_all(true).len(), 2);
    }

    #[test]
    fn discover_loops_requires_executable_and_live() {
        let mut store = ArtifactStore::new();
        store
            .write(
                "loop_1",
                "alpha_1",
                WriteRequest {
                    executable: true,
                    code: "fn run() { 0 }".to_string(),
                    has_loop: true,
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .write(
                "flag_only",
                "alpha_1",
                WriteRequest {
                    has_loop: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.discover_loops(), vec!["loop_1".to_string()]);
    }
}
