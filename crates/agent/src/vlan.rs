//! Host-local VLAN tag pool.
//!
//! Every isolated endpoint, same-host link and overlay attachment holds one
//! tag under a string key. Tags are unique across keys and the map survives
//! restarts through a JSON state file that is replaced atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum VlanError {
    #[error("vlan pool {start}-{end} exhausted")]
    Exhausted { start: u16, end: u16 },
    #[error("vlan {tag} is already held by {holder}")]
    TagInUse { tag: u16, holder: String },
    #[error("vlan {tag} is outside pool {start}-{end}")]
    OutOfRange { tag: u16, start: u16, end: u16 },
    #[error("vlan state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("vlan state file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct PoolRange {
    start: u16,
    end: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    range: PoolRange,
    allocations: BTreeMap<String, u16>,
}

/// Accepts the current versioned layout and the bare `{key: tag}` map older
/// agents wrote.
#[derive(Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Versioned(StateFile),
    Legacy(BTreeMap<String, u16>),
}

#[derive(Debug)]
pub struct VlanAllocator {
    start: u16,
    end: u16,
    path: Option<PathBuf>,
    by_key: BTreeMap<String, u16>,
    by_tag: BTreeMap<u16, String>,
}

impl VlanAllocator {
    /// Pool without a backing file.
    pub fn in_memory(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            path: None,
            by_key: BTreeMap::new(),
            by_tag: BTreeMap::new(),
        }
    }

    /// Opens the pool persisted at `path`. A missing file yields an empty
    /// pool. Entries outside the current range, and later holders of a tag
    /// that is already taken, are dropped with a warning.
    pub fn load(path: impl Into<PathBuf>, start: u16, end: u16) -> Result<Self, VlanError> {
        let path = path.into();
        let mut pool = Self {
            path: Some(path.clone()),
            ..Self::in_memory(start, end)
        };

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(pool),
            Err(source) => return Err(VlanError::Io { path, source }),
        };
        if raw.trim().is_empty() {
            return Ok(pool);
        }

        let allocations = match serde_json::from_str::<OnDisk>(&raw) {
            Ok(OnDisk::Versioned(state)) => {
                if state.version != STATE_VERSION {
                    return Err(VlanError::Corrupt {
                        path,
                        message: format!("unsupported version {}", state.version),
                    });
                }
                state.allocations
            }
            Ok(OnDisk::Legacy(map)) => map,
            Err(err) => {
                return Err(VlanError::Corrupt {
                    path,
                    message: err.to_string(),
                });
            }
        };

        for (key, tag) in allocations {
            if !pool.in_range(tag) {
                warn!(%key, tag, start, end, "dropping persisted vlan outside pool");
                continue;
            }
            if let Some(holder) = pool.by_tag.get(&tag) {
                warn!(%key, tag, %holder, "dropping duplicate persisted vlan");
                continue;
            }
            pool.by_tag.insert(tag, key.clone());
            pool.by_key.insert(key, tag);
        }
        Ok(pool)
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<u16> {
        self.by_key.get(key).copied()
    }

    pub fn holder(&self, tag: u16) -> Option<&str> {
        self.by_tag.get(&tag).map(String::as_str)
    }

    pub fn allocations(&self) -> impl Iterator<Item = (&str, u16)> {
        self.by_key.iter().map(|(key, tag)| (key.as_str(), *tag))
    }

    /// Returns the tag held by `key`, allocating the lowest free tag when the
    /// key holds none.
    pub fn allocate(&mut self, key: &str) -> Result<u16, VlanError> {
        if let Some(tag) = self.get(key) {
            return Ok(tag);
        }
        let tag = (self.start..=self.end)
            .find(|tag| !self.by_tag.contains_key(tag))
            .ok_or(VlanError::Exhausted {
                start: self.start,
                end: self.end,
            })?;
        self.bind(key, tag);
        if let Err(err) = self.persist() {
            self.unbind(key);
            return Err(err);
        }
        Ok(tag)
    }

    /// Frees the tag held by `key`.
    pub fn release(&mut self, key: &str) -> Result<Option<u16>, VlanError> {
        let Some(tag) = self.unbind(key) else {
            return Ok(None);
        };
        if let Err(err) = self.persist() {
            self.bind(key, tag);
            return Err(err);
        }
        Ok(Some(tag))
    }

    /// Records that `key` holds `tag`, for tags observed on the bridge. A key
    /// that held a different tag is moved.
    pub fn claim(&mut self, key: &str, tag: u16) -> Result<(), VlanError> {
        if !self.in_range(tag) {
            return Err(VlanError::OutOfRange {
                tag,
                start: self.start,
                end: self.end,
            });
        }
        match self.by_tag.get(&tag) {
            Some(holder) if holder == key => return Ok(()),
            Some(holder) => {
                return Err(VlanError::TagInUse {
                    tag,
                    holder: holder.clone(),
                });
            }
            None => {}
        }
        let previous = self.unbind(key);
        self.bind(key, tag);
        if let Err(err) = self.persist() {
            self.unbind(key);
            if let Some(previous) = previous {
                self.bind(key, previous);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Drops every allocation `keep` rejects and returns what was released.
    pub fn retain<F>(&mut self, mut keep: F) -> Result<Vec<(String, u16)>, VlanError>
    where
        F: FnMut(&str, u16) -> bool,
    {
        let released: Vec<(String, u16)> = self
            .by_key
            .iter()
            .filter(|(key, tag)| !keep(key, **tag))
            .map(|(key, tag)| (key.clone(), *tag))
            .collect();
        if released.is_empty() {
            return Ok(released);
        }
        for (key, _) in &released {
            self.unbind(key);
        }
        if let Err(err) = self.persist() {
            for (key, tag) in &released {
                self.bind(key, *tag);
            }
            return Err(err);
        }
        Ok(released)
    }

    fn in_range(&self, tag: u16) -> bool {
        (self.start..=self.end).contains(&tag)
    }

    fn bind(&mut self, key: &str, tag: u16) {
        self.by_key.insert(key.to_string(), tag);
        self.by_tag.insert(tag, key.to_string());
    }

    fn unbind(&mut self, key: &str) -> Option<u16> {
        let tag = self.by_key.remove(key)?;
        self.by_tag.remove(&tag);
        Some(tag)
    }

    fn persist(&self) -> Result<(), VlanError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let state = StateFile {
            version: STATE_VERSION,
            range: PoolRange {
                start: self.start,
                end: self.end,
            },
            allocations: self.by_key.clone(),
        };
        let body = serde_json::to_vec_pretty(&state).map_err(|err| VlanError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        write_atomic(path, &body).map_err(|source| VlanError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_stable_and_lowest_free() {
        let mut pool = VlanAllocator::in_memory(100, 102);
        assert_eq!(pool.allocate("lab/r1/eth1").expect("alloc"), 100);
        assert_eq!(pool.allocate("lab/r2/eth1").expect("alloc"), 101);
        assert_eq!(pool.allocate("lab/r1/eth1").expect("alloc"), 100);

        assert_eq!(pool.release("lab/r1/eth1").expect("release"), Some(100));
        assert_eq!(pool.allocate("lab/r3/eth1").expect("alloc"), 100);
        assert_eq!(pool.release("lab/missing/eth1").expect("release"), None);
    }

    #[test]
    fn exhausted_pool_is_reported() {
        let mut pool = VlanAllocator::in_memory(10, 11);
        pool.allocate("a").expect("alloc");
        pool.allocate("b").expect("alloc");
        assert!(matches!(
            pool.allocate("c"),
            Err(VlanError::Exhausted { start: 10, end: 11 })
        ));
    }

    #[test]
    fn claim_rejects_foreign_and_out_of_range_tags() {
        let mut pool = VlanAllocator::in_memory(100, 200);
        pool.claim("a", 150).expect("claim");
        pool.claim("a", 150).expect("idempotent claim");
        assert!(matches!(
            pool.claim("b", 150),
            Err(VlanError::TagInUse { tag: 150, .. })
        ));
        assert!(matches!(pool.claim("b", 20), Err(VlanError::OutOfRange { .. })));

        pool.claim("a", 160).expect("move");
        assert_eq!(pool.get("a"), Some(160));
        assert_eq!(pool.holder(150), None);
    }

    #[test]
    fn allocations_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("vlans.json");
        {
            let mut pool = VlanAllocator::load(&path, 100, 200).expect("load");
            pool.allocate("lab/r1/eth1").expect("alloc");
            pool.claim("link/lab/r1:eth2-r2:eth2", 175).expect("claim");
        }
        assert!(!path.with_extension("json.tmp").exists());

        let raw = std::fs::read_to_string(&path).expect("read");
        let state: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(state["version"], 1);
        assert_eq!(state["range"]["start"], 100);

        let pool = VlanAllocator::load(&path, 100, 200).expect("reload");
        assert_eq!(pool.get("lab/r1/eth1"), Some(100));
        assert_eq!(pool.holder(175), Some("link/lab/r1:eth2-r2:eth2"));
    }

    #[test]
    fn legacy_map_is_accepted_and_filtered_to_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vlans.json");
        std::fs::write(&path, r#"{"a": 120, "b": 5, "c": 120}"#).expect("write");

        let pool = VlanAllocator::load(&path, 100, 200).expect("load");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get("a"), Some(120));
        assert_eq!(pool.get("b"), None);
        assert_eq!(pool.get("c"), None);
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vlans.json");
        std::fs::write(&path, "not json").expect("write");
        assert!(matches!(
            VlanAllocator::load(&path, 100, 200),
            Err(VlanError::Corrupt { .. })
        ));
    }

    #[test]
    fn retain_releases_rejected_allocations() {
        let mut pool = VlanAllocator::in_memory(100, 200);
        pool.allocate("keep").expect("alloc");
        pool.allocate("drop").expect("alloc");
        let released = pool.retain(|key, _| key == "keep").expect("retain");
        assert_eq!(released, vec![("drop".to_string(), 101)]);
        assert_eq!(pool.len(), 1);
    }
}
