//! Persistent key-value store, one node per container.
//!
//! Each container id owns a directory under the store root; every
//! persistent property or data entry is one file named after the key,
//! holding the value's string form. Writes go through a temporary file
//! and `rename` so a crash never leaves a half-written value. The slave
//! is the only writer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use warden_common::error::{Result, WardenError};
use warden_common::types::ContainerId;

/// Handle to the store root.
#[derive(Debug, Clone)]
pub struct KvStore {
    root: PathBuf,
}

/// One container's node inside the store.
#[derive(Debug, Clone)]
pub struct KvNode {
    dir: PathBuf,
}

impl KvStore {
    /// Opens (and creates, if missing) the store at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| WardenError::io(root, e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The node for a container id; the directory is created lazily by
    /// the first write.
    #[must_use]
    pub fn node(&self, id: ContainerId) -> KvNode {
        KvNode {
            dir: self.root.join(id.to_string()),
        }
    }

    /// Lists all persisted nodes with their key/value pairs, ordered by
    /// container id.
    ///
    /// Entries that do not parse as an id directory are skipped with a
    /// warning; a damaged node must not block the restore of the rest.
    ///
    /// # Errors
    ///
    /// Returns an error if the store root cannot be read.
    pub fn restore_all(&self) -> Result<Vec<(ContainerId, BTreeMap<String, String>)>> {
        let mut nodes = Vec::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| WardenError::io(&self.root, e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                tracing::warn!(entry = ?name, "skipping foreign entry in kv store");
                continue;
            };
            let node = self.node(ContainerId(id));
            nodes.push((ContainerId(id), node.read_all()?));
        }
        nodes.sort_by_key(|(id, _)| *id);
        Ok(nodes)
    }
}

impl KvNode {
    /// True when the node has been written at least once.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Writes one key, atomically replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or rename fails; on error the old
    /// value, if any, is still in place.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| WardenError::io(&self.dir, e))?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        let path = self.dir.join(key);
        std::fs::write(&tmp, value).map_err(|e| WardenError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| WardenError::io(&path, e))?;
        Ok(())
    }

    /// Reads one key.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read; a missing key reads
    /// as `None`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.dir.join(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WardenError::io(path, e)),
        }
    }

    /// Deletes one key; missing keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the unlink fails.
    pub fn remove_key(&self, key: &str) -> Result<()> {
        let path = self.dir.join(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WardenError::io(path, e)),
        }
    }

    /// All key/value pairs of the node, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let mut pairs = BTreeMap::new();
        if !self.exists() {
            return Ok(pairs);
        }
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| WardenError::io(&self.dir, e))?;
        for entry in entries.flatten() {
            let Some(key) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if key.starts_with('.') {
                // Leftover temporary from an interrupted write.
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            let value = std::fs::read_to_string(entry.path())
                .map_err(|e| WardenError::io(entry.path(), e))?;
            pairs.insert(key, value);
        }
        Ok(pairs)
    }

    /// Removes the whole node.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be deleted.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WardenError::io(&self.dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KvStore::open(&dir.path().join("kv")).unwrap();
        (dir, store)
    }

    #[test]
    fn set_get_roundtrip() {
        let (_dir, store) = store();
        let node = store.node(ContainerId(3));
        node.set("command", "sleep 1000").unwrap();
        assert_eq!(node.get("command").unwrap().as_deref(), Some("sleep 1000"));
        assert_eq!(node.get("missing").unwrap(), None);
    }

    #[test]
    fn set_overwrites_atomically() {
        let (_dir, store) = store();
        let node = store.node(ContainerId(3));
        node.set("state", "stopped").unwrap();
        node.set("state", "running").unwrap();
        assert_eq!(node.get("state").unwrap().as_deref(), Some("running"));
        // No temp file left behind.
        assert_eq!(node.read_all().unwrap().len(), 1);
    }

    #[test]
    fn read_all_skips_stale_temp_files() {
        let (_dir, store) = store();
        let node = store.node(ContainerId(4));
        node.set("a", "1").unwrap();
        std::fs::write(store.node(ContainerId(4)).dir.join(".b.tmp"), "junk").unwrap();
        let pairs = node.read_all().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs["a"], "1");
    }

    #[test]
    fn restore_all_orders_by_id_and_skips_foreign_entries() {
        let (_dir, store) = store();
        store.node(ContainerId(9)).set("k", "v9").unwrap();
        store.node(ContainerId(3)).set("k", "v3").unwrap();
        std::fs::create_dir_all(store.root.join("not-a-number")).unwrap();

        let nodes = store.restore_all().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].0, ContainerId(3));
        assert_eq!(nodes[1].0, ContainerId(9));
        assert_eq!(nodes[1].1["k"], "v9");
    }

    #[test]
    fn remove_node_then_read_is_empty() {
        let (_dir, store) = store();
        let node = store.node(ContainerId(5));
        node.set("k", "v").unwrap();
        node.remove().unwrap();
        assert!(!node.exists());
        assert!(node.read_all().unwrap().is_empty());
        node.remove().unwrap();
    }

    #[test]
    fn remove_key_is_idempotent() {
        let (_dir, store) = store();
        let node = store.node(ContainerId(6));
        node.set("k", "v").unwrap();
        node.remove_key("k").unwrap();
        node.remove_key("k").unwrap();
        assert_eq!(node.get("k").unwrap(), None);
    }
}
