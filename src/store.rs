use core::marker::PhantomData;
use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::err::{Fallible, FlagError};
use crate::version::VersionVector;
use crate::{FlagWithMeta, Host};

/// Wire shape of a replicated flag set: what a remote endpoint returns
/// during sync and what the durable store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagBatch {
    pub flags: Vec<FlagWithMeta>,
    pub version: VersionVector,
}

/// Storage contract consumed by the client façade.
///
/// `set`/`delete`/`clear` are raw CRUD: the façade owns version bumps for
/// its own mutations. `merge` is the one versioned operation here, and its
/// contract is normative: a remote entry is written iff no local entry
/// exists or the remote meta version is strictly newer, and any accepted
/// write increments the store version with the seed `"merge"`. Merging the
/// same batch twice therefore accepts everything once and nothing after.
pub trait FlagStore {
    fn get(&self, key: &str) -> Fallible<Option<FlagWithMeta>>;
    fn set(&self, key: &str, entry: FlagWithMeta) -> Fallible<()>;
    fn delete(&self, key: &str) -> Fallible<bool>;
    fn has(&self, key: &str) -> Fallible<bool>;
    fn list(&self) -> Fallible<Vec<FlagWithMeta>>;
    fn keys(&self) -> Fallible<Vec<String>>;
    fn count(&self) -> Fallible<usize>;
    fn clear(&self) -> Fallible<()>;
    fn get_version(&self) -> Fallible<VersionVector>;
    fn set_version(&self, version: VersionVector) -> Fallible<()>;
    /// Reorganize underlying storage; all accepted data is preserved.
    fn compact(&self) -> Fallible<()>;
    /// Durably persist all prior mutations before returning.
    fn flush(&self) -> Fallible<()>;
    /// Last-writer-wins reconciliation; returns the count of accepted
    /// entries.
    fn merge(&self, remote: Vec<FlagWithMeta>) -> Fallible<u32>;
}

/// Applies the merge contract to a plain map. Shared by the in-memory and
/// file-backed stores.
pub(crate) fn merge_into(
    flags: &mut HashMap<String, FlagWithMeta>,
    remote: Vec<FlagWithMeta>,
) -> u32 {
    let mut accepted = 0;
    for entry in remote {
        let write = match flags.get(&entry.flag.key) {
            None => true,
            Some(local) => entry.meta.version.is_newer(&local.meta.version),
        };
        if write {
            flags.insert(entry.flag.key.clone(), entry);
            accepted += 1;
        }
    }
    accepted
}

fn poisoned() -> FlagError {
    FlagError::storage("store lock poisoned")
}

/// Synchronous in-memory store: a flag map and the store-level version,
/// each behind its own lock. The locks are never held together.
#[derive(Debug)]
pub struct MemoryStore<H: Host> {
    flags: RwLock<HashMap<String, FlagWithMeta>>,
    version: RwLock<VersionVector>,
    host: PhantomData<H>,
}

impl<H: Host> MemoryStore<H> {
    pub fn new(node_id: &str) -> Fallible<MemoryStore<H>> {
        Ok(MemoryStore {
            flags: RwLock::new(HashMap::new()),
            version: RwLock::new(VersionVector::make(node_id, "init", H::now_millis())?),
            host: PhantomData,
        })
    }
}

impl<H: Host> FlagStore for MemoryStore<H> {
    fn get(&self, key: &str) -> Fallible<Option<FlagWithMeta>> {
        let flags = self.flags.read().map_err(|_| poisoned())?;
        Ok(flags.get(key).cloned())
    }

    fn set(&self, key: &str, entry: FlagWithMeta) -> Fallible<()> {
        let mut flags = self.flags.write().map_err(|_| poisoned())?;
        flags.insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Fallible<bool> {
        let mut flags = self.flags.write().map_err(|_| poisoned())?;
        Ok(flags.remove(key).is_some())
    }

    fn has(&self, key: &str) -> Fallible<bool> {
        let flags = self.flags.read().map_err(|_| poisoned())?;
        Ok(flags.contains_key(key))
    }

    fn list(&self) -> Fallible<Vec<FlagWithMeta>> {
        let flags = self.flags.read().map_err(|_| poisoned())?;
        Ok(flags.values().cloned().collect())
    }

    fn keys(&self) -> Fallible<Vec<String>> {
        let flags = self.flags.read().map_err(|_| poisoned())?;
        Ok(flags.keys().cloned().collect())
    }

    fn count(&self) -> Fallible<usize> {
        let flags = self.flags.read().map_err(|_| poisoned())?;
        Ok(flags.len())
    }

    fn clear(&self) -> Fallible<()> {
        let mut flags = self.flags.write().map_err(|_| poisoned())?;
        flags.clear();
        Ok(())
    }

    fn get_version(&self) -> Fallible<VersionVector> {
        let version = self.version.read().map_err(|_| poisoned())?;
        Ok(version.clone())
    }

    fn set_version(&self, next: VersionVector) -> Fallible<()> {
        let mut version = self.version.write().map_err(|_| poisoned())?;
        *version = next;
        Ok(())
    }

    fn compact(&self) -> Fallible<()> {
        Ok(())
    }

    fn flush(&self) -> Fallible<()> {
        Ok(())
    }

    fn merge(&self, remote: Vec<FlagWithMeta>) -> Fallible<u32> {
        let accepted = {
            let mut flags = self.flags.write().map_err(|_| poisoned())?;
            merge_into(&mut flags, remote)
        };
        if accepted > 0 {
            let mut version = self.version.write().map_err(|_| poisoned())?;
            *version = version.increment("merge", H::now_millis());
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Flag, FlagValue};

    struct SysClock;
    impl Host for SysClock {}

    fn entry(key: &str, version: u64, timestamp: i64, node_id: &str) -> FlagWithMeta {
        let mut e = FlagWithMeta::for_tests(Flag::boolean(key, true), timestamp);
        e.meta.version = VersionVector {
            version,
            timestamp,
            node_id: node_id.to_string(),
            checksum: "00000000".to_string(),
        };
        e
    }

    #[test]
    fn crud_surface() {
        let store: MemoryStore<SysClock> = MemoryStore::new("node-a").unwrap();
        assert!(store.get("dark_mode").unwrap().is_none());
        assert!(!store.has("dark_mode").unwrap());

        store.set("dark_mode", entry("dark_mode", 1, 10, "node-a")).unwrap();
        assert!(store.has("dark_mode").unwrap());
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.keys().unwrap(), vec!["dark_mode".to_string()]);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(
            store.get("dark_mode").unwrap().unwrap().flag.value,
            FlagValue::Bool(true)
        );

        assert!(store.delete("dark_mode").unwrap());
        assert!(!store.delete("dark_mode").unwrap());

        store.set("a", entry("a", 1, 10, "node-a")).unwrap();
        store.set("b", entry("b", 1, 10, "node-a")).unwrap();
        store.clear().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn merge_accepts_new_and_newer_only() {
        let store: MemoryStore<SysClock> = MemoryStore::new("node-a").unwrap();
        store.set("beta", entry("beta", 2, 10, "a")).unwrap();
        store.set("gamma", entry("gamma", 5, 10, "a")).unwrap();

        let remote = vec![
            entry("beta", 3, 5, "b"),  // newer version, older wall clock: wins
            entry("gamma", 4, 99, "b"), // older version: rejected
            entry("delta", 1, 1, "b"),  // absent locally: accepted
        ];
        let accepted = store.merge(remote).unwrap();
        assert_eq!(accepted, 2);

        assert_eq!(store.get("beta").unwrap().unwrap().meta.version.version, 3);
        assert_eq!(store.get("gamma").unwrap().unwrap().meta.version.version, 5);
        assert!(store.has("delta").unwrap());
    }

    #[test]
    fn merge_is_idempotent() {
        let store: MemoryStore<SysClock> = MemoryStore::new("node-a").unwrap();
        let remote = vec![entry("beta", 3, 5, "b"), entry("delta", 1, 1, "b")];

        assert_eq!(store.merge(remote.clone()).unwrap(), 2);
        assert_eq!(store.merge(remote).unwrap(), 0);
    }

    #[test]
    fn merge_bumps_the_store_version_only_on_accepts() {
        let store: MemoryStore<SysClock> = MemoryStore::new("node-a").unwrap();
        let before = store.get_version().unwrap();

        assert_eq!(store.merge(vec![entry("beta", 3, 5, "b")]).unwrap(), 1);
        let after = store.get_version().unwrap();
        assert!(after.is_newer(&before));
        assert_eq!(after.checksum, crate::version::checksum32("merge"));
        assert_eq!(after.node_id, "node-a");

        assert_eq!(store.merge(vec![entry("beta", 3, 5, "b")]).unwrap(), 0);
        assert_eq!(store.get_version().unwrap(), after);
    }

    #[test]
    fn equal_versions_are_not_rewritten() {
        let store: MemoryStore<SysClock> = MemoryStore::new("node-a").unwrap();
        store.set("beta", entry("beta", 3, 5, "b")).unwrap();
        assert_eq!(store.merge(vec![entry("beta", 3, 5, "b")]).unwrap(), 0);
    }

    #[test]
    fn batch_wire_shape() {
        let batch = FlagBatch {
            flags: vec![entry("beta", 3, 5, "b")],
            version: VersionVector {
                version: 7,
                timestamp: 42,
                node_id: "b".to_string(),
                checksum: "deadbeef".to_string(),
            },
        };
        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains(r#""version":"7:42:b:deadbeef""#));
        assert!(json.contains(r#""flags":[{"flag":"#));
        let back: FlagBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
    }
}
