use core::marker::PhantomData;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::err::{Fallible, FlagError};
use crate::store::{merge_into, FlagBatch, FlagStore};
use crate::version::VersionVector;
use crate::{FlagWithMeta, Host};

fn poisoned() -> FlagError {
    FlagError::storage("file store lock poisoned")
}

/// Durable store backed by a single JSON snapshot file holding the same
/// `{flags, version}` shape that travels over the sync wire.
///
/// Mutations land in memory; `flush` serializes the snapshot to a temp file
/// and renames it into place so readers never observe a half-written file.
/// `compact` rewrites the snapshot with entries ordered by key. Nothing is
/// flushed implicitly: hosts decide when durability is paid for.
#[derive(Debug)]
pub struct FileStore<H: Host> {
    path: PathBuf,
    flags: RwLock<HashMap<String, FlagWithMeta>>,
    version: RwLock<VersionVector>,
    host: PhantomData<H>,
}

impl<H: Host> FileStore<H> {
    /// Opens the snapshot at `path`, or starts empty when the file does not
    /// exist yet.
    pub fn open(path: impl AsRef<Path>, node_id: &str) -> Fallible<FileStore<H>> {
        let path = path.as_ref().to_path_buf();
        let (flags, version) = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| FlagError::storage(format!("read {}: {}", path.display(), e)))?;
            let batch: FlagBatch = serde_json::from_str(&raw)?;
            let mut map = HashMap::with_capacity(batch.flags.len());
            for entry in batch.flags {
                map.insert(entry.flag.key.clone(), entry);
            }
            (map, batch.version)
        } else {
            (
                HashMap::new(),
                VersionVector::make(node_id, "init", H::now_millis())?,
            )
        };
        Ok(FileStore {
            path,
            flags: RwLock::new(flags),
            version: RwLock::new(version),
            host: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self, sorted: bool) -> Fallible<FlagBatch> {
        let flags = self.flags.read().map_err(|_| poisoned())?;
        let version = self.version.read().map_err(|_| poisoned())?;
        let mut entries: Vec<FlagWithMeta> = flags.values().cloned().collect();
        if sorted {
            entries.sort_by(|a, b| a.flag.key.cmp(&b.flag.key));
        }
        Ok(FlagBatch {
            flags: entries,
            version: version.clone(),
        })
    }

    fn write_snapshot(&self, batch: &FlagBatch) -> Fallible<()> {
        let json = serde_json::to_string(batch)?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        fs::write(&tmp, json)
            .map_err(|e| FlagError::storage(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| FlagError::storage(format!("rename {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

impl<H: Host> FlagStore for FileStore<H> {
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
        let batch = self.snapshot(true)?;
        self.write_snapshot(&batch)
    }

    fn flush(&self) -> Fallible<()> {
        let batch = self.snapshot(false)?;
        self.write_snapshot(&batch)
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
