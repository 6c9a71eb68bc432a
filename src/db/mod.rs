//! Durable key-value storage for cached routes and the position trail.

use std::{collections::HashMap, fs, path::Path};

use heed::{Database, Env, EnvOpenOptions, types::*};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Bump this when the encoding of anything stored in the entries table
/// changes. Everything in there is a cache, so an old database is just
/// cleared instead of migrated.
pub const CURRENT_VERSION: u32 = 1;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> eyre::Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> eyre::Result<()>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> eyre::Result<bool>;
    /// Every key starting with `prefix`, in lexicographic order.
    fn keys(&self, prefix: &str) -> eyre::Result<Vec<String>>;
}

pub struct Db {
    env: Env,
    entries_db: Database<Str, Bytes>,
    settings_db: Database<Str, Bytes>,
}
impl Db {
    pub fn open(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        info!("Opening database at {}", path.display());

        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        // SAFETY: The file shouldn't be modified by anything other than heed.
        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(2)
                .map_size(1024 * 1024 * 1024)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let settings_db: Database<Str, Bytes> =
            env.create_database(&mut wtxn, Some("settings"))?;
        let entries_db: Database<Str, Bytes> = env.create_database(&mut wtxn, Some("entries"))?;

        let version = match settings_db.get(&wtxn, "version")? {
            Some(data) => data.try_into().map(u32::from_le_bytes).ok(),
            None => None,
        };
        if version != Some(CURRENT_VERSION) {
            if !entries_db.is_empty(&wtxn)? {
                warn!("Database version is {version:?}, expected {CURRENT_VERSION}. Clearing it.");
            }
            entries_db.clear(&mut wtxn)?;
            settings_db.put(&mut wtxn, "version", &CURRENT_VERSION.to_le_bytes())?;
        }

        wtxn.commit()?;

        Ok(Self {
            env,
            entries_db,
            settings_db,
        })
    }

    pub fn version(&self) -> eyre::Result<Option<u32>> {
        let txn = self.env.read_txn()?;
        let version = self
            .settings_db
            .get(&txn, "version")?
            .and_then(|data| data.try_into().map(u32::from_le_bytes).ok());
        Ok(version)
    }

    /// Blocks until the environment is fully closed, so it can be opened
    /// again.
    pub fn close(self) {
        self.env.prepare_for_closing().wait();
    }
}

impl KvStore for Db {
    fn get(&self, key: &str) -> eyre::Result<Option<Vec<u8>>> {
        let txn = self.env.read_txn()?;
        let value = self.entries_db.get(&txn, key)?.map(<[u8]>::to_vec);
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> eyre::Result<()> {
        let mut txn = self.env.write_txn()?;
        self.entries_db.put(&mut txn, key, value)?;
        txn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> eyre::Result<bool> {
        let mut txn = self.env.write_txn()?;
        let existed = self.entries_db.delete(&mut txn, key)?;
        txn.commit()?;
        Ok(existed)
    }

    fn keys(&self, prefix: &str) -> eyre::Result<Vec<String>> {
        let txn = self.env.read_txn()?;
        let mut keys = Vec::new();
        // LMDB rejects a zero-length key for the range lookup prefix_iter does
        if prefix.is_empty() {
            for res in self.entries_db.iter(&txn)? {
                let (key, _) = res?;
                keys.push(key.to_string());
            }
        } else {
            for res in self.entries_db.prefix_iter(&txn, prefix)? {
                let (key, _) = res?;
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}

/// A [`KvStore`] that only lives as long as the process does.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> eyre::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> eyre::Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> eyre::Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> eyre::Result<Vec<String>> {
        let mut keys = self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }
}
