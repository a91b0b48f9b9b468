//! Embedded metadata store for file-backed mode.
//!
//! One LMDB database maps stream path to [`StreamMeta`]. Metadata is
//! written after the log append has been flushed; recovery reconciles the
//! two by truncating log bytes the metadata never acknowledged.

use std::fs;
use std::path::{Path, PathBuf};

use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::StreamMeta;

/// Virtual map size for the metadata environment. Metadata entries are
/// small; 1 GiB leaves ample headroom without reserving real memory.
const META_MAP_SIZE: usize = 1 << 30;

const META_DIR: &str = "meta";
const LOGS_DIR: &str = "logs";
const INSTANCE_ID_FILE: &str = "instance.id";

pub(crate) struct MetaStore {
    env: Env,
    db: Database<Str, SerdeJson<StreamMeta>>,
}

impl MetaStore {
    /// Open (or create) the metadata environment under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let meta_dir = data_dir.join(META_DIR);
        fs::create_dir_all(&meta_dir)?;
        fs::create_dir_all(data_dir.join(LOGS_DIR))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(META_MAP_SIZE)
                .max_dbs(1)
                .open(&meta_dir)?
        };

        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some("streams"))?;
        wtxn.commit()?;

        Ok(Self { env, db })
    }

    /// Persist a stream's metadata.
    pub fn put(&self, meta: &StreamMeta) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &meta.path, meta)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Remove a stream's metadata.
    pub fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.db.delete(&mut wtxn, path)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Load every stream's metadata, for startup recovery.
    pub fn load_all(&self) -> Result<Vec<StreamMeta>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.db.iter(&rtxn)? {
            let (_path, meta) = item?;
            out.push(meta);
        }
        Ok(out)
    }
}

/// Directory holding the per-stream log files.
pub(crate) fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOGS_DIR)
}

/// Load the server instance identifier, creating it on first start. The id
/// seeds cursor generation so two instances sharing a cache never collide.
pub fn load_or_create_instance_id(data_dir: &Path) -> std::io::Result<String> {
    let path = data_dir.join(INSTANCE_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        Ok(_) | Err(_) => {
            fs::create_dir_all(data_dir)?;
            let id = Uuid::new_v4().to_string();
            fs::write(&path, &id)?;
            Ok(id)
        }
    }
}
