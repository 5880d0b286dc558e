use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod cache_store;
mod event_store;
mod instrument_store;
mod snapshot_store;

pub use cache_store::CacheStore;
pub use event_store::{EventCursor, EventFilter, EventStore, OrderedScan, SUBTABLE_CAPACITY};
pub use instrument_store::{InstrumentRow, InstrumentStore};
pub use snapshot_store::SnapshotStore;

pub use redb::WriteTransaction;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
pub(crate) const EVENT_INDEX_TABLE: TableDefinition<(u64, u32), &[u8]> =
    TableDefinition::new("event_index");
pub(crate) const SNAPSHOT_TABLE: TableDefinition<(u64, u64, u32, u32), &[u8]> =
    TableDefinition::new("snapshots");
pub(crate) const INSTRUMENT_TABLE: TableDefinition<(u64, [u8; 20]), &[u8]> =
    TableDefinition::new("instruments");
pub(crate) const CACHE_TABLE: TableDefinition<(u64, &str), &[u8]> =
    TableDefinition::new("caches");

const META_KEY: &str = "meta";
const DB_FILE: &str = "indexer.redb";

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("begin transaction: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("open table: {0}")]
    Table(#[from] redb::TableError),
    #[error("row access: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("row encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("row decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema version {version}")]
    UnsupportedSchemaVersion { version: u32 },
}

/// Singleton row describing which build wrote the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreMeta {
    schema_version: u32,
    app_version: String,
    created_at: u64,
}

impl StoreMeta {
    fn current(created_at: u64) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at,
        }
    }
}

enum SchemaCheck {
    Ready,
    /// Written by a build we cannot read or upgrade from.
    Incompatible(u32),
}

/// Embedded store shared by every persistent subsystem. One writer at a
/// time; writers pass their [`WriteTransaction`] into the sub-stores so a
/// batch commits or rolls back as a unit.
#[derive(Debug)]
pub struct DbStore {
    root_dir: PathBuf,
    db: Arc<Database>,
}

impl DbStore {
    /// Opens (or creates) the store under `root_dir`. A store file this
    /// build cannot read or upgrade is renamed aside and replaced with a
    /// fresh one, never deleted.
    pub fn open(root_dir: impl Into<PathBuf>) -> Result<Self, DbError> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;
        let path = root_dir.join(DB_FILE);

        loop {
            let store = Self::attach(root_dir.clone(), &path)?;
            match store.reconcile_schema()? {
                SchemaCheck::Ready => return Ok(store),
                SchemaCheck::Incompatible(version) => {
                    drop(store);
                    set_aside(&path, version)?;
                }
            }
        }
    }

    fn attach(root_dir: PathBuf, path: &Path) -> Result<Self, DbError> {
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };
        let store = Self {
            root_dir,
            db: Arc::new(db),
        };
        store.create_tables()?;
        Ok(store)
    }

    /// Brings the meta row in line with this build, upgrading older stores
    /// in place where a migration path exists.
    fn reconcile_schema(&self) -> Result<SchemaCheck, DbError> {
        let Some(meta) = self.load_meta()? else {
            self.store_meta(&StoreMeta::current(unix_now()))?;
            return Ok(SchemaCheck::Ready);
        };

        match meta.schema_version.cmp(&CURRENT_SCHEMA_VERSION) {
            Ordering::Equal => Ok(SchemaCheck::Ready),
            Ordering::Greater => Ok(SchemaCheck::Incompatible(meta.schema_version)),
            Ordering::Less => match self.upgrade(meta.schema_version) {
                Ok(()) => {
                    self.store_meta(&StoreMeta::current(meta.created_at))?;
                    Ok(SchemaCheck::Ready)
                }
                Err(DbError::UnsupportedSchemaVersion { version }) => {
                    Ok(SchemaCheck::Incompatible(version))
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Walks the store forward one schema version at a time. Tables are
    /// created by `attach`; versions listed here only transform rows.
    fn upgrade(&self, from: u32) -> Result<(), DbError> {
        for version in from..CURRENT_SCHEMA_VERSION {
            match version {
                0 => {}
                version => return Err(DbError::UnsupportedSchemaVersion { version }),
            }
        }
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub(crate) fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    pub fn begin_write(&self) -> Result<WriteTransaction, DbError> {
        Ok(self.db.begin_write()?)
    }

    pub fn events(&self, chain_id: u64) -> EventStore {
        EventStore::new(self.database(), chain_id)
    }

    pub fn snapshots(&self, chain_id: u64) -> SnapshotStore {
        SnapshotStore::new(self.database(), chain_id)
    }

    pub fn instruments(&self, chain_id: u64) -> InstrumentStore {
        InstrumentStore::new(self.database(), chain_id)
    }

    pub fn caches(&self, chain_id: u64) -> CacheStore {
        CacheStore::new(self.database(), chain_id)
    }

    fn create_tables(&self) -> Result<(), DbError> {
        let txn = self.db.begin_write()?;
        txn.open_table(META_TABLE)?;
        txn.open_table(EVENT_INDEX_TABLE)?;
        txn.open_table(SNAPSHOT_TABLE)?;
        txn.open_table(INSTRUMENT_TABLE)?;
        txn.open_table(CACHE_TABLE)?;
        txn.commit()?;
        Ok(())
    }

    fn load_meta(&self) -> Result<Option<StoreMeta>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        table
            .get(META_KEY)?
            .map(|raw| unpack(raw.value()))
            .transpose()
    }

    fn store_meta(&self, meta: &StoreMeta) -> Result<(), DbError> {
        let raw = pack(meta)?;
        let txn = self.db.begin_write()?;
        txn.open_table(META_TABLE)?.insert(META_KEY, raw.as_slice())?;
        txn.commit()?;
        Ok(())
    }
}

/// Moves an unreadable store file out of the way, tagged with the schema
/// version that made it unreadable.
fn set_aside(path: &Path, version: u32) -> Result<(), DbError> {
    let parked = path.with_file_name(format!("{DB_FILE}.v{version}-{}", unix_now()));
    std::fs::rename(path, parked)?;
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

pub(crate) fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>, DbError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub(crate) fn unpack<T: DeserializeOwned>(raw: &[u8]) -> Result<T, DbError> {
    Ok(rmp_serde::from_slice(raw)?)
}

#[cfg(test)]
pub(crate) fn temp_store() -> DbStore {
    let dir = std::env::temp_dir().join("derivatives-indexer-tests");
    std::fs::create_dir_all(&dir).expect("create temp db dir");
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    DbStore::open(dir.join(format!("db-{pid}-{nanos}"))).expect("open temp store")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_preserves_meta() {
        let store = temp_store();
        let root = store.root_dir().to_path_buf();
        let created = store
            .load_meta()
            .expect("load meta")
            .expect("meta written on create")
            .created_at;
        drop(store);

        let store = DbStore::open(&root).expect("reopen");
        let meta = store.load_meta().expect("load meta").expect("meta present");
        assert_eq!(meta.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(meta.created_at, created);
    }

    #[test]
    fn future_schema_is_set_aside() {
        let store = temp_store();
        let root = store.root_dir().to_path_buf();
        store
            .store_meta(&StoreMeta {
                schema_version: CURRENT_SCHEMA_VERSION + 1,
                app_version: "99.0.0".to_string(),
                created_at: 1,
            })
            .expect("write future meta");
        drop(store);

        let store = DbStore::open(&root).expect("reopen starts fresh");
        let meta = store.load_meta().expect("load meta").expect("meta present");
        assert_eq!(meta.schema_version, CURRENT_SCHEMA_VERSION);

        let parked = std::fs::read_dir(&root)
            .expect("read store dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{DB_FILE}.v"))
            })
            .count();
        assert_eq!(parked, 1);
    }
}
