//! The store adapter: the only component that issues primitives against the
//! embedded store. Wraps a single redb database holding one byte-keyed table
//! for the whole logical keyspace, maps redb's error family onto ours, and
//! runs the startup protocol that decides between first-time initialization
//! and warm restore.

use std::ops::Bound;
use std::path::PathBuf;

use redb::{Database, ReadTransaction, TableDefinition, WriteTransaction};
use tracing::{error, info};

use crate::config::DataConfig;
use crate::error::{Error, Result};
use crate::keyspace::{DIRTY_KEY, STATE_KEY, VERSION_KEY};
use crate::schema::SavedState;

/// The single logical keyspace; namespace tags keep it partitioned.
const DATA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("strata");

const STORE_FILE: &str = "strata.redb";

/// Release tag written under the `"hyperdex"` metadata key.
pub const VERSION_TAG: &[u8] = b"1.0.rc3";
/// Prior tags whose on-disk layout we still read.
pub const COMPAT_TAGS: &[&[u8]] = &[b"1.0.rc1", b"1.0.rc2"];

type DataTable<'txn> = redb::Table<'txn, &'static [u8], &'static [u8]>;
type SnapTable = redb::ReadOnlyTable<&'static [u8], &'static [u8]>;

/// A lazy, ordered range over a snapshot.
pub type SnapRange = redb::Range<'static, &'static [u8], &'static [u8]>;

/// What setup found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupState {
    /// The identity written by the last save_state, None on first open.
    pub saved: Option<SavedState>,
    /// Whether the dirty flag was present. The caller decides what to do.
    pub dirty: bool,
}

/// Handle on the embedded store.
pub struct Store {
    db: Database,
    path: PathBuf,
}

impl Store {
    /// Opens or creates the store and runs the startup protocol: verify the
    /// layout version tag, then recover the saved daemon identity. A version
    /// mismatch, a state record on a fresh store, or a missing state record
    /// on a used store are all fatal.
    pub fn open(config: &DataConfig) -> Result<(Self, SetupState)> {
        std::fs::create_dir_all(&config.dir)?;
        let path = config.dir.join(STORE_FILE);

        let db = Database::builder()
            .set_cache_size(config.max_size_mb * 1024 * 1024)
            .create(&path)?;

        let store = Self { db, path };

        // make sure the table exists before any read transaction opens it
        let txn = store.begin_write()?;
        {
            txn.open_table(DATA_TABLE)?;
        }
        txn.commit()?;

        let setup = store.restore()?;
        Ok((store, setup))
    }

    fn restore(&self) -> Result<SetupState> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;

        let version = table.get(VERSION_KEY)?.map(|g| g.value().to_vec());
        let first_time = match &version {
            None => true,
            Some(tag) => {
                if tag.as_slice() != VERSION_TAG && !COMPAT_TAGS.contains(&tag.as_slice()) {
                    error!(
                        found = %String::from_utf8_lossy(tag),
                        expected = %String::from_utf8_lossy(VERSION_TAG),
                        "could not restore: the existing data was created by another release"
                    );
                    return Err(Error::Corruption(format!(
                        "store created by release {:?}",
                        String::from_utf8_lossy(tag)
                    )));
                }
                false
            }
        };

        let state = table.get(STATE_KEY)?.map(|g| g.value().to_vec());
        let saved = match (first_time, state) {
            (true, Some(_)) => {
                error!("could not restore: a previous execution crashed and the store was tampered with");
                return Err(Error::Corruption("saved state on a fresh store".to_string()));
            }
            (false, None) => {
                error!("could not restore: a previous execution crashed; run recovery and try again");
                return Err(Error::Corruption("saved state missing".to_string()));
            }
            (true, None) => None,
            (false, Some(bytes)) => Some(bincode::deserialize::<SavedState>(&bytes).map_err(
                |e| {
                    error!(error = %e, "could not restore: a previous execution saved invalid state");
                    Error::Corruption("saved state undecodable".to_string())
                },
            )?),
        };

        let dirty = table.get(DIRTY_KEY)?.is_some();
        info!(path = %self.path.display(), first_time, dirty, "store opened");
        Ok(SetupState { saved, dirty })
    }

    /// Writes the layout version tag. Called once after a first-time open.
    pub fn initialize(&self) -> Result<()> {
        self.put_meta(VERSION_KEY, VERSION_TAG)
    }

    /// Persists the daemon identity: sets the dirty flag and the state
    /// record in one transaction.
    pub fn save_state(&self, state: &SavedState) -> Result<()> {
        let packed = bincode::serialize(state)?;
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(DATA_TABLE)?;
            table.insert(DIRTY_KEY, &b""[..])?;
            table.insert(STATE_KEY, packed.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Removes the dirty flag; the only clean-shutdown marker. Idempotent.
    pub fn clear_dirty(&self) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(DATA_TABLE)?;
            table.remove(DIRTY_KEY)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Begin a read-write transaction.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    /// Opens the keyspace table inside a write transaction.
    pub fn open_table<'txn>(&self, txn: &'txn WriteTransaction) -> Result<DataTable<'txn>> {
        Ok(txn.open_table(DATA_TABLE)?)
    }

    /// A consistent read view of the whole keyspace.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        Ok(Snapshot { table, _txn: txn })
    }

    /// Pages currently holding data, in bytes.
    pub fn approximate_size(&self) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let stats = txn.stats()?;
        let pages = (stats.branch_pages() + stats.leaf_pages()) as u64;
        let size = pages * stats.page_size() as u64;
        txn.abort()?;
        Ok(size)
    }

    fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(DATA_TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// A consistent read view, held open by a read-only transaction. Iterators
/// and references derived from the same snapshot are mutually consistent.
pub struct Snapshot {
    table: SnapTable,
    _txn: ReadTransaction,
}

impl Snapshot {
    /// Point lookup, copying the value out.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.table.get(key)?.map(|g| g.value().to_vec()))
    }

    /// Ordered range scan from `lo` (inclusive) to `hi` (exclusive;
    /// unbounded when None).
    pub fn range(&self, lo: &[u8], hi: Option<&[u8]>) -> Result<SnapRange> {
        let upper = match hi {
            Some(h) => Bound::Excluded(h),
            None => Bound::Unbounded,
        };
        Ok(self.table.range::<&[u8]>((Bound::Included(lo), upper))?)
    }
}

/// Owns the bytes of one read, plus the snapshot that produced them so the
/// read view stays pinned for as long as the caller keeps the handle.
pub struct Reference {
    bytes: Vec<u8>,
    snapshot: Option<std::sync::Arc<Snapshot>>,
}

impl Reference {
    pub(crate) fn new(bytes: Vec<u8>, snapshot: std::sync::Arc<Snapshot>) -> Self {
        Self {
            bytes,
            snapshot: Some(snapshot),
        }
    }

    /// The referenced bytes.
    pub fn slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Keeps the bytes but releases the underlying snapshot early.
    pub fn persist(&mut self) {
        self.snapshot = None;
    }
}
