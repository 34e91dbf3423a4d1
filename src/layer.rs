//! The data layer proper: maps user-visible objects onto the ordered byte
//! keyspace, maintains secondary indexes, records capture logs for regions
//! undergoing state transfer, and tracks acked sequence numbers.
//!
//! Every public write executes as one store transaction: the object, its
//! index delta, the acked marker (when a sequence id was supplied), and the
//! capture-log entry (when the region is captured) commit together or not
//! at all.

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use redb::{ReadableTable, Table};
use tracing::error;

use crate::cleaner::{self, Shared, SharedTopology};
use crate::codec::{codec_for, IndexCodec};
use crate::config::DataConfig;
use crate::error::{Error, Result};
use crate::format;
use crate::index;
use crate::iter::{self, AttributeCheck, DataIterator, ObjectRangeIter, SearchIter};
use crate::keyspace;
use crate::schema::{
    CaptureId, RegionId, SavedState, Schema, ServerId, Subspace, Topology, TransferSink,
};
use crate::store::{Reference, SetupState, Snapshot, Store};
use crate::value;

/// The per-node persistence and query engine. `Send + Sync`; user
/// operations run on any number of caller threads while one background
/// cleaner prunes obsolete capture logs.
pub struct DataLayer {
    store: Arc<Store>,
    topology: SharedTopology,
    shared: Arc<Shared>,
    cleaner: Option<JoinHandle<()>>,
}

impl DataLayer {
    /// Opens the store, runs the startup protocol, and starts the cleaner
    /// thread. The returned SetupState tells the caller whether this was a
    /// first-time open and whether the previous shutdown was clean.
    pub fn setup(
        config: &DataConfig,
        topology: Arc<dyn Topology>,
        sink: Arc<dyn TransferSink>,
    ) -> Result<(Self, SetupState)> {
        let (store, state) = Store::open(config)?;
        let store = Arc::new(store);
        let shared = Arc::new(Shared::new());
        let topology: SharedTopology = Arc::new(RwLock::new(topology));
        let cleaner = cleaner::spawn(store.clone(), shared.clone(), topology.clone(), sink);

        let layer = Self {
            store,
            topology,
            shared,
            cleaner: Some(cleaner),
        };
        Ok((layer, state))
    }

    /// Stops the cleaner and releases the store.
    pub fn teardown(mut self) {
        self.shutdown();
    }

    /// Writes the on-disk layout version tag. Called once after a
    /// first-time setup.
    pub fn initialize(&self) -> Result<()> {
        self.store.initialize()
    }

    /// Persists the daemon identity for warm restart.
    pub fn save_state(&self, state: &SavedState) -> Result<()> {
        self.store.save_state(state)
    }

    /// Marks the shutdown clean. Idempotent.
    pub fn clear_dirty(&self) -> Result<()> {
        self.store.clear_dirty()
    }

    /// Bytes of pages currently holding data.
    pub fn approximate_size(&self) -> Result<u64> {
        self.store.approximate_size()
    }

    // ------------------------------------------------------------------
    // reconfiguration protocol
    // ------------------------------------------------------------------

    /// Requests a cleaner pause. Must not be called while a pause is
    /// already outstanding.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock().unwrap();
        assert!(!state.need_pause);
        state.need_pause = true;
    }

    /// Lifts the pause and schedules a cleaning pass.
    pub fn unpause(&self) {
        let mut state = self.shared.state.lock().unwrap();
        assert!(state.need_pause);
        self.shared.wakeup_cleaner.notify_all();
        state.need_pause = false;
        state.need_cleaning = true;
    }

    /// Installs a new configuration. Blocks until the cleaner acknowledges
    /// the pause, then replaces the capture counters with the captured
    /// regions this server owns under the new topology. Call between
    /// `pause` and `unpause`.
    pub fn reconfigure(&self, new_topology: Arc<dyn Topology>, us: ServerId) {
        let mut state = self.shared.state.lock().unwrap();
        assert!(state.need_pause);

        while !state.paused {
            state = self.shared.wakeup_reconfigurer.wait(state).unwrap();
        }

        let mut regions = new_topology.captured_regions(us);
        regions.sort();
        state.counters.adopt(&regions);
        *self.topology.write().unwrap() = new_topology;
    }

    /// Enqueues a capture stream for deletion; the cleaner reports it to
    /// the state-transfer sink once its log entries are gone.
    pub fn request_wipe(&self, capture: CaptureId) {
        let mut state = self.shared.state.lock().unwrap();
        state.wipe_requests.insert(capture);
        self.shared.wakeup_cleaner.notify_all();
    }

    // ------------------------------------------------------------------
    // objects
    // ------------------------------------------------------------------

    /// Reads an object, returning its attribute values and version.
    pub fn get(&self, region: RegionId, key: &[u8]) -> Result<(Vec<Vec<u8>>, u64)> {
        let schema = self.schema_for(region)?;
        let key_codec = key_codec(&schema)?;
        let object_key = keyspace::object_key(region, &key_codec.encode(key)?);

        let snap = self.store.snapshot()?;
        let body = snap.get(&object_key)?.ok_or(Error::NotFound)?;
        value::decode_object(&body)
    }

    /// Writes an object and the index entries for `new_value`. A put over a
    /// live key silently overwrites the object but does not remove the
    /// previous value's index entries; callers that need index correctness
    /// over existing keys route through `uncertain_put`.
    pub fn put(
        &self,
        region: RegionId,
        reg: RegionId,
        seq_id: u64,
        key: &[u8],
        new_value: &[Vec<u8>],
        version: u64,
    ) -> Result<()> {
        let schema = self.schema_for(region)?;
        check_arity(&schema, new_value)?;
        let subspace = self.subspace_for(region);
        let key_codec = key_codec(&schema)?;
        let encoded_key = key_codec.encode(key)?;

        let txn = self.store.begin_write()?;
        {
            let mut table = self.store.open_table(&txn)?;
            table.insert(
                keyspace::object_key(region, &encoded_key).as_slice(),
                value::encode_object(new_value, version).as_slice(),
            )?;
            index::index_changes(
                &mut table,
                &schema,
                &subspace,
                region,
                key_codec,
                &encoded_key,
                None,
                Some(new_value),
            )?;
            self.finish_write(&mut table, region, reg, seq_id, key, Some((new_value, version)))?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Deletes an object and the index entries for `old_value`, which the
    /// caller supplies so no extra read is needed.
    pub fn del(
        &self,
        region: RegionId,
        reg: RegionId,
        seq_id: u64,
        key: &[u8],
        old_value: &[Vec<u8>],
    ) -> Result<()> {
        let schema = self.schema_for(region)?;
        check_arity(&schema, old_value)?;
        let subspace = self.subspace_for(region);
        let key_codec = key_codec(&schema)?;
        let encoded_key = key_codec.encode(key)?;

        let txn = self.store.begin_write()?;
        {
            let mut table = self.store.open_table(&txn)?;

            let existed = table
                .remove(keyspace::object_key(region, &encoded_key).as_slice())?
                .is_some();
            if !existed {
                return Err(Error::NotFound);
            }

            index::index_changes(
                &mut table,
                &schema,
                &subspace,
                region,
                key_codec,
                &encoded_key,
                Some(old_value),
                None,
            )?;
            self.finish_write(&mut table, region, reg, seq_id, key, None)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Replaces an object, applying the per-attribute index delta between
    /// `old_value` and `new_value`.
    pub fn overput(
        &self,
        region: RegionId,
        reg: RegionId,
        seq_id: u64,
        key: &[u8],
        old_value: &[Vec<u8>],
        new_value: &[Vec<u8>],
        version: u64,
    ) -> Result<()> {
        let schema = self.schema_for(region)?;
        check_arity(&schema, old_value)?;
        check_arity(&schema, new_value)?;
        let subspace = self.subspace_for(region);
        let key_codec = key_codec(&schema)?;
        let encoded_key = key_codec.encode(key)?;

        let txn = self.store.begin_write()?;
        {
            let mut table = self.store.open_table(&txn)?;
            table.insert(
                keyspace::object_key(region, &encoded_key).as_slice(),
                value::encode_object(new_value, version).as_slice(),
            )?;
            index::index_changes(
                &mut table,
                &schema,
                &subspace,
                region,
                key_codec,
                &encoded_key,
                Some(old_value),
                Some(new_value),
            )?;
            self.finish_write(&mut table, region, reg, seq_id, key, Some((new_value, version)))?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Atomic read-then-delete: reads the current object and, if present,
    /// deletes it along with its index entries. Succeeds when the object is
    /// already absent. Fails with BadEncoding when the stored value's arity
    /// disagrees with the schema; nothing is written in that case.
    pub fn uncertain_del(&self, region: RegionId, key: &[u8]) -> Result<()> {
        let schema = self.schema_for(region)?;
        let subspace = self.subspace_for(region);
        let key_codec = key_codec(&schema)?;
        let encoded_key = key_codec.encode(key)?;
        let object_key = keyspace::object_key(region, &encoded_key);

        let txn = self.store.begin_write()?;
        {
            let mut table = self.store.open_table(&txn)?;

            let body = table.get(object_key.as_slice())?.map(|g| g.value().to_vec());
            let Some(body) = body else {
                return Ok(());
            };

            let (old_value, _version) = value::decode_object(&body)?;
            check_arity(&schema, &old_value)?;

            table.remove(object_key.as_slice())?;
            index::index_changes(
                &mut table,
                &schema,
                &subspace,
                region,
                key_codec,
                &encoded_key,
                Some(&old_value),
                None,
            )?;
            self.finish_write(&mut table, region, RegionId::default(), 0, key, None)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Atomic read-then-write: behaves as `overput` against the read-back
    /// value when the object exists, as `put` otherwise.
    pub fn uncertain_put(
        &self,
        region: RegionId,
        key: &[u8],
        new_value: &[Vec<u8>],
        version: u64,
    ) -> Result<()> {
        let schema = self.schema_for(region)?;
        check_arity(&schema, new_value)?;
        let subspace = self.subspace_for(region);
        let key_codec = key_codec(&schema)?;
        let encoded_key = key_codec.encode(key)?;
        let object_key = keyspace::object_key(region, &encoded_key);

        let txn = self.store.begin_write()?;
        {
            let mut table = self.store.open_table(&txn)?;

            let body = table.get(object_key.as_slice())?.map(|g| g.value().to_vec());
            let old_value = match body {
                None => None,
                Some(body) => {
                    let (old_value, _version) = value::decode_object(&body)?;
                    check_arity(&schema, &old_value)?;
                    Some(old_value)
                }
            };

            table.insert(
                object_key.as_slice(),
                value::encode_object(new_value, version).as_slice(),
            )?;
            index::index_changes(
                &mut table,
                &schema,
                &subspace,
                region,
                key_codec,
                &encoded_key,
                old_value.as_deref(),
                Some(new_value),
            )?;
            self.finish_write(
                &mut table,
                region,
                RegionId::default(),
                0,
                key,
                Some((new_value, version)),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // state transfer
    // ------------------------------------------------------------------

    /// Reads one capture-log entry of the region's capture stream:
    /// `(has_value, key, values, version, reference)`.
    pub fn get_transfer(
        &self,
        region: RegionId,
        seq_no: u64,
    ) -> Result<(bool, Vec<u8>, Option<Vec<Vec<u8>>>, Option<u64>, Reference)> {
        let capture = self
            .topology
            .read()
            .unwrap()
            .capture_for(region)
            .ok_or_else(|| Error::Db(format!("{region} is not captured")))?;

        let snap = Arc::new(self.store.snapshot()?);
        let body = snap
            .get(&keyspace::transfer_key(capture, seq_no))?
            .ok_or(Error::NotFound)?;
        let (has_value, key, values, version) = value::decode_capture(&body)?;
        Ok((has_value, key, values, version, Reference::new(body, snap)))
    }

    // ------------------------------------------------------------------
    // acked markers
    // ------------------------------------------------------------------

    /// Whether `(region, reg, seq_id)` was ever marked acked and not
    /// cleared since.
    pub fn check_acked(&self, region: RegionId, reg: RegionId, seq_id: u64) -> bool {
        let key = keyspace::acked_key(reg, region, u64::MAX - seq_id);
        match self.store.snapshot().and_then(|snap| snap.get(&key)) {
            Ok(found) => found.is_some(),
            Err(err) => {
                error!(
                    error = %err,
                    key = %format::bytes(&key),
                    seq_id,
                    "could not check acked marker"
                );
                false
            }
        }
    }

    /// Durably records that `(region, reg, seq_id)` was processed.
    /// Idempotent; errors are logged, not surfaced.
    pub fn mark_acked(&self, region: RegionId, reg: RegionId, seq_id: u64) {
        let key = keyspace::acked_key(reg, region, u64::MAX - seq_id);
        let result = (|| -> Result<()> {
            let txn = self.store.begin_write()?;
            {
                let mut table = self.store.open_table(&txn)?;
                table.insert(key.as_slice(), &b""[..])?;
            }
            txn.commit()?;
            Ok(())
        })();

        if let Err(err) = result {
            error!(
                error = %err,
                key = %format::bytes(&key),
                seq_id,
                "could not mark acked"
            );
        }
    }

    /// The largest acked seq id recorded for `(reg, reg)`, or 0. Inverted
    /// seq encoding puts it first in the marker range, so this is one
    /// positioning read.
    pub fn max_seq_id(&self, reg: RegionId) -> u64 {
        let result = (|| -> Result<u64> {
            let snap = self.store.snapshot()?;
            let probe = keyspace::acked_key(reg, reg, 0);
            let mut range = snap.range(&probe, None)?;

            let Some(item) = range.next() else {
                return Ok(0);
            };
            let (key, _) = item.map_err(Error::from)?;

            match keyspace::decode_acked_key(key.value()) {
                Ok((found_reg, found_region, inverted))
                    if found_reg == reg && found_region == reg =>
                {
                    Ok(u64::MAX - inverted)
                }
                _ => Ok(0),
            }
        })();

        match result {
            Ok(seq) => seq,
            Err(err) => {
                error!(error = %err, reg = reg.0, "could not read max seq id");
                0
            }
        }
    }

    /// Removes every acked marker of `reg` with seq id below `before_seq`.
    /// Errors are logged, not surfaced.
    pub fn clear_acked(&self, reg: RegionId, before_seq: u64) {
        let result = (|| -> Result<()> {
            let txn = self.store.begin_write()?;
            {
                let mut table = self.store.open_table(&txn)?;

                let lo = keyspace::acked_key(reg, RegionId(0), 0);
                let hi = keyspace::bump(&keyspace::acked_prefix(reg));

                let mut stale: Vec<Vec<u8>> = Vec::new();
                {
                    use redb::ReadableTable;
                    let upper = match hi.as_deref() {
                        Some(h) => std::ops::Bound::Excluded(h),
                        None => std::ops::Bound::Unbounded,
                    };
                    let range = table
                        .range::<&[u8]>((std::ops::Bound::Included(lo.as_slice()), upper))?;
                    for item in range {
                        let (key, _) = item.map_err(Error::from)?;
                        let Ok((found_reg, _region, inverted)) =
                            keyspace::decode_acked_key(key.value())
                        else {
                            continue;
                        };
                        if found_reg == reg && u64::MAX - inverted < before_seq {
                            stale.push(key.value().to_vec());
                        }
                    }
                }

                for key in &stale {
                    table.remove(key.as_slice())?;
                }
            }
            txn.commit()?;
            Ok(())
        })();

        if let Err(err) = result {
            error!(error = %err, reg = reg.0, before_seq, "could not clear acked markers");
        }
    }

    // ------------------------------------------------------------------
    // snapshots and iterators
    // ------------------------------------------------------------------

    /// A consistent read view for iteration.
    pub fn make_snapshot(&self) -> Result<Arc<Snapshot>> {
        Ok(Arc::new(self.store.snapshot()?))
    }

    /// Iterates every object of a region under the snapshot.
    pub fn make_region_iterator(
        &self,
        snap: Arc<Snapshot>,
        region: RegionId,
    ) -> Result<ObjectRangeIter> {
        let schema = self.schema_for(region)?;
        let key_codec = key_codec(&schema)?;
        Ok(ObjectRangeIter::new(snap, region, None, None, key_codec))
    }

    /// Plans and returns a search iterator over the region for the given
    /// checks.
    pub fn make_search_iterator(
        &self,
        snap: Arc<Snapshot>,
        region: RegionId,
        checks: Vec<AttributeCheck>,
    ) -> Result<SearchIter> {
        let schema = self.schema_for(region)?;
        let subspace = self.subspace_for(region);
        iter::plan_search(snap, region, schema, subspace, checks)
    }

    /// Reads the object under an iterator's current position, through the
    /// iterator's own snapshot.
    pub fn get_from_iterator(
        &self,
        region: RegionId,
        it: &mut dyn DataIterator,
    ) -> Result<(Vec<u8>, Vec<Vec<u8>>, u64, Reference)> {
        let object_key = keyspace::object_key(region, it.internal_key());
        let snap = it.snap().clone();
        let body = snap.get(&object_key)?.ok_or(Error::NotFound)?;
        let (values, version) = value::decode_object(&body)?;
        Ok((it.key().to_vec(), values, version, Reference::new(body, snap)))
    }

    // ------------------------------------------------------------------

    fn finish_write(
        &self,
        table: &mut Table<&'static [u8], &'static [u8]>,
        region: RegionId,
        reg: RegionId,
        seq_id: u64,
        key: &[u8],
        write: Option<(&[Vec<u8>], u64)>,
    ) -> Result<()> {
        if seq_id != 0 {
            table.insert(
                keyspace::acked_key(reg, region, u64::MAX - seq_id).as_slice(),
                &b""[..],
            )?;
        }

        let count = self.shared.state.lock().unwrap().counters.lookup(region);
        if let Some(count) = count {
            let capture = self
                .topology
                .read()
                .unwrap()
                .capture_for(region)
                .ok_or_else(|| {
                    Error::Db(format!("{region} is captured but has no capture stream"))
                })?;
            table.insert(
                keyspace::transfer_key(capture, count).as_slice(),
                value::encode_capture(key, write).as_slice(),
            )?;
        }

        Ok(())
    }

    fn schema_for(&self, region: RegionId) -> Result<Schema> {
        self.topology
            .read()
            .unwrap()
            .schema(region)
            .ok_or_else(|| Error::Db(format!("no schema for {region}")))
    }

    fn subspace_for(&self, region: RegionId) -> Subspace {
        self.topology
            .read()
            .unwrap()
            .subspace(region)
            .unwrap_or_default()
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.wakeup_cleaner.notify_all();
        }

        if let Some(handle) = self.cleaner.take() {
            if handle.join().is_err() {
                error!("cleanup thread panicked");
            }
        }
    }
}

impl Drop for DataLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_arity(schema: &Schema, value: &[Vec<u8>]) -> Result<()> {
    if value.len() + 1 != schema.arity() {
        return Err(Error::BadEncoding(format!(
            "value has {} attributes, schema expects {}",
            value.len(),
            schema.arity() - 1
        )));
    }
    Ok(())
}

fn key_codec(schema: &Schema) -> Result<&'static dyn IndexCodec> {
    codec_for(schema.key_type())
        .ok_or_else(|| Error::Db("the key attribute's type cannot be encoded".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::Predicate;
    use crate::schema::{AttrType, Attribute, CaptureId};
    use crate::value::int_payload;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::tempdir;

    const R: RegionId = RegionId(1);

    #[derive(Default)]
    struct TestTopology {
        schemas: HashMap<u64, (Schema, Subspace)>,
        captures: HashMap<u64, u64>,
        owned: Vec<RegionId>,
    }

    impl TestTopology {
        fn with_kvw(indexed: Vec<u16>) -> Self {
            let schema = Schema::new(vec![
                Attribute::new("k", AttrType::Str),
                Attribute::new("v", AttrType::Int),
                Attribute::new("w", AttrType::Str),
            ]);
            let mut schemas = HashMap::new();
            schemas.insert(R.0, (schema, Subspace::new(indexed)));
            Self {
                schemas,
                captures: HashMap::new(),
                owned: Vec::new(),
            }
        }

        fn captured(mut self, region: RegionId, capture: CaptureId) -> Self {
            self.captures.insert(region.0, capture.0);
            self.owned.push(region);
            self
        }
    }

    impl Topology for TestTopology {
        fn schema(&self, region: RegionId) -> Option<Schema> {
            self.schemas.get(&region.0).map(|(s, _)| s.clone())
        }

        fn subspace(&self, region: RegionId) -> Option<Subspace> {
            self.schemas.get(&region.0).map(|(_, s)| s.clone())
        }

        fn capture_for(&self, region: RegionId) -> Option<CaptureId> {
            self.captures.get(&region.0).copied().map(CaptureId)
        }

        fn is_captured(&self, capture: CaptureId) -> bool {
            self.captures.values().any(|c| *c == capture.0)
        }

        fn captured_regions(&self, _us: ServerId) -> Vec<RegionId> {
            self.owned.clone()
        }
    }

    #[derive(Default)]
    struct TestSink {
        wiped: StdMutex<Vec<CaptureId>>,
    }

    impl TransferSink for TestSink {
        fn report_wiped(&self, capture: CaptureId) {
            self.wiped.lock().unwrap().push(capture);
        }
    }

    fn open(dir: &Path, topology: TestTopology) -> (DataLayer, Arc<TestSink>) {
        let sink = Arc::new(TestSink::default());
        let config = DataConfig::new(dir).max_size_mb(16);
        let (layer, _) = DataLayer::setup(&config, Arc::new(topology), sink.clone()).unwrap();
        layer.initialize().unwrap();
        (layer, sink)
    }

    /// Adopt capture counters for the regions the topology owns.
    fn adopt_captures(layer: &DataLayer, topology: TestTopology) {
        layer.pause();
        layer.reconfigure(Arc::new(topology), ServerId(1));
        layer.unpause();
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {what}");
    }

    fn index_entries(layer: &DataLayer, region: RegionId, attr: u16) -> Vec<Vec<u8>> {
        let snap = layer.store.snapshot().unwrap();
        let prefix = keyspace::index_prefix(region, attr);
        let upper = keyspace::bump(&prefix).unwrap();
        snap.range(&prefix, Some(&upper))
            .unwrap()
            .map(|item| item.map(|(k, _)| k.value().to_vec()))
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    fn collect_keys(it: &mut dyn DataIterator) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        keys
    }

    #[test]
    fn test_put_get_del() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let value = vec![int_payload(42), b"x".to_vec()];
        layer.put(R, RegionId(0), 0, b"alice", &value, 1).unwrap();
        assert_eq!(layer.get(R, b"alice").unwrap(), (value.clone(), 1));

        layer.del(R, RegionId(0), 0, b"alice", &value).unwrap();
        assert_eq!(layer.get(R, b"alice"), Err(Error::NotFound));
    }

    #[test]
    fn test_del_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let value = vec![int_payload(1), b"".to_vec()];
        assert_eq!(
            layer.del(R, RegionId(0), 0, b"ghost", &value),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_repeated_put_changes_only_version() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let value = vec![int_payload(7), b"w".to_vec()];
        layer.put(R, RegionId(0), 0, b"k", &value, 1).unwrap();
        let entries_before = index_entries(&layer, R, 1);

        layer.put(R, RegionId(0), 0, b"k", &value, 2).unwrap();
        assert_eq!(layer.get(R, b"k").unwrap(), (value, 2));
        assert_eq!(index_entries(&layer, R, 1), entries_before);
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let short = vec![int_payload(1)];
        assert!(matches!(
            layer.put(R, RegionId(0), 0, b"k", &short, 1),
            Err(Error::BadEncoding(_))
        ));
    }

    #[test]
    fn test_overput_updates_index() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let old = vec![int_payload(1), b"a".to_vec()];
        let new = vec![int_payload(2), b"a".to_vec()];
        layer.put(R, RegionId(0), 0, b"k", &old, 1).unwrap();
        layer.overput(R, RegionId(0), 0, b"k", &old, &new, 2).unwrap();

        let int_codec = codec_for(&AttrType::Int).unwrap();
        let str_codec = codec_for(&AttrType::Str).unwrap();
        let old_entry =
            index::index_entry(R, 1, int_codec, str_codec, b"k", &int_payload(1)).unwrap();
        let new_entry =
            index::index_entry(R, 1, int_codec, str_codec, b"k", &int_payload(2)).unwrap();

        let entries = index_entries(&layer, R, 1);
        assert!(!entries.contains(&old_entry));
        assert!(entries.contains(&new_entry));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_overput_same_value_leaves_index_untouched() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let value = vec![int_payload(5), b"a".to_vec()];
        layer.put(R, RegionId(0), 0, b"k", &value, 1).unwrap();
        let before = index_entries(&layer, R, 1);

        layer.overput(R, RegionId(0), 0, b"k", &value, &value, 2).unwrap();
        assert_eq!(index_entries(&layer, R, 1), before);
        assert_eq!(layer.get(R, b"k").unwrap().1, 2);
    }

    #[test]
    fn test_index_matches_live_objects() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        for (key, v) in [(&b"a"[..], 1i64), (b"b", 2), (b"c", 2)] {
            let value = vec![int_payload(v), b"w".to_vec()];
            layer.uncertain_put(R, key, &value, 1).unwrap();
        }
        let update = vec![int_payload(9), b"w".to_vec()];
        layer.uncertain_put(R, b"b", &update, 2).unwrap();
        layer.uncertain_del(R, b"c").unwrap();

        // exactly one entry per live object, decoding to its current value
        let int_codec = codec_for(&AttrType::Int).unwrap();
        let str_codec = codec_for(&AttrType::Str).unwrap();
        let mut expected = vec![
            index::index_entry(R, 1, int_codec, str_codec, b"a", &int_payload(1)).unwrap(),
            index::index_entry(R, 1, int_codec, str_codec, b"b", &int_payload(9)).unwrap(),
        ];
        expected.sort();
        assert_eq!(index_entries(&layer, R, 1), expected);
    }

    #[test]
    fn test_uncertain_put_behaves_as_put_then_overput() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let v1 = vec![int_payload(1), b"a".to_vec()];
        let v2 = vec![int_payload(2), b"b".to_vec()];

        layer.uncertain_put(R, b"k", &v1, 1).unwrap();
        assert_eq!(layer.get(R, b"k").unwrap(), (v1.clone(), 1));

        layer.uncertain_put(R, b"k", &v2, 2).unwrap();
        assert_eq!(layer.get(R, b"k").unwrap(), (v2, 2));

        // the read-back old value drove index removal
        let int_codec = codec_for(&AttrType::Int).unwrap();
        let str_codec = codec_for(&AttrType::Str).unwrap();
        let stale =
            index::index_entry(R, 1, int_codec, str_codec, b"k", &int_payload(1)).unwrap();
        assert!(!index_entries(&layer, R, 1).contains(&stale));
    }

    #[test]
    fn test_uncertain_del_on_missing_succeeds() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));
        assert_eq!(layer.uncertain_del(R, b"nothing"), Ok(()));
    }

    #[test]
    fn test_acked_round_trip() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));
        let r7 = RegionId(7);

        layer.mark_acked(r7, r7, 10);
        layer.mark_acked(r7, r7, 25);
        layer.mark_acked(r7, r7, 25);

        assert!(layer.check_acked(r7, r7, 10));
        assert!(!layer.check_acked(r7, r7, 11));
        assert_eq!(layer.max_seq_id(r7), 25);

        layer.clear_acked(r7, 20);
        assert!(!layer.check_acked(r7, r7, 10));
        assert!(layer.check_acked(r7, r7, 25));
        assert_eq!(layer.max_seq_id(r7), 25);
    }

    #[test]
    fn test_clear_acked_scoped_to_reg() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        layer.mark_acked(RegionId(7), RegionId(7), 5);
        layer.mark_acked(RegionId(8), RegionId(8), 5);
        layer.clear_acked(RegionId(7), 100);

        assert!(!layer.check_acked(RegionId(7), RegionId(7), 5));
        assert!(layer.check_acked(RegionId(8), RegionId(8), 5));
    }

    #[test]
    fn test_write_emits_acked_marker() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let value = vec![int_payload(1), b"".to_vec()];
        layer.put(R, RegionId(3), 11, b"k", &value, 1).unwrap();
        assert!(layer.check_acked(R, RegionId(3), 11));
        assert!(!layer.check_acked(R, RegionId(3), 12));
    }

    #[test]
    fn test_capture_log_seq_dense_and_replayable() {
        let dir = tempdir().unwrap();
        let capture = CaptureId(40);
        let topology = || TestTopology::with_kvw(vec![1]).captured(R, capture);
        let (layer, _) = open(dir.path(), topology());
        adopt_captures(&layer, topology());

        let v1 = vec![int_payload(1), b"a".to_vec()];
        let v2 = vec![int_payload(2), b"b".to_vec()];
        layer.put(R, RegionId(0), 0, b"k1", &v1, 1).unwrap();
        layer.put(R, RegionId(0), 0, b"k2", &v2, 1).unwrap();
        layer.del(R, RegionId(0), 0, b"k1", &v1).unwrap();

        let (has, key, values, version, _) = layer.get_transfer(R, 0).unwrap();
        assert!(has);
        assert_eq!(key, b"k1");
        assert_eq!(values.unwrap(), v1);
        assert_eq!(version, Some(1));

        let (has, key, values, version, _) = layer.get_transfer(R, 1).unwrap();
        assert!(has);
        assert_eq!(key, b"k2");
        assert_eq!(values.unwrap(), v2);
        assert_eq!(version, Some(1));

        let (has, key, values, version, _) = layer.get_transfer(R, 2).unwrap();
        assert!(!has);
        assert_eq!(key, b"k1");
        assert!(values.is_none());
        assert!(version.is_none());

        assert!(matches!(layer.get_transfer(R, 3), Err(Error::NotFound)));
    }

    #[test]
    fn test_capture_wipe_reports_once() {
        let dir = tempdir().unwrap();
        let capture = CaptureId(77);
        let topology = || TestTopology::with_kvw(vec![1]).captured(R, capture);
        let (layer, sink) = open(dir.path(), topology());
        adopt_captures(&layer, topology());

        for i in 0..3u64 {
            let value = vec![int_payload(i as i64), b"".to_vec()];
            layer
                .put(R, RegionId(0), 0, format!("k{i}").as_bytes(), &value, 1)
                .unwrap();
        }
        assert!(layer.get_transfer(R, 2).is_ok());

        layer.request_wipe(capture);
        wait_until("wipe report", || !sink.wiped.lock().unwrap().is_empty());

        assert_eq!(*sink.wiped.lock().unwrap(), vec![capture]);
        for seq in 0..3 {
            assert!(matches!(layer.get_transfer(R, seq), Err(Error::NotFound)));
        }
    }

    #[test]
    fn test_wipe_request_with_no_entries_still_reported() {
        let dir = tempdir().unwrap();
        let (layer, sink) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        layer.request_wipe(CaptureId(500));
        wait_until("wipe report", || !sink.wiped.lock().unwrap().is_empty());
        assert_eq!(*sink.wiped.lock().unwrap(), vec![CaptureId(500)]);
    }

    #[test]
    fn test_cleaner_keeps_live_streams() {
        let dir = tempdir().unwrap();
        let capture = CaptureId(9);
        let topology = || TestTopology::with_kvw(vec![1]).captured(R, capture);
        let (layer, sink) = open(dir.path(), topology());
        adopt_captures(&layer, topology());

        let value = vec![int_payload(1), b"".to_vec()];
        layer.put(R, RegionId(0), 0, b"k", &value, 1).unwrap();

        // an unrelated wipe request triggers a pass; the live stream survives
        layer.request_wipe(CaptureId(1000));
        wait_until("wipe report", || !sink.wiped.lock().unwrap().is_empty());

        assert_eq!(*sink.wiped.lock().unwrap(), vec![CaptureId(1000)]);
        assert!(layer.get_transfer(R, 0).is_ok());
    }

    #[test]
    fn test_reconfigure_adopts_counters() {
        let dir = tempdir().unwrap();
        let capture = CaptureId(12);
        let topology = || TestTopology::with_kvw(vec![1]).captured(R, capture);
        let (layer, _) = open(dir.path(), topology());

        // not captured yet: no capture entries are produced
        let value = vec![int_payload(1), b"".to_vec()];
        layer.put(R, RegionId(0), 0, b"before", &value, 1).unwrap();

        adopt_captures(&layer, topology());
        layer.put(R, RegionId(0), 0, b"after", &value, 1).unwrap();

        let (_, key, _, _, _) = layer.get_transfer(R, 0).unwrap();
        assert_eq!(key, b"after");
        assert!(matches!(layer.get_transfer(R, 1), Err(Error::NotFound)));
    }

    #[test]
    fn test_region_iterator_visits_region_only() {
        let dir = tempdir().unwrap();
        let mut topology = TestTopology::with_kvw(vec![1]);
        let (schema, sub) = topology.schemas.get(&R.0).unwrap().clone();
        topology.schemas.insert(2, (schema, sub));
        let other = RegionId(2);

        let (layer, _) = open(dir.path(), topology);
        let value = vec![int_payload(1), b"".to_vec()];
        layer.put(R, RegionId(0), 0, b"a", &value, 1).unwrap();
        layer.put(R, RegionId(0), 0, b"b", &value, 1).unwrap();
        layer.put(other, RegionId(0), 0, b"c", &value, 1).unwrap();

        let snap = layer.make_snapshot().unwrap();
        let mut it = layer.make_region_iterator(snap, R).unwrap();
        assert_eq!(collect_keys(&mut it), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_get_from_iterator() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let value = vec![int_payload(3), b"w".to_vec()];
        layer.put(R, RegionId(0), 0, b"a", &value, 4).unwrap();

        let snap = layer.make_snapshot().unwrap();
        let mut it = layer.make_region_iterator(snap, R).unwrap();
        assert!(it.valid());

        let (key, values, version, mut reference) = layer.get_from_iterator(R, &mut it).unwrap();
        assert_eq!(key, b"a");
        assert_eq!(values, value);
        assert_eq!(version, 4);
        reference.persist();
        assert!(!reference.slice().is_empty());
    }

    #[test]
    fn test_search_equality_uses_index() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        // 1000 objects with pseudo-random v, 10 with v == 5
        let mut state = 0x2545f4914f6cdd1du64;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for i in 0..1000u32 {
            let v = if i % 100 == 0 {
                5
            } else {
                let mut v = (rand() % 100_000) as i64 + 10;
                if v == 5 {
                    v += 1;
                }
                v
            };
            let value = vec![int_payload(v), b"w".to_vec()];
            layer
                .put(R, RegionId(0), 0, format!("key{i:04}").as_bytes(), &value, 1)
                .unwrap();
        }

        let snap = layer.make_snapshot().unwrap();
        let checks = vec![AttributeCheck::new(1, Predicate::Equals, int_payload(5))];
        let mut it = layer.make_search_iterator(snap, R, checks).unwrap();

        assert!(!it.scan_fallback());
        let mut keys = collect_keys(&mut it);
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 10);
        for key in &keys {
            let (values, _) = layer.get(R, key).unwrap();
            assert_eq!(values[0], int_payload(5));
        }
    }

    #[test]
    fn test_search_small_region_falls_back_to_scan() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        for i in 0..10u32 {
            let value = vec![int_payload(5), b"w".to_vec()];
            layer
                .put(R, RegionId(0), 0, format!("key{i}").as_bytes(), &value, 1)
                .unwrap();
        }

        let snap = layer.make_snapshot().unwrap();
        let checks = vec![AttributeCheck::new(1, Predicate::Equals, int_payload(5))];
        let mut it = layer.make_search_iterator(snap, R, checks).unwrap();

        assert!(it.scan_fallback());
        assert_eq!(collect_keys(&mut it).len(), 10);
    }

    #[test]
    fn test_search_unindexed_attribute_post_filters() {
        let dir = tempdir().unwrap();
        // attribute 1 (v) is NOT indexed here
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![]));

        for (key, v) in [(&b"a"[..], 1i64), (b"b", 2), (b"c", 1)] {
            let value = vec![int_payload(v), b"w".to_vec()];
            layer.put(R, RegionId(0), 0, key, &value, 1).unwrap();
        }

        let snap = layer.make_snapshot().unwrap();
        let checks = vec![AttributeCheck::new(1, Predicate::Equals, int_payload(1))];
        let mut it = layer.make_search_iterator(snap, R, checks).unwrap();

        assert!(it.scan_fallback());
        assert_eq!(collect_keys(&mut it), vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_search_range_and_key_checks() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        for (key, v) in [(&b"a"[..], 1i64), (b"b", 5), (b"c", 9), (b"d", -3)] {
            let value = vec![int_payload(v), b"w".to_vec()];
            layer.put(R, RegionId(0), 0, key, &value, 1).unwrap();
        }

        let snap = layer.make_snapshot().unwrap();
        let checks = vec![
            AttributeCheck::new(1, Predicate::GreaterEqual, int_payload(0)),
            AttributeCheck::new(1, Predicate::LessEqual, int_payload(5)),
        ];
        let mut it = layer.make_search_iterator(snap.clone(), R, checks).unwrap();
        let mut keys = collect_keys(&mut it);
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        // equality on the key attribute plans through the object namespace
        let checks = vec![AttributeCheck::new(0, Predicate::Equals, b"c".to_vec())];
        let mut it = layer.make_search_iterator(snap, R, checks).unwrap();
        assert_eq!(collect_keys(&mut it), vec![b"c".to_vec()]);
    }

    #[test]
    fn test_search_invalid_check_returns_nothing() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let value = vec![int_payload(1), b"w".to_vec()];
        layer.put(R, RegionId(0), 0, b"a", &value, 1).unwrap();

        let snap = layer.make_snapshot().unwrap();
        let checks = vec![
            AttributeCheck::new(1, Predicate::Equals, int_payload(1)),
            AttributeCheck::new(1, Predicate::Equals, int_payload(2)),
        ];
        let mut it = layer.make_search_iterator(snap, R, checks).unwrap();
        assert!(collect_keys(&mut it).is_empty());
    }

    #[test]
    fn test_snapshot_isolation_for_search() {
        let dir = tempdir().unwrap();
        let (layer, _) = open(dir.path(), TestTopology::with_kvw(vec![1]));

        let value = vec![int_payload(1), b"w".to_vec()];
        layer.put(R, RegionId(0), 0, b"a", &value, 1).unwrap();

        let snap = layer.make_snapshot().unwrap();
        layer.put(R, RegionId(0), 0, b"b", &value, 1).unwrap();

        let mut it = layer
            .make_search_iterator(
                snap,
                R,
                vec![AttributeCheck::new(1, Predicate::Equals, int_payload(1))],
            )
            .unwrap();
        assert_eq!(collect_keys(&mut it), vec![b"a".to_vec()]);
    }
}
