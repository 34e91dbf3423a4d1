//! The background cleaner: one dedicated thread that purges obsolete
//! capture-log entries and cooperates with the pause/resume handshake used
//! by reconfiguration.
//!
//! All cleaner-adjacent state (the capture counters, pending wipe requests,
//! and the pause/shutdown flags) lives under a single mutex shared with two
//! condvars: one wakes the cleaner, the other signals the reconfigurer that
//! the pause took effect. Cleaner errors are logged and the loop continues;
//! the cleaner never takes the process down.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use tracing::{error, info};

use crate::error::Result;
use crate::keyspace::{self, TAG_TRANSFER};
use crate::schema::{CaptureId, CounterMap, Topology, TransferSink};
use crate::store::Store;

/// State guarded by the cleaner mutex.
pub(crate) struct CleanerState {
    pub counters: CounterMap,
    pub wipe_requests: BTreeSet<CaptureId>,
    pub need_cleaning: bool,
    pub need_pause: bool,
    pub paused: bool,
    pub shutdown: bool,
}

/// The mutex/condvar bundle shared between user operations, the
/// reconfigurer, and the cleaner thread.
pub(crate) struct Shared {
    pub state: Mutex<CleanerState>,
    pub wakeup_cleaner: Condvar,
    pub wakeup_reconfigurer: Condvar,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CleanerState {
                counters: CounterMap::new(),
                wipe_requests: BTreeSet::new(),
                need_cleaning: false,
                need_pause: false,
                paused: false,
                shutdown: false,
            }),
            wakeup_cleaner: Condvar::new(),
            wakeup_reconfigurer: Condvar::new(),
        }
    }
}

pub(crate) type SharedTopology = Arc<RwLock<Arc<dyn Topology>>>;

/// Starts the cleaner thread.
pub(crate) fn spawn(
    store: Arc<Store>,
    shared: Arc<Shared>,
    topology: SharedTopology,
    sink: Arc<dyn TransferSink>,
) -> JoinHandle<()> {
    std::thread::spawn(move || run(store, shared, topology, sink))
}

fn run(store: Arc<Store>, shared: Arc<Shared>, topology: SharedTopology, sink: Arc<dyn TransferSink>) {
    info!("cleanup thread started");

    loop {
        let mut wipes;
        {
            let mut state = shared.state.lock().unwrap();

            while (!state.need_cleaning && state.wipe_requests.is_empty() && !state.shutdown)
                || state.need_pause
            {
                state.paused = true;
                if state.need_pause {
                    shared.wakeup_reconfigurer.notify_one();
                }
                state = shared.wakeup_cleaner.wait(state).unwrap();
                state.paused = false;
            }

            if state.shutdown {
                break;
            }

            wipes = std::mem::take(&mut state.wipe_requests);
            state.need_cleaning = false;
        }

        match clean_pass(&store, &topology, &mut wipes) {
            Ok(wiped) => {
                for capture in wiped {
                    sink.report_wiped(capture);
                }
                // anything left in the request set had no entries on disk
                for capture in wipes {
                    sink.report_wiped(capture);
                }
            }
            Err(err) => {
                error!(error = %err, "could not clean up old transfers");
            }
        }
    }

    info!("cleanup thread shutting down");
}

/// One pass over the capture-log namespace. Streams that are dead in the
/// current configuration, or whose wipe was requested, have their entries
/// deleted; live streams are skipped whole. Returns the capture ids whose
/// entries this pass removed, reported only after the deleting transaction
/// commits.
fn clean_pass(
    store: &Store,
    topology: &SharedTopology,
    wipes: &mut BTreeSet<CaptureId>,
) -> Result<Vec<CaptureId>> {
    let txn = store.begin_write()?;
    let mut wiped = Vec::new();
    let mut to_delete: Vec<Vec<u8>> = Vec::new();

    {
        let table = store.open_table(&txn)?;
        let mut pos: Vec<u8> = vec![TAG_TRANSFER];
        let mut adopted: Option<CaptureId> = None;

        loop {
            let key = match next_key(&table, &pos)? {
                Some(key) => key,
                None => break,
            };

            let Ok((capture, _seq)) = keyspace::decode_transfer_key(&key) else {
                break; // walked off the end of the namespace
            };

            if adopted == Some(capture) {
                // successor of this exact key; entries are unique
                let mut after = key.clone();
                after.push(0x00);
                to_delete.push(key);
                pos = after;
                continue;
            }

            // transition: the previously adopted stream is fully scanned
            if let Some(done) = adopted.take() {
                wiped.push(done);
            }

            let live = topology.read().unwrap().is_captured(capture);
            let requested = wipes.remove(&capture);

            if !live || requested {
                adopted = Some(capture);
                continue;
            }

            // a live stream nobody asked to wipe: skip past it whole
            match capture.0.checked_add(1) {
                Some(next) => pos = keyspace::transfer_key(CaptureId(next), 0),
                None => break,
            }
        }

        if let Some(done) = adopted {
            wiped.push(done);
        }
    }

    if !to_delete.is_empty() {
        let mut table = store.open_table(&txn)?;
        for key in &to_delete {
            table.remove(key.as_slice())?;
        }
    }
    txn.commit()?;

    if !wiped.is_empty() {
        info!(
            streams = wiped.len(),
            entries = to_delete.len(),
            "wiped obsolete capture logs"
        );
    }
    Ok(wiped)
}

fn next_key(
    table: &redb::Table<&'static [u8], &'static [u8]>,
    pos: &[u8],
) -> Result<Option<Vec<u8>>> {
    use redb::ReadableTable;

    let mut range = table.range::<&[u8]>(pos..)?;
    match range.next() {
        None => Ok(None),
        Some(item) => {
            let (key, _) = item?;
            Ok(Some(key.value().to_vec()))
        }
    }
}
