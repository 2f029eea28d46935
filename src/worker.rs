//! Worker-side endpoint: submitting requests and consuming completions.

use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::constants::PATH_CAP;
use crate::error::{Error, Result};
use crate::layout::RingKind;
use crate::shm::ShmRegion;
use crate::slot::{LoadStatus, SlotState};

/// Per-worker endpoint over the shared region.
///
/// A `Worker` is a single-threaded handle: one thread calls [`request`],
/// [`wait_get`], and releases entries in arbitrary interleavings. It may be
/// moved to another thread or inherited across `fork`, but never shared.
///
/// Backpressure is explicit: [`request`] returns `Ok(false)` once all
/// `queue_depth` slots are in flight or borrowed, and the caller drains
/// completions before retrying. There is no blocking request.
///
/// [`request`]: Worker::request
/// [`wait_get`]: Worker::wait_get
pub struct Worker {
    region: Arc<ShmRegion>,
    id: u32,
    // Endpoints are handed out per worker id; the rings they touch are
    // strictly single-producer/single-consumer.
    _not_sync: PhantomData<*mut ()>,
}

unsafe impl Send for Worker {}

impl Worker {
    pub(crate) fn new(region: Arc<ShmRegion>, id: u32) -> Result<Self> {
        let n_workers = region.layout().n_workers;
        if id >= n_workers {
            return Err(Error::WorkerOutOfRange { id, n_workers });
        }
        Ok(Self { region, id, _not_sync: PhantomData })
    }

    /// Attach to a loader's region from an unrelated process.
    ///
    /// Validates the region's magic, version, and geometry before handing
    /// out the endpoint.
    pub fn attach(region_name: &str, id: u32) -> Result<Self> {
        let region = ShmRegion::attach(region_name)?;
        info!(name = region_name, worker = id, "attached worker context");
        Self::new(Arc::new(region), id)
    }

    /// Worker id within the region.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Slots currently available for [`Worker::request`].
    pub fn free_slots(&self) -> u64 {
        self.region.ring(self.id, RingKind::Free).len()
    }

    /// Submit a load request for `path`.
    ///
    /// Returns `Ok(false)` when every slot is in flight or borrowed; the
    /// caller must consume completions before retrying. Never blocks.
    pub fn request<P: AsRef<Path>>(&self, path: P) -> Result<bool> {
        let bytes = path.as_ref().as_os_str().as_bytes();
        if bytes.len() > PATH_CAP {
            return Err(Error::PathTooLong { len: bytes.len(), cap: PATH_CAP });
        }
        if self.region.aborted() {
            return Err(Error::Aborted);
        }

        let Some(slot) = self.region.ring(self.id, RingKind::Free).pop() else {
            return Ok(false);
        };

        let meta = self.region.slot_meta(slot);
        assert!(
            meta.transition(SlotState::Free, SlotState::Pending),
            "slot {slot} left the free pool in a non-free state"
        );
        meta.set_path(bytes);

        self.region.ring(self.id, RingKind::Submit).push(slot);
        self.region.header().wakeup.post();
        Ok(true)
    }

    /// Block until a completion is available and return it.
    ///
    /// Completions arrive in the order the loader finished them, not the
    /// order this worker submitted them; correlate by [`Entry::filepath`].
    /// Returns [`Error::Aborted`] once the loader has shut down and no
    /// undelivered completion remains.
    pub fn wait_get(&self) -> Result<Entry<'_>> {
        let done = &self.region.worker(self.id).done;
        let completions = self.region.ring(self.id, RingKind::Complete);
        loop {
            done.wait();
            if let Some(slot) = completions.pop() {
                let meta = self.region.slot_meta(slot);
                assert!(
                    meta.transition(SlotState::Completed, SlotState::Borrowed),
                    "slot {slot} published on the completion ring in a non-completed state"
                );
                return Ok(Entry { worker: self, slot, released: false });
            }
            if self.region.aborted() {
                return Err(Error::Aborted);
            }
            // Spurious wakeup: the semaphore can run ahead of the ring
            // during shutdown races. Go back to sleep.
        }
    }
}

/// A completed request, borrowing its slot until released.
///
/// The data and filepath views are valid only while the entry is alive.
/// [`Entry::release`] (or drop) returns the slot to the worker's free
/// pool; the buffer may then be rewritten by a later request.
pub struct Entry<'w> {
    worker: &'w Worker,
    slot: u32,
    released: bool,
}

impl Entry<'_> {
    /// Path this request named, as submitted.
    pub fn filepath(&self) -> &Path {
        let meta = self.worker.region.slot_meta(self.slot);
        Path::new(std::ffi::OsStr::from_bytes(meta.path()))
    }

    /// The loaded bytes. Empty on open or read failure.
    pub fn data(&self) -> &[u8] {
        self.worker.region.buffer(self.slot, self.len())
    }

    /// Number of valid bytes in [`Entry::data`].
    pub fn len(&self) -> usize {
        self.worker.region.slot_meta(self.slot).data_len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Result status of the request.
    pub fn status(&self) -> LoadStatus {
        self.worker.region.slot_meta(self.slot).status()
    }

    /// Return the slot to the free pool. Dropping the entry does the
    /// same; this form just makes the handoff explicit at call sites.
    pub fn release(self) {
        // Drop runs release_slot.
    }

    fn release_slot(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let meta = self.worker.region.slot_meta(self.slot);
        assert!(
            meta.transition(SlotState::Borrowed, SlotState::Free),
            "slot {} released while not borrowed",
            self.slot
        );
        self.worker.region.ring(self.worker.id, RingKind::Free).push(self.slot);
    }
}

impl Drop for Entry<'_> {
    fn drop(&mut self) {
        self.release_slot();
    }
}

impl std::fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("filepath", &self.filepath())
            .field("len", &self.len())
            .field("status", &self.status())
            .finish()
    }
}
