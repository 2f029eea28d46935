//! Named POSIX shared memory region backing one loader.
//!
//! The loader creates the region (`shm_open` with `O_EXCL`, so duplicate
//! names are rejected), sizes it from the computed layout, and initializes
//! the header, semaphores, slot metadata, and free rings before any worker
//! can observe it. Workers in unrelated processes re-attach by name and
//! validate the magic, version, and geometry before use, exactly as they
//! would any foreign mapping.
//!
//! The mapping address differs between processes; all accessors resolve
//! offsets from [`crate::layout::RegionLayout`] against the local base.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::Ordering;

use memmap2::MmapRaw;
use tracing::info;

use crate::constants::{MAX_REGION_NAME_LEN, PATH_CAP};
use crate::error::{Error, Result};
use crate::layout::{RegionHeader, RegionLayout, RingKind, WorkerHeader, REGION_MAGIC, REGION_VERSION};
use crate::ring::IndexRing;
use crate::sem::SharedSemaphore;
use crate::slot::SlotMeta;

/// One mapped loader region.
///
/// The creating process owns the name and unlinks it when the region
/// drops; attached processes only unmap.
#[derive(Debug)]
pub struct ShmRegion {
    map: MmapRaw,
    name: CString,
    owner: bool,
    layout: RegionLayout,
}

// All shared state inside the mapping is atomics, semaphores, and
// handshake-protected slots; the struct itself is freely shareable.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn region_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() < 2 {
        return Err(Error::region(format!(
            "region name {name:?} must be of the form \"/name\""
        )));
    }
    if name.len() > MAX_REGION_NAME_LEN {
        return Err(Error::region(format!(
            "region name {name:?} exceeds {MAX_REGION_NAME_LEN} bytes"
        )));
    }
    CString::new(name).map_err(|_| Error::region("region name contains a NUL byte"))
}

fn shm_open(name: &CString, flags: libc::c_int) -> Result<File> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::mode_t) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EEXIST) => Error::region(format!(
                "region {:?} already exists; unlink the stale segment or pick another name",
                name
            )),
            Some(libc::ENOENT) => Error::region(format!("region {name:?} does not exist")),
            _ => Error::Io(err),
        });
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

impl ShmRegion {
    /// Create and fully initialize a region for the given layout.
    pub fn create(name: &str, layout: RegionLayout) -> Result<Self> {
        let cname = region_name(name)?;
        let file = shm_open(&cname, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;

        // ftruncate zero-fills, so counters, states, and lengths all start
        // at their initial values for free.
        file.set_len(layout.total_size as u64)?;
        let map = MmapRaw::map_raw(&file)?;

        let region = Self { map, name: cname, owner: true, layout };
        region.init_contents()?;

        info!(
            name,
            n_workers = layout.n_workers,
            queue_depth = layout.queue_depth,
            max_file_size = layout.max_file_size,
            total_size = layout.total_size,
            "created loader region"
        );
        Ok(region)
    }

    /// Attach to an existing region by name, deriving and validating the
    /// geometry from its header.
    pub fn attach(name: &str) -> Result<Self> {
        let cname = region_name(name)?;
        let file = shm_open(&cname, libc::O_RDWR)?;
        let mapped_len = file.metadata()?.len() as usize;
        if mapped_len < std::mem::size_of::<RegionHeader>() {
            return Err(Error::region(format!(
                "region {name:?} is {mapped_len} bytes, smaller than the header"
            )));
        }
        let map = MmapRaw::map_raw(&file)?;

        let header = unsafe { &*(map.as_mut_ptr() as *const RegionHeader) };
        if header.magic != REGION_MAGIC {
            return Err(Error::region(format!("region {name:?} has wrong magic")));
        }
        if header.version != REGION_VERSION {
            return Err(Error::region(format!(
                "region {name:?} has version {}, expected {REGION_VERSION}",
                header.version
            )));
        }
        if header.path_cap as usize != PATH_CAP {
            return Err(Error::region(format!(
                "region {name:?} was built with path capacity {}, expected {PATH_CAP}",
                header.path_cap
            )));
        }

        let layout = RegionLayout::compute(header.n_workers, header.queue_depth, header.max_file_size);
        if layout.ring_cap != header.ring_cap || layout.total_size != mapped_len {
            return Err(Error::region(format!(
                "region {name:?} geometry does not match its header"
            )));
        }

        Ok(Self { map, name: cname, owner: false, layout })
    }

    /// Write the header, initialize every semaphore, stamp slot owners,
    /// and fill each worker's free ring with its slot partition.
    fn init_contents(&self) -> Result<()> {
        let layout = self.layout;
        unsafe {
            let header = self.base() as *mut RegionHeader;
            std::ptr::addr_of_mut!((*header).magic).write(REGION_MAGIC);
            std::ptr::addr_of_mut!((*header).version).write(REGION_VERSION);
            std::ptr::addr_of_mut!((*header).n_workers).write(layout.n_workers);
            std::ptr::addr_of_mut!((*header).queue_depth).write(layout.queue_depth);
            std::ptr::addr_of_mut!((*header).ring_cap).write(layout.ring_cap);
            std::ptr::addr_of_mut!((*header).path_cap).write(PATH_CAP as u32);
            std::ptr::addr_of_mut!((*header).max_file_size).write(layout.max_file_size);
            SharedSemaphore::init(std::ptr::addr_of_mut!((*header).wakeup))
                .map_err(Error::Io)?;
        }

        for w in 0..layout.n_workers {
            unsafe {
                let wh = self.base().add(layout.worker_offset(w)) as *mut WorkerHeader;
                SharedSemaphore::init(std::ptr::addr_of_mut!((*wh).done)).map_err(Error::Io)?;
            }
            for slot in layout.slot_range(w) {
                unsafe {
                    SlotMeta::init(
                        self.base().add(layout.slot_meta_offset(slot)) as *mut SlotMeta,
                        w,
                    );
                }
            }
            let free = self.ring(w, RingKind::Free);
            for slot in layout.slot_range(w) {
                free.push(slot);
            }
        }
        Ok(())
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("<non-utf8>")
    }

    /// Region header, including the abort flag and wakeup semaphore.
    pub fn header(&self) -> &RegionHeader {
        unsafe { &*(self.base() as *const RegionHeader) }
    }

    /// Worker `w`'s coordination block.
    pub fn worker(&self, worker: u32) -> &WorkerHeader {
        debug_assert!(worker < self.layout.n_workers);
        unsafe { &*(self.base().add(self.layout.worker_offset(worker)) as *const WorkerHeader) }
    }

    /// A handle over one of worker `w`'s rings.
    pub fn ring(&self, worker: u32, kind: RingKind) -> IndexRing {
        let wh = self.worker(worker);
        let counters = match kind {
            RingKind::Submit => &wh.submit,
            RingKind::Complete => &wh.complete,
            RingKind::Free => &wh.free,
        };
        let slots = unsafe { self.base().add(self.layout.ring_array_offset(worker, kind)) };
        unsafe { IndexRing::from_raw(counters, slots as *mut u32, self.layout.ring_cap) }
    }

    /// Metadata record for one slot.
    pub fn slot_meta(&self, slot: u32) -> &SlotMeta {
        debug_assert!(slot < self.layout.n_slots());
        unsafe { &*(self.base().add(self.layout.slot_meta_offset(slot)) as *const SlotMeta) }
    }

    /// Base address of a slot's data buffer. Stable for the lifetime of
    /// the mapping; the kernel holds it across the asynchronous read.
    pub fn buffer_ptr(&self, slot: u32) -> *mut u8 {
        debug_assert!(slot < self.layout.n_slots());
        unsafe { self.base().add(self.layout.buffer_offset(slot)) }
    }

    /// The first `len` bytes of a slot's buffer.
    ///
    /// Caller must hold the slot `Borrowed` (worker side) so the loader
    /// cannot be writing concurrently.
    pub fn buffer(&self, slot: u32, len: usize) -> &[u8] {
        debug_assert!(len as u64 <= self.layout.max_file_size);
        unsafe { std::slice::from_raw_parts(self.buffer_ptr(slot), len) }
    }

    /// True once the loader has begun shutdown.
    pub fn aborted(&self) -> bool {
        self.header().abort.load(Ordering::Acquire) != 0
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner {
            unsafe {
                let header = self.base() as *mut RegionHeader;
                SharedSemaphore::destroy(std::ptr::addr_of_mut!((*header).wakeup));
                for w in 0..self.layout.n_workers {
                    let wh = self.base().add(self.layout.worker_offset(w)) as *mut WorkerHeader;
                    SharedSemaphore::destroy(std::ptr::addr_of_mut!((*wh).done));
                }
                // A second unlink (e.g. both sides of a fork owning the
                // region) reports ENOENT; that is fine.
                libc::shm_unlink(self.name.as_ptr());
            }
            info!(name = self.name(), "unlinked loader region");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotState;

    fn unique_name(tag: &str) -> String {
        format!("/sluice-test-{}-{}", std::process::id(), tag)
    }

    #[test]
    fn test_create_rejects_duplicate_name() {
        let name = unique_name("dup");
        let layout = RegionLayout::compute(1, 2, 4096);
        let _region = ShmRegion::create(&name, layout).unwrap();
        let err = ShmRegion::create(&name, layout).unwrap_err();
        assert!(matches!(err, Error::Region { .. }), "got {err}");
    }

    #[test]
    fn test_unlink_frees_the_name() {
        let name = unique_name("relink");
        let layout = RegionLayout::compute(1, 2, 4096);
        drop(ShmRegion::create(&name, layout).unwrap());
        // After the owner drops, the name is available again.
        drop(ShmRegion::create(&name, layout).unwrap());
    }

    #[test]
    fn test_attach_missing_region_fails() {
        let err = ShmRegion::attach(&unique_name("missing")).unwrap_err();
        assert!(matches!(err, Error::Region { .. }));
    }

    #[test]
    fn test_bad_names_rejected() {
        let layout = RegionLayout::compute(1, 1, 4096);
        for bad in ["no-slash", "/", "/a/b"] {
            assert!(ShmRegion::create(bad, layout).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_attach_sees_creator_geometry() {
        let name = unique_name("geometry");
        let layout = RegionLayout::compute(2, 3, 8192);
        let created = ShmRegion::create(&name, layout).unwrap();
        let attached = ShmRegion::attach(&name).unwrap();
        assert_eq!(attached.layout().n_workers, 2);
        assert_eq!(attached.layout().queue_depth, 3);
        assert_eq!(attached.layout().ring_cap, 4);
        assert_eq!(attached.layout().max_file_size, 8192);
        assert_eq!(attached.layout().total_size, created.layout().total_size);
        drop(attached);
        drop(created);
    }

    #[test]
    fn test_free_rings_hold_the_partition() {
        let name = unique_name("freepool");
        let layout = RegionLayout::compute(2, 4, 4096);
        let region = ShmRegion::create(&name, layout).unwrap();
        for w in 0..2 {
            let free = region.ring(w, RingKind::Free);
            let mut drained = Vec::new();
            while let Some(slot) = free.pop() {
                assert_eq!(region.slot_meta(slot).owner(), w);
                drained.push(slot);
            }
            assert_eq!(drained, layout.slot_range(w).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_shared_writes_visible_through_attach() {
        let name = unique_name("visible");
        let layout = RegionLayout::compute(1, 2, 4096);
        let created = ShmRegion::create(&name, layout).unwrap();
        let attached = ShmRegion::attach(&name).unwrap();

        assert!(created.slot_meta(0).transition(SlotState::Free, SlotState::Pending));
        assert_eq!(attached.slot_meta(0).state(), SlotState::Pending as u32);

        created.slot_meta(1).set_path(b"/some/file");
        assert_eq!(attached.slot_meta(1).path(), b"/some/file");
    }
}
