//! The loader: region ownership and the batched dispatch loop.
//!
//! One loader process services every worker. Its single dispatch thread
//! alternates three phases per iteration:
//!
//! 1. **Harvest** — round-robin over worker submission rings, opening each
//!    requested file and staging an `opcode::Read` against the slot's
//!    buffer. Open failures short-circuit into synthetic completions.
//! 2. **Dispatch** — staged reads accumulate until `min_dispatch` is
//!    reached or `max_idle_iters` iterations pass without a submit, then
//!    the whole batch goes to the kernel in one syscall. The idle counter
//!    resets on every submit, so no staged read waits forever.
//! 3. **Reap** — non-blocking drain of the completion queue: record the
//!    result in the slot, close the fd, publish the slot on the owning
//!    worker's completion ring, and post its semaphore.
//!
//! When all three phases come up empty the loop parks briefly on the
//! wakeup semaphore that workers post on every `request`.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use io_uring::{opcode, squeue, types, IoUring};
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::constants::{IDLE_WAIT, URING_MAX_ENTRIES};
use crate::cpu::pin_current_thread;
use crate::error::Result;
use crate::layout::RingKind;
use crate::shm::ShmRegion;
use crate::slot::{LoadStatus, SlotState};
use crate::worker::Worker;

/// One read the kernel currently owns: where the completion goes and the
/// fd to close once it lands.
struct InFlight {
    worker: u32,
    slot: u32,
    file: File,
    file_len: u64,
}

/// Mutable state of one dispatch loop run.
struct DispatchState {
    inflight: HashMap<u64, InFlight>,
    next_token: u64,
    staged: usize,
    idle_iters: u32,
}

/// Owner of the shared region and entry point of the dispatch loop.
pub struct Loader {
    region: Arc<ShmRegion>,
    config: LoaderConfig,
}

/// Shutdown handle, cloneable and usable from any thread or any process
/// holding the region.
#[derive(Clone)]
pub struct LoaderControl {
    region: Arc<ShmRegion>,
}

impl LoaderControl {
    /// Begin shutdown: the dispatch loop abandons in-flight work, wakes
    /// every blocked `wait_get`, and returns.
    pub fn shutdown(&self) {
        self.region.header().abort.store(1, Ordering::Release);
        self.region.header().wakeup.post();
    }
}

impl Loader {
    /// Create the shared region for `config` and fully initialize it.
    ///
    /// The region name must not already exist; a stale segment from a
    /// killed loader has to be unlinked by the host first.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let region = ShmRegion::create(&config.region_name, config.layout())?;
        Ok(Self { region: Arc::new(region), config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Handle for worker `id`, sharing this process's mapping. Valid to
    /// call before or after forking the loader process.
    pub fn worker_context(&self, id: u32) -> Result<Worker> {
        Worker::new(Arc::clone(&self.region), id)
    }

    /// Shutdown handle for this region.
    pub fn control(&self) -> LoaderControl {
        LoaderControl { region: Arc::clone(&self.region) }
    }

    /// Run the dispatch loop until shutdown.
    ///
    /// Takes ownership of the io_uring instance for the life of the loop;
    /// does not return until [`LoaderControl::shutdown`] is observed.
    pub fn become_loader(&mut self) -> Result<()> {
        if let Some(cpu) = self.config.loader_cpu {
            pin_current_thread(cpu)?;
        }

        let entries = self
            .region
            .layout()
            .n_slots()
            .next_power_of_two()
            .clamp(8, URING_MAX_ENTRIES);
        let mut ring = IoUring::new(entries)?;
        let mut state = DispatchState {
            inflight: HashMap::new(),
            next_token: 0,
            staged: 0,
            idle_iters: 0,
        };
        info!(
            region = self.region.name(),
            entries,
            min_dispatch = self.config.min_dispatch,
            max_idle_iters = self.config.max_idle_iters,
            "dispatch loop starting"
        );

        loop {
            if self.region.aborted() {
                self.finish_abort(&state);
                return Ok(());
            }

            let harvested = self.harvest(&mut ring, &mut state)?;
            self.maybe_dispatch(&mut ring, &mut state)?;
            let reaped = self.reap(&mut ring, &mut state);

            if harvested == 0 && reaped == 0 {
                if state.staged == 0 && state.inflight.is_empty() {
                    // Fully idle: park until a worker posts a request or
                    // the wait times out.
                    self.region.header().wakeup.timed_wait(IDLE_WAIT);
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Phase (A): drain every worker's submission ring, open files, and
    /// stage reads. Returns how many submissions were taken.
    fn harvest(&self, ring: &mut IoUring, state: &mut DispatchState) -> Result<usize> {
        let layout = *self.region.layout();
        let mut harvested = 0;
        for w in 0..layout.n_workers {
            let submissions = self.region.ring(w, RingKind::Submit);
            while let Some(slot) = submissions.pop() {
                harvested += 1;
                // Balance the wakeup post made by this request.
                self.region.header().wakeup.try_wait();

                let meta = self.region.slot_meta(slot);
                assert!(
                    meta.transition(SlotState::Pending, SlotState::InFlight),
                    "slot {slot} submitted while not pending"
                );

                let path = Path::new(std::ffi::OsStr::from_bytes(meta.path()));
                let opened = File::open(path).and_then(|file| {
                    let len = file.metadata()?.len();
                    Ok((file, len))
                });
                match opened {
                    Ok((file, file_len)) => {
                        let token = state.next_token;
                        state.next_token += 1;
                        let read = opcode::Read::new(
                            types::Fd(file.as_raw_fd()),
                            self.region.buffer_ptr(slot),
                            layout.max_file_size as u32,
                        )
                        .offset(0)
                        .build()
                        .user_data(token);
                        self.push_sqe(ring, state, read)?;
                        state.inflight.insert(token, InFlight { worker: w, slot, file, file_len });
                        state.staged += 1;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), %err, "open failed");
                        // Synthetic completion: no read was staged.
                        meta.set_result(LoadStatus::OpenFailed, 0);
                        assert!(
                            meta.transition(SlotState::InFlight, SlotState::Completed),
                            "slot {slot} mutated while loader-owned"
                        );
                        self.publish_completion(w, slot);
                    }
                }
            }
        }
        Ok(harvested)
    }

    /// Push one staged SQE, submitting early if the queue is full. An
    /// early submit counts as a dispatch for the idle policy.
    fn push_sqe(&self, ring: &mut IoUring, state: &mut DispatchState, sqe: squeue::Entry) -> Result<()> {
        if unsafe { ring.submission().push(&sqe) }.is_ok() {
            return Ok(());
        }
        debug!(staged = state.staged, "submission queue full, flushing early");
        ring.submit()?;
        state.staged = 0;
        state.idle_iters = 0;
        unsafe { ring.submission().push(&sqe) }
            .expect("submission queue has space after submit");
        Ok(())
    }

    /// Phase (B): submit the staged batch if the policy says so.
    fn maybe_dispatch(&self, ring: &mut IoUring, state: &mut DispatchState) -> Result<()> {
        if state.staged == 0 {
            return Ok(());
        }
        let flush = self.config.dispatch_immediately()
            || state.staged >= self.config.min_dispatch
            || state.idle_iters >= self.config.max_idle_iters;
        if flush {
            debug!(staged = state.staged, idle_iters = state.idle_iters, "submitting batch");
            ring.submit()?;
            state.staged = 0;
            state.idle_iters = 0;
        } else {
            state.idle_iters += 1;
        }
        Ok(())
    }

    /// Phase (C): drain the completion queue without blocking. Returns
    /// how many completions were published.
    fn reap(&self, ring: &mut IoUring, state: &mut DispatchState) -> usize {
        let max_file_size = self.region.layout().max_file_size;
        let mut reaped = 0;
        for cqe in &mut ring.completion() {
            let Some(op) = state.inflight.remove(&cqe.user_data()) else {
                debug_assert!(false, "completion for unknown token {}", cqe.user_data());
                continue;
            };
            let meta = self.region.slot_meta(op.slot);
            let res = cqe.result();
            if res < 0 {
                warn!(
                    path = %Path::new(std::ffi::OsStr::from_bytes(meta.path())).display(),
                    errno = -res,
                    "read failed"
                );
                meta.set_result(LoadStatus::ReadFailed, 0);
            } else if op.file_len > max_file_size {
                meta.set_result(LoadStatus::Truncated, u64::from(res as u32).min(max_file_size));
            } else {
                meta.set_result(LoadStatus::Ok, u64::from(res as u32));
            }
            // Completion closes the fd.
            drop(op.file);

            assert!(
                meta.transition(SlotState::InFlight, SlotState::Completed),
                "slot {} mutated while loader-owned",
                op.slot
            );
            self.publish_completion(op.worker, op.slot);
            reaped += 1;
        }
        if reaped > 0 {
            debug!(reaped, inflight = state.inflight.len(), "reaped completions");
        }
        reaped
    }

    fn publish_completion(&self, worker: u32, slot: u32) {
        self.region.ring(worker, RingKind::Complete).push(slot);
        self.region.worker(worker).done.post();
    }

    /// Wake every potential waiter so blocked `wait_get` calls observe
    /// the abort. In-flight reads are abandoned; their fds close here.
    fn finish_abort(&self, state: &DispatchState) {
        let layout = self.region.layout();
        for w in 0..layout.n_workers {
            let done = &self.region.worker(w).done;
            for _ in 0..layout.queue_depth {
                done.post();
            }
        }
        info!(
            abandoned = state.inflight.len(),
            "dispatch loop shut down"
        );
    }
}
