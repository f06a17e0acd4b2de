//! Value paging: the swap file and its worker pool.
//!
//! The swap file is a fixed grid of pages. A bit-per-page map tracks
//! occupancy; allocation scans linearly from a rolling cursor and
//! jumps to a random position when the neighborhood gets crowded, so
//! concurrent allocate/free churn does not keep hammering one region.
//!
//! Disk work happens on plain OS threads (reading or writing a value
//! is blocking, CPU-light I/O that would stall the executor). Jobs
//! move across three queues — new, processing, processed — behind one
//! mutex; a worker pops, executes, pushes, then nudges the executor
//! over the completion channel. The executor alone touches the page
//! bitmap and the keyspace, so commits need no further locking.
//!
//! Only string payloads are paged. The on-disk form of a value is the
//! snapshot string encoding (uncompressed), so a page run is
//! self-describing: the length prefix tells the loader where the
//! value ends inside the padded final page.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use bit_vec::BitVec;
use bytes::Bytes;
use cinder_core::SwapPtr;
use cinder_persistence::length;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::EngineEvent;
use crate::config::VmConfig;

/// Allocations served near the cursor before it jumps somewhere
/// random to spread load across the file.
const NEAR_ALLOC_LIMIT: usize = 4096;

/// Poll interval while waiting out a job that a worker is executing.
const CANCEL_SPIN: Duration = Duration::from_micros(50);

/// Outstanding swap-out jobs allowed at once.
pub const MAX_INFLIGHT_SWAPS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Trial-serialize to learn the page count.
    PrepareSwap,
    /// Write the payload to its allocated pages.
    DoSwap,
    /// Read the payload back.
    Load,
}

/// One unit of background I/O, keyed to a (db, key) pair.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub db: usize,
    pub key: Bytes,
    /// Payload being swapped out (PrepareSwap / DoSwap).
    pub payload: Option<Bytes>,
    /// Target pages (DoSwap after allocation, Load always).
    pub ptr: Option<SwapPtr>,
    /// Page count computed by PrepareSwap.
    pub pages: u32,
    /// Payload read back by Load.
    pub loaded: Option<Bytes>,
    pub canceled: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct Queues {
    new: VecDeque<Job>,
    processing: Vec<u64>,
    processed: Vec<Job>,
}

struct Shared {
    queues: Mutex<Queues>,
    available: Condvar,
}

/// Executor-side handle to the paging subsystem.
pub struct Vm {
    pub max_memory: usize,
    page_size: usize,
    page_count: usize,
    file: Arc<File>,
    shared: Arc<Shared>,
    bitmap: BitVec,
    used_pages: usize,
    cursor: usize,
    near_allocs: usize,
    next_job_id: u64,
    /// (db, key) → job id for every job not yet committed.
    in_flight: AHashMap<(usize, Bytes), u64>,
    inflight_swaps: usize,
    pub swapped_keys: usize,
    pub swap_outs: u64,
    pub swap_ins: u64,
}

impl Vm {
    /// Creates the swap file, sizes it, and starts the worker pool.
    pub fn start(cfg: &VmConfig, events: mpsc::UnboundedSender<EngineEvent>) -> io::Result<Vm> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&cfg.swap_file)?;
        file.set_len((cfg.page_size * cfg.pages) as u64)?;
        info!(
            file = %cfg.swap_file.display(),
            pages = cfg.pages,
            page_size = cfg.page_size,
            threads = cfg.max_threads,
            "value paging enabled"
        );

        let file = Arc::new(file);
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            available: Condvar::new(),
        });

        for worker in 0..cfg.max_threads {
            let file = Arc::clone(&file);
            let shared = Arc::clone(&shared);
            let events = events.clone();
            let page_size = cfg.page_size;
            std::thread::Builder::new()
                .name(format!("cinder-vm-{worker}"))
                .spawn(move || worker_loop(file, shared, page_size, events))?;
        }

        Ok(Vm {
            max_memory: cfg.max_memory,
            page_size: cfg.page_size,
            page_count: cfg.pages,
            file,
            shared,
            bitmap: BitVec::from_elem(cfg.pages, false),
            used_pages: 0,
            cursor: 0,
            near_allocs: 0,
            next_job_id: 0,
            in_flight: AHashMap::new(),
            inflight_swaps: 0,
            swapped_keys: 0,
            swap_outs: 0,
            swap_ins: 0,
        })
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn inflight_swaps(&self) -> usize {
        self.inflight_swaps
    }

    /// Whether a job is outstanding for this key.
    pub fn has_job(&self, db: usize, key: &[u8]) -> bool {
        self.in_flight.contains_key(&(db, Bytes::copy_from_slice(key)))
    }

    /// Queues a PrepareSwap for a payload the executor just marked
    /// `Swapping`.
    pub fn queue_swap_out(&mut self, db: usize, key: Bytes, payload: Bytes) {
        let job = self.new_job(JobKind::PrepareSwap, db, key, Some(payload), None);
        self.inflight_swaps += 1;
        self.push_job(job);
    }

    /// Queues a Load for a key the executor just marked `Loading`.
    pub fn queue_load(&mut self, db: usize, key: Bytes, ptr: SwapPtr) {
        let job = self.new_job(JobKind::Load, db, key, None, Some(ptr));
        self.push_job(job);
    }

    /// Re-queues a completed PrepareSwap as a DoSwap on `ptr`.
    pub fn requeue_as_swap(&mut self, mut job: Job, ptr: SwapPtr) {
        job.kind = JobKind::DoSwap;
        job.ptr = Some(ptr);
        self.in_flight.insert((job.db, job.key.clone()), job.id);
        self.push_job(job);
    }

    fn new_job(
        &mut self,
        kind: JobKind,
        db: usize,
        key: Bytes,
        payload: Option<Bytes>,
        ptr: Option<SwapPtr>,
    ) -> Job {
        self.next_job_id += 1;
        let id = self.next_job_id;
        self.in_flight.insert((db, key.clone()), id);
        Job {
            id,
            kind,
            db,
            key,
            payload,
            ptr,
            pages: 0,
            loaded: None,
            canceled: false,
            error: None,
        }
    }

    fn push_job(&mut self, job: Job) {
        let mut queues = self.shared.queues.lock().expect("vm queue poisoned");
        queues.new.push_back(job);
        drop(queues);
        self.shared.available.notify_one();
    }

    /// Pulls every completed job off the processed queue. The caller
    /// commits each one (and must call [`Self::job_committed`]).
    pub fn drain_processed(&mut self) -> Vec<Job> {
        let mut queues = self.shared.queues.lock().expect("vm queue poisoned");
        std::mem::take(&mut queues.processed)
    }

    /// Bookkeeping after the executor committed (or discarded) a job.
    /// Canceled jobs were already accounted for by [`Self::cancel`].
    pub fn job_committed(&mut self, job: &Job) {
        // a PrepareSwap that gets rebranded keeps its in_flight slot
        if job.kind != JobKind::PrepareSwap || job.canceled || job.error.is_some() {
            self.in_flight.remove(&(job.db, job.key.clone()));
        }
        if !job.canceled
            && (job.kind == JobKind::DoSwap
                || (job.kind == JobKind::PrepareSwap && job.error.is_some()))
        {
            self.inflight_swaps = self.inflight_swaps.saturating_sub(1);
        }
    }

    /// Cancels the in-flight job for a key, if any. A job still on
    /// the new queue is returned to the caller; one that a worker
    /// holds is waited out and marked canceled on the processed
    /// queue (the drain loop frees its pages and drops it).
    pub fn cancel(&mut self, db: usize, key: &[u8]) -> Option<Job> {
        let id = self
            .in_flight
            .remove(&(db, Bytes::copy_from_slice(key)))?;

        loop {
            let mut queues = self.shared.queues.lock().expect("vm queue poisoned");

            if let Some(pos) = queues.new.iter().position(|j| j.id == id) {
                let job = queues.new.remove(pos).expect("position just found");
                drop(queues);
                if matches!(job.kind, JobKind::PrepareSwap | JobKind::DoSwap) {
                    self.inflight_swaps = self.inflight_swaps.saturating_sub(1);
                }
                return Some(job);
            }
            if let Some(job) = queues.processed.iter_mut().find(|j| j.id == id) {
                job.canceled = true;
                if matches!(job.kind, JobKind::PrepareSwap | JobKind::DoSwap) {
                    self.inflight_swaps = self.inflight_swaps.saturating_sub(1);
                }
                return None;
            }
            if !queues.processing.contains(&id) {
                // committed between our unlock windows
                return None;
            }
            // a worker holds it: wait for it to reach processed
            drop(queues);
            std::thread::sleep(CANCEL_SPIN);
        }
    }

    /// Finds `n` contiguous free pages, scanning from the cursor and
    /// wrapping once. Marks them used.
    pub fn alloc_pages(&mut self, n: u32) -> Option<u32> {
        let n = n as usize;
        if n == 0 || n > self.page_count {
            return None;
        }

        self.near_allocs += 1;
        if self.near_allocs >= NEAR_ALLOC_LIMIT {
            self.near_allocs = 0;
            self.cursor = rand::rng().random_range(0..self.page_count);
        }

        let mut base = self.cursor;
        let mut scanned = 0;
        while scanned < self.page_count {
            // a run crossing the end of the file cannot be contiguous
            if base + n > self.page_count {
                scanned += self.page_count - base;
                base = 0;
                continue;
            }
            match (0..n).position(|i| self.bitmap[base + i]) {
                None => {
                    for i in 0..n {
                        self.bitmap.set(base + i, true);
                    }
                    self.used_pages += n;
                    self.cursor = (base + n) % self.page_count;
                    return Some(base as u32);
                }
                Some(hit) => {
                    scanned += hit + 1;
                    base += hit + 1;
                }
            }
        }
        None
    }

    /// Returns a page run to the free pool.
    pub fn free_pages(&mut self, ptr: SwapPtr) {
        for i in 0..ptr.pages {
            let page = (ptr.page + i) as usize;
            debug_assert!(self.bitmap[page], "double free of page {page}");
            self.bitmap.set(page, false);
        }
        self.used_pages = self.used_pages.saturating_sub(ptr.pages as usize);
    }

    /// Pages needed to hold a payload in serialized form.
    pub fn pages_for(&self, payload: &[u8]) -> u32 {
        pages_for_len(serialized_len(payload), self.page_size)
    }

    /// Synchronous read of a swapped value, bypassing the workers.
    /// Used for snapshot writing and the blocking fallback load.
    pub fn read_direct(&self, ptr: SwapPtr) -> io::Result<Bytes> {
        read_value(&self.file, ptr, self.page_size)
    }

    /// Synchronous write used by the blocking (non-threaded) paths.
    pub fn write_direct(&self, ptr: SwapPtr, payload: &[u8]) -> io::Result<()> {
        write_value(&self.file, ptr, self.page_size, payload)
    }
}

fn pages_for_len(len: usize, page_size: usize) -> u32 {
    (len.div_ceil(page_size)) as u32
}

/// Serialized footprint: snapshot string encoding, no compression.
fn serialized_len(payload: &[u8]) -> usize {
    let mut counter = CountingWriter(0);
    length::write_string(&mut counter, payload, false).expect("counting writer is infallible");
    counter.0
}

struct CountingWriter(usize);

impl io::Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_value(file: &File, ptr: SwapPtr, page_size: usize, payload: &[u8]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(ptr.pages as usize * page_size);
    length::write_string(&mut buf, payload, false)?;
    buf.resize(ptr.pages as usize * page_size, 0);
    file.write_all_at(&buf, ptr.page as u64 * page_size as u64)
}

fn read_value(file: &File, ptr: SwapPtr, page_size: usize) -> io::Result<Bytes> {
    let mut buf = vec![0u8; ptr.pages as usize * page_size];
    file.read_exact_at(&mut buf, ptr.page as u64 * page_size as u64)?;
    let value = length::read_string(&mut Cursor::new(&buf[..]))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(Bytes::from(value))
}

fn worker_loop(
    file: Arc<File>,
    shared: Arc<Shared>,
    page_size: usize,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    loop {
        let mut job = {
            let mut queues = shared.queues.lock().expect("vm queue poisoned");
            loop {
                if let Some(job) = queues.new.pop_front() {
                    queues.processing.push(job.id);
                    break job;
                }
                queues = shared
                    .available
                    .wait(queues)
                    .expect("vm queue poisoned");
            }
        };

        match job.kind {
            JobKind::PrepareSwap => {
                let payload = job.payload.as_deref().unwrap_or_default();
                job.pages = pages_for_len(serialized_len(payload), page_size);
            }
            JobKind::DoSwap => {
                let ptr = job.ptr.expect("DoSwap carries allocated pages");
                let payload = job.payload.as_deref().unwrap_or_default();
                if let Err(e) = write_value(&file, ptr, page_size, payload) {
                    error!(key = ?job.key, "swap write failed: {e}");
                    job.error = Some(e.to_string());
                }
            }
            JobKind::Load => {
                let ptr = job.ptr.expect("Load carries the source pages");
                match read_value(&file, ptr, page_size) {
                    Ok(data) => job.loaded = Some(data),
                    Err(e) => {
                        error!(key = ?job.key, "swap read failed: {e}");
                        job.error = Some(e.to_string());
                    }
                }
            }
        }

        debug!(id = job.id, kind = ?job.kind, "vm job done");
        let mut queues = shared.queues.lock().expect("vm queue poisoned");
        queues.processing.retain(|&id| id != job.id);
        queues.processed.push(job);
        drop(queues);

        // self-pipe rendition: nudge the executor to drain processed
        if events.send(EngineEvent::VmWake).is_err() {
            return; // engine gone, shut the pool down
        }
    }
}
