//! Fence & completion tracking
//!
//! Every submission gets a sequence number and a [`Fence`]. Fences move from
//! pending to signalled exactly once, either when the device reports the
//! sequence number complete or when the device is lost.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bitflags::bitflags;
use tracing::{debug, info, trace, warn};

use crate::device::Device;
use crate::error::Error;
use crate::time::{has_elapsed, now_nanoseconds, Deadline, Timeout};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FenceFlags: u32 {
        /// Command execution finished.
        const EXEC = 1 << 0;
        /// Query results referenced by the submission are written.
        const QUERY = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Signalled,
    /// Force-signalled because the device stopped accepting work.
    DeviceLost,
}

#[derive(Debug)]
struct FenceInner {
    seqno: u64,
    flags: FenceFlags,
    status: Mutex<FenceStatus>,
}

impl FenceInner {
    fn status(&self) -> MutexGuard<'_, FenceStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pending -> `status`. Later signals are ignored.
    fn signal(&self, status: FenceStatus) -> bool {
        let mut current = self.status();
        if *current != FenceStatus::Pending {
            return false;
        }
        *current = status;
        true
    }
}

/// Completion handle of one submission. Clones share the same fence;
/// dropping the last clone releases it.
#[derive(Debug, Clone)]
pub struct Fence(Arc<FenceInner>);

impl Fence {
    pub fn seqno(&self) -> u64 {
        self.0.seqno
    }

    pub fn flags(&self) -> FenceFlags {
        self.0.flags
    }

    pub fn status(&self) -> FenceStatus {
        *self.0.status()
    }

    pub fn is_signalled(&self) -> bool {
        self.status() != FenceStatus::Pending
    }

    /// Whether both handles refer to the same submission.
    pub fn same_as(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Issues fences and resolves them against device completion.
pub struct FenceTracker {
    next_seqno: AtomicU64,
    pending: Mutex<BTreeMap<u64, Weak<FenceInner>>>,
    lost: AtomicBool,
    /// Log creation, completion and waits at info level.
    verbose: bool,
}

impl Default for FenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceTracker {
    pub fn new() -> Self {
        Self {
            next_seqno: AtomicU64::new(1),
            pending: Mutex::new(BTreeMap::new()),
            lost: AtomicBool::new(false),
            verbose: false,
        }
    }

    /// Log fence traffic at info level instead of trace.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    pub fn is_logging(&self) -> bool {
        self.verbose
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<u64, Weak<FenceInner>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the sequence number of the next submission.
    pub fn next_seqno(&self) -> u64 {
        self.next_seqno.fetch_add(1, Ordering::AcqRel)
    }

    /// Fence for a submission the device accepted.
    pub fn create(&self, seqno: u64, flags: FenceFlags) -> Fence {
        let inner = Arc::new(FenceInner {
            seqno,
            flags,
            status: Mutex::new(FenceStatus::Pending),
        });
        if self.lost.load(Ordering::Acquire) {
            inner.signal(FenceStatus::DeviceLost);
        } else {
            self.pending().insert(seqno, Arc::downgrade(&inner));
        }
        if self.verbose {
            info!("Fence {} created ({:?})", seqno, flags);
        } else {
            trace!("Fence {} created ({:?})", seqno, flags);
        }
        Fence(inner)
    }

    /// Signal every pending fence the device reports complete.
    pub fn update(&self, device: &dyn Device) {
        match device.completed_seqno() {
            Ok(completed) => self.signal_through(completed),
            Err(Error::DeviceLost) => self.device_lost(),
            Err(e) => warn!("Failed to query fence completion: {}", e),
        }
    }

    fn signal_through(&self, completed: u64) {
        let mut pending = self.pending();
        let still_pending = pending.split_off(&(completed + 1));
        let done = std::mem::replace(&mut *pending, still_pending);
        drop(pending);

        for (seqno, fence) in done {
            if let Some(fence) = fence.upgrade() {
                if !fence.signal(FenceStatus::Signalled) {
                    continue;
                }
                if self.verbose {
                    info!("Fence {} signalled", seqno);
                } else {
                    trace!("Fence {} signalled", seqno);
                }
            }
        }
    }

    /// Force-signal every pending fence. Nothing is pending afterwards and
    /// new fences are born signalled.
    pub fn device_lost(&self) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = std::mem::take(&mut *self.pending());
        warn!("Device lost, force-signalling {} fences", drained.len());
        for fence in drained.into_values().filter_map(|f| f.upgrade()) {
            fence.signal(FenceStatus::DeviceLost);
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Number of fences still waiting on the device.
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending();
        pending.retain(|_, f| f.strong_count() > 0);
        pending.len()
    }

    /// Non-blocking completion check.
    pub fn poll(&self, fence: &Fence, device: &dyn Device) -> bool {
        if fence.is_signalled() {
            return true;
        }
        self.update(device);
        fence.is_signalled()
    }

    /// Block until the fence signals or the timeout passes. A zero relative
    /// timeout is a poll.
    pub fn wait(&self, fence: &Fence, device: &dyn Device, timeout: Timeout) -> bool {
        if timeout.is_poll() {
            return self.poll(fence, device);
        }

        let (start, deadline) = timeout.window(now_nanoseconds());
        if let Deadline::At(end) = deadline {
            // an absolute deadline already behind us only reports status
            if matches!(timeout, Timeout::Absolute(_)) && end <= start {
                return self.poll(fence, device);
            }
        }

        if self.verbose {
            info!("Waiting for fence {} ({:?})", fence.seqno(), timeout);
        } else {
            debug!("Waiting for fence {} ({:?})", fence.seqno(), timeout);
        }
        loop {
            if self.poll(fence, device) {
                return true;
            }
            let slice = match deadline {
                Deadline::Never => None,
                Deadline::At(end) => {
                    if has_elapsed(start, end, now_nanoseconds()) {
                        debug!("Wait for fence {} timed out", fence.seqno());
                        return false;
                    }
                    deadline.remaining()
                }
            };
            match device.wait_seqno(fence.seqno(), slice) {
                Ok(_) => {}
                Err(Error::DeviceLost) => self.device_lost(),
                Err(e) => {
                    warn!("Fence wait failed: {}", e);
                    return self.poll(fence, device);
                }
            }
        }
    }
}
