//! Device Module
//!
//! The connection to the virtual GPU, and an in-memory loopback device
//! used by tests and the demo binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::fence::FenceFlags;
use crate::protocol::*;
use crate::reloc::RelocFlags;
use crate::resource::{DeviceId, ResourceKind};
use crate::stream::CommandStream;

/// Device limits consulted when validating creation descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub max_texture_dim: u32,
    pub max_array_layers: u32,
    pub max_samples: u32,
    pub max_buffer_size: u32,
    pub max_shader_bytes: u32,
    /// Total guest memory the device will back.
    pub memory_budget: u64,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            max_texture_dim: 16384,
            max_array_layers: 2048,
            max_samples: 8,
            max_buffer_size: 128 * 1024 * 1024,
            max_shader_bytes: 1024 * 1024,
            memory_budget: 256 * 1024 * 1024,
        }
    }
}

/// Accumulated access of one resource within a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub kind: ResourceKind,
    pub id: DeviceId,
    pub flags: RelocFlags,
}

/// One resolved command buffer handed to the device.
#[derive(Debug)]
pub struct Submission<'a> {
    pub context_id: u32,
    pub seqno: u64,
    pub fence_flags: FenceFlags,
    pub commands: &'a [u8],
    pub usage: &'a [ResourceUsage],
}

/// A virtual GPU connection.
///
/// Submission is a bounded-latency call; only [`Device::wait_seqno`] blocks
/// for an unbounded time.
pub trait Device: Send + Sync {
    fn caps(&self) -> DeviceCaps;

    /// Allocate a device id for an object about to be bound.
    fn define(&self, kind: ResourceKind, backing_size: u64) -> Result<DeviceId>;

    /// Release an id. The object is no longer referenced by any pending work.
    fn undefine(&self, kind: ResourceKind, id: DeviceId);

    fn submit(&self, submission: &Submission<'_>) -> Result<()>;

    /// Highest sequence number whose work has completed.
    fn completed_seqno(&self) -> Result<u64>;

    /// Block until `seqno` completes or `timeout` passes (`None` waits
    /// forever). Returns whether it completed.
    fn wait_seqno(&self, seqno: u64, timeout: Option<Duration>) -> Result<bool>;

    /// Objects whose backing store was dropped since the last call.
    fn take_evictions(&self) -> Vec<(ResourceKind, DeviceId)>;
}

/// A submission recorded by [`LoopbackDevice`].
#[derive(Debug, Clone)]
pub struct SubmittedBuffer {
    pub context_id: u32,
    pub seqno: u64,
    pub fence_flags: FenceFlags,
    pub commands: Vec<u8>,
    pub usage: Vec<ResourceUsage>,
}

#[derive(Default)]
struct LoopbackState {
    next_id: HashMap<ResourceKind, DeviceId>,
    live: HashMap<(ResourceKind, DeviceId), u64>,
    live_bytes: u64,
    submissions: Vec<SubmittedBuffer>,
    submitted_seqno: u64,
    completed_seqno: u64,
    evictions: Vec<(ResourceKind, DeviceId)>,
    lost: bool,
}

/// Device that executes nothing. Submissions are validated and recorded;
/// completion is driven by the caller or by a worker thread.
pub struct LoopbackDevice {
    caps: DeviceCaps,
    auto_complete: AtomicBool,
    state: Mutex<LoopbackState>,
    completed: Condvar,
}

impl LoopbackDevice {
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            auto_complete: AtomicBool::new(false),
            state: Mutex::new(LoopbackState::default()),
            completed: Condvar::new(),
        }
    }

    /// Complete every submission as soon as it arrives.
    pub fn with_auto_complete(self, enabled: bool) -> Self {
        self.auto_complete.store(enabled, Ordering::Relaxed);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark work up to and including `seqno` as complete.
    pub fn complete_through(&self, seqno: u64) {
        let mut state = self.lock();
        let target = seqno.min(state.submitted_seqno);
        if target > state.completed_seqno {
            state.completed_seqno = target;
            trace!("Loopback completed through {}", target);
            self.completed.notify_all();
        }
    }

    pub fn complete_all(&self) {
        let submitted = self.lock().submitted_seqno;
        self.complete_through(submitted);
    }

    /// Simulate losing the device. Waiters are woken with an error.
    pub fn set_lost(&self) {
        let mut state = self.lock();
        state.lost = true;
        warn!("Loopback device marked lost");
        self.completed.notify_all();
    }

    /// Drop the backing store of a defined object.
    pub fn evict(&self, kind: ResourceKind, id: DeviceId) {
        let mut state = self.lock();
        if state.live.contains_key(&(kind, id)) {
            debug!("Evicting {:?} {}", kind, id);
            state.evictions.push((kind, id));
        }
    }

    pub fn submissions(&self) -> Vec<SubmittedBuffer> {
        self.lock().submissions.clone()
    }

    pub fn last_submission(&self) -> Option<SubmittedBuffer> {
        self.lock().submissions.last().cloned()
    }

    pub fn is_defined(&self, kind: ResourceKind, id: DeviceId) -> bool {
        self.lock().live.contains_key(&(kind, id))
    }

    pub fn live_objects(&self) -> usize {
        self.lock().live.len()
    }

    /// Complete outstanding work every `latency` until `shutdown` is set.
    pub fn run_completion_worker(&self, latency: Duration, shutdown: &AtomicBool) {
        info!("Loopback completion worker started");
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(latency);
            self.complete_all();
        }
        info!("Loopback completion worker exiting");
    }

    fn validate(state: &LoopbackState, submission: &Submission<'_>) -> Result<()> {
        let mut fence_seen = false;
        for cmd in CommandStream::new(submission.commands) {
            let cmd = cmd?;
            match cmd.command_type() {
                PVGPU_CMD_BIND_OBJECT => {
                    let bind: CmdBindObject = cmd.read()?;
                    let kind = ResourceKind::from_wire(bind.object_kind).ok_or_else(|| {
                        Error::MalformedStream(format!("bind of unknown kind {}", bind.object_kind))
                    })?;
                    if !state.live.contains_key(&(kind, bind.object_id)) {
                        return Err(Error::MalformedStream(format!(
                            "bind of undefined {:?} {}",
                            kind, bind.object_id
                        )));
                    }
                }
                PVGPU_CMD_FENCE => {
                    let fence: CmdFence = cmd.read()?;
                    if fence.fence_value != submission.seqno {
                        return Err(Error::MalformedStream(format!(
                            "fence {} in submission {}",
                            fence.fence_value, submission.seqno
                        )));
                    }
                    fence_seen = true;
                }
                _ => {}
            }
            if cmd.header.context_id != submission.context_id {
                return Err(Error::MalformedStream(format!(
                    "{} for context {} in a submission from context {}",
                    cmd.name(),
                    cmd.header.context_id,
                    submission.context_id
                )));
            }
        }
        if !fence_seen {
            return Err(Error::MalformedStream("submission without fence".into()));
        }
        Ok(())
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new(DeviceCaps::default())
    }
}

impl Device for LoopbackDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps.clone()
    }

    fn define(&self, kind: ResourceKind, backing_size: u64) -> Result<DeviceId> {
        let mut state = self.lock();
        if state.lost {
            return Err(Error::DeviceLost);
        }
        if state.live_bytes.saturating_add(backing_size) > self.caps.memory_budget {
            return Err(Error::OutOfDeviceMemory);
        }
        let next = state.next_id.entry(kind).or_insert(1);
        let id = *next;
        *next += 1;
        state.live.insert((kind, id), backing_size);
        state.live_bytes += backing_size;
        debug!("Defined {:?} {} ({} bytes)", kind, id, backing_size);
        Ok(id)
    }

    fn undefine(&self, kind: ResourceKind, id: DeviceId) {
        let mut state = self.lock();
        match state.live.remove(&(kind, id)) {
            Some(size) => {
                state.live_bytes -= size;
                state.evictions.retain(|e| *e != (kind, id));
                debug!("Undefined {:?} {}", kind, id);
            }
            None => warn!("Attempted to undefine non-existent {:?} {}", kind, id),
        }
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<()> {
        let mut state = self.lock();
        if state.lost {
            return Err(Error::DeviceLost);
        }
        Self::validate(&state, submission)?;
        debug!(
            "Submission: context={}, seqno={}, {} bytes, {} resources",
            submission.context_id,
            submission.seqno,
            submission.commands.len(),
            submission.usage.len()
        );
        state.submitted_seqno = state.submitted_seqno.max(submission.seqno);
        state.submissions.push(SubmittedBuffer {
            context_id: submission.context_id,
            seqno: submission.seqno,
            fence_flags: submission.fence_flags,
            commands: submission.commands.to_vec(),
            usage: submission.usage.to_vec(),
        });
        if self.auto_complete.load(Ordering::Relaxed) {
            state.completed_seqno = state.submitted_seqno;
            self.completed.notify_all();
        }
        Ok(())
    }

    fn completed_seqno(&self) -> Result<u64> {
        let state = self.lock();
        if state.lost {
            return Err(Error::DeviceLost);
        }
        Ok(state.completed_seqno)
    }

    fn wait_seqno(&self, seqno: u64, timeout: Option<Duration>) -> Result<bool> {
        let mut state = self.lock();
        let done = |s: &LoopbackState| s.lost || s.completed_seqno >= seqno;
        state = match timeout {
            None => self
                .completed
                .wait_while(state, |s| !done(s))
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            Some(timeout) => {
                self.completed
                    .wait_timeout_while(state, timeout, |s| !done(s))
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0
            }
        };
        if state.lost {
            return Err(Error::DeviceLost);
        }
        Ok(state.completed_seqno >= seqno)
    }

    fn take_evictions(&self) -> Vec<(ResourceKind, DeviceId)> {
        std::mem::take(&mut self.lock().evictions)
    }
}
