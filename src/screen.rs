//! Screen
//!
//! Process-wide device state shared by every context: the device connection,
//! the resource registry, fence tracking, the eviction epoch and the
//! immutable debug configuration.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::debug::DebugFlags;
use crate::device::{Device, DeviceCaps};
use crate::error::Result;
use crate::fence::{Fence, FenceTracker};
use crate::format::FormatTable;
use crate::protocol::{PVGPU_DEFAULT_CMDBUF_SIZE, PVGPU_DEFAULT_MAX_RELOCS};
use crate::registry::ResourceRegistry;
use crate::resource::{Binding, Descriptor, DeviceId, ResourceHandle};
use crate::time::Timeout;

/// Fixed at screen creation.
#[derive(Debug, Clone)]
pub struct ScreenOptions {
    pub command_buffer_size: usize,
    pub max_relocations: usize,
    pub debug: DebugFlags,
    pub formats: FormatTable,
}

impl Default for ScreenOptions {
    fn default() -> Self {
        Self {
            command_buffer_size: PVGPU_DEFAULT_CMDBUF_SIZE,
            max_relocations: PVGPU_DEFAULT_MAX_RELOCS,
            debug: DebugFlags::empty(),
            formats: FormatTable::new(),
        }
    }
}

pub struct Screen {
    device: Arc<dyn Device>,
    caps: DeviceCaps,
    registry: ResourceRegistry,
    fences: FenceTracker,
    options: ScreenOptions,
    next_context_id: AtomicU32,
    eviction_epoch: AtomicU64,
    lost: AtomicBool,
    /// Keeps sequence numbers in submission order.
    submit_lock: Mutex<()>,
}

impl Screen {
    pub fn new(device: Arc<dyn Device>, options: ScreenOptions) -> Arc<Self> {
        let caps = device.caps();
        info!(
            "Screen created: {} byte command buffers, {} relocations, debug {:?}",
            options.command_buffer_size, options.max_relocations, options.debug
        );
        Arc::new(Self {
            registry: ResourceRegistry::new(caps.clone(), options.formats.clone()),
            device,
            caps,
            fences: FenceTracker::new().with_logging(options.debug.contains(DebugFlags::FENCE)),
            options,
            next_context_id: AtomicU32::new(1),
            eviction_epoch: AtomicU64::new(0),
            lost: AtomicBool::new(false),
            submit_lock: Mutex::new(()),
        })
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn options(&self) -> &ScreenOptions {
        &self.options
    }

    pub fn debug(&self) -> DebugFlags {
        self.options.debug
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub(crate) fn fences(&self) -> &FenceTracker {
        &self.fences
    }

    pub(crate) fn submit_lock(&self) -> MutexGuard<'_, ()> {
        self.submit_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_context(self: &Arc<Self>) -> Context {
        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        debug!("Context {} created", id);
        Context::new(id, self.clone())
    }

    pub fn can_create(&self, desc: &Descriptor) -> bool {
        self.registry.can_create(desc)
    }

    pub fn create_resource(&self, desc: &Descriptor) -> Result<ResourceHandle> {
        self.registry.create(desc)
    }

    pub fn destroy_resource(&self, handle: ResourceHandle) -> Result<()> {
        self.registry.destroy(handle)?;
        self.reap();
        Ok(())
    }

    pub fn reference(&self, handle: ResourceHandle) -> Result<ResourceHandle> {
        self.registry.reference(handle)
    }

    pub fn release(&self, handle: ResourceHandle) -> Result<()> {
        self.registry.release(handle)?;
        self.reap();
        Ok(())
    }

    pub fn device_id(&self, handle: ResourceHandle) -> Option<DeviceId> {
        self.registry.device_id(handle)
    }

    pub fn binding(&self, handle: ResourceHandle) -> Result<Binding> {
        self.registry.binding(handle)
    }

    pub fn is_allocated(&self, handle: ResourceHandle) -> bool {
        self.registry.is_allocated(handle)
    }

    /// Whether no context holds the resource in an unsubmitted buffer.
    pub fn is_flushed(&self, handle: ResourceHandle) -> Result<bool> {
        self.registry.is_flushed(handle)
    }

    /// Reclaim destroyed resources whose work has completed.
    pub fn reap(&self) -> usize {
        self.fences.update(self.device.as_ref());
        self.registry.reap(self.device.as_ref())
    }

    pub fn poll(&self, fence: &Fence) -> bool {
        let done = self.fences.poll(fence, self.device.as_ref());
        if done {
            self.registry.reap(self.device.as_ref());
        }
        done
    }

    pub fn wait(&self, fence: &Fence, timeout: Timeout) -> bool {
        let done = self.fences.wait(fence, self.device.as_ref(), timeout);
        if done {
            self.registry.reap(self.device.as_ref());
        }
        done
    }

    /// [`Screen::wait`] on tokio's blocking pool.
    pub async fn wait_async(self: &Arc<Self>, fence: Fence, timeout: Timeout) -> bool {
        let screen = self.clone();
        match tokio::task::spawn_blocking(move || screen.wait(&fence, timeout)).await {
            Ok(done) => done,
            Err(e) => {
                warn!("Fence wait task failed: {}", e);
                false
            }
        }
    }

    /// Apply evictions reported by the device. Returns how many resources
    /// lost residency; any loss starts a new eviction epoch.
    pub fn process_evictions(&self) -> usize {
        let evicted = self
            .device
            .take_evictions()
            .into_iter()
            .filter(|&(kind, id)| self.registry.mark_evicted(kind, id))
            .count();
        if evicted > 0 {
            let epoch = self.eviction_epoch.fetch_add(1, Ordering::AcqRel) + 1;
            if self.debug().contains(DebugFlags::REBIND) {
                info!("{} resources evicted, eviction epoch {}", evicted, epoch);
            } else {
                debug!("{} resources evicted, eviction epoch {}", evicted, epoch);
            }
        }
        evicted
    }

    pub fn eviction_epoch(&self) -> u64 {
        self.eviction_epoch.load(Ordering::Acquire)
    }

    /// Set once the device is lost, whether found by a submission or a wait.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire) || self.fences.is_lost()
    }

    /// Stop accepting work and force-signal every pending fence.
    pub fn device_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            warn!("Device lost");
        }
        self.fences.device_lost();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;
    use crate::fence::FenceStatus;
    use crate::resource::{BufferDesc, BufferUsage, ResourceKind};
    use std::time::Duration;

    fn screen() -> (Arc<LoopbackDevice>, Arc<Screen>) {
        let device = Arc::new(LoopbackDevice::default());
        let screen = Screen::new(device.clone(), ScreenOptions::default());
        (device, screen)
    }

    fn vertex_buffer(screen: &Screen) -> ResourceHandle {
        screen
            .create_resource(&Descriptor::Buffer(BufferDesc {
                size: 256,
                alignment: 16,
                usage: BufferUsage::VERTEX,
            }))
            .unwrap()
    }

    #[test]
    fn test_context_ids_increase() {
        let (_, screen) = screen();
        let a = screen.create_context();
        let b = screen.create_context();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_evictions_bump_epoch() {
        let (device, screen) = screen();
        let h = vertex_buffer(&screen);
        let mut ctx = screen.create_context();
        ctx.set_vertex_buffer(0, h, 16, 0).unwrap();
        ctx.commit().unwrap();
        let id = screen.device_id(h).unwrap();

        assert_eq!(screen.process_evictions(), 0);
        assert_eq!(screen.eviction_epoch(), 0);
        device.evict(ResourceKind::Buffer, id);
        assert_eq!(screen.process_evictions(), 1);
        assert_eq!(screen.eviction_epoch(), 1);
        assert_eq!(screen.binding(h).unwrap(), Binding::Evicted(id));
        assert_eq!(screen.device_id(h), None);
    }

    #[test]
    fn test_device_lost_is_broadcast() {
        let (device, screen) = screen();
        let mut ctx = screen.create_context();
        let fence = ctx.commit().unwrap();
        device.set_lost();
        assert!(screen.wait(&fence, Timeout::Infinite));
        assert_eq!(fence.status(), FenceStatus::DeviceLost);
        assert!(screen.is_lost());

        let mut other = screen.create_context();
        assert!(matches!(other.commit(), Err(crate::Error::DeviceLost)));
    }

    #[test]
    fn test_fence_logging_follows_debug_flags() {
        let (_, quiet) = screen();
        assert!(!quiet.fences().is_logging());

        let device = Arc::new(LoopbackDevice::default());
        let options = ScreenOptions {
            debug: DebugFlags::parse("fence"),
            ..ScreenOptions::default()
        };
        let verbose = Screen::new(device.clone(), options);
        assert!(verbose.fences().is_logging());
        let fence = verbose.create_context().commit().unwrap();
        device.complete_all();
        assert!(verbose.poll(&fence));
    }

    #[tokio::test]
    async fn test_wait_async() {
        let (device, screen) = screen();
        let mut ctx = screen.create_context();
        let fence = ctx.commit().unwrap();

        let completer = {
            let device = device.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                device.complete_all();
            })
        };
        assert!(screen.wait_async(fence.clone(), Timeout::Infinite).await);
        completer.await.unwrap();
        assert_eq!(fence.status(), FenceStatus::Signalled);
    }
}
