//! Resource Registry
//!
//! Shared table from driver handles to resource state. Creation, lookup and
//! reclaim go through one mutex; reference counts, staging counts and
//! per-resource state live in the entries so contexts on different threads
//! only contend on the table itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::device::{Device, DeviceCaps};
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::format::FormatTable;
use crate::resource::{
    Binding, Descriptor, DeviceId, DeviceObject, MapFlags, Resource, ResourceHandle, ResourceKind,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct MapState {
    count: u32,
    flags: MapFlags,
    written: bool,
    evicted_while_mapped: bool,
}

/// Registry-side state of one resource.
#[derive(Debug)]
pub struct ResourceEntry {
    handle: ResourceHandle,
    resource: Resource,
    refcount: AtomicU32,
    destroyed: AtomicBool,
    /// Unsubmitted command buffers referencing the resource.
    staged: AtomicU32,
    binding: Mutex<Binding>,
    storage: Mutex<Vec<u8>>,
    map_state: Mutex<MapState>,
    /// Fences of submitted work that references the resource.
    fences: Mutex<Vec<Fence>>,
}

impl ResourceEntry {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn kind(&self) -> ResourceKind {
        self.resource.kind()
    }

    pub fn binding(&self) -> Binding {
        *lock(&self.binding)
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn attach_fence(&self, fence: Fence) {
        let mut fences = lock(&self.fences);
        fences.retain(|f| !f.is_signalled());
        fences.push(fence);
    }

    /// Fences of submitted work on the resource that have not signalled.
    pub(crate) fn pending_fences(&self) -> Vec<Fence> {
        let mut fences = lock(&self.fences);
        fences.retain(|f| !f.is_signalled());
        fences.clone()
    }

    fn fences_signalled(&self) -> bool {
        let mut fences = lock(&self.fences);
        fences.retain(|f| !f.is_signalled());
        fences.is_empty()
    }

    fn reclaimable(&self) -> bool {
        self.is_destroyed()
            && self.refcount() == 0
            && self.staged.load(Ordering::Acquire) == 0
            && self.fences_signalled()
    }
}

/// Keeps a resource alive while an unsubmitted command buffer references it.
#[derive(Debug)]
pub struct StagedRef(Arc<ResourceEntry>);

impl StagedRef {
    pub fn entry(&self) -> &Arc<ResourceEntry> {
        &self.0
    }
}

impl Drop for StagedRef {
    fn drop(&mut self) {
        self.0.staged.fetch_sub(1, Ordering::AcqRel);
    }
}

/// CPU view of a resource's backing storage. Give it back with
/// [`ResourceRegistry::unmap`] to learn whether a rebind is required.
#[derive(Debug)]
pub struct Mapping {
    entry: Arc<ResourceEntry>,
    flags: MapFlags,
    released: bool,
}

impl Mapping {
    pub fn handle(&self) -> ResourceHandle {
        self.entry.handle
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn len(&self) -> usize {
        lock(&self.entry.storage).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let storage = lock(&self.entry.storage);
        let src = offset
            .checked_add(out.len())
            .and_then(|end| storage.get(offset..end))
            .ok_or_else(|| Error::unsupported(format!("read of {} bytes at {offset}", out.len())))?;
        out.copy_from_slice(src);
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if !self.flags.contains(MapFlags::WRITE) {
            return Err(Error::unsupported("write through a read-only mapping"));
        }
        let mut storage = lock(&self.entry.storage);
        let dst = offset
            .checked_add(data.len())
            .and_then(|end| storage.get_mut(offset..end))
            .ok_or_else(|| Error::unsupported(format!("write of {} bytes at {offset}", data.len())))?;
        dst.copy_from_slice(data);
        lock(&self.entry.map_state).written = true;
        Ok(())
    }

    /// Drop this mapping's share of the map state.
    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let bound = self.entry.binding().device_id().is_some();
        let mut state = lock(&self.entry.map_state);
        state.count = state.count.saturating_sub(1);
        let rebind = state.evicted_while_mapped || (state.written && bound);
        if state.count == 0 {
            *state = MapState::default();
        }
        rebind
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<ResourceHandle, Arc<ResourceEntry>>,
    by_device_id: HashMap<(ResourceKind, DeviceId), ResourceHandle>,
    next_handle: u32,
    committed_bytes: u64,
}

/// Handle table shared by every context of a screen.
pub struct ResourceRegistry {
    caps: DeviceCaps,
    formats: FormatTable,
    inner: Mutex<RegistryInner>,
}

impl ResourceRegistry {
    pub fn new(caps: DeviceCaps, formats: FormatTable) -> Self {
        Self {
            caps,
            formats,
            inner: Mutex::new(RegistryInner {
                next_handle: 1,
                ..RegistryInner::default()
            }),
        }
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    /// Whether `create` would accept the descriptor's size and format.
    pub fn can_create(&self, desc: &Descriptor) -> bool {
        desc.instantiate(&self.caps, &self.formats).is_ok()
    }

    /// Create a resource. It has no device id until first relocated.
    pub fn create(&self, desc: &Descriptor) -> Result<ResourceHandle> {
        let resource = desc.instantiate(&self.caps, &self.formats)?;
        let size = resource.backing_size();

        let mut inner = lock(&self.inner);
        let committed = inner.committed_bytes.checked_add(size);
        if committed.map_or(true, |total| total > self.caps.memory_budget) {
            warn!(
                "Out of device memory creating {:?} of {} bytes ({} of {} committed)",
                resource.kind(),
                size,
                inner.committed_bytes,
                self.caps.memory_budget
            );
            return Err(Error::OutOfDeviceMemory);
        }

        let handle = ResourceHandle(inner.next_handle);
        inner.next_handle = inner
            .next_handle
            .checked_add(1)
            .ok_or(Error::OutOfDeviceMemory)?;
        inner.committed_bytes += size;

        let entry = Arc::new(ResourceEntry {
            handle,
            resource,
            refcount: AtomicU32::new(1),
            destroyed: AtomicBool::new(false),
            staged: AtomicU32::new(0),
            binding: Mutex::new(Binding::Unbound),
            storage: Mutex::new(vec![0; size as usize]),
            map_state: Mutex::new(MapState::default()),
            fences: Mutex::new(Vec::new()),
        });
        debug!("Created {:?} {} ({} bytes)", entry.kind(), handle, size);
        inner.entries.insert(handle, entry);
        Ok(handle)
    }

    /// Live (not destroyed) entry for `handle`.
    pub fn lookup(&self, handle: ResourceHandle) -> Result<Arc<ResourceEntry>> {
        let inner = lock(&self.inner);
        match inner.entries.get(&handle) {
            Some(entry) if !entry.is_destroyed() => Ok(entry.clone()),
            _ => Err(Error::InvalidHandle(handle)),
        }
    }

    /// Whether the resource still holds device memory, destroyed or not.
    pub fn is_allocated(&self, handle: ResourceHandle) -> bool {
        lock(&self.inner).entries.contains_key(&handle)
    }

    pub fn device_id(&self, handle: ResourceHandle) -> Option<DeviceId> {
        let inner = lock(&self.inner);
        inner.entries.get(&handle)?.binding().device_id()
    }

    pub fn binding(&self, handle: ResourceHandle) -> Result<Binding> {
        let inner = lock(&self.inner);
        inner
            .entries
            .get(&handle)
            .map(|entry| entry.binding())
            .ok_or(Error::InvalidHandle(handle))
    }

    pub fn refcount(&self, handle: ResourceHandle) -> Result<u32> {
        let inner = lock(&self.inner);
        inner
            .entries
            .get(&handle)
            .map(|entry| entry.refcount())
            .ok_or(Error::InvalidHandle(handle))
    }

    /// Whether no unsubmitted command buffer references the resource.
    pub fn is_flushed(&self, handle: ResourceHandle) -> Result<bool> {
        let inner = lock(&self.inner);
        inner
            .entries
            .get(&handle)
            .map(|entry| entry.staged.load(Ordering::Acquire) == 0)
            .ok_or(Error::InvalidHandle(handle))
    }

    pub fn reference(&self, handle: ResourceHandle) -> Result<ResourceHandle> {
        let entry = self.lookup(handle)?;
        let count = entry.refcount.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Reference {} -> {}", handle, count);
        Ok(handle)
    }

    /// Drop one reference. Reaching zero marks the resource destroyed;
    /// reclaim waits for pending fences (see [`ResourceRegistry::reap`]).
    pub fn release(&self, handle: ResourceHandle) -> Result<()> {
        let entry = {
            let inner = lock(&self.inner);
            inner
                .entries
                .get(&handle)
                .cloned()
                .ok_or(Error::InvalidHandle(handle))?
        };

        let previous = entry
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map_err(|_| Error::InvalidHandle(handle))?;
        trace!("Release {} -> {}", handle, previous - 1);
        if previous == 1 {
            entry.destroyed.store(true, Ordering::Release);
            debug!("{} unreferenced, reclaim deferred to fences", handle);
        }
        Ok(())
    }

    /// Mark destroyed and drop the creator's reference. Safe while staged or
    /// in flight.
    pub fn destroy(&self, handle: ResourceHandle) -> Result<()> {
        let entry = self.lookup(handle)?;
        entry.destroyed.store(true, Ordering::Release);
        debug!("Destroy {} requested", handle);
        self.release(handle)
    }

    /// Take a staging reference for an unsubmitted command buffer.
    pub(crate) fn stage_entry(entry: &Arc<ResourceEntry>) -> StagedRef {
        entry.staged.fetch_add(1, Ordering::AcqRel);
        StagedRef(entry.clone())
    }

    /// Record a device binding made by the relocation engine.
    pub(crate) fn set_binding(&self, entry: &ResourceEntry, binding: Binding) {
        let mut inner = lock(&self.inner);
        let mut current = lock(&entry.binding);
        if let Some(old) = current.known_id() {
            inner.by_device_id.remove(&(entry.kind(), old));
        }
        if let Some(id) = binding.known_id() {
            inner.by_device_id.insert((entry.kind(), id), entry.handle);
        }
        *current = binding;
    }

    /// Apply an eviction reported by the device. Returns whether a resource
    /// lost its residency.
    pub fn mark_evicted(&self, kind: ResourceKind, id: DeviceId) -> bool {
        let inner = lock(&self.inner);
        let Some(entry) = inner
            .by_device_id
            .get(&(kind, id))
            .and_then(|handle| inner.entries.get(handle))
        else {
            return false;
        };
        if !entry.resource.evictable() {
            warn!("Device evicted non-evictable {:?} {}", kind, id);
        }

        let mut binding = lock(&entry.binding);
        if *binding != Binding::Bound(id) {
            return false;
        }
        *binding = Binding::Evicted(id);
        let mut map_state = lock(&entry.map_state);
        if map_state.count > 0 {
            map_state.evicted_while_mapped = true;
        }
        debug!("{} ({:?} {}) evicted", entry.handle, kind, id);
        true
    }

    /// Map the backing storage. Conflicting concurrent intents fail with
    /// [`Error::MapConflict`].
    pub fn map(&self, handle: ResourceHandle, flags: MapFlags) -> Result<Mapping> {
        let entry = self.lookup(handle)?;
        entry.resource.check_map(flags)?;
        {
            let mut state = lock(&entry.map_state);
            if state.count > 0 && flags.conflicts_with(state.flags) {
                return Err(Error::MapConflict(handle));
            }
            state.count += 1;
            state.flags |= flags;
        }
        trace!("Mapped {} with {:?}", handle, flags);
        Ok(Mapping {
            entry,
            flags,
            released: false,
        })
    }

    /// Returns whether the resource must be rebound to the device: it was
    /// evicted while mapped, or written while device-bound.
    pub fn unmap(&self, mut mapping: Mapping) -> bool {
        let rebind = mapping.release();
        trace!("Unmapped {}, rebind={}", mapping.handle(), rebind);
        rebind
    }

    /// Reclaim destroyed resources whose references, staging and fences are
    /// all gone. Returns the number reclaimed.
    pub fn reap(&self, device: &dyn Device) -> usize {
        let reclaimed: Vec<Arc<ResourceEntry>> = {
            let mut inner = lock(&self.inner);
            let handles: Vec<ResourceHandle> = inner
                .entries
                .values()
                .filter(|entry| entry.reclaimable())
                .map(|entry| entry.handle)
                .collect();

            let mut reclaimed = Vec::with_capacity(handles.len());
            for handle in handles {
                if let Some(entry) = inner.entries.remove(&handle) {
                    if let Some(id) = entry.binding().known_id() {
                        inner.by_device_id.remove(&(entry.kind(), id));
                    }
                    inner.committed_bytes -= entry.resource.backing_size();
                    reclaimed.push(entry);
                }
            }
            reclaimed
        };

        for entry in &reclaimed {
            debug!("Reclaimed {:?} {}", entry.kind(), entry.handle);
            entry.resource.destroy(device, entry.binding());
        }
        reclaimed.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;
    use crate::format::Format;
    use crate::resource::{BufferDesc, BufferUsage, MobDesc, QueryDesc, SurfaceDesc};
    use assert_matches::assert_matches;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(DeviceCaps::default(), FormatTable::new())
    }

    fn buffer(size: u32) -> Descriptor {
        Descriptor::Buffer(BufferDesc {
            size,
            alignment: 16,
            usage: BufferUsage::VERTEX,
        })
    }

    #[test]
    fn test_create_starts_unbound() {
        let reg = registry();
        let h = reg.create(&buffer(256)).unwrap();
        assert_eq!(reg.binding(h).unwrap(), Binding::Unbound);
        assert_eq!(reg.device_id(h), None);
        assert_eq!(reg.refcount(h).unwrap(), 1);
    }

    #[test]
    fn test_out_of_memory() {
        let reg = ResourceRegistry::new(
            DeviceCaps {
                memory_budget: 8192,
                ..DeviceCaps::default()
            },
            FormatTable::new(),
        );
        reg.create(&Descriptor::Mob(MobDesc { size: 4096 })).unwrap();
        reg.create(&Descriptor::Mob(MobDesc { size: 4096 })).unwrap();
        assert_matches!(
            reg.create(&Descriptor::Mob(MobDesc { size: 4096 })),
            Err(Error::OutOfDeviceMemory)
        );
    }

    #[test]
    fn test_oversized_surface_is_refused() {
        let reg = registry();
        let mut volume = SurfaceDesc::texture_2d(Format::R32G32B32A32Float, 16384, 16384);
        volume.size.depth = 16384;
        volume.array_size = u32::MAX;
        let desc = Descriptor::Surface(volume.clone());
        assert!(!reg.can_create(&desc));
        assert_matches!(reg.create(&desc), Err(Error::UnsupportedDescriptor(_)));

        volume.array_size = 2048;
        assert_matches!(
            reg.create(&Descriptor::Surface(volume)),
            Err(Error::OutOfDeviceMemory)
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_destroy_and_reap() {
        let reg = registry();
        let device = LoopbackDevice::default();
        let h = reg.create(&buffer(64)).unwrap();
        reg.destroy(h).unwrap();
        assert_matches!(reg.lookup(h), Err(Error::InvalidHandle(_)));
        assert_matches!(reg.destroy(h), Err(Error::InvalidHandle(_)));
        assert!(reg.is_allocated(h));
        assert_eq!(reg.reap(&device), 1);
        assert!(!reg.is_allocated(h));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_references_delay_reclaim() {
        let reg = registry();
        let device = LoopbackDevice::default();
        let h = reg.create(&buffer(64)).unwrap();
        reg.reference(h).unwrap();
        reg.destroy(h).unwrap();
        assert_eq!(reg.reap(&device), 0);
        assert!(reg.is_allocated(h));
        reg.release(h).unwrap();
        assert_eq!(reg.reap(&device), 1);
        assert_matches!(reg.release(h), Err(Error::InvalidHandle(_)));
    }

    #[test]
    fn test_staging_delays_reclaim() {
        let reg = registry();
        let device = LoopbackDevice::default();
        let h = reg.create(&buffer(64)).unwrap();
        let staged = ResourceRegistry::stage_entry(&reg.lookup(h).unwrap());
        assert!(!reg.is_flushed(h).unwrap());
        reg.destroy(h).unwrap();
        assert_eq!(reg.reap(&device), 0);
        drop(staged);
        assert!(reg.is_flushed(h).unwrap());
        assert_eq!(reg.reap(&device), 1);
    }

    #[test]
    fn test_map_write_read() {
        let reg = registry();
        let h = reg.create(&buffer(64)).unwrap();
        let mapping = reg.map(h, MapFlags::WRITE).unwrap();
        mapping.write(8, &[1, 2, 3, 4]).unwrap();
        assert!(mapping.write(62, &[0; 4]).is_err());
        // written but never bound: nothing to rebind
        assert!(!reg.unmap(mapping));

        let mapping = reg.map(h, MapFlags::READ).unwrap();
        let mut out = [0u8; 4];
        mapping.read(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(mapping.write(0, &[1]).is_err());
        assert!(!reg.unmap(mapping));
    }

    #[test]
    fn test_conflicting_maps() {
        let reg = registry();
        let h = reg.create(&buffer(64)).unwrap();
        let reader = reg.map(h, MapFlags::READ).unwrap();
        let second_reader = reg.map(h, MapFlags::READ).unwrap();
        assert_matches!(reg.map(h, MapFlags::WRITE), Err(Error::MapConflict(_)));
        reg.unmap(reader);
        drop(second_reader);
        let writer = reg.map(h, MapFlags::WRITE).unwrap();
        assert_matches!(reg.map(h, MapFlags::READ), Err(Error::MapConflict(_)));
        reg.unmap(writer);
    }

    #[test]
    fn test_eviction_while_mapped_requests_rebind() {
        let reg = registry();
        let h = reg.create(&buffer(64)).unwrap();
        let entry = reg.lookup(h).unwrap();
        reg.set_binding(&entry, Binding::Bound(7));

        let mapping = reg.map(h, MapFlags::READ).unwrap();
        assert!(reg.mark_evicted(ResourceKind::Buffer, 7));
        assert!(!reg.mark_evicted(ResourceKind::Buffer, 7));
        assert!(reg.unmap(mapping));
        assert_eq!(reg.binding(h).unwrap(), Binding::Evicted(7));
    }

    #[test]
    fn test_write_to_bound_resource_requests_rebind() {
        let reg = registry();
        let h = reg.create(&buffer(64)).unwrap();
        let entry = reg.lookup(h).unwrap();
        reg.set_binding(&entry, Binding::Bound(3));
        let mapping = reg.map(h, MapFlags::WRITE).unwrap();
        mapping.write(0, &[9]).unwrap();
        assert!(reg.unmap(mapping));
    }

    #[test]
    fn test_query_is_read_only() {
        let reg = registry();
        let q = reg.create(&Descriptor::Query(QueryDesc { len: 16 })).unwrap();
        assert_matches!(reg.map(q, MapFlags::WRITE), Err(Error::UnsupportedDescriptor(_)));
        assert!(reg.map(q, MapFlags::READ).is_ok());
    }

    #[test]
    fn test_concurrent_reference_counts() {
        let reg = registry();
        let handles: Vec<_> = (0..4).map(|_| reg.create(&buffer(64)).unwrap()).collect();

        std::thread::scope(|s| {
            for t in 0..4 {
                let reg = &reg;
                let handles = &handles;
                s.spawn(move || {
                    for i in 0..500 {
                        let h = handles[(t + i) % handles.len()];
                        reg.reference(h).unwrap();
                        reg.reference(h).unwrap();
                        reg.release(h).unwrap();
                    }
                });
            }
        });

        let total: u32 = handles.iter().map(|h| reg.refcount(*h).unwrap()).sum();
        // 4 creators + 4 threads * 500 * (2 - 1)
        assert_eq!(total, 4 + 4 * 500);
    }
}
