//! Relocation Engine
//!
//! Commands are staged with driver handles in place of device ids. At commit
//! the engine walks the staged commands in order, binds every referenced
//! resource that has no valid device id (inserting a BIND command ahead of
//! the command that uses it) and patches the ids into the copied bytes.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::builder::{StagedBuffer, StagedItem};
use crate::debug::DebugFlags;
use crate::device::{Device, ResourceUsage};
use crate::error::{Error, Result};
use crate::protocol::*;
use crate::registry::{ResourceEntry, ResourceRegistry};
use crate::resource::{Binding, DeviceId, DeviceObject, ResourceHandle, ResourceKind};

bitflags! {
    /// How the device will access a relocated resource.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RelocFlags: u32 {
        const WRITE = 1 << 0;
        const READ = 1 << 1;
        /// Reference made by the driver itself, not by API state.
        const INTERNAL = 1 << 2;
        /// Bulk transfer.
        const DMA = 1 << 3;
    }
}

/// Size of the bind command the engine may insert per resource.
pub const BIND_COMMAND_SIZE: usize = std::mem::size_of::<CmdBindObject>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    /// A resource; `kind` restricts which kinds the slot accepts.
    Resource {
        handle: ResourceHandle,
        kind: Option<ResourceKind>,
    },
    /// The id of the submitting context.
    Context,
}

/// Extra word written next to the id, e.g. an offset into a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryPatch {
    pub offset: usize,
    pub value: u32,
}

/// One id reference inside a reservation. Offsets are relative to the start
/// of the reservation the relocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub target: RelocTarget,
    pub flags: RelocFlags,
    pub secondary: Option<SecondaryPatch>,
}

impl Relocation {
    /// Reference to a resource of any kind.
    pub fn resource(offset: usize, handle: ResourceHandle, flags: RelocFlags) -> Self {
        Self {
            offset,
            target: RelocTarget::Resource { handle, kind: None },
            flags,
            secondary: None,
        }
    }

    fn typed(offset: usize, handle: ResourceHandle, kind: ResourceKind, flags: RelocFlags) -> Self {
        Self {
            offset,
            target: RelocTarget::Resource {
                handle,
                kind: Some(kind),
            },
            flags,
            secondary: None,
        }
    }

    pub fn surface(offset: usize, handle: ResourceHandle, flags: RelocFlags) -> Self {
        Self::typed(offset, handle, ResourceKind::Surface, flags)
    }

    pub fn buffer(offset: usize, handle: ResourceHandle, flags: RelocFlags) -> Self {
        Self::typed(offset, handle, ResourceKind::Buffer, flags)
    }

    pub fn shader(offset: usize, handle: ResourceHandle) -> Self {
        Self::typed(offset, handle, ResourceKind::Shader, RelocFlags::READ)
    }

    /// Memory object id at `offset`, plus the offset into the object at
    /// `offset_field`.
    pub fn mob(
        offset: usize,
        handle: ResourceHandle,
        flags: RelocFlags,
        offset_field: usize,
        offset_into_mob: u32,
    ) -> Self {
        Self::typed(offset, handle, ResourceKind::Mob, flags).with_secondary(offset_field, offset_into_mob)
    }

    /// Query results are written by the device.
    pub fn query(offset: usize, handle: ResourceHandle) -> Self {
        Self::typed(offset, handle, ResourceKind::Query, RelocFlags::WRITE)
    }

    pub fn context(offset: usize) -> Self {
        Self {
            offset,
            target: RelocTarget::Context,
            flags: RelocFlags::empty(),
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, offset: usize, value: u32) -> Self {
        self.secondary = Some(SecondaryPatch { offset, value });
        self
    }

    pub fn handle(&self) -> Option<ResourceHandle> {
        match self.target {
            RelocTarget::Resource { handle, .. } => Some(handle),
            RelocTarget::Context => None,
        }
    }

    /// Last byte written by this relocation, relative to the reservation.
    pub(crate) fn end(&self) -> usize {
        let primary = self.offset + 4;
        match self.secondary {
            Some(s) => primary.max(s.offset + 4),
            None => primary,
        }
    }
}

/// A command buffer ready for submission.
#[derive(Debug)]
pub(crate) struct Resolved {
    pub commands: Vec<u8>,
    pub usage: Vec<ResourceUsage>,
    /// Every resource the submission references, in first-use order.
    pub referenced: Vec<Arc<ResourceEntry>>,
    /// Bind commands inserted.
    pub binds: usize,
    pub has_queries: bool,
    /// Bindings made during resolve, with the state they replaced.
    rebound: Vec<(Arc<ResourceEntry>, Binding)>,
}

impl Resolved {
    /// The submission never reached the device: resources bound by this
    /// resolve must be bound again before their next use.
    pub(crate) fn rollback(&self, registry: &ResourceRegistry) {
        for (entry, previous) in &self.rebound {
            let restored = match (previous, entry.binding()) {
                (Binding::Unbound, Binding::Bound(id)) => Binding::Evicted(id),
                (previous, _) => *previous,
            };
            registry.set_binding(entry, restored);
        }
    }
}

struct Resolver<'a> {
    registry: &'a ResourceRegistry,
    device: &'a dyn Device,
    context_id: u32,
    debug: DebugFlags,
    out: Vec<u8>,
    bound: HashMap<ResourceHandle, DeviceId>,
    usage_index: HashMap<ResourceHandle, usize>,
    usage: Vec<ResourceUsage>,
    referenced: Vec<Arc<ResourceEntry>>,
    rebound: Vec<(Arc<ResourceEntry>, Binding)>,
    binds: usize,
}

impl<'a> Resolver<'a> {
    fn emit_bind(&mut self, entry: &ResourceEntry, id: DeviceId) {
        let size = entry.resource().backing_size();
        let mut header =
            CommandHeader::new(PVGPU_CMD_BIND_OBJECT, BIND_COMMAND_SIZE, self.context_id);
        header.flags |= PVGPU_CMD_FLAG_IMPLICIT;
        let cmd = CmdBindObject {
            header,
            object_kind: entry.kind().wire(),
            object_id: id,
            backing_size_lo: size as u32,
            backing_size_hi: (size >> 32) as u32,
        };
        self.out.extend_from_slice(bytemuck::bytes_of(&cmd));
        self.binds += 1;
        if self.debug.contains(DebugFlags::REBIND) {
            debug!("Bind {:?} {} as {}", entry.kind(), entry.handle(), id);
        }
    }

    /// Give the resource a valid device id for this buffer, binding it at
    /// most once unless `force` is set.
    fn ensure_resident(&mut self, entry: &Arc<ResourceEntry>, force: bool) -> Result<DeviceId> {
        if let Some(&id) = self.bound.get(&entry.handle()) {
            if force {
                self.emit_bind(entry, id);
            }
            return Ok(id);
        }

        let previous = entry.binding();
        let id = match previous {
            Binding::Bound(id) => {
                if force {
                    self.emit_bind(entry, id);
                }
                id
            }
            Binding::Evicted(id) => {
                self.emit_bind(entry, id);
                self.registry.set_binding(entry, Binding::Bound(id));
                self.rebound.push((entry.clone(), previous));
                id
            }
            Binding::Unbound => {
                let id = self
                    .device
                    .define(entry.kind(), entry.resource().backing_size())?;
                self.emit_bind(entry, id);
                self.registry.set_binding(entry, Binding::Bound(id));
                self.rebound.push((entry.clone(), previous));
                id
            }
        };
        self.bound.insert(entry.handle(), id);
        Ok(id)
    }

    fn record_usage(&mut self, entry: &Arc<ResourceEntry>, id: DeviceId, flags: RelocFlags) {
        match self.usage_index.get(&entry.handle()) {
            Some(&i) => self.usage[i].flags |= flags,
            None => {
                self.usage_index.insert(entry.handle(), self.usage.len());
                self.usage.push(ResourceUsage {
                    kind: entry.kind(),
                    id,
                    flags,
                });
                self.referenced.push(entry.clone());
            }
        }
    }

    fn patch(&mut self, at: usize, value: u32) -> Result<()> {
        let word = at
            .checked_add(4)
            .and_then(|end| self.out.get_mut(at..end))
            .ok_or_else(|| Error::MalformedStream(format!("relocation at {at} is out of bounds")))?;
        word.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn commands(
        &mut self,
        staged: &StagedBuffer,
        start: usize,
        len: usize,
        relocs: &[Relocation],
    ) -> Result<()> {
        // resolve first so any bind lands ahead of the command
        let mut ids = Vec::with_capacity(relocs.len());
        for reloc in relocs {
            let value = match reloc.target {
                RelocTarget::Context => self.context_id,
                RelocTarget::Resource { handle, .. } => {
                    let entry = staged.entry(handle)?;
                    let id = self.ensure_resident(entry, false)?;
                    self.record_usage(entry, id, reloc.flags);
                    id
                }
            };
            ids.push(value);
        }

        let base = self.out.len();
        let bytes = staged
            .bytes
            .get(start..start + len)
            .ok_or_else(|| Error::MalformedStream(format!("staged range {start}+{len}")))?;
        self.out.extend_from_slice(bytes);

        for (reloc, value) in relocs.iter().zip(ids) {
            if reloc.end() > len {
                return Err(Error::MalformedStream(format!(
                    "relocation ending at {} outside a {len}-byte reservation",
                    reloc.end()
                )));
            }
            self.patch(base + reloc.offset, value)?;
            if let Some(secondary) = reloc.secondary {
                self.patch(base + secondary.offset, secondary.value)?;
            }
            if self.debug.contains(DebugFlags::RELOC) {
                debug!(
                    "Reloc {:?} at {} -> {} (buffer offset {})",
                    reloc.target,
                    reloc.offset,
                    value,
                    base + reloc.offset
                );
            }
        }
        Ok(())
    }
}

/// Produce the final bytes and usage list of a staged buffer.
pub(crate) fn resolve(
    staged: &StagedBuffer,
    registry: &ResourceRegistry,
    device: &dyn Device,
    context_id: u32,
    debug: DebugFlags,
) -> Result<Resolved> {
    let mut resolver = Resolver {
        registry,
        device,
        context_id,
        debug,
        out: Vec::with_capacity(staged.bytes.len() + BIND_COMMAND_SIZE * staged.touched_len()),
        bound: HashMap::new(),
        usage_index: HashMap::new(),
        usage: Vec::new(),
        referenced: Vec::new(),
        rebound: Vec::new(),
        binds: 0,
    };

    let result = staged.items.iter().try_for_each(|item| match item {
        StagedItem::Commands { start, len, relocs } => {
            resolver.commands(staged, *start, *len, &staged.relocs[relocs.clone()])
        }
        StagedItem::Rebind {
            handle,
            flags,
            force,
        } => {
            let entry = staged.entry(*handle)?;
            let id = resolver.ensure_resident(entry, *force)?;
            resolver.record_usage(entry, id, *flags);
            Ok(())
        }
    });

    let has_queries = resolver
        .referenced
        .iter()
        .any(|entry| entry.kind() == ResourceKind::Query);
    let resolved = Resolved {
        commands: resolver.out,
        usage: resolver.usage,
        referenced: resolver.referenced,
        binds: resolver.binds,
        has_queries,
        rebound: resolver.rebound,
    };
    if let Err(e) = result {
        resolved.rollback(registry);
        return Err(e);
    }

    trace!(
        "Resolved {} staged bytes into {} ({} binds, {} resources)",
        staged.bytes.len(),
        resolved.commands.len(),
        resolved.binds,
        resolved.usage.len()
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CommandBuffer;
    use crate::device::{DeviceCaps, LoopbackDevice};
    use crate::format::FormatTable;
    use crate::resource::{BufferDesc, BufferUsage, Descriptor, MobDesc};
    use crate::stream::decode;
    use assert_matches::assert_matches;
    use std::mem::offset_of;

    struct Fixture {
        registry: ResourceRegistry,
        device: LoopbackDevice,
        buffer: CommandBuffer,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: ResourceRegistry::new(DeviceCaps::default(), FormatTable::new()),
                device: LoopbackDevice::default(),
                buffer: CommandBuffer::new(4096, 64),
            }
        }

        fn vertex_buffer(&self) -> ResourceHandle {
            self.registry
                .create(&Descriptor::Buffer(BufferDesc {
                    size: 256,
                    alignment: 16,
                    usage: BufferUsage::VERTEX,
                }))
                .unwrap()
        }

        fn set_vb(&mut self, slot: u32, handle: ResourceHandle) {
            let cmd = CmdSetVertexBuffer {
                header: CommandHeader::new(
                    PVGPU_CMD_SET_VERTEX_BUFFER,
                    std::mem::size_of::<CmdSetVertexBuffer>(),
                    1,
                ),
                slot,
                buffer_id: PVGPU_INVALID_ID,
                stride: 16,
                offset: 0,
            };
            let bytes = bytemuck::bytes_of(&cmd);
            self.buffer.reserve(bytes.len(), 1).unwrap().copy_from_slice(bytes);
            let entry = self.registry.lookup(handle).unwrap();
            self.buffer
                .add_relocation(
                    Relocation::buffer(offset_of!(CmdSetVertexBuffer, buffer_id), handle, RelocFlags::READ),
                    Some(&entry),
                )
                .unwrap();
        }

        fn resolve(&mut self) -> Result<Resolved> {
            let staged = self.buffer.take();
            resolve(&staged, &self.registry, &self.device, 1, DebugFlags::empty())
        }
    }

    #[test]
    fn test_binds_and_patches_ids() {
        let mut fx = Fixture::new();
        let a = fx.vertex_buffer();
        let b = fx.vertex_buffer();
        fx.set_vb(0, a);
        fx.set_vb(1, b);
        fx.set_vb(2, a);
        let resolved = fx.resolve().unwrap();
        assert_eq!(resolved.binds, 2);

        let cmds = decode(&resolved.commands).unwrap();
        let types: Vec<u32> = cmds.iter().map(|c| c.command_type()).collect();
        assert_eq!(
            types,
            vec![
                PVGPU_CMD_BIND_OBJECT,
                PVGPU_CMD_SET_VERTEX_BUFFER,
                PVGPU_CMD_BIND_OBJECT,
                PVGPU_CMD_SET_VERTEX_BUFFER,
                PVGPU_CMD_SET_VERTEX_BUFFER,
            ]
        );

        let id_a = fx.registry.device_id(a).unwrap();
        let id_b = fx.registry.device_id(b).unwrap();
        let patched: Vec<u32> = cmds
            .iter()
            .filter(|c| c.command_type() == PVGPU_CMD_SET_VERTEX_BUFFER)
            .map(|c| c.read::<CmdSetVertexBuffer>().unwrap().buffer_id)
            .collect();
        assert_eq!(patched, vec![id_a, id_b, id_a]);

        let bind: CmdBindObject = cmds[0].read().unwrap();
        assert_eq!(bind.object_id, id_a);
        assert_eq!(bind.header.flags & PVGPU_CMD_FLAG_IMPLICIT, PVGPU_CMD_FLAG_IMPLICIT);
        assert!(fx.device.is_defined(ResourceKind::Buffer, id_a));
    }

    #[test]
    fn test_bound_resources_are_not_rebound() {
        let mut fx = Fixture::new();
        let a = fx.vertex_buffer();
        fx.set_vb(0, a);
        fx.resolve().unwrap();

        fx.set_vb(0, a);
        let resolved = fx.resolve().unwrap();
        assert_eq!(resolved.binds, 0);
        assert_eq!(resolved.commands.len(), std::mem::size_of::<CmdSetVertexBuffer>());
    }

    #[test]
    fn test_evicted_resource_is_rebound_with_same_id() {
        let mut fx = Fixture::new();
        let a = fx.vertex_buffer();
        fx.set_vb(0, a);
        fx.resolve().unwrap();
        let id = fx.registry.device_id(a).unwrap();
        assert!(fx.registry.mark_evicted(ResourceKind::Buffer, id));

        fx.set_vb(0, a);
        let resolved = fx.resolve().unwrap();
        assert_eq!(resolved.binds, 1);
        assert_eq!(fx.registry.binding(a).unwrap(), Binding::Bound(id));
    }

    #[test]
    fn test_usage_accumulates_flags() {
        let mut fx = Fixture::new();
        let a = fx.vertex_buffer();
        let entry = fx.registry.lookup(a).unwrap();
        let cmd = CmdCopyResource {
            header: CommandHeader::new(PVGPU_CMD_COPY_RESOURCE, std::mem::size_of::<CmdCopyResource>(), 1),
            dst_resource_id: 0,
            src_resource_id: 0,
            _reserved: [0; 2],
        };
        fx.buffer
            .reserve(std::mem::size_of::<CmdCopyResource>(), 2)
            .unwrap()
            .copy_from_slice(bytemuck::bytes_of(&cmd));
        fx.buffer
            .add_relocation(
                Relocation::resource(offset_of!(CmdCopyResource, dst_resource_id), a, RelocFlags::WRITE),
                Some(&entry),
            )
            .unwrap();
        fx.buffer
            .add_relocation(
                Relocation::resource(offset_of!(CmdCopyResource, src_resource_id), a, RelocFlags::READ),
                Some(&entry),
            )
            .unwrap();

        let resolved = fx.resolve().unwrap();
        assert_eq!(resolved.usage.len(), 1);
        assert_eq!(resolved.usage[0].flags, RelocFlags::READ | RelocFlags::WRITE);
        assert_eq!(resolved.referenced.len(), 1);
    }

    #[test]
    fn test_secondary_patch_and_context() {
        let mut fx = Fixture::new();
        let mob = fx.registry.create(&Descriptor::Mob(MobDesc { size: 4096 })).unwrap();
        let entry = fx.registry.lookup(mob).unwrap();
        let cmd = CmdSetConstantBuffer {
            header: CommandHeader::new(
                PVGPU_CMD_SET_CONSTANT_BUFFER,
                std::mem::size_of::<CmdSetConstantBuffer>(),
                1,
            ),
            stage: 0,
            slot: 0,
            mob_id: 0,
            offset_into_mob: 0,
        };
        fx.buffer
            .reserve(std::mem::size_of::<CmdSetConstantBuffer>(), 1)
            .unwrap()
            .copy_from_slice(bytemuck::bytes_of(&cmd));
        fx.buffer
            .add_relocation(
                Relocation::mob(
                    offset_of!(CmdSetConstantBuffer, mob_id),
                    mob,
                    RelocFlags::READ,
                    offset_of!(CmdSetConstantBuffer, offset_into_mob),
                    256,
                ),
                Some(&entry),
            )
            .unwrap();

        let resolved = fx.resolve().unwrap();
        let cmds = decode(&resolved.commands).unwrap();
        let set: CmdSetConstantBuffer = cmds[1].read().unwrap();
        assert_eq!(set.mob_id, fx.registry.device_id(mob).unwrap());
        assert_eq!(set.offset_into_mob, 256);
    }

    #[test]
    fn test_failed_define_rolls_back() {
        let mut fx = Fixture::new();
        fx.device = LoopbackDevice::new(DeviceCaps {
            memory_budget: 300,
            ..DeviceCaps::default()
        });
        let a = fx.vertex_buffer();
        let b = fx.vertex_buffer();
        fx.set_vb(0, a);
        fx.set_vb(1, b);
        assert_matches!(fx.resolve(), Err(Error::OutOfDeviceMemory));
        // `a` got an id, but its bind never reached the device
        assert_matches!(fx.registry.binding(a).unwrap(), Binding::Evicted(_));
        assert_eq!(fx.registry.binding(b).unwrap(), Binding::Unbound);
    }
}
