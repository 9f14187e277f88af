//! Context
//!
//! A context owns one command buffer. Commands are written into reserved
//! space, resource references are recorded as relocations and `commit`
//! resolves, submits and fences the buffer. A buffer that runs out of space
//! is flushed implicitly, and the first reservation of every buffer stages
//! a rebind of resources evicted since the context last looked.

use std::collections::HashMap;
use std::mem::offset_of;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use bytemuck::Pod;
use tracing::{debug, info, trace, warn};

use crate::builder::CommandBuffer;
use crate::debug::DebugFlags;
use crate::device::Submission;
use crate::encode::{encode_dispatch, encode_primitive, PrimitiveInfo};
use crate::error::{Error, Result};
use crate::fence::{Fence, FenceFlags};
use crate::protocol::*;
use crate::registry::{Mapping, ResourceEntry};
use crate::reloc::{self, RelocFlags, RelocTarget, Relocation};
use crate::resource::{Binding, DeviceObject, MapFlags, ResourceHandle, ShaderStage};
use crate::screen::Screen;
use crate::time::Timeout;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Hints: u32 {
        /// Flush early once the buffer is nearly full rather than waiting
        /// for a reservation to fail.
        const CAN_PRE_FLUSH = 1 << 0;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryBindFlags: u32 {
        /// Make the query object the context's result store.
        const SET = 1 << 0;
        /// Reference the bound query object without changing it.
        const REF = 1 << 1;
    }
}

/// Result of [`Context::map`].
#[derive(Debug)]
pub enum MapOutcome {
    Mapped(Mapping),
    /// The command buffer has no room to record the map. Commit and map
    /// again.
    Retry,
}

impl MapOutcome {
    pub fn mapped(self) -> Option<Mapping> {
        match self {
            MapOutcome::Mapped(mapping) => Some(mapping),
            MapOutcome::Retry => None,
        }
    }
}

pub struct Context {
    id: u32,
    screen: Arc<Screen>,
    buffer: CommandBuffer,
    /// Resources of earlier submissions, scanned for evictions.
    in_use: HashMap<ResourceHandle, Weak<ResourceEntry>>,
    seen_epoch: u64,
    /// The rebind prologue of the current buffer has been staged.
    started: bool,
    lost: bool,
    hints: Hints,
    last_fence: Option<Fence>,
    submissions: u64,
}

impl Context {
    pub(crate) fn new(id: u32, screen: Arc<Screen>) -> Self {
        let options = screen.options();
        Self {
            id,
            buffer: CommandBuffer::new(options.command_buffer_size, options.max_relocations),
            in_use: HashMap::new(),
            seen_epoch: screen.eviction_epoch(),
            started: false,
            lost: false,
            hints: Hints::empty(),
            last_fence: None,
            submissions: 0,
            screen,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn screen(&self) -> &Arc<Screen> {
        &self.screen
    }

    pub fn hints(&self) -> Hints {
        self.hints
    }

    pub fn set_hints(&mut self, hints: Hints) {
        self.hints = hints;
    }

    /// Fence of the most recent submission, explicit or implicit.
    pub fn last_fence(&self) -> Option<&Fence> {
        self.last_fence.as_ref()
    }

    /// Buffers submitted so far.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Header for a command of this context.
    pub fn header(&self, command_type: u32, command_size: usize) -> CommandHeader {
        CommandHeader::new(command_type, command_size, self.id)
    }

    fn check_usable(&self) -> Result<()> {
        if self.lost || self.screen.is_lost() {
            return Err(Error::DeviceLost);
        }
        Ok(())
    }

    fn fail(&mut self, error: Error) -> Error {
        if error == Error::DeviceLost {
            self.lost = true;
            self.screen.device_lost();
        }
        error
    }

    // =========================================================================
    // Reservation
    // =========================================================================

    /// Writable space for `bytes` bytes of commands referencing at most
    /// `relocs` resources. Flushes the current buffer if the request does not
    /// fit; fails only if it would not fit an empty buffer either.
    pub fn reserve(&mut self, bytes: usize, relocs: usize) -> Result<&mut [u8]> {
        self.check_usable()?;
        if !self.buffer.fits_empty(bytes, relocs) {
            return Err(Error::CommandTooLarge {
                requested: bytes,
                capacity: self.buffer.capacity(),
            });
        }
        self.prepare(bytes, relocs)?;
        self.buffer.reserve(bytes, relocs)
    }

    fn nearly_full(&self) -> bool {
        self.hints.contains(Hints::CAN_PRE_FLUSH)
            && !self.buffer.is_empty()
            && self.buffer.projected_len() * 8 >= self.buffer.capacity() * 7
    }

    /// Make room for a reservation and stage the prologue of a new buffer.
    fn prepare(&mut self, bytes: usize, relocs: usize) -> Result<()> {
        if self.started && (!self.buffer.fits(bytes, relocs) || self.nearly_full()) {
            self.implicit_flush()?;
        }
        if !self.started {
            self.start_buffer()?;
            if !self.buffer.fits(bytes, relocs) {
                // the prologue took the room; it is complete for this epoch
                self.implicit_flush()?;
                self.started = true;
            }
        }
        Ok(())
    }

    fn implicit_flush(&mut self) -> Result<()> {
        if self.screen.debug().contains(DebugFlags::FLUSH) {
            info!("Context {}: implicit flush", self.id);
        } else {
            debug!("Context {}: implicit flush", self.id);
        }
        self.commit().map(|_| ())
    }

    /// Stage a bind of every resource used by earlier buffers that was
    /// evicted since the last buffer started.
    fn start_buffer(&mut self) -> Result<()> {
        self.screen.process_evictions();
        self.started = true;
        let epoch = self.screen.eviction_epoch();
        if epoch == self.seen_epoch {
            return Ok(());
        }
        self.seen_epoch = epoch;

        self.in_use.retain(|_, entry| entry.strong_count() > 0);
        let mut evicted: Vec<Arc<ResourceEntry>> = self
            .in_use
            .values()
            .filter_map(Weak::upgrade)
            .filter(|entry| !entry.is_destroyed() && matches!(entry.binding(), Binding::Evicted(_)))
            .collect();
        evicted.sort_by_key(|entry| entry.handle());

        if !evicted.is_empty() && self.screen.debug().contains(DebugFlags::REBIND) {
            info!("Context {}: rebinding {} evicted resources", self.id, evicted.len());
        }
        for entry in evicted {
            if !self.buffer.fits_rebind() {
                self.submit()?;
            }
            self.buffer.stage_rebind(&entry, RelocFlags::INTERNAL, false)?;
        }
        Ok(())
    }

    /// Record a reference to a resource (or this context) inside the last
    /// reservation. Relocations of one reservation come in offset order.
    pub fn add_relocation(&mut self, reloc: Relocation) -> Result<()> {
        let entry = match reloc.target {
            RelocTarget::Resource { handle, kind } => {
                let entry = self.screen.registry().lookup(handle)?;
                if let Some(kind) = kind {
                    if entry.kind() != kind {
                        return Err(Error::unsupported(format!(
                            "{} is a {:?}, referenced as a {:?}",
                            handle,
                            entry.kind(),
                            kind
                        )));
                    }
                }
                Some(entry)
            }
            RelocTarget::Context => None,
        };
        self.buffer.add_relocation(reloc, entry.as_ref())
    }

    /// Reserve, copy and relocate one command.
    pub fn emit_bytes(&mut self, bytes: &[u8], relocs: &[Relocation]) -> Result<()> {
        self.reserve(bytes.len(), relocs.len())?.copy_from_slice(bytes);
        relocs.iter().try_for_each(|reloc| self.add_relocation(*reloc))
    }

    pub fn emit<T: Pod>(&mut self, cmd: &T, relocs: &[Relocation]) -> Result<()> {
        self.emit_bytes(bytemuck::bytes_of(cmd), relocs)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub fn draw(&mut self, info: &PrimitiveInfo) -> Result<()> {
        let cmd = encode_primitive(info, self.id);
        self.emit_bytes(cmd.as_bytes(), &[])
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) -> Result<()> {
        let cmd = encode_dispatch(groups, self.id);
        self.emit_bytes(cmd.as_bytes(), &[])
    }

    pub fn set_render_targets(
        &mut self,
        targets: &[ResourceHandle],
        depth_stencil: Option<ResourceHandle>,
    ) -> Result<()> {
        if targets.len() > 8 {
            return Err(Error::unsupported(format!("{} render targets", targets.len())));
        }
        let cmd = CmdSetRenderTarget {
            header: self.header(PVGPU_CMD_SET_RENDER_TARGET, std::mem::size_of::<CmdSetRenderTarget>()),
            num_rtvs: targets.len() as u32,
            dsv_id: PVGPU_INVALID_ID,
            rtv_ids: [PVGPU_INVALID_ID; 8],
            _reserved: [0; 2],
        };

        let mut relocs = Vec::with_capacity(targets.len() + 1);
        if let Some(dsv) = depth_stencil {
            relocs.push(Relocation::surface(
                offset_of!(CmdSetRenderTarget, dsv_id),
                dsv,
                RelocFlags::READ | RelocFlags::WRITE,
            ));
        }
        for (i, rtv) in targets.iter().enumerate() {
            relocs.push(Relocation::surface(
                offset_of!(CmdSetRenderTarget, rtv_ids) + i * 4,
                *rtv,
                RelocFlags::WRITE,
            ));
        }
        self.emit(&cmd, &relocs)
    }

    /// Bind a shader, optionally loading it from a memory object.
    pub fn set_shader(
        &mut self,
        stage: ShaderStage,
        shader: ResourceHandle,
        backing: Option<(ResourceHandle, u32)>,
    ) -> Result<()> {
        let cmd = CmdSetShader {
            header: self.header(PVGPU_CMD_SET_SHADER, std::mem::size_of::<CmdSetShader>()),
            stage: stage as u32,
            shader_id: PVGPU_INVALID_ID,
            mob_id: PVGPU_INVALID_ID,
            mob_offset: 0,
        };
        let mut relocs = vec![Relocation::shader(offset_of!(CmdSetShader, shader_id), shader)];
        if let Some((mob, offset)) = backing {
            relocs.push(Relocation::mob(
                offset_of!(CmdSetShader, mob_id),
                mob,
                RelocFlags::READ,
                offset_of!(CmdSetShader, mob_offset),
                offset,
            ));
        }
        self.emit(&cmd, &relocs)
    }

    pub fn set_constant_buffer(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        mob: ResourceHandle,
        offset: u32,
    ) -> Result<()> {
        let cmd = CmdSetConstantBuffer {
            header: self.header(PVGPU_CMD_SET_CONSTANT_BUFFER, std::mem::size_of::<CmdSetConstantBuffer>()),
            stage: stage as u32,
            slot,
            mob_id: PVGPU_INVALID_ID,
            offset_into_mob: 0,
        };
        self.emit(
            &cmd,
            &[Relocation::mob(
                offset_of!(CmdSetConstantBuffer, mob_id),
                mob,
                RelocFlags::READ,
                offset_of!(CmdSetConstantBuffer, offset_into_mob),
                offset,
            )],
        )
    }

    pub fn set_vertex_buffer(
        &mut self,
        slot: u32,
        buffer: ResourceHandle,
        stride: u32,
        offset: u32,
    ) -> Result<()> {
        let cmd = CmdSetVertexBuffer {
            header: self.header(PVGPU_CMD_SET_VERTEX_BUFFER, std::mem::size_of::<CmdSetVertexBuffer>()),
            slot,
            buffer_id: PVGPU_INVALID_ID,
            stride,
            offset,
        };
        self.emit(
            &cmd,
            &[Relocation::buffer(
                offset_of!(CmdSetVertexBuffer, buffer_id),
                buffer,
                RelocFlags::READ,
            )],
        )
    }

    pub fn set_index_buffer(&mut self, buffer: ResourceHandle, format: u32, offset: u32) -> Result<()> {
        let cmd = CmdSetIndexBuffer {
            header: self.header(PVGPU_CMD_SET_INDEX_BUFFER, std::mem::size_of::<CmdSetIndexBuffer>()),
            buffer_id: PVGPU_INVALID_ID,
            format,
            offset,
            _reserved: 0,
        };
        self.emit(
            &cmd,
            &[Relocation::buffer(
                offset_of!(CmdSetIndexBuffer, buffer_id),
                buffer,
                RelocFlags::READ,
            )],
        )
    }

    pub fn copy_resource(&mut self, dst: ResourceHandle, src: ResourceHandle) -> Result<()> {
        let cmd = CmdCopyResource {
            header: self.header(PVGPU_CMD_COPY_RESOURCE, std::mem::size_of::<CmdCopyResource>()),
            dst_resource_id: PVGPU_INVALID_ID,
            src_resource_id: PVGPU_INVALID_ID,
            _reserved: [0; 2],
        };
        self.emit(
            &cmd,
            &[
                Relocation::resource(
                    offset_of!(CmdCopyResource, dst_resource_id),
                    dst,
                    RelocFlags::WRITE | RelocFlags::DMA,
                ),
                Relocation::resource(
                    offset_of!(CmdCopyResource, src_resource_id),
                    src,
                    RelocFlags::READ | RelocFlags::DMA,
                ),
            ],
        )
    }

    /// Attach a query object to this context.
    pub fn query_bind(&mut self, query: ResourceHandle, flags: QueryBindFlags) -> Result<()> {
        let cmd = CmdQueryBind {
            header: self.header(PVGPU_CMD_QUERY_BIND, std::mem::size_of::<CmdQueryBind>()),
            context_id: PVGPU_INVALID_ID,
            query_mob_id: PVGPU_INVALID_ID,
            bind_flags: flags.bits(),
            _reserved: 0,
        };
        self.emit(
            &cmd,
            &[
                Relocation::context(offset_of!(CmdQueryBind, context_id)),
                Relocation::query(offset_of!(CmdQueryBind, query_mob_id), query),
            ],
        )
    }

    pub fn begin_query(&mut self, query: ResourceHandle, offset: u32, query_type: u32) -> Result<()> {
        self.query_command(PVGPU_CMD_BEGIN_QUERY, query, offset, query_type)
    }

    /// The result lands at `offset` of the query object once the fence of
    /// the submission signals.
    pub fn end_query(&mut self, query: ResourceHandle, offset: u32, query_type: u32) -> Result<()> {
        self.query_command(PVGPU_CMD_END_QUERY, query, offset, query_type)
    }

    fn query_command(
        &mut self,
        command_type: u32,
        query: ResourceHandle,
        offset: u32,
        query_type: u32,
    ) -> Result<()> {
        if offset % 8 != 0 {
            return Err(Error::unsupported(format!("query offset {offset} is not 8-byte aligned")));
        }
        let cmd = CmdQuery {
            header: self.header(command_type, std::mem::size_of::<CmdQuery>()),
            query_mob_id: PVGPU_INVALID_ID,
            offset,
            query_type,
            _reserved: 0,
        };
        self.emit(&cmd, &[Relocation::query(offset_of!(CmdQuery, query_mob_id), query)])
    }

    /// Debug marker in the command stream. Only recorded when annotations
    /// are enabled.
    pub fn annotate(&mut self, text: &str) -> Result<()> {
        if !self.screen.debug().contains(DebugFlags::ANNOTATE) {
            return Ok(());
        }
        let head = std::mem::size_of::<CmdAnnotation>();
        let size = align16(head + text.len());
        let cmd = CmdAnnotation {
            header: self.header(PVGPU_CMD_ANNOTATION, size),
            text_len: text.len() as u32,
            _reserved: [0; 3],
        };
        let region = self.reserve(size, 0)?;
        region[..head].copy_from_slice(bytemuck::bytes_of(&cmd));
        region[head..head + text.len()].copy_from_slice(text.as_bytes());
        Ok(())
    }

    // =========================================================================
    // Mapping & residency
    // =========================================================================

    /// Map a resource for CPU access.
    ///
    /// Unless the intent is unsynchronized or discards the contents, pending
    /// work on the resource is flushed and waited for first. A discarding map
    /// of a device-bound surface or buffer records an invalidate; when the
    /// buffer has no room for it the result is [`MapOutcome::Retry`].
    pub fn map(&mut self, handle: ResourceHandle, flags: MapFlags) -> Result<MapOutcome> {
        self.check_usable()?;
        let entry = self.screen.registry().lookup(handle)?;
        let debug = self.screen.debug().contains(DebugFlags::MAP);

        let sync = !flags.intersects(MapFlags::UNSYNCHRONIZED | MapFlags::DISCARD_WHOLE_RESOURCE);
        if sync {
            if self.buffer.touches(handle) {
                self.commit()?;
            }
            for fence in entry.pending_fences() {
                if debug {
                    debug!("Map of {} waits for fence {}", handle, fence.seqno());
                }
                if !self.screen.wait(&fence, Timeout::Infinite) {
                    break;
                }
            }
            self.check_usable()?;
        }

        let invalidate = entry.binding().device_id().is_some()
            && entry.resource().map_records_invalidate(flags);
        let invalidate_size = std::mem::size_of::<CmdInvalidateObject>();
        if invalidate && self.started && !self.buffer.fits(invalidate_size, 1) {
            if debug {
                debug!("Map of {} needs a flush first", handle);
            }
            return Ok(MapOutcome::Retry);
        }

        let mapping = self.screen.registry().map(handle, flags)?;
        if invalidate {
            let cmd = CmdInvalidateObject {
                header: self.header(PVGPU_CMD_INVALIDATE_OBJECT, invalidate_size),
                object_kind: entry.kind().wire(),
                object_id: PVGPU_INVALID_ID,
                _reserved: [0; 2],
            };
            self.emit(
                &cmd,
                &[Relocation::resource(
                    offset_of!(CmdInvalidateObject, object_id),
                    handle,
                    RelocFlags::WRITE,
                )],
            )?;
        }
        if debug {
            debug!("Mapped {} with {:?} (invalidate: {})", handle, flags, invalidate);
        }
        Ok(MapOutcome::Mapped(mapping))
    }

    /// Returns whether the resource must be rebound with [`Context::rebind`].
    pub fn unmap(&mut self, mapping: Mapping) -> bool {
        let handle = mapping.handle();
        self.screen.process_evictions();
        let rebind = self.screen.registry().unmap(mapping);
        if rebind && self.screen.debug().intersects(DebugFlags::MAP | DebugFlags::REBIND) {
            debug!("Unmap of {} requires a rebind", handle);
        }
        rebind
    }

    /// Bind the resource again in the current buffer, whatever its state.
    pub fn rebind(&mut self, handle: ResourceHandle, flags: RelocFlags) -> Result<()> {
        self.check_usable()?;
        let entry = self.screen.registry().lookup(handle)?;
        self.prepare(0, 1)?;
        self.buffer.stage_rebind(&entry, flags, true)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Resolve relocations, submit the buffer and fence it. The context
    /// starts a fresh buffer whatever the outcome.
    pub fn commit(&mut self) -> Result<Fence> {
        let result = self.submit();
        self.started = false;
        result
    }

    fn submit(&mut self) -> Result<Fence> {
        let staged = self.buffer.take();
        self.check_usable()?;

        let screen = self.screen.clone();
        let debug_flags = screen.debug();
        let submit_lock = screen.submit_lock();
        // ids evicted while the buffer was being recorded must be bound again
        screen.process_evictions();

        let mut resolved = match reloc::resolve(
            &staged,
            screen.registry(),
            screen.device(),
            self.id,
            debug_flags,
        ) {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.fail(e)),
        };

        let seqno = screen.fences().next_seqno();
        let mut fence_flags = FenceFlags::EXEC;
        if resolved.has_queries {
            fence_flags |= FenceFlags::QUERY;
        }
        let fence_cmd = CmdFence {
            header: self.header(PVGPU_CMD_FENCE, std::mem::size_of::<CmdFence>()),
            fence_value: seqno,
            fence_flags: fence_flags.bits(),
            _reserved: 0,
        };
        resolved.commands.extend_from_slice(bytemuck::bytes_of(&fence_cmd));

        if debug_flags.contains(DebugFlags::FLUSH) {
            info!(
                "Context {}: submit seqno {} ({} bytes, {} relocations, {} binds, {} resources)",
                self.id,
                seqno,
                resolved.commands.len(),
                staged.relocs.len(),
                resolved.binds,
                resolved.usage.len()
            );
        }
        if debug_flags.contains(DebugFlags::HEX) {
            debug!("Context {} seqno {}:\n{}", self.id, seqno, hex_dump(&resolved.commands));
        }

        let submission = Submission {
            context_id: self.id,
            seqno,
            fence_flags,
            commands: &resolved.commands,
            usage: &resolved.usage,
        };
        if let Err(e) = screen.device().submit(&submission) {
            warn!("Context {}: submission {} failed: {}", self.id, seqno, e);
            resolved.rollback(screen.registry());
            return Err(self.fail(e));
        }
        let fence = screen.fences().create(seqno, fence_flags);
        drop(submit_lock);

        // fence before unstaging so reclaim never sees the resource idle
        for entry in &resolved.referenced {
            entry.attach_fence(fence.clone());
            self.in_use.insert(entry.handle(), Arc::downgrade(entry));
        }
        drop(staged);
        self.submissions += 1;
        trace!("Context {}: submitted seqno {}", self.id, seqno);

        screen.reap();
        if debug_flags.contains(DebugFlags::SYNC) {
            screen.wait(&fence, Timeout::Infinite);
        }
        self.last_fence = Some(fence.clone());
        Ok(fence)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Context {} dropped with unsubmitted commands", self.id);
        }
    }
}

fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(i, line)| {
            let words: Vec<String> = line
                .chunks(4)
                .map(|w| w.iter().rev().map(|b| format!("{b:02x}")).collect())
                .collect();
            format!("{:08x}: {}", i * 16, words.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
