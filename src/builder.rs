//! Command Buffer Builder
//!
//! Accumulates command bytes and the relocations that refer into them.
//! Capacity accounting reserves room for the bind commands the relocation
//! engine may insert and for the trailing fence, so a buffer that accepted
//! a reservation always resolves within its capacity.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::CmdFence;
use crate::registry::{ResourceEntry, ResourceRegistry, StagedRef};
use crate::reloc::{RelocFlags, RelocTarget, Relocation, BIND_COMMAND_SIZE};
use crate::resource::ResourceHandle;

const FENCE_COMMAND_SIZE: usize = std::mem::size_of::<CmdFence>();

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StagedItem {
    /// Bytes `start..start + len` of the staged buffer and their relocations.
    Commands {
        start: usize,
        len: usize,
        relocs: Range<usize>,
    },
    /// Bind the resource ahead of the following commands. Without `force`
    /// the bind is only emitted if the resource lacks a valid id.
    Rebind {
        handle: ResourceHandle,
        flags: RelocFlags,
        force: bool,
    },
}

/// Contents of a command buffer taken for submission.
#[derive(Debug, Default)]
pub(crate) struct StagedBuffer {
    pub bytes: Vec<u8>,
    pub items: Vec<StagedItem>,
    pub relocs: Vec<Relocation>,
    touched: HashMap<ResourceHandle, StagedRef>,
}

impl StagedBuffer {
    pub fn entry(&self, handle: ResourceHandle) -> Result<&Arc<ResourceEntry>> {
        self.touched
            .get(&handle)
            .map(StagedRef::entry)
            .ok_or(Error::InvalidHandle(handle))
    }

    pub fn touched_len(&self) -> usize {
        self.touched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    start: usize,
    len: usize,
    relocs_left: usize,
    last_offset: Option<usize>,
}

/// One context's command buffer under construction.
#[derive(Debug)]
pub(crate) struct CommandBuffer {
    capacity: usize,
    max_relocs: usize,
    staged: StagedBuffer,
    /// Bind commands the engine may still have to insert.
    bind_headroom: usize,
    reservation: Option<Reservation>,
}

impl CommandBuffer {
    pub fn new(capacity: usize, max_relocs: usize) -> Self {
        Self {
            capacity,
            max_relocs,
            staged: StagedBuffer::default(),
            bind_headroom: 0,
            reservation: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes the buffer will occupy once resolved, at worst.
    pub fn projected_len(&self) -> usize {
        self.staged.bytes.len() + self.bind_headroom * BIND_COMMAND_SIZE + FENCE_COMMAND_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Whether the staged commands reference `handle`.
    pub fn touches(&self, handle: ResourceHandle) -> bool {
        self.staged.touched.contains_key(&handle)
    }

    fn unused_relocs(&self) -> usize {
        self.reservation.map_or(0, |r| r.relocs_left)
    }

    fn fits_with(&self, used_bytes: usize, used_relocs: usize, bytes: usize, relocs: usize) -> bool {
        let binds = used_relocs + relocs;
        used_bytes + bytes + binds * BIND_COMMAND_SIZE + FENCE_COMMAND_SIZE <= self.capacity
            && self.staged.relocs.len() + relocs <= self.max_relocs
    }

    /// Whether a reservation fits in what is left of the buffer.
    pub fn fits(&self, bytes: usize, relocs: usize) -> bool {
        // unused relocations of the open reservation are given back on reserve
        let headroom = self.bind_headroom - self.unused_relocs();
        self.fits_with(self.staged.bytes.len(), headroom, bytes, relocs)
    }

    /// Whether a reservation fits in an empty buffer.
    pub fn fits_empty(&self, bytes: usize, relocs: usize) -> bool {
        relocs <= self.max_relocs && self.fits_with(0, 0, bytes, relocs)
    }

    fn close_reservation(&mut self) {
        if let Some(r) = self.reservation.take() {
            self.bind_headroom -= r.relocs_left;
        }
    }

    /// Writable region of exactly `bytes` bytes, with room for `relocs`
    /// relocations.
    pub fn reserve(&mut self, bytes: usize, relocs: usize) -> Result<&mut [u8]> {
        if !self.fits(bytes, relocs) {
            return Err(Error::BufferExhausted);
        }
        self.close_reservation();

        let start = self.staged.bytes.len();
        let first_reloc = self.staged.relocs.len();
        self.staged.bytes.resize(start + bytes, 0);
        self.staged.items.push(StagedItem::Commands {
            start,
            len: bytes,
            relocs: first_reloc..first_reloc,
        });
        self.bind_headroom += relocs;
        self.reservation = Some(Reservation {
            start,
            len: bytes,
            relocs_left: relocs,
            last_offset: None,
        });
        trace!("Reserved {} bytes at {} ({} relocs)", bytes, start, relocs);
        Ok(&mut self.staged.bytes[start..])
    }

    /// Append a relocation into the last reservation. `entry` is the
    /// resolved target of resource relocations.
    pub fn add_relocation(
        &mut self,
        reloc: Relocation,
        entry: Option<&Arc<ResourceEntry>>,
    ) -> Result<()> {
        let Some(reservation) = self.reservation.as_mut() else {
            debug_assert!(false, "relocation without a reservation");
            return Err(Error::MalformedStream("relocation without a reservation".into()));
        };
        debug_assert!(reservation.relocs_left > 0, "more relocations than reserved");
        debug_assert!(reloc.end() <= reservation.len, "relocation outside its reservation");
        debug_assert!(
            reservation.last_offset.map_or(true, |last| reloc.offset > last),
            "relocation offsets must increase"
        );
        if reservation.relocs_left == 0 {
            return Err(Error::MalformedStream("more relocations than reserved".into()));
        }
        reservation.relocs_left -= 1;
        reservation.last_offset = Some(reloc.offset);
        let start = reservation.start;

        let new_resource = match (&reloc.target, entry) {
            (RelocTarget::Resource { handle, .. }, Some(entry)) => {
                debug_assert_eq!(*handle, entry.handle());
                match self.staged.touched.get(handle) {
                    Some(_) => false,
                    None => {
                        self.staged
                            .touched
                            .insert(*handle, ResourceRegistry::stage_entry(entry));
                        true
                    }
                }
            }
            (RelocTarget::Resource { handle, .. }, None) => {
                if !self.staged.touched.contains_key(handle) {
                    return Err(Error::InvalidHandle(*handle));
                }
                false
            }
            (RelocTarget::Context, _) => false,
        };
        if !new_resource {
            // this relocation will never need a bind of its own
            self.bind_headroom -= 1;
        }

        self.staged.relocs.push(reloc);
        if let Some(StagedItem::Commands { relocs, .. }) = self.staged.items.last_mut() {
            relocs.end = self.staged.relocs.len();
        }
        trace!(
            "Relocation at {} -> {:?}",
            start + reloc.offset,
            reloc.target
        );
        Ok(())
    }

    /// Whether a rebind of one more resource fits.
    pub fn fits_rebind(&self) -> bool {
        self.fits(0, 1)
    }

    /// Stage a bind of `entry` ahead of whatever is reserved next.
    pub fn stage_rebind(&mut self, entry: &Arc<ResourceEntry>, flags: RelocFlags, force: bool) -> Result<()> {
        if !self.fits_rebind() {
            return Err(Error::BufferExhausted);
        }
        self.close_reservation();
        let handle = entry.handle();
        self.staged
            .touched
            .entry(handle)
            .or_insert_with(|| ResourceRegistry::stage_entry(entry));
        self.bind_headroom += 1;
        self.staged.items.push(StagedItem::Rebind {
            handle,
            flags,
            force,
        });
        Ok(())
    }

    /// Take the staged contents, leaving an empty buffer.
    pub fn take(&mut self) -> StagedBuffer {
        self.reservation = None;
        self.bind_headroom = 0;
        std::mem::take(&mut self.staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCaps;
    use crate::format::FormatTable;
    use crate::resource::{BufferDesc, BufferUsage, Descriptor};

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(DeviceCaps::default(), FormatTable::new())
    }

    fn buffer(reg: &ResourceRegistry) -> Arc<ResourceEntry> {
        let h = reg
            .create(&Descriptor::Buffer(BufferDesc {
                size: 64,
                alignment: 16,
                usage: BufferUsage::VERTEX,
            }))
            .unwrap();
        reg.lookup(h).unwrap()
    }

    #[test]
    fn test_reserve_until_exhausted() {
        // 32 bytes of fence headroom leave room for three 32-byte commands
        let mut cb = CommandBuffer::new(128, 16);
        for _ in 0..3 {
            assert_eq!(cb.reserve(32, 0).unwrap().len(), 32);
        }
        assert!(!cb.fits(32, 0));
        assert!(matches!(cb.reserve(32, 0), Err(Error::BufferExhausted)));
        assert!(cb.fits_empty(96, 0));
        assert!(!cb.fits_empty(128, 0));
    }

    #[test]
    fn test_bind_headroom_released_for_known_resources() {
        let reg = registry();
        let entry = buffer(&reg);
        let mut cb = CommandBuffer::new(4096, 16);

        cb.reserve(32, 2).unwrap();
        cb.add_relocation(Relocation::buffer(16, entry.handle(), RelocFlags::READ), Some(&entry))
            .unwrap();
        cb.add_relocation(Relocation::buffer(20, entry.handle(), RelocFlags::WRITE), Some(&entry))
            .unwrap();
        assert_eq!(cb.projected_len(), 32 + BIND_COMMAND_SIZE + FENCE_COMMAND_SIZE);

        // unused relocations are given back when the next reservation opens
        cb.reserve(32, 4).unwrap();
        cb.reserve(16, 0).unwrap();
        assert_eq!(cb.projected_len(), 80 + BIND_COMMAND_SIZE + FENCE_COMMAND_SIZE);
    }

    #[test]
    fn test_relocation_count_limit() {
        let cb = CommandBuffer::new(4096, 2);
        assert!(cb.fits(16, 2));
        assert!(!cb.fits(16, 3));
        assert!(!cb.fits_empty(16, 3));
    }

    #[test]
    fn test_staging_keeps_resources_unflushed() {
        let reg = registry();
        let entry = buffer(&reg);
        let mut cb = CommandBuffer::new(4096, 16);
        cb.reserve(32, 1).unwrap();
        cb.add_relocation(Relocation::buffer(16, entry.handle(), RelocFlags::READ), Some(&entry))
            .unwrap();
        assert!(!reg.is_flushed(entry.handle()).unwrap());

        let staged = cb.take();
        assert!(cb.is_empty());
        assert_eq!(staged.touched_len(), 1);
        assert!(!reg.is_flushed(entry.handle()).unwrap());
        drop(staged);
        assert!(reg.is_flushed(entry.handle()).unwrap());
    }

    #[test]
    fn test_rebind_closes_reservation() {
        let reg = registry();
        let entry = buffer(&reg);
        let mut cb = CommandBuffer::new(4096, 16);
        cb.reserve(32, 1).unwrap();
        cb.stage_rebind(&entry, RelocFlags::INTERNAL, true).unwrap();
        let staged = cb.take();
        assert_eq!(staged.items.len(), 2);
        assert!(matches!(staged.items[1], StagedItem::Rebind { force: true, .. }));
        assert!(staged.entry(entry.handle()).is_ok());
    }

    #[test]
    #[should_panic(expected = "relocation offsets must increase")]
    #[cfg(debug_assertions)]
    fn test_relocations_must_be_ordered() {
        let mut cb = CommandBuffer::new(4096, 16);
        cb.reserve(32, 2).unwrap();
        cb.add_relocation(Relocation::context(20), None).unwrap();
        cb.add_relocation(Relocation::context(16), None).unwrap();
    }
}
