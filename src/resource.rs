//! Resource Module
//!
//! Driver-side resource handles, creation descriptors and the per-kind
//! objects behind them.

use std::fmt;

use bitflags::bitflags;

use crate::device::{Device, DeviceCaps};
use crate::error::{Error, Result};
use crate::format::{Format, FormatTable, UsageKind};

/// Opaque driver handle. Never reused while the registry holds the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub(crate) u32);

impl ResourceHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Device-assigned object id.
pub type DeviceId = u32;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Surface = 1,
    Buffer = 2,
    Shader = 3,
    Query = 4,
    Mob = 5,
}

impl ResourceKind {
    pub fn wire(self) -> u32 {
        self as u32
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Surface),
            2 => Some(Self::Buffer),
            3 => Some(Self::Shader),
            4 => Some(Self::Query),
            5 => Some(Self::Mob),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SurfaceUsage: u32 {
        const SAMPLER = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const SHARED = 1 << 3;
        const SCANOUT = 1 << 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        /// Never evicted by the device.
        const PINNED = 1 << 3;
        const SHADER = 1 << 4;
    }
}

bitflags! {
    /// CPU access requested by `map`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Previous contents may be thrown away.
        const DISCARD_WHOLE_RESOURCE = 1 << 2;
        const UNSYNCHRONIZED = 1 << 3;
    }
}

impl MapFlags {
    pub fn discards(self) -> bool {
        self.contains(MapFlags::DISCARD_WHOLE_RESOURCE)
    }

    /// Two mappings may coexist only if neither writes.
    pub fn conflicts_with(self, other: MapFlags) -> bool {
        self.contains(MapFlags::WRITE) || other.contains(MapFlags::WRITE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub format: Format,
    pub size: Extent3d,
    /// 1, or 6 for cube maps.
    pub faces: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub usage: SurfaceUsage,
}

impl SurfaceDesc {
    pub fn texture_2d(format: Format, width: u32, height: u32) -> Self {
        Self {
            format,
            size: Extent3d {
                width,
                height,
                depth: 1,
            },
            faces: 1,
            array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            usage: SurfaceUsage::SAMPLER,
        }
    }

    pub fn with_usage(mut self, usage: SurfaceUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u32,
    pub alignment: u32,
    pub usage: BufferUsage,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex = 0,
    Pixel = 1,
    Geometry = 2,
    Hull = 3,
    Domain = 4,
    Compute = 5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderDesc {
    pub stage: ShaderStage,
    pub bytecode: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDesc {
    /// Bytes of result storage, one 8-byte slot per query.
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobDesc {
    pub size: u32,
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Surface(SurfaceDesc),
    Buffer(BufferDesc),
    Shader(ShaderDesc),
    Query(QueryDesc),
    Mob(MobDesc),
}

const MOB_PAGE_SIZE: u32 = 4096;

impl Descriptor {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Descriptor::Surface(_) => ResourceKind::Surface,
            Descriptor::Buffer(_) => ResourceKind::Buffer,
            Descriptor::Shader(_) => ResourceKind::Shader,
            Descriptor::Query(_) => ResourceKind::Query,
            Descriptor::Mob(_) => ResourceKind::Mob,
        }
    }

    /// Check the descriptor against device limits and build the resource.
    pub fn instantiate(&self, caps: &DeviceCaps, formats: &FormatTable) -> Result<Resource> {
        match self {
            Descriptor::Surface(desc) => Surface::new(desc, caps, formats).map(Resource::Surface),
            Descriptor::Buffer(desc) => Buffer::new(desc, caps).map(Resource::Buffer),
            Descriptor::Shader(desc) => ShaderObject::new(desc, caps).map(Resource::Shader),
            Descriptor::Query(desc) => {
                if desc.len == 0 || desc.len % 8 != 0 {
                    return Err(Error::unsupported(format!(
                        "query length {} is not a positive multiple of 8",
                        desc.len
                    )));
                }
                Ok(Resource::Query(QueryObject { len: desc.len }))
            }
            Descriptor::Mob(desc) => {
                if desc.size == 0 || desc.size % MOB_PAGE_SIZE != 0 {
                    return Err(Error::unsupported(format!(
                        "memory object size {} is not a positive multiple of {MOB_PAGE_SIZE}",
                        desc.size
                    )));
                }
                Ok(Resource::Mob(MemoryObject { size: desc.size }))
            }
        }
    }
}

/// Device residency of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// No device id yet.
    Unbound,
    Bound(DeviceId),
    /// The device dropped the backing store; the id must be rebound before use.
    Evicted(DeviceId),
}

impl Binding {
    /// The id, only while it is valid for use in a command.
    pub fn device_id(self) -> Option<DeviceId> {
        match self {
            Binding::Bound(id) => Some(id),
            _ => None,
        }
    }

    pub fn known_id(self) -> Option<DeviceId> {
        match self {
            Binding::Bound(id) | Binding::Evicted(id) => Some(id),
            Binding::Unbound => None,
        }
    }
}

/// Capabilities every resource kind shares.
pub trait DeviceObject {
    fn kind(&self) -> ResourceKind;

    /// Bytes of guest memory backing the object.
    fn backing_size(&self) -> u64;

    /// Reject CPU mappings the kind does not support.
    fn check_map(&self, flags: MapFlags) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::unsupported("empty map flags"));
        }
        Ok(())
    }

    /// Whether a mapping with `flags` of a device-bound object has to record
    /// an invalidate command in the current command buffer.
    fn map_records_invalidate(&self, flags: MapFlags) -> bool {
        let _ = flags;
        false
    }

    /// Whether the device may evict the backing store.
    fn evictable(&self) -> bool {
        true
    }

    /// Release the device id once the object is reclaimed.
    fn destroy(&self, device: &dyn Device, binding: Binding) {
        if let Some(id) = binding.known_id() {
            device.undefine(self.kind(), id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Surface {
    desc: SurfaceDesc,
    size: u64,
}

impl Surface {
    fn new(desc: &SurfaceDesc, caps: &DeviceCaps, formats: &FormatTable) -> Result<Self> {
        let Extent3d {
            width,
            height,
            depth,
        } = desc.size;
        if width == 0 || height == 0 || depth == 0 {
            return Err(Error::unsupported("zero surface dimension"));
        }
        if width > caps.max_texture_dim || height > caps.max_texture_dim || depth > caps.max_texture_dim {
            return Err(Error::unsupported(format!(
                "surface {width}x{height}x{depth} exceeds device limit {}",
                caps.max_texture_dim
            )));
        }
        if desc.faces != 1 && desc.faces != 6 {
            return Err(Error::unsupported(format!("{} faces", desc.faces)));
        }
        if desc.faces == 6 && width != height {
            return Err(Error::unsupported("cube faces must be square"));
        }
        if desc.array_size == 0 || desc.array_size > caps.max_array_layers {
            return Err(Error::unsupported(format!(
                "array size {}, device allows 1 to {}",
                desc.array_size, caps.max_array_layers
            )));
        }
        let max_mips = 32 - width.max(height).max(depth).leading_zeros();
        if desc.mip_levels == 0 || desc.mip_levels > max_mips {
            return Err(Error::unsupported(format!(
                "{} mip levels, at most {max_mips} allowed",
                desc.mip_levels
            )));
        }
        if !desc.sample_count.is_power_of_two() || desc.sample_count > caps.max_samples {
            return Err(Error::unsupported(format!(
                "sample count {}",
                desc.sample_count
            )));
        }

        let usages = [
            (SurfaceUsage::SAMPLER, UsageKind::Sampling),
            (SurfaceUsage::RENDER_TARGET, UsageKind::RenderTarget),
            (SurfaceUsage::DEPTH_STENCIL, UsageKind::DepthStencil),
        ];
        for (bit, usage) in usages {
            if desc.usage.contains(bit) && !formats.is_supported(desc.format, usage) {
                return Err(Error::unsupported(format!(
                    "format {:?} cannot be used for {usage:?}",
                    desc.format
                )));
            }
        }
        if formats.describe(desc.format).is_none() {
            return Err(Error::unsupported(format!("format {:?}", desc.format)));
        }

        let too_large =
            || Error::unsupported(format!("surface {width}x{height}x{depth} is too large"));
        let mut per_face = 0u64;
        for level in 0..desc.mip_levels {
            let w = (width >> level).max(1);
            let h = (height >> level).max(1);
            let d = u64::from((depth >> level).max(1));
            let image = formats
                .image_size(desc.format, w, h)
                .ok_or_else(|| Error::unsupported(format!("format {:?}", desc.format)))?;
            per_face = image
                .checked_mul(d)
                .and_then(|level_size| per_face.checked_add(level_size))
                .ok_or_else(too_large)?;
        }
        let size = [desc.faces, desc.array_size, desc.sample_count]
            .into_iter()
            .try_fold(per_face, |size, n| size.checked_mul(u64::from(n)))
            .ok_or_else(too_large)?;

        Ok(Self {
            desc: desc.clone(),
            size,
        })
    }

    pub fn desc(&self) -> &SurfaceDesc {
        &self.desc
    }
}

impl DeviceObject for Surface {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Surface
    }

    fn backing_size(&self) -> u64 {
        self.size
    }

    fn map_records_invalidate(&self, flags: MapFlags) -> bool {
        flags.discards()
    }

    fn evictable(&self) -> bool {
        !self.desc.usage.contains(SurfaceUsage::SCANOUT)
    }
}

#[derive(Debug, Clone)]
pub struct Buffer {
    desc: BufferDesc,
}

impl Buffer {
    fn new(desc: &BufferDesc, caps: &DeviceCaps) -> Result<Self> {
        if desc.size == 0 || desc.size > caps.max_buffer_size {
            return Err(Error::unsupported(format!(
                "buffer size {} (limit {})",
                desc.size, caps.max_buffer_size
            )));
        }
        if !desc.alignment.is_power_of_two() {
            return Err(Error::unsupported(format!(
                "buffer alignment {} is not a power of two",
                desc.alignment
            )));
        }
        Ok(Self { desc: desc.clone() })
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }
}

impl DeviceObject for Buffer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Buffer
    }

    fn backing_size(&self) -> u64 {
        u64::from(self.desc.size)
    }

    fn map_records_invalidate(&self, flags: MapFlags) -> bool {
        flags.discards()
    }

    fn evictable(&self) -> bool {
        !self.desc.usage.contains(BufferUsage::PINNED)
    }
}

#[derive(Debug, Clone)]
pub struct ShaderObject {
    stage: ShaderStage,
    bytecode: Vec<u32>,
}

impl ShaderObject {
    fn new(desc: &ShaderDesc, caps: &DeviceCaps) -> Result<Self> {
        let len = desc.bytecode.len() * 4;
        if desc.bytecode.is_empty() || len > caps.max_shader_bytes as usize {
            return Err(Error::unsupported(format!("shader of {len} bytes")));
        }
        Ok(Self {
            stage: desc.stage,
            bytecode: desc.bytecode.clone(),
        })
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn bytecode(&self) -> &[u32] {
        &self.bytecode
    }
}

impl DeviceObject for ShaderObject {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Shader
    }

    fn backing_size(&self) -> u64 {
        (self.bytecode.len() * 4) as u64
    }

    fn check_map(&self, _flags: MapFlags) -> Result<()> {
        Err(Error::unsupported("shader objects cannot be mapped"))
    }
}

#[derive(Debug, Clone)]
pub struct QueryObject {
    len: u32,
}

impl DeviceObject for QueryObject {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Query
    }

    fn backing_size(&self) -> u64 {
        u64::from(self.len)
    }

    fn check_map(&self, flags: MapFlags) -> Result<()> {
        if flags != MapFlags::READ {
            return Err(Error::unsupported("query objects are mapped read-only"));
        }
        Ok(())
    }

    fn evictable(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct MemoryObject {
    size: u32,
}

impl DeviceObject for MemoryObject {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Mob
    }

    fn backing_size(&self) -> u64 {
        u64::from(self.size)
    }
}

/// A resource of any kind.
#[derive(Debug, Clone)]
pub enum Resource {
    Surface(Surface),
    Buffer(Buffer),
    Shader(ShaderObject),
    Query(QueryObject),
    Mob(MemoryObject),
}

impl Resource {
    fn object(&self) -> &dyn DeviceObject {
        match self {
            Resource::Surface(s) => s,
            Resource::Buffer(b) => b,
            Resource::Shader(s) => s,
            Resource::Query(q) => q,
            Resource::Mob(m) => m,
        }
    }
}

impl DeviceObject for Resource {
    fn kind(&self) -> ResourceKind {
        self.object().kind()
    }

    fn backing_size(&self) -> u64 {
        self.object().backing_size()
    }

    fn check_map(&self, flags: MapFlags) -> Result<()> {
        self.object().check_map(flags)
    }

    fn map_records_invalidate(&self, flags: MapFlags) -> bool {
        self.object().map_records_invalidate(flags)
    }

    fn evictable(&self) -> bool {
        self.object().evictable()
    }

    fn destroy(&self, device: &dyn Device, binding: Binding) {
        self.object().destroy(device, binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn caps() -> DeviceCaps {
        DeviceCaps::default()
    }

    #[test]
    fn test_surface_size_with_mips() {
        let desc = SurfaceDesc::texture_2d(Format::R8G8B8A8Unorm, 4, 4).with_mips(3);
        let res = Descriptor::Surface(desc)
            .instantiate(&caps(), &FormatTable::new())
            .unwrap();
        // 4x4 + 2x2 + 1x1 texels of 4 bytes
        assert_eq!(res.backing_size(), (16 + 4 + 1) * 4);
        assert_eq!(res.kind(), ResourceKind::Surface);
    }

    #[test]
    fn test_surface_rejects_bad_descriptors() {
        let formats = FormatTable::new();
        let too_many_mips = SurfaceDesc::texture_2d(Format::R8Unorm, 4, 4).with_mips(4);
        assert_matches!(
            Descriptor::Surface(too_many_mips).instantiate(&caps(), &formats),
            Err(Error::UnsupportedDescriptor(_))
        );

        let huge = SurfaceDesc::texture_2d(Format::R8Unorm, caps().max_texture_dim + 1, 1);
        assert_matches!(
            Descriptor::Surface(huge).instantiate(&caps(), &formats),
            Err(Error::UnsupportedDescriptor(_))
        );

        let depth_rt = SurfaceDesc::texture_2d(Format::D32Float, 8, 8)
            .with_usage(SurfaceUsage::RENDER_TARGET);
        assert_matches!(
            Descriptor::Surface(depth_rt).instantiate(&caps(), &formats),
            Err(Error::UnsupportedDescriptor(_))
        );

        let mut cube = SurfaceDesc::texture_2d(Format::R8Unorm, 8, 4);
        cube.faces = 6;
        assert_matches!(
            Descriptor::Surface(cube).instantiate(&caps(), &formats),
            Err(Error::UnsupportedDescriptor(_))
        );
    }

    #[test]
    fn test_surface_array_limit() {
        let formats = FormatTable::new();
        let mut volume = SurfaceDesc::texture_2d(Format::B8G8R8A8Unorm, 16384, 16384);
        volume.size.depth = 16384;
        volume.array_size = u32::MAX;
        assert_matches!(
            Descriptor::Surface(volume.clone()).instantiate(&caps(), &formats),
            Err(Error::UnsupportedDescriptor(_))
        );

        volume.array_size = caps().max_array_layers;
        volume.format = Format::R32G32B32A32Float;
        volume.sample_count = caps().max_samples;
        let Resource::Surface(surface) = Descriptor::Surface(volume).instantiate(&caps(), &formats).unwrap()
        else {
            panic!("expected a surface");
        };
        assert_eq!(surface.backing_size(), 16u64 << 42 << 11 << 3);
    }

    #[test]
    fn test_buffer_and_mob_limits() {
        let bad_align = BufferDesc {
            size: 64,
            alignment: 3,
            usage: BufferUsage::VERTEX,
        };
        assert_matches!(
            Descriptor::Buffer(bad_align).instantiate(&caps(), &FormatTable::new()),
            Err(Error::UnsupportedDescriptor(_))
        );
        assert_matches!(
            Descriptor::Mob(MobDesc { size: 100 }).instantiate(&caps(), &FormatTable::new()),
            Err(Error::UnsupportedDescriptor(_))
        );
        assert!(Descriptor::Mob(MobDesc { size: 8192 })
            .instantiate(&caps(), &FormatTable::new())
            .is_ok());
    }

    #[test]
    fn test_map_capabilities() {
        let shader = Descriptor::Shader(ShaderDesc {
            stage: ShaderStage::Pixel,
            bytecode: vec![0x0700_0000],
        })
        .instantiate(&caps(), &FormatTable::new())
        .unwrap();
        assert_matches!(shader.check_map(MapFlags::READ), Err(Error::UnsupportedDescriptor(_)));

        let query = Descriptor::Query(QueryDesc { len: 16 })
            .instantiate(&caps(), &FormatTable::new())
            .unwrap();
        assert!(query.check_map(MapFlags::READ).is_ok());
        assert!(query.check_map(MapFlags::WRITE).is_err());
        assert!(!query.evictable());
    }

    #[test]
    fn test_binding_ids() {
        assert_eq!(Binding::Bound(3).device_id(), Some(3));
        assert_eq!(Binding::Evicted(3).device_id(), None);
        assert_eq!(Binding::Evicted(3).known_id(), Some(3));
        assert_eq!(Binding::Unbound.known_id(), None);
    }
}
