//! PVGPU command stream layout
//!
//! Fixed wire structures shared by the command buffer builder, the
//! relocation engine and the stream decoder. Every command starts with a
//! [`CommandHeader`] and is padded to a 16-byte boundary.

use bytemuck::{Pod, Zeroable};

pub const PVGPU_VERSION_MAJOR: u32 = 1;
pub const PVGPU_VERSION_MINOR: u32 = 1;
pub const PVGPU_VERSION: u32 = (PVGPU_VERSION_MAJOR << 16) | PVGPU_VERSION_MINOR;

/// Default sizes
pub const PVGPU_DEFAULT_CMDBUF_SIZE: usize = 0x8000; // 32KB
pub const PVGPU_DEFAULT_MAX_RELOCS: usize = 2048;

/// Placeholder written where a relocation will later store an id.
pub const PVGPU_INVALID_ID: u32 = u32::MAX;

// =============================================================================
// Command Types
// =============================================================================

// Object residency: 0x0001 - 0x00FF
pub const PVGPU_CMD_BIND_OBJECT: u32 = 0x0001;
pub const PVGPU_CMD_INVALIDATE_OBJECT: u32 = 0x0002;
pub const PVGPU_CMD_COPY_RESOURCE: u32 = 0x0006;

// State commands: 0x0100 - 0x01FF
pub const PVGPU_CMD_SET_RENDER_TARGET: u32 = 0x0101;
pub const PVGPU_CMD_SET_SHADER: u32 = 0x0107;
pub const PVGPU_CMD_SET_CONSTANT_BUFFER: u32 = 0x0109;
pub const PVGPU_CMD_SET_VERTEX_BUFFER: u32 = 0x010A;
pub const PVGPU_CMD_SET_INDEX_BUFFER: u32 = 0x010B;

// Draw commands: 0x0200 - 0x02FF
pub const PVGPU_CMD_DRAW: u32 = 0x0201;
pub const PVGPU_CMD_DRAW_INDEXED: u32 = 0x0202;
pub const PVGPU_CMD_DRAW_INSTANCED: u32 = 0x0203;
pub const PVGPU_CMD_DRAW_INDEXED_INSTANCED: u32 = 0x0204;
pub const PVGPU_CMD_DISPATCH: u32 = 0x0205;

// Sync commands: 0x0300 - 0x03FF
pub const PVGPU_CMD_FENCE: u32 = 0x0301;
pub const PVGPU_CMD_QUERY_BIND: u32 = 0x0310;
pub const PVGPU_CMD_BEGIN_QUERY: u32 = 0x0311;
pub const PVGPU_CMD_END_QUERY: u32 = 0x0312;

// Debug commands: 0x0400 - 0x04FF
pub const PVGPU_CMD_ANNOTATION: u32 = 0x0401;

// =============================================================================
// Command Header
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CommandHeader {
    pub command_type: u32,
    pub command_size: u32,
    pub context_id: u32,
    pub flags: u32,
}

pub const PVGPU_CMD_HEADER_SIZE: usize = std::mem::size_of::<CommandHeader>();

// Command flags
/// Set on bind commands the relocation engine inserted on its own.
pub const PVGPU_CMD_FLAG_IMPLICIT: u32 = 1 << 0;

impl CommandHeader {
    pub fn new(command_type: u32, command_size: usize, context_id: u32) -> Self {
        Self {
            command_type,
            command_size: command_size as u32,
            context_id,
            flags: 0,
        }
    }
}

// =============================================================================
// Command Payloads
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdBindObject {
    pub header: CommandHeader,
    pub object_kind: u32,
    pub object_id: u32,
    pub backing_size_lo: u32,
    pub backing_size_hi: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdInvalidateObject {
    pub header: CommandHeader,
    pub object_kind: u32,
    pub object_id: u32,
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdCopyResource {
    pub header: CommandHeader,
    pub dst_resource_id: u32,
    pub src_resource_id: u32,
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetRenderTarget {
    pub header: CommandHeader,
    pub num_rtvs: u32,
    pub dsv_id: u32,
    pub rtv_ids: [u32; 8],
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetShader {
    pub header: CommandHeader,
    pub stage: u32,
    pub shader_id: u32,
    pub mob_id: u32,
    pub mob_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetVertexBuffer {
    pub header: CommandHeader,
    pub slot: u32,
    pub buffer_id: u32,
    pub stride: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetIndexBuffer {
    pub header: CommandHeader,
    pub buffer_id: u32,
    pub format: u32, // 16 = R16_UINT, 42 = R32_UINT
    pub offset: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetConstantBuffer {
    pub header: CommandHeader,
    pub stage: u32,
    pub slot: u32,
    pub mob_id: u32,
    pub offset_into_mob: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDraw {
    pub header: CommandHeader,
    pub topology: u32,
    pub vertex_count: u32,
    pub start_vertex: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDrawIndexed {
    pub header: CommandHeader,
    pub topology: u32,
    pub index_count: u32,
    pub start_index: u32,
    pub base_vertex: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDrawInstanced {
    pub header: CommandHeader,
    pub topology: u32,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub start_vertex: u32,
    pub start_instance: u32,
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDrawIndexedInstanced {
    pub header: CommandHeader,
    pub topology: u32,
    pub index_count: u32,
    pub instance_count: u32,
    pub start_index: u32,
    pub base_vertex: i32,
    pub start_instance: u32,
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDispatch {
    pub header: CommandHeader,
    pub thread_group_count_x: u32,
    pub thread_group_count_y: u32,
    pub thread_group_count_z: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdFence {
    pub header: CommandHeader,
    pub fence_value: u64,
    pub fence_flags: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdQueryBind {
    pub header: CommandHeader,
    pub context_id: u32,
    pub query_mob_id: u32,
    pub bind_flags: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdQuery {
    pub header: CommandHeader,
    pub query_mob_id: u32,
    pub offset: u32,
    pub query_type: u32,
    pub _reserved: u32,
}

/// Variable length: the header is followed by `text_len` bytes of UTF-8,
/// zero padded to 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdAnnotation {
    pub header: CommandHeader,
    pub text_len: u32,
    pub _reserved: [u32; 3],
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Align a value to 16-byte boundary.
pub const fn align16(x: usize) -> usize {
    (x + 15) & !15
}

/// Human-readable name of a command type, for logs.
pub fn command_name(command_type: u32) -> &'static str {
    match command_type {
        PVGPU_CMD_BIND_OBJECT => "BindObject",
        PVGPU_CMD_INVALIDATE_OBJECT => "InvalidateObject",
        PVGPU_CMD_COPY_RESOURCE => "CopyResource",
        PVGPU_CMD_SET_RENDER_TARGET => "SetRenderTarget",
        PVGPU_CMD_SET_SHADER => "SetShader",
        PVGPU_CMD_SET_CONSTANT_BUFFER => "SetConstantBuffer",
        PVGPU_CMD_SET_VERTEX_BUFFER => "SetVertexBuffer",
        PVGPU_CMD_SET_INDEX_BUFFER => "SetIndexBuffer",
        PVGPU_CMD_DRAW => "Draw",
        PVGPU_CMD_DRAW_INDEXED => "DrawIndexed",
        PVGPU_CMD_DRAW_INSTANCED => "DrawInstanced",
        PVGPU_CMD_DRAW_INDEXED_INSTANCED => "DrawIndexedInstanced",
        PVGPU_CMD_DISPATCH => "Dispatch",
        PVGPU_CMD_FENCE => "Fence",
        PVGPU_CMD_QUERY_BIND => "QueryBind",
        PVGPU_CMD_BEGIN_QUERY => "BeginQuery",
        PVGPU_CMD_END_QUERY => "EndQuery",
        PVGPU_CMD_ANNOTATION => "Annotation",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_header_size() {
        assert_eq!(std::mem::size_of::<CommandHeader>(), 16);
    }

    #[test]
    fn test_commands_are_16_byte_multiples() {
        assert_eq!(std::mem::size_of::<CmdBindObject>() % 16, 0);
        assert_eq!(std::mem::size_of::<CmdSetRenderTarget>() % 16, 0);
        assert_eq!(std::mem::size_of::<CmdDrawInstanced>() % 16, 0);
        assert_eq!(std::mem::size_of::<CmdDrawIndexedInstanced>() % 16, 0);
        assert_eq!(std::mem::size_of::<CmdFence>() % 16, 0);
        assert_eq!(std::mem::size_of::<CmdAnnotation>() % 16, 0);
    }

    #[test]
    fn test_align16() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(17), 32);
    }
}
