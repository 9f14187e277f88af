//! Fixed command encoders for draws and dispatches.

use crate::protocol::*;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    PointList = 1,
    LineList = 2,
    LineStrip = 3,
    TriangleList = 4,
    TriangleStrip = 5,
}

/// Parameters of one draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveInfo {
    pub topology: Topology,
    /// Vertices, or indices when `indexed`.
    pub count: u32,
    pub start: u32,
    pub indexed: bool,
    pub base_vertex: i32,
    pub instance_count: u32,
    pub start_instance: u32,
}

impl PrimitiveInfo {
    pub fn vertices(topology: Topology, count: u32) -> Self {
        Self {
            topology,
            count,
            start: 0,
            indexed: false,
            base_vertex: 0,
            instance_count: 1,
            start_instance: 0,
        }
    }

    pub fn indices(topology: Topology, count: u32) -> Self {
        Self {
            indexed: true,
            ..Self::vertices(topology, count)
        }
    }

    pub fn instanced(mut self, instance_count: u32, start_instance: u32) -> Self {
        self.instance_count = instance_count;
        self.start_instance = start_instance;
        self
    }

    fn is_instanced(&self) -> bool {
        self.instance_count != 1 || self.start_instance != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub enum EncodedCommand {
    Draw(CmdDraw),
    DrawIndexed(CmdDrawIndexed),
    DrawInstanced(CmdDrawInstanced),
    DrawIndexedInstanced(CmdDrawIndexedInstanced),
    Dispatch(CmdDispatch),
}

impl EncodedCommand {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            EncodedCommand::Draw(c) => bytemuck::bytes_of(c),
            EncodedCommand::DrawIndexed(c) => bytemuck::bytes_of(c),
            EncodedCommand::DrawInstanced(c) => bytemuck::bytes_of(c),
            EncodedCommand::DrawIndexedInstanced(c) => bytemuck::bytes_of(c),
            EncodedCommand::Dispatch(c) => bytemuck::bytes_of(c),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

fn header<T>(command_type: u32, context_id: u32) -> CommandHeader {
    CommandHeader::new(command_type, std::mem::size_of::<T>(), context_id)
}

/// Pick the smallest draw command that expresses `info`.
pub fn encode_primitive(info: &PrimitiveInfo, context_id: u32) -> EncodedCommand {
    let topology = info.topology as u32;
    match (info.indexed, info.is_instanced()) {
        (false, false) => EncodedCommand::Draw(CmdDraw {
            header: header::<CmdDraw>(PVGPU_CMD_DRAW, context_id),
            topology,
            vertex_count: info.count,
            start_vertex: info.start,
            _reserved: 0,
        }),
        (true, false) => EncodedCommand::DrawIndexed(CmdDrawIndexed {
            header: header::<CmdDrawIndexed>(PVGPU_CMD_DRAW_INDEXED, context_id),
            topology,
            index_count: info.count,
            start_index: info.start,
            base_vertex: info.base_vertex,
        }),
        (false, true) => EncodedCommand::DrawInstanced(CmdDrawInstanced {
            header: header::<CmdDrawInstanced>(PVGPU_CMD_DRAW_INSTANCED, context_id),
            topology,
            vertex_count: info.count,
            instance_count: info.instance_count,
            start_vertex: info.start,
            start_instance: info.start_instance,
            _reserved: [0; 3],
        }),
        (true, true) => EncodedCommand::DrawIndexedInstanced(CmdDrawIndexedInstanced {
            header: header::<CmdDrawIndexedInstanced>(PVGPU_CMD_DRAW_INDEXED_INSTANCED, context_id),
            topology,
            index_count: info.count,
            instance_count: info.instance_count,
            start_index: info.start,
            base_vertex: info.base_vertex,
            start_instance: info.start_instance,
            _reserved: [0; 2],
        }),
    }
}

pub fn encode_dispatch(groups: [u32; 3], context_id: u32) -> EncodedCommand {
    EncodedCommand::Dispatch(CmdDispatch {
        header: header::<CmdDispatch>(PVGPU_CMD_DISPATCH, context_id),
        thread_group_count_x: groups[0],
        thread_group_count_y: groups[1],
        thread_group_count_z: groups[2],
        _reserved: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_draw_variant() {
        let plain = encode_primitive(&PrimitiveInfo::vertices(Topology::TriangleList, 3), 1);
        assert!(matches!(plain, EncodedCommand::Draw(_)));
        assert_eq!(plain.len(), 32);

        let indexed = encode_primitive(&PrimitiveInfo::indices(Topology::TriangleStrip, 6), 1);
        assert!(matches!(indexed, EncodedCommand::DrawIndexed(_)));

        let instanced =
            encode_primitive(&PrimitiveInfo::vertices(Topology::PointList, 1).instanced(4, 0), 1);
        assert!(matches!(instanced, EncodedCommand::DrawInstanced(_)));
        assert_eq!(instanced.len(), 48);

        let both = encode_primitive(&PrimitiveInfo::indices(Topology::LineList, 2).instanced(1, 2), 1);
        assert!(matches!(both, EncodedCommand::DrawIndexedInstanced(_)));
    }

    #[test]
    fn test_header_matches_size() {
        let cmd = encode_primitive(&PrimitiveInfo::indices(Topology::TriangleList, 3).instanced(2, 0), 7);
        let header: CommandHeader = bytemuck::pod_read_unaligned(&cmd.as_bytes()[..PVGPU_CMD_HEADER_SIZE]);
        assert_eq!(header.command_size as usize, cmd.len());
        assert_eq!(header.context_id, 7);
        assert_eq!(header.command_type, PVGPU_CMD_DRAW_INDEXED_INSTANCED);
    }

    #[test]
    fn test_dispatch() {
        let EncodedCommand::Dispatch(cmd) = encode_dispatch([8, 4, 1], 2) else {
            panic!("expected a dispatch");
        };
        assert_eq!(cmd.thread_group_count_y, 4);
    }
}
