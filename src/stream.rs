//! Command stream decoder
//!
//! Walks the headers of a resolved command buffer. The loopback device
//! validates submissions with it and tests use it to inspect what reached
//! the device.

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::protocol::*;

/// One command of a stream, header included.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    pub offset: usize,
    pub header: CommandHeader,
    pub bytes: &'a [u8],
}

impl Command<'_> {
    pub fn command_type(&self) -> u32 {
        self.header.command_type
    }

    pub fn name(&self) -> &'static str {
        command_name(self.header.command_type)
    }

    /// Read the command as its fixed-layout struct.
    pub fn read<T: Pod>(&self) -> Result<T> {
        let size = std::mem::size_of::<T>();
        if self.bytes.len() < size {
            return Err(Error::MalformedStream(format!(
                "{} at offset {} is {} bytes, expected at least {}",
                self.name(),
                self.offset,
                self.bytes.len(),
                size
            )));
        }
        Ok(bytemuck::pod_read_unaligned(&self.bytes[..size]))
    }
}

/// Iterator over the commands of a byte stream. Stops after the first
/// malformed command.
pub struct CommandStream<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> CommandStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn fail(&mut self, reason: String) -> Option<Result<Command<'a>>> {
        self.offset = self.data.len();
        Some(Err(Error::MalformedStream(reason)))
    }
}

impl<'a> Iterator for CommandStream<'a> {
    type Item = Result<Command<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.offset..];
        if rest.is_empty() {
            return None;
        }
        if rest.len() < PVGPU_CMD_HEADER_SIZE {
            let reason = format!("{} trailing bytes at offset {}", rest.len(), self.offset);
            return self.fail(reason);
        }

        let header: CommandHeader =
            bytemuck::pod_read_unaligned(&rest[..PVGPU_CMD_HEADER_SIZE]);
        let size = header.command_size as usize;
        if size < PVGPU_CMD_HEADER_SIZE || size > rest.len() {
            let reason = format!(
                "command 0x{:04X} at offset {} claims {} bytes, {} available",
                header.command_type,
                self.offset,
                size,
                rest.len()
            );
            return self.fail(reason);
        }
        if size % 16 != 0 {
            let reason = format!(
                "command 0x{:04X} at offset {} is not 16-byte aligned ({} bytes)",
                header.command_type, self.offset, size
            );
            return self.fail(reason);
        }

        let command = Command {
            offset: self.offset,
            header,
            bytes: &rest[..size],
        };
        self.offset += size;
        Some(Ok(command))
    }
}

/// Decode a whole stream, failing on the first malformed command.
pub fn decode(data: &[u8]) -> Result<Vec<Command<'_>>> {
    CommandStream::new(data).collect()
}

/// Command types of a stream in order.
pub fn command_types(data: &[u8]) -> Result<Vec<u32>> {
    CommandStream::new(data)
        .map(|cmd| cmd.map(|c| c.command_type()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw(vertex_count: u32) -> CmdDraw {
        CmdDraw {
            header: CommandHeader::new(PVGPU_CMD_DRAW, std::mem::size_of::<CmdDraw>(), 1),
            topology: 4,
            vertex_count,
            start_vertex: 0,
            _reserved: 0,
        }
    }

    #[test]
    fn test_walks_commands() {
        let mut data = Vec::new();
        data.extend_from_slice(bytemuck::bytes_of(&draw(3)));
        data.extend_from_slice(bytemuck::bytes_of(&draw(6)));

        let cmds = decode(&data).unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[1].offset, 32);
        assert_eq!(cmds[1].read::<CmdDraw>().unwrap().vertex_count, 6);
        assert_eq!(cmds[0].name(), "Draw");
    }

    #[test]
    fn test_rejects_truncated_command() {
        let data = bytemuck::bytes_of(&draw(3)).to_vec();
        let mut stream = CommandStream::new(&data[..24]);
        assert!(matches!(stream.next(), Some(Err(Error::MalformedStream(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_rejects_unaligned_size() {
        let mut cmd = draw(3);
        cmd.header.command_size = 20;
        let data = bytemuck::bytes_of(&cmd).to_vec();
        assert!(decode(&data).is_err());
    }
}
