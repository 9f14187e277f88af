//! Error Module
//!
//! Failures surfaced by the winsys layer.

use thiserror::Error as ThisError;

use crate::resource::ResourceHandle;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The device refused to back a new object.
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// Size, format or usage combination the device cannot handle.
    #[error("unsupported descriptor: {0}")]
    UnsupportedDescriptor(String),
    /// The current command buffer cannot hold a reservation. Absorbed by the
    /// implicit flush in `Context::reserve`.
    #[error("command buffer exhausted")]
    BufferExhausted,
    /// The device stopped accepting submissions. Fatal to every context.
    #[error("device lost")]
    DeviceLost,
    /// Unknown or already destroyed resource handle.
    #[error("invalid resource handle {0}")]
    InvalidHandle(ResourceHandle),
    /// A single command larger than an empty command buffer.
    #[error("command of {requested} bytes exceeds command buffer capacity of {capacity} bytes")]
    CommandTooLarge { requested: usize, capacity: usize },
    /// A second mapping of the same resource with a conflicting intent.
    #[error("resource {0} is already mapped with a conflicting intent")]
    MapConflict(ResourceHandle),
    #[error("malformed command stream: {0}")]
    MalformedStream(String),
}

impl Error {
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedDescriptor(reason.into())
    }
}
