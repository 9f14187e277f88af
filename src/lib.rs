//! PVGPU Guest Winsys
//!
//! Userspace side of the paravirtual GPU: contexts record commands into
//! fixed-size buffers, resource references are relocated to device ids at
//! submission, evicted resources are rebound, and fences report when the
//! device has finished with a submission.

mod builder;
pub mod config;
pub mod context;
pub mod debug;
pub mod device;
pub mod encode;
pub mod error;
pub mod fence;
pub mod format;
pub mod protocol;
pub mod registry;
pub mod reloc;
pub mod resource;
pub mod screen;
pub mod stream;
pub mod time;

pub use config::Config;
pub use context::{Context, Hints, MapOutcome, QueryBindFlags};
pub use debug::DebugFlags;
pub use device::{Device, DeviceCaps, LoopbackDevice};
pub use encode::{PrimitiveInfo, Topology};
pub use error::{Error, Result};
pub use fence::{Fence, FenceFlags, FenceStatus};
pub use format::Format;
pub use registry::Mapping;
pub use reloc::{RelocFlags, Relocation};
pub use resource::{
    Binding, BufferDesc, BufferUsage, Descriptor, MapFlags, MobDesc, QueryDesc, ResourceHandle,
    ResourceKind, ShaderDesc, ShaderStage, SurfaceDesc, SurfaceUsage,
};
pub use screen::{Screen, ScreenOptions};
pub use time::Timeout;
