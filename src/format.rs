//! Surface format capability lookup.

/// Surface formats the device knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B5G6R5Unorm,
    R16Float,
    R16G16B16A16Float,
    R32Float,
    R32G32B32A32Float,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    Bc1Unorm,
    Bc3Unorm,
}

/// What a surface of a given format will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKind {
    Sampling,
    RenderTarget,
    DepthStencil,
}

/// Device encoding of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDesc {
    pub device_code: u32,
    /// Channel order the sampler returns, as indices into RGBA.
    pub swizzle: [u8; 4],
    /// Bits per channel returned by the sampler (16 or 32).
    pub return_size: u8,
    pub render_target: bool,
    pub depth_stencil: bool,
    pub bytes_per_block: u32,
    /// Edge length of a compression block, 1 for uncompressed formats.
    pub block_dim: u32,
}

const RGBA: [u8; 4] = [0, 1, 2, 3];
const BGRA: [u8; 4] = [2, 1, 0, 3];

const fn desc(
    device_code: u32,
    swizzle: [u8; 4],
    return_size: u8,
    render_target: bool,
    depth_stencil: bool,
    bytes_per_block: u32,
    block_dim: u32,
) -> FormatDesc {
    FormatDesc {
        device_code,
        swizzle,
        return_size,
        render_target,
        depth_stencil,
        bytes_per_block,
        block_dim,
    }
}

fn lookup(format: Format) -> FormatDesc {
    use Format::*;
    match format {
        R8Unorm => desc(61, [0, 4, 4, 5], 16, true, false, 1, 1),
        R8G8Unorm => desc(49, [0, 1, 4, 5], 16, true, false, 2, 1),
        R8G8B8A8Unorm => desc(28, RGBA, 16, true, false, 4, 1),
        R8G8B8A8Srgb => desc(29, RGBA, 16, true, false, 4, 1),
        B8G8R8A8Unorm => desc(87, BGRA, 16, true, false, 4, 1),
        B5G6R5Unorm => desc(85, [2, 1, 0, 5], 16, true, false, 2, 1),
        R16Float => desc(54, [0, 4, 4, 5], 16, true, false, 2, 1),
        R16G16B16A16Float => desc(10, RGBA, 16, true, false, 8, 1),
        R32Float => desc(41, [0, 4, 4, 5], 32, true, false, 4, 1),
        R32G32B32A32Float => desc(2, RGBA, 32, false, false, 16, 1),
        D16Unorm => desc(55, [0, 0, 0, 5], 16, false, true, 2, 1),
        D24UnormS8Uint => desc(45, [0, 0, 0, 5], 32, false, true, 4, 1),
        D32Float => desc(40, [0, 0, 0, 5], 32, false, true, 4, 1),
        Bc1Unorm => desc(71, RGBA, 16, false, false, 8, 4),
        Bc3Unorm => desc(77, RGBA, 16, false, false, 16, 4),
    }
}

/// Static per-device format table.
#[derive(Debug, Clone, Default)]
pub struct FormatTable {
    /// Formats the device does not expose even though they are known.
    disabled: Vec<Format>,
}

impl FormatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with `formats` reported as unsupported.
    pub fn without(formats: &[Format]) -> Self {
        Self {
            disabled: formats.to_vec(),
        }
    }

    pub fn describe(&self, format: Format) -> Option<FormatDesc> {
        if self.disabled.contains(&format) {
            return None;
        }
        Some(lookup(format))
    }

    pub fn is_supported(&self, format: Format, usage: UsageKind) -> bool {
        let Some(d) = self.describe(format) else {
            return false;
        };
        match usage {
            UsageKind::Sampling => true,
            UsageKind::RenderTarget => d.render_target,
            UsageKind::DepthStencil => d.depth_stencil,
        }
    }

    /// Bytes needed for one `width` x `height` image in `format`.
    pub fn image_size(&self, format: Format, width: u32, height: u32) -> Option<u64> {
        let d = self.describe(format)?;
        let blocks_x = u64::from(width.div_ceil(d.block_dim));
        let blocks_y = u64::from(height.div_ceil(d.block_dim));
        Some(blocks_x * blocks_y * u64::from(d.bytes_per_block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_support() {
        let table = FormatTable::new();
        assert!(table.is_supported(Format::R8G8B8A8Unorm, UsageKind::RenderTarget));
        assert!(!table.is_supported(Format::R8G8B8A8Unorm, UsageKind::DepthStencil));
        assert!(table.is_supported(Format::D24UnormS8Uint, UsageKind::DepthStencil));
        assert!(!table.is_supported(Format::Bc1Unorm, UsageKind::RenderTarget));
        assert!(table.is_supported(Format::Bc1Unorm, UsageKind::Sampling));
    }

    #[test]
    fn test_disabled_formats() {
        let table = FormatTable::without(&[Format::R16G16B16A16Float]);
        assert!(table.describe(Format::R16G16B16A16Float).is_none());
        assert!(!table.is_supported(Format::R16G16B16A16Float, UsageKind::Sampling));
    }

    #[test]
    fn test_describe_swizzle() {
        let table = FormatTable::new();
        assert_eq!(table.describe(Format::B8G8R8A8Unorm).unwrap().swizzle, [2, 1, 0, 3]);
        assert_eq!(table.describe(Format::R32Float).unwrap().return_size, 32);
    }

    #[test]
    fn test_image_size_compressed() {
        let table = FormatTable::new();
        assert_eq!(table.image_size(Format::Bc1Unorm, 5, 5), Some(2 * 2 * 8));
        assert_eq!(table.image_size(Format::R8G8B8A8Unorm, 4, 2), Some(32));
    }
}
