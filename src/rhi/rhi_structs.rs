use super::rhi_enums::*;
use cgmath::Vector2;

/// Data for buffer creation.
#[derive(Debug, Clone)]
pub struct BufferCreateInfo {
    /// Size of the buffer.
    pub size: u64,

    /// Offset of the buffer inside the memory it's created from.
    pub offset: u64,

    /// The usage profile of the buffer
    pub buffer_usage: BufferUsage,

    /// Who may access the buffer's memory.
    pub sharing: SharingMode,
}

/// What the device needs from the memory that backs a buffer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryRequirements {
    /// Alignment, in bytes, of the buffer and of every range bound inside it.
    pub alignment: u64,
}

/// Data for image creation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ImageCreateInfo {
    /// Size of the image, in pixels.
    pub extent: Vector2<u32>,

    /// Format of the image's pixels.
    pub format: TextureFormat,
}

impl ImageCreateInfo {
    /// Number of bytes of tightly packed pixel data the image holds.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.extent.x) * u64::from(self.extent.y) * self.format.bytes_per_pixel()
    }
}
