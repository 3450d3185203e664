use bitflags::bitflags;
use failure::Fail;

/// How a piece of memory will be used.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MemoryUsage {
    /// The memory will only be used by device.
    ///
    /// Useful for things like vertex buffers and dynamic textures.
    DeviceOnly,

    /// The memory will be written to by the CPU, but will only be written to a handful of times per frame.
    ///
    /// Useful for the model matrix buffer, the per-frame data buffer, and other uniform buffers which are updated a
    /// few times per frame.
    LowFrequencyUpload,

    /// The memory will be used for a staging buffer.
    StagingBuffer,
}

/// Describes what kind of object you want to allocate from a new memory pool.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ObjectType {
    /// Allocate buffers for storing vertex data or other data.
    Buffer,
}

/// Describes the operations the queue supports.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueType {
    /// Provides access to full rasterization pipeline.
    Graphics,

    /// Optimized for passing data over PCI-e bus.
    Copy,
}

/// Who may touch a buffer's memory, and how its contents get updated.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SharingMode {
    /// Device-local memory owned by one queue. The CPU can't see it, so every update is a recorded copy command from
    /// a staging buffer.
    Exclusive,

    /// Memory both the CPU and the GPU can see. It stays mapped for the lifetime of its buffer and is written
    /// directly, without any copy command.
    HostVisible,
}

impl SharingMode {
    /// The kind of memory a buffer with this sharing mode lives in.
    pub fn memory_usage(self) -> MemoryUsage {
        match self {
            SharingMode::Exclusive => MemoryUsage::DeviceOnly,
            SharingMode::HostVisible => MemoryUsage::LowFrequencyUpload,
        }
    }
}

/// Pixel format of an image.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TextureFormat {
    /// 8-bit single channel.
    R8,

    /// 8 bits per channel RGBA.
    Rgba8,

    /// 16-bit float per channel RGBA.
    Rgba16F,

    /// 32-bit float per channel RGBA.
    Rgba32F,
}

impl TextureFormat {
    /// Size of one pixel of this format, in bytes.
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rgba16F => 8,
            TextureFormat::Rgba32F => 16,
        }
    }
}

bitflags! {
    /// What a buffer may be used for.
    ///
    /// Buffers are only shared between requests whose usage matches exactly.
    pub struct BufferUsage: u32 {
        /// A buffer of uniform values.
        const UNIFORM = 0x0000_0001;

        /// The index buffer for rasterization.
        const INDEX = 0x0000_0002;

        /// The vertex buffer for rasterization.
        const VERTEX = 0x0000_0004;

        /// A buffer that shaders can read and write.
        const STORAGE = 0x0000_0008;

        /// The buffer may be the source of a copy.
        const TRANSFER_SOURCE = 0x0000_0010;

        /// The buffer may be the destination of a copy.
        const TRANSFER_DESTINATION = 0x0000_0020;

        /// Buffer waiting for transfer to/from another buffer.
        const STAGING = Self::TRANSFER_SOURCE.bits | Self::TRANSFER_DESTINATION.bits;
    }
}

/// Failure type for memory-related errors.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum MemoryError {
    /// Not enough host memory to create the requested object.
    #[fail(display = "There's not enough host memory to create the requested object.")]
    OutOfHostMemory,

    /// Not enough device memory to create the requested object.
    #[fail(display = "There's not enough device memory to create the requested object.")]
    OutOfDeviceMemory,

    /// The object doesn't fit in the memory it's being created from.
    #[fail(display = "The requested object doesn't fit in its memory.")]
    OutOfBounds,
}

/// Failure type for errors you get when allocating memory.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum AllocationError {
    /// There's not enough host memory to make the requested allocation.
    #[fail(display = "There's not enough host memory to make the requested allocation.")]
    OutOfHostMemory,

    /// There's not enough device memory to make the requested allocation.
    #[fail(display = "There's not enough device memory to make the requested allocation.")]
    OutOfDeviceMemory,

    /// You've made too many memory allocations already.
    #[fail(display = "You've made too many memory allocations already.")]
    TooManyObjects,

    /// No memory matching the requirements found.
    #[fail(display = "No memory matching the requirements found.")]
    NoSuitableMemoryFound,
}

/// Failure type for mapping memory
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum MappingError {
    /// The resource is in device local memory and therefore can't be mapped
    #[fail(display = "Resource is in device local memory.")]
    ResourceInDeviceMemory,

    /// Mapping failed for a generic reason
    #[fail(display = "Mapping failed for an unknown reason.")]
    MappingFailed,
}
